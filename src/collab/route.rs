use crate::config::RelayPolicy;
use crate::smtp::task::Task;
use std::net::IpAddr;
use std::sync::Arc;

/// A configured outbound destination with policy, shared across every
/// session opened against it.
#[derive(Debug, Clone)]
pub struct Relay {
    pub name: String,
    pub policy: RelayPolicy,
}

/// A (source-address, destination-host) pairing: the unit of concurrency
/// accounting.
#[derive(Debug, Clone)]
pub struct Route {
    pub source_addr: Option<IpAddr>,
    pub dest_addr: IpAddr,
    /// Cached PTR name for the destination, if the route manager already
    /// resolved and cached it.
    pub dest_ptrname: Option<String>,
}

/// The route/relay manager: selects destinations, tracks route health,
/// dispatches tasks.
///
/// Calls here are synchronous, fire-and-forget notifications that never
/// need to suspend the session, so this is a plain (non-async) trait.
pub trait RouteManager: Send + Sync {
    /// Pull the next task for this relay/route, or `None` if there is
    /// nothing left to send.
    fn next_task(&self, relay: &Relay, route: &Route) -> Option<Task>;

    /// The session reached `Ready` for the first time: the route is
    /// usable.
    fn route_ok(&self, relay: &Relay, route: &Route);

    /// A route-level error occurred (protocol, negotiation, transport).
    fn route_error(&self, relay: &Relay, route: &Route, message: &str);

    /// The local source address itself is unusable (`EADDRNOTAVAIL`);
    /// the route manager should consider disabling that source.
    fn source_error(&self, relay: &Relay, route: &Route, message: &str);

    /// Session teardown: release this session's reference count on
    /// `relay`/`route` so utilization can be recomputed.
    fn route_collect(&self, relay: &Relay, route: &Route);
}

/// Convenience alias for the shared, ref-counted handles sessions hold.
pub type SharedRelay = Arc<Relay>;
pub type SharedRoute = Arc<Route>;
