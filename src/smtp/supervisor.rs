//! Session supervisor: owns session lifecycle from `start(relay, route)`
//! through reconnection fallback to final teardown and reporting back to
//! the route manager.
//!
//! PTR lookup (possibly cached on the route), pick the mode for the
//! current attempt, open the socket, drive the dialog, and decide whether
//! a failure is worth retrying on the next rung of the ladder.

use crate::collab::{CertAuthority, PtrResolver, QueueHandle, Relay, Route, RouteManager};
use crate::config::SessionConfig;
use crate::error::MtaError;
use crate::metrics::Metrics;
use crate::smtp::session::{Session, SessionFailure, SessionOutcome};
use crate::smtp::stream::ByteStream;
use crate::smtp::tls::{self, ConnectMode};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// The external collaborators a session is driven against: the queue, the
/// route manager, the CA helper, and the DNS resolver. Bundled into one
/// struct so `Session::run` takes a single argument.
pub struct Collaborators {
    pub queue: Arc<dyn QueueHandle>,
    pub route_manager: Arc<dyn RouteManager>,
    pub ca: Arc<dyn CertAuthority>,
    pub ptr_resolver: Arc<dyn PtrResolver>,
    pub metrics: Arc<Metrics>,
}

/// Outcome of a connect attempt that never got as far as opening a
/// session. Kept distinct from [`SessionFailure`] so the two failure
/// sinks stay separate: this one is a connect-time failure and is always
/// either swallowed-and-retried or terminal, never handed to a running
/// session.
enum ConnectError {
    /// `EADDRNOTAVAIL`: the local source address itself is unusable.
    SourceUnavailable(String),
    /// Refused or timed out — the attempt ladder already covers retrying
    /// this, so it is swallowed rather than reported as a route error.
    Retryable(String),
    /// Any other connect failure: reported and terminal.
    Fatal(String),
}

/// Owns the per-relay attempt counter and drives one delivery session
/// through to completion.
pub struct Supervisor {
    id_counter: AtomicU64,
    config: SessionConfig,
    collaborators: Collaborators,
}

impl Supervisor {
    pub fn new(config: SessionConfig, collaborators: Collaborators) -> Self {
        Self {
            id_counter: AtomicU64::new(1),
            config,
            collaborators,
        }
    }

    fn next_id(&self) -> u64 {
        self.id_counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Entry point: resolve PTR if the route doesn't already carry a
    /// cached name, then drive the session through its reconnection
    /// ladder. Always reports `route_collect` on the way out, win or
    /// lose.
    pub async fn start(
        &self,
        relay: Arc<Relay>,
        route: Arc<Route>,
    ) -> Result<SessionOutcome, SessionFailure> {
        let id = self.next_id();
        self.collaborators.metrics.session_started();

        let ptrname = match &route.dest_ptrname {
            Some(name) => Some(name.clone()),
            None => self.collaborators.ptr_resolver.resolve_ptr(route.dest_addr).await,
        };
        match &ptrname {
            Some(name) => info!(session_id = id, dest = %route.dest_addr, ptr = %name, "connecting"),
            None => info!(session_id = id, dest = %route.dest_addr, "connecting"),
        }

        let result = self.run_attempts(id, &relay, &route).await;

        self.collaborators.route_manager.route_collect(&relay, &route);
        self.collaborators.metrics.session_ended();
        result
    }

    /// The reconnection ladder itself: advance `attempt` only while the
    /// session has never reached `Ready`
    /// and the failure was marked retryable; stop as soon as either
    /// condition fails, or the ladder runs out of modes.
    async fn run_attempts(
        &self,
        id: u64,
        relay: &Arc<Relay>,
        route: &Arc<Route>,
    ) -> Result<SessionOutcome, SessionFailure> {
        let mut attempt = 0u32;
        loop {
            let mode = match tls::resolve_mode(relay.policy.security, attempt) {
                Some(m) => m,
                None => {
                    let message = "could not connect: attempt ladder exhausted".to_string();
                    self.collaborators.route_manager.route_error(relay, route, &message);
                    return Err(SessionFailure {
                        message,
                        retryable: false,
                        reached_ready: false,
                    });
                }
            };

            match self.connect(mode, relay, route).await {
                Ok(stream) => {
                    let mut session =
                        Session::new(id, relay.clone(), route.clone(), stream, mode, &self.config);
                    match session.run(&self.collaborators).await {
                        Ok(outcome) => return Ok(outcome),
                        Err(failure) => {
                            if failure.reached_ready || !failure.retryable {
                                return Err(failure);
                            }
                            attempt += 1;
                        }
                    }
                }
                Err(ConnectError::SourceUnavailable(message)) => {
                    self.collaborators.route_manager.source_error(relay, route, &message);
                    return Err(SessionFailure {
                        message,
                        retryable: false,
                        reached_ready: false,
                    });
                }
                Err(ConnectError::Retryable(message)) => {
                    attempt += 1;
                    if tls::resolve_mode(relay.policy.security, attempt).is_none() {
                        self.collaborators.route_manager.route_error(relay, route, &message);
                        return Err(SessionFailure {
                            message,
                            retryable: false,
                            reached_ready: false,
                        });
                    }
                }
                Err(ConnectError::Fatal(message)) => {
                    self.collaborators.route_manager.route_error(relay, route, &message);
                    return Err(SessionFailure {
                        message,
                        retryable: false,
                        reached_ready: false,
                    });
                }
            }
        }
    }

    /// Open the transport for `mode`: implicit SMTPS and STARTTLS-capable
    /// modes both start out as a plain `TcpStream` (the TLS handshake
    /// itself happens inside `Session::run`'s `Init` state); this just
    /// picks the right port and local source address.
    async fn connect(
        &self,
        mode: ConnectMode,
        relay: &Relay,
        route: &Route,
    ) -> Result<ByteStream, ConnectError> {
        let port = relay.policy.port_override.unwrap_or(if mode.uses_implicit_tls() {
            self.config.smtps_port
        } else {
            self.config.smtp_port
        });
        let addr = SocketAddr::new(route.dest_addr, port);

        match ByteStream::connect_plain(
            addr,
            route.source_addr,
            self.config.high_water_mark,
            Duration::from_secs(self.config.inactivity_timeout_secs),
        )
        .await
        {
            Ok(stream) => Ok(stream),
            Err(MtaError::Io(e)) => {
                use std::io::ErrorKind;
                match e.kind() {
                    ErrorKind::AddrNotAvailable => Err(ConnectError::SourceUnavailable(e.to_string())),
                    ErrorKind::ConnectionRefused | ErrorKind::TimedOut => {
                        warn!("connect attempt {} to {} failed: {}", mode_label(mode), addr, e);
                        Err(ConnectError::Retryable(e.to_string()))
                    }
                    _ => Err(ConnectError::Fatal(e.to_string())),
                }
            }
            Err(e) => Err(ConnectError::Fatal(e.to_string())),
        }
    }
}

fn mode_label(mode: ConnectMode) -> &'static str {
    match mode {
        ConnectMode::Smtps => "smtps",
        ConnectMode::RequiredStartTls => "starttls(required)",
        ConnectMode::OpportunisticStartTls => "starttls(opportunistic)",
        ConnectMode::Plain => "plain",
    }
}
