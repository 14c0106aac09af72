//! Interfaces to the external collaborators this crate talks to but does
//! not implement: the queue subsystem, the route/relay manager, the DNS
//! resolver, and the certificate-authority helper process. Everything in
//! this module is a seam, not a subsystem — production wiring of these
//! traits (to an IPC-backed queue, a real route manager, etc.) lives
//! outside this crate.

mod queue;
mod route;
mod tls_authority;

pub mod inmemory;

pub use queue::{ContentHandle, QueueHandle};
pub use route::{Relay, Route, RouteManager};
pub use tls_authority::{CertAuthority, CertMaterial, PtrResolver, VerifyOutcome};
