//! Outbound SMTP delivery session engine.
//!
//! Given a queued message and a chosen route to a remote receiving server,
//! this crate drives a single TCP (optionally TLS-wrapped) conversation
//! through SMTP to deliver one or more messages and report per-envelope
//! delivery outcomes. It does not implement the queue, the route/relay
//! manager, the DNS resolver, or the certificate authority helper — those
//! are external collaborators this crate talks to through the traits in
//! [`collab`].
//!
//! # Modules
//!
//! - [`smtp`]: the C1–C8 delivery-session components (line codec, byte
//!   stream, body streamer, loop detector, TLS controller, state machine,
//!   envelope accounting, session supervisor).
//! - [`collab`]: trait seams for the queue, route manager, DNS resolver,
//!   and CA helper, plus in-memory fakes used by tests and the demo CLI.
//! - [`config`]: session tunables and per-relay security policy.
//! - [`error`]: the crate-wide error type and `Result` alias.
//! - [`metrics`]: session/task/envelope delivery gauges.
//! - [`dns`]: a `hickory-resolver`-backed [`collab::PtrResolver`].

pub mod collab;
pub mod config;
pub mod dns;
pub mod error;
pub mod metrics;
pub mod smtp;

pub use config::Config;
pub use error::{MtaError, Result};
