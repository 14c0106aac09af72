//! Outbound SMTP delivery session: one module per component.
//!
//! - [`codec`]: reply-line parsing and command framing
//! - [`stream`]: the non-blocking, optionally TLS-upgraded byte stream
//! - [`body`]: dot-stuffed body streaming
//! - [`loopcheck`]: `Received:` header counting
//! - [`tls`]: security-mode resolution, context building, handshake
//! - [`session`]: the dialog state machine
//! - [`accounting`]: per-envelope verdict reporting
//! - [`supervisor`]: session lifecycle and reconnection
//! - [`task`]: `Task`/`Envelope`/`Verdict` data types

pub mod accounting;
pub mod body;
pub mod codec;
pub mod loopcheck;
pub mod session;
pub mod stream;
pub mod supervisor;
pub mod task;
pub mod tls;

pub use session::{Session, SessionFlags, SessionState};
pub use supervisor::Supervisor;
pub use task::{Envelope, Mailbox, Task, Verdict};
