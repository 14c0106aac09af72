use crate::error::Result;
use crate::smtp::task::Verdict;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncSeek};
use uuid::Uuid;

/// A rewindable byte stream over the RFC 5322 message content: the loop
/// detector scans it once, then the body streamer rewinds and sends it
/// in full.
pub trait RewindableContent: AsyncRead + AsyncSeek + Unpin + Send {}
impl<T: AsyncRead + AsyncSeek + Unpin + Send> RewindableContent for T {}

pub type ContentHandle = Box<dyn RewindableContent>;

/// The queue subsystem: supplies message content, receives delivery
/// verdicts.
#[async_trait]
pub trait QueueHandle: Send + Sync {
    /// Open the content handle for `message_id`.
    async fn open_content(&self, message_id: Uuid) -> Result<ContentHandle>;

    /// Report a per-envelope delivery outcome.
    async fn report(&self, message_id: Uuid, envelope_id: Uuid, verdict: Verdict, error_text: &str)
        -> Result<()>;
}
