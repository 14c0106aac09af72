//! Envelope accounting: turns a verdict into per-envelope queue reports
//! and metric updates.

use crate::collab::QueueHandle;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::smtp::task::{Envelope, Task, Verdict};
use tracing::{info, warn};

pub struct Accounting;

impl Accounting {
    /// Mark one envelope with its own verdict, ahead of the rest of the
    /// task: a `5xx`/`4xx` RCPT reply only fails that one recipient.
    /// `message` becomes `error_text`, wrapped in a `RemoteError (...)`
    /// note.
    pub fn envelope_fail(envelope: &mut Envelope, verdict: Verdict, message: &str) {
        envelope.verdict = Some(verdict);
        envelope.set_error(format!("RemoteError ({})", message));
        warn!(
            envelope_id = %envelope.id,
            recipient = %envelope.recipient,
            verdict = verdict.log_prefix(),
            "{}",
            message
        );
    }

    /// Apply `verdict` to every envelope in `task` that doesn't already
    /// carry one of its own (set by an earlier per-recipient `RCPT`
    /// rejection), report each to the queue, and retire the task's
    /// metrics.
    pub async fn flush_task(
        queue: &dyn QueueHandle,
        metrics: &Metrics,
        task: &Task,
        verdict: Verdict,
        error_text: &str,
    ) -> Result<()> {
        let envelope_count = task.envelopes.len() as i64;

        for envelope in &task.envelopes {
            let resolved_verdict = envelope.verdict.unwrap_or(verdict);
            let resolved_text = envelope
                .error_text
                .clone()
                .unwrap_or_else(|| error_text.to_string());

            info!(
                message_id = %task.message_id,
                envelope_id = %envelope.id,
                recipient = %envelope.recipient,
                "{}: {}",
                resolved_verdict.log_prefix(),
                resolved_text
            );

            queue
                .report(task.message_id, envelope.id, resolved_verdict, &resolved_text)
                .await?;
        }

        metrics.task_retired(envelope_count);
        Ok(())
    }
}
