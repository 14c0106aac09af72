//! Data model for one batch of envelopes sharing a message body.

use serde::{Deserialize, Serialize};

/// An email address split the way OpenSMTPD's envelope struct does it,
/// so that `user[0] == '\0' && domain[0] == '\0'` (the bounce sender) has
/// a direct, typed equivalent: both fields empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mailbox {
    pub user: String,
    pub domain: String,
}

impl Mailbox {
    pub fn new(user: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            domain: domain.into(),
        }
    }

    /// The empty reverse-path used for bounce messages.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.user.is_empty() && self.domain.is_empty()
    }
}

impl std::fmt::Display for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            Ok(())
        } else {
            write!(f, "{}@{}", self.user, self.domain)
        }
    }
}

/// Outcome of delivering one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Ok,
    TempFail,
    PermFail,
    Loop,
}

impl Verdict {
    /// Label used in envelope log lines. `Loop` logs under the
    /// `PermFail` prefix since it is a permanent-failure class.
    pub fn log_prefix(self) -> &'static str {
        match self {
            Verdict::Ok => "Ok",
            Verdict::TempFail => "TempFail",
            Verdict::PermFail | Verdict::Loop => "PermFail",
        }
    }

    /// Classify an SMTP reply's leading digit into a verdict: `5xx` is
    /// permanent, everything else (`4xx`, and any other class reached
    /// here) is treated as transient.
    pub fn from_reply_class(first_digit: u8) -> Verdict {
        if first_digit == b'5' {
            Verdict::PermFail
        } else {
            Verdict::TempFail
        }
    }
}

/// One recipient plus its bookkeeping.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub id: uuid::Uuid,
    pub recipient: Mailbox,
    pub error_text: Option<String>,
    pub verdict: Option<Verdict>,
}

impl Envelope {
    pub fn new(recipient: Mailbox) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            recipient,
            error_text: None,
            verdict: None,
        }
    }

    pub fn set_error(&mut self, text: impl Into<String>) {
        self.error_text = Some(text.into());
    }
}

/// A batch of envelopes sharing a sender and message body, handed to a
/// session by the route manager.
#[derive(Debug)]
pub struct Task {
    pub message_id: uuid::Uuid,
    pub sender: Mailbox,
    pub envelopes: Vec<Envelope>,
}

impl Task {
    pub fn new(message_id: uuid::Uuid, sender: Mailbox, recipients: Vec<Mailbox>) -> Self {
        Self {
            message_id,
            sender,
            envelopes: recipients.into_iter().map(Envelope::new).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.envelopes.is_empty()
    }
}
