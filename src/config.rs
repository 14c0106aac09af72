//! Tunables for the delivery session engine.
//!
//! Mirrors the flat `Config`/`*Config` struct style used elsewhere in this
//! codebase: a `Config::default()` with sane values plus `Config::from_file`
//! for loading a TOML override.

use crate::error::{MtaError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub session: SessionConfig,
    pub logging: LoggingConfig,
}

/// Limits and timeouts for a single outbound delivery session:
/// `max_line_length` is the reply/command line cap, `high_water_mark` is
/// the body streamer's backpressure threshold, `hop_limit` is the loop
/// detector's `Received:` header cap, `max_messages_per_session` is the
/// per-session delivered-count cap, `inactivity_timeout_secs` is the
/// transport's single per-phase timer.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    pub hostname: String,
    pub max_line_length: usize,
    pub high_water_mark: usize,
    pub hop_limit: u32,
    pub max_messages_per_session: u32,
    pub inactivity_timeout_secs: u64,
    pub smtp_port: u16,
    pub smtps_port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
            max_line_length: 4096,
            high_water_mark: 65_536,
            hop_limit: 100,
            max_messages_per_session: 100,
            inactivity_timeout_secs: 300,
            smtp_port: 25,
            smtps_port: 465,
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| MtaError::Config(e.to_string()))?;
        toml::from_str(&content).map_err(|e| MtaError::Config(e.to_string()))
    }

    pub fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }
}

/// Per-relay security and credential policy.
///
/// One `RelayPolicy` is shared (read-mostly, via `Arc`) across every
/// session opened against that relay.
#[derive(Debug, Clone, Default)]
pub struct RelayPolicy {
    pub security: SecurityPolicy,
    /// Pre-formed `AUTH PLAIN` base64 blob, if this relay authenticates.
    pub secret: Option<String>,
    /// Name of the client certificate to request from the CA helper.
    pub client_cert_name: Option<String>,
    /// Destination port override; `None` means "use the mode's default
    /// port" (25 for cleartext/STARTTLS, 465 for implicit SMTPS).
    pub port_override: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityPolicy {
    /// Try implicit SMTPS on attempt 0, opportunistic STARTTLS fallback
    /// on attempt 1 if STARTTLS itself was never reached.
    ForceAnySsl,
    /// Implicit SMTPS only.
    ForceSmtps,
    /// STARTTLS required; absence is fatal.
    ForceTls,
    /// Never upgrade to TLS.
    ForcePlain,
    /// Opportunistic STARTTLS: upgrade if advertised, else continue
    /// cleartext. The default policy.
    Opportunistic,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        SecurityPolicy::Opportunistic
    }
}

impl SecurityPolicy {
    /// Whether a failure to secure the connection should be treated as
    /// fatal.
    pub fn want_secure(self) -> bool {
        matches!(
            self,
            SecurityPolicy::ForceAnySsl | SecurityPolicy::ForceSmtps | SecurityPolicy::ForceTls
        )
    }
}
