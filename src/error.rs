use thiserror::Error;

#[derive(Error, Debug)]
pub enum MtaError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SMTP protocol error: {0}")]
    Protocol(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("DNS lookup failed: {0}")]
    DnsLookup(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("connection timed out")]
    Timeout,

    #[error("a collaborator ({0}) reported an error: {1}")]
    Collaborator(&'static str, String),
}

pub type Result<T> = std::result::Result<T, MtaError>;
