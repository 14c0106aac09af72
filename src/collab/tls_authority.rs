use crate::error::Result;
use async_trait::async_trait;
use std::net::IpAddr;

/// Client certificate and key material returned by the CA helper.
/// Zeroed on drop, after the bytes have been handed to the TLS context
/// builder.
pub struct CertMaterial {
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
}

impl Drop for CertMaterial {
    fn drop(&mut self) {
        self.cert_der.iter_mut().for_each(|b| *b = 0);
        self.key_der.iter_mut().for_each(|b| *b = 0);
    }
}

/// Verdict from the out-of-process peer-certificate verification.
/// Logged but not enforced by this crate — enforcement is a policy
/// decision left to the route manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyOutcome {
    pub verified: bool,
}

/// The key/certificate authority helper process.
#[async_trait]
pub trait CertAuthority: Send + Sync {
    /// Request client certificate material for the named credential.
    async fn init_cert(&self, name: &str) -> Result<CertMaterial>;

    /// Submit the peer's leaf certificate and chain (DER) for
    /// verification and wait for the verdict.
    async fn verify_peer(&self, leaf_der: Vec<u8>, chain_der: Vec<Vec<u8>>) -> Result<VerifyOutcome>;
}

/// The DNS resolver, restricted to the one lookup this crate needs:
/// reverse DNS for logging.
#[async_trait]
pub trait PtrResolver: Send + Sync {
    async fn resolve_ptr(&self, addr: IpAddr) -> Option<String>;
}
