//! TLS controller: resolves the effective security mode from policy +
//! attempt counter, builds the outbound TLS context (with or without a
//! client certificate from the CA helper), and performs the handshake +
//! out-of-process peer verification hand-off.

use crate::collab::{CertAuthority, CertMaterial};
use crate::config::SecurityPolicy;
use crate::error::{MtaError, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::info;

/// The security mode for one connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    /// TLS handshake before the banner, dedicated port (465 by default).
    Smtps,
    /// STARTTLS required; its absence is fatal once advertised-missing.
    RequiredStartTls,
    /// STARTTLS if advertised, else continue in cleartext.
    OpportunisticStartTls,
    /// Never upgrade.
    Plain,
}

impl ConnectMode {
    pub fn uses_implicit_tls(self) -> bool {
        matches!(self, ConnectMode::Smtps)
    }
}

/// Resolve the mode for `attempt` (0-based) under `policy`: each security
/// policy defines its own ladder of modes to try in order, falling back to
/// `None` once the ladder is exhausted.
pub fn resolve_mode(policy: SecurityPolicy, attempt: u32) -> Option<ConnectMode> {
    match (policy, attempt) {
        (SecurityPolicy::ForceSmtps, 0) => Some(ConnectMode::Smtps),
        (SecurityPolicy::ForceAnySsl, 0) => Some(ConnectMode::RequiredStartTls),
        (SecurityPolicy::ForceAnySsl, 1) => Some(ConnectMode::Smtps),
        (SecurityPolicy::ForceTls, 0) => Some(ConnectMode::RequiredStartTls),
        (SecurityPolicy::Opportunistic, 0) => Some(ConnectMode::OpportunisticStartTls),
        (SecurityPolicy::ForcePlain, 0) => Some(ConnectMode::Plain),
        _ => None,
    }
}

/// Verification is performed out-of-process by the CA helper: the
/// handshake itself must succeed regardless of chain trust so the leaf +
/// chain can be captured and shipped off for the real verdict, which is
/// logged but not enforced here.
#[derive(Debug)]
struct DeferToHelperVerifier;

impl ServerCertVerifier for DeferToHelperVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}

pub struct TlsController {
    ca: Arc<dyn CertAuthority>,
}

impl TlsController {
    pub fn new(ca: Arc<dyn CertAuthority>) -> Self {
        Self { ca }
    }

    /// Acquire credentials (if `cert_name` is set) and build a client
    /// TLS context: request material from the CA helper when the relay
    /// declares a client certificate, else build an anonymous-client
    /// context directly.
    pub async fn build_context(&self, cert_name: Option<&str>) -> Result<Arc<ClientConfig>> {
        let builder = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(DeferToHelperVerifier));

        let config = match cert_name {
            Some(name) => {
                let CertMaterial { cert_der, key_der } = self.ca.init_cert(name).await?;
                let cert = CertificateDer::from(cert_der).into_owned();
                let key = PrivateKeyDer::try_from(key_der)
                    .map_err(|e| MtaError::Tls(format!("invalid client key material: {}", e)))?;
                builder
                    .with_client_auth_cert(vec![cert], key)
                    .map_err(|e| MtaError::Tls(format!("failed to build client TLS config: {}", e)))?
            }
            None => builder.with_no_client_auth(),
        };

        Ok(Arc::new(config))
    }

    /// Perform the handshake and return the stream plus the peer's
    /// leaf + chain (DER), for the caller to hand to
    /// `CertAuthority::verify_peer` if a certificate was presented.
    pub async fn handshake(
        &self,
        stream: TcpStream,
        server_name: &str,
        config: Arc<ClientConfig>,
    ) -> Result<(TlsStream<TcpStream>, Vec<Vec<u8>>)> {
        let connector = TlsConnector::from(config);
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| MtaError::Tls(format!("invalid server name {:?}: {}", server_name, e)))?;

        let tls_stream = connector
            .connect(name, stream)
            .await
            .map_err(|e| MtaError::Tls(format!("TLS handshake failed: {}", e)))?;

        let chain: Vec<Vec<u8>> = tls_stream
            .get_ref()
            .1
            .peer_certificates()
            .map(|certs| certs.iter().map(|c| c.as_ref().to_vec()).collect())
            .unwrap_or_default();

        info!("TLS handshake complete ({} peer certificate(s) presented)", chain.len());

        Ok((tls_stream, chain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_zero_resolves_per_policy() {
        assert_eq!(resolve_mode(SecurityPolicy::ForceSmtps, 0), Some(ConnectMode::Smtps));
        assert_eq!(
            resolve_mode(SecurityPolicy::ForceAnySsl, 0),
            Some(ConnectMode::RequiredStartTls)
        );
        assert_eq!(
            resolve_mode(SecurityPolicy::ForceTls, 0),
            Some(ConnectMode::RequiredStartTls)
        );
        assert_eq!(
            resolve_mode(SecurityPolicy::Opportunistic, 0),
            Some(ConnectMode::OpportunisticStartTls)
        );
        assert_eq!(resolve_mode(SecurityPolicy::ForcePlain, 0), Some(ConnectMode::Plain));
    }

    #[test]
    fn attempt_one_only_falls_back_for_force_any_ssl() {
        assert_eq!(resolve_mode(SecurityPolicy::ForceAnySsl, 1), Some(ConnectMode::Smtps));
        assert_eq!(resolve_mode(SecurityPolicy::ForceSmtps, 1), None);
        assert_eq!(resolve_mode(SecurityPolicy::ForceTls, 1), None);
        assert_eq!(resolve_mode(SecurityPolicy::Opportunistic, 1), None);
        assert_eq!(resolve_mode(SecurityPolicy::ForcePlain, 1), None);
    }

    #[test]
    fn attempt_two_never_resolves() {
        for policy in [
            SecurityPolicy::ForceSmtps,
            SecurityPolicy::ForceAnySsl,
            SecurityPolicy::ForceTls,
            SecurityPolicy::Opportunistic,
            SecurityPolicy::ForcePlain,
        ] {
            assert_eq!(resolve_mode(policy, 2), None);
        }
    }
}
