//! TLS certificate pinning
//!
//! Every TLS handshake made by the secure client goes through
//! [`PinnedCertVerifier`], which compares the server key's SPKI fingerprint
//! with the fingerprint from the verified attestation. The pinned key is the
//! trust anchor, so no CA chain is consulted.

use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tracing::{debug, warn};

use crate::config::PinningMode;
use crate::error::{Error, Result};
use crate::fingerprint;

/// Result of checking a presented certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Reject,
}

/// Certificate verifier that pins to a specific public key fingerprint
pub struct PinnedCertVerifier {
    /// The expected SPKI fingerprint (hex-encoded SHA256)
    pinned_fingerprint: String,
    mode: PinningMode,
    provider: Arc<CryptoProvider>,
}

impl std::fmt::Debug for PinnedCertVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedCertVerifier")
            .field("pinned_fingerprint", &self.pinned_fingerprint)
            .field("mode", &self.mode)
            .finish()
    }
}

impl PinnedCertVerifier {
    pub fn new(pinned_fingerprint: impl Into<String>, mode: PinningMode) -> Self {
        Self {
            pinned_fingerprint: pinned_fingerprint.into().to_ascii_lowercase(),
            mode,
            provider: Arc::new(rustls::crypto::aws_lc_rs::default_provider()),
        }
    }

    pub fn pinned_fingerprint(&self) -> &str {
        &self.pinned_fingerprint
    }

    /// Decide whether a DER end-entity certificate may be used.
    ///
    /// Unparseable certificates and keys on unsupported curves count as a
    /// mismatch, never as a pass.
    pub fn evaluate(&self, end_entity: &[u8]) -> Decision {
        let matched = match fingerprint::cert_fingerprint(end_entity) {
            Ok(actual) => actual == self.pinned_fingerprint,
            Err(e) => {
                warn!("Could not fingerprint server certificate: {}", e);
                false
            }
        };

        match &self.mode {
            PinningMode::Strict if matched => Decision::Accept,
            PinningMode::Strict => {
                warn!(
                    expected = %short(&self.pinned_fingerprint),
                    "Rejecting connection: certificate fingerprint mismatch"
                );
                Decision::Reject
            }
            PinningMode::Relaxed(observer) => {
                if !matched {
                    warn!(
                        expected = %short(&self.pinned_fingerprint),
                        "Certificate fingerprint mismatch tolerated in relaxed mode"
                    );
                }
                observer(matched);
                Decision::Accept
            }
        }
    }
}

fn short(fp: &str) -> &str {
    &fp[..fp.len().min(16)]
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match self.evaluate(end_entity.as_ref()) {
            Decision::Accept => {
                debug!("Server certificate matches pinned fingerprint");
                Ok(ServerCertVerified::assertion())
            }
            Decision::Reject => Err(rustls::Error::General(format!(
                "Certificate fingerprint mismatch: expected {}",
                self.pinned_fingerprint
            ))),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Create a reqwest client with certificate pinning
///
/// This client will reject any connection where the server's certificate
/// public key fingerprint doesn't match the pinned value (unless `mode` is
/// relaxed).
pub fn create_pinned_client(
    pinned_fingerprint: &str,
    mode: PinningMode,
    timeout: Option<Duration>,
) -> Result<reqwest::Client> {
    let verifier = PinnedCertVerifier::new(pinned_fingerprint, mode);
    let provider = verifier.provider.clone();

    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(format!("Failed to configure TLS: {}", e)))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();

    let mut builder = reqwest::Client::builder().use_preconfigured_tls(config);
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }

    builder
        .build()
        .map_err(|e| Error::Tls(format!("Failed to build HTTP client: {}", e)))
}

/// Create a reqwest client for a proxy hop, verified against the bundled
/// web PKI roots. The proxy is not the attested enclave, so no pin applies.
pub fn create_proxy_client(timeout: Option<Duration>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().use_rustls_tls();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }

    builder
        .build()
        .map_err(|e| Error::Tls(format!("Failed to build HTTP client: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn self_signed(alg: &'static rcgen::SignatureAlgorithm) -> CertificateDer<'static> {
        let key_pair = rcgen::KeyPair::generate_for(alg).unwrap();
        let cert = rcgen::CertificateParams::new(vec!["enclave.example.com".into()])
            .unwrap()
            .self_signed(&key_pair)
            .unwrap();
        cert.der().clone()
    }

    fn check(verifier: &PinnedCertVerifier, cert: &CertificateDer<'_>) -> bool {
        let name = ServerName::try_from("enclave.example.com").unwrap();
        verifier
            .verify_server_cert(cert, &[], &name, &[], UnixTime::now())
            .is_ok()
    }

    fn recording_mode() -> (PinningMode, Arc<Mutex<Vec<bool>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mode = PinningMode::Relaxed(Arc::new(move |ok: bool| sink.lock().unwrap().push(ok)));
        (mode, seen)
    }

    #[test]
    fn test_matching_fingerprint_accepted_in_both_modes() {
        let cert = self_signed(&rcgen::PKCS_ECDSA_P256_SHA256);
        let fp = fingerprint::cert_fingerprint(&cert).unwrap();

        assert!(check(&PinnedCertVerifier::new(&fp, PinningMode::Strict), &cert));

        let (mode, seen) = recording_mode();
        assert!(check(&PinnedCertVerifier::new(&fp, mode), &cert));
        assert_eq!(*seen.lock().unwrap(), vec![true]);
    }

    #[test]
    fn test_p384_certificate_is_pinned() {
        let cert = self_signed(&rcgen::PKCS_ECDSA_P384_SHA384);
        let fp = fingerprint::cert_fingerprint(&cert).unwrap();
        assert!(check(&PinnedCertVerifier::new(fp, PinningMode::Strict), &cert));
    }

    #[test]
    fn test_mismatch_rejected_in_strict_mode() {
        let cert = self_signed(&rcgen::PKCS_ECDSA_P256_SHA256);
        let verifier = PinnedCertVerifier::new("a".repeat(64), PinningMode::Strict);

        assert_eq!(verifier.evaluate(&cert), Decision::Reject);
        assert!(!check(&verifier, &cert));
    }

    #[test]
    fn test_mismatch_reported_in_relaxed_mode() {
        let cert = self_signed(&rcgen::PKCS_ECDSA_P256_SHA256);
        let (mode, seen) = recording_mode();
        let verifier = PinnedCertVerifier::new("a".repeat(64), mode);

        assert!(check(&verifier, &cert));
        assert_eq!(*seen.lock().unwrap(), vec![false]);
    }

    #[test]
    fn test_unparseable_certificate_is_a_mismatch() {
        let garbage = CertificateDer::from(vec![0x30, 0x03, 0x01, 0x01, 0x00]);

        let strict = PinnedCertVerifier::new("a".repeat(64), PinningMode::Strict);
        assert_eq!(strict.evaluate(&garbage), Decision::Reject);

        let (mode, seen) = recording_mode();
        let relaxed = PinnedCertVerifier::new("a".repeat(64), mode);
        assert_eq!(relaxed.evaluate(&garbage), Decision::Accept);
        assert_eq!(*seen.lock().unwrap(), vec![false]);
    }

    #[test]
    fn test_fingerprint_compare_ignores_case() {
        let cert = self_signed(&rcgen::PKCS_ECDSA_P256_SHA256);
        let fp = fingerprint::cert_fingerprint(&cert).unwrap().to_uppercase();
        assert!(check(&PinnedCertVerifier::new(fp, PinningMode::Strict), &cert));
    }

    #[test]
    fn test_create_clients() {
        assert!(create_pinned_client(&"0".repeat(64), PinningMode::Strict, None).is_ok());
        assert!(create_proxy_client(Some(Duration::from_secs(5))).is_ok());
    }
}
