//! Attestation engine boundary
//!
//! The verifier treats the engine as a trusted oracle: it is handed the
//! target and repository and returns either the ground truth as JSON or an
//! error naming the step that failed. [`NativeEngine`] is the built-in
//! implementation on top of this crate's attestation and Sigstore code.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::attestation::types::{HardwareMeasurement, Measurement, PredicateType, Verification};
use crate::attestation::{self, tdx};
use crate::bundle;
use crate::config::{Config, Target};
use crate::error::Error;
use crate::fingerprint;
use crate::sigstore::{self, FulcioRoots};
use crate::verifier::{GroundTruth, Step};

/// Error reported by an attestation engine.
///
/// `step` is the structured classification when the engine knows it. When
/// it doesn't, the message prefix is consulted (see [`classify_error`]).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct EngineError {
    pub step: Option<Step>,
    pub message: String,
}

impl EngineError {
    pub fn tagged(step: Step, message: impl std::fmt::Display) -> Self {
        Self {
            step: Some(step),
            message: format!("{}: {}", step.as_str(), message),
        }
    }

    /// Wrap a string-only engine error
    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            step: None,
            message: message.into(),
        }
    }

    pub fn step(&self) -> Option<Step> {
        self.step.or_else(|| classify_error(&self.message))
    }
}

// `validateTLS` and `verifyHardware` are part of measurement comparison
const STEP_PREFIXES: &[(&str, Step)] = &[
    ("fetchDigest", Step::FetchDigest),
    ("verifyCode", Step::VerifyCode),
    ("verifyEnclave", Step::VerifyEnclave),
    ("compareMeasurements", Step::CompareMeasurements),
    ("validateTLS", Step::CompareMeasurements),
    ("verifyHardware", Step::CompareMeasurements),
];

/// Attribute a string-only engine error to a step by its `prefix:` tag.
/// `None` means the origin is unknown.
pub fn classify_error(message: &str) -> Option<Step> {
    let (prefix, _) = message.trim_start().split_once(':')?;
    STEP_PREFIXES
        .iter()
        .find(|(p, _)| *p == prefix.trim())
        .map(|(_, step)| *step)
}

#[async_trait]
pub trait AttestationEngine: Send + Sync {
    /// Verify `target` against `repo`, returning the ground truth as JSON
    async fn verify(&self, target: &Target, repo: &str) -> Result<serde_json::Value, EngineError>;
}

/// Built-in engine: Sigstore provenance plus SEV-SNP / TDX attestation
#[derive(Clone)]
pub struct NativeEngine {
    github_proxy: String,
    attestation_proxy: String,
    kds_proxy: String,
    hardware_measurements: Vec<HardwareMeasurement>,
    fulcio_roots: FulcioRoots,
    quotes: Arc<dyn tdx::QuoteVerifier>,
}

impl std::fmt::Debug for NativeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeEngine")
            .field("github_proxy", &self.github_proxy)
            .field("attestation_proxy", &self.attestation_proxy)
            .field("kds_proxy", &self.kds_proxy)
            .field("hardware_measurements", &self.hardware_measurements.len())
            .finish_non_exhaustive()
    }
}

impl NativeEngine {
    /// Fails only when `config.fulcio_roots` does not parse
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        Ok(Self {
            github_proxy: config.github_proxy.clone(),
            attestation_proxy: config.attestation_proxy.clone(),
            kds_proxy: config.kds_proxy.clone(),
            hardware_measurements: config.hardware_measurements.clone(),
            fulcio_roots: config.fulcio_roots()?,
            quotes: Arc::new(tdx::DcapVerifier::new(config.pccs_url.as_str())),
        })
    }

    /// Replace the TDX quote verifier
    pub fn with_quote_verifier(mut self, quotes: Arc<dyn tdx::QuoteVerifier>) -> Self {
        self.quotes = quotes;
        self
    }

    async fn verify_direct(&self, host: &str, repo: &str) -> Result<GroundTruth, EngineError> {
        let at = |step| move |e: Error| EngineError::tagged(step, e);

        let tag = sigstore::fetch_latest_tag(&self.github_proxy, repo)
            .await
            .map_err(at(Step::FetchDigest))?;
        let digest = sigstore::fetch_digest(&self.github_proxy, repo, &tag)
            .await
            .map_err(at(Step::FetchDigest))?;
        let provenance = sigstore::fetch_bundle(&self.attestation_proxy, repo, &digest)
            .await
            .map_err(at(Step::FetchDigest))?;
        debug!(repo, tag = %tag, "Fetched release digest");

        let code = sigstore::verify_bundle(&provenance, &digest, repo, &self.fulcio_roots)
            .map_err(at(Step::VerifyCode))?;

        let doc = attestation::fetch(host).await.map_err(at(Step::VerifyEnclave))?;
        let enclave = attestation::verify(&doc, None, &self.kds_proxy, self.quotes.as_ref())
            .await
            .map_err(at(Step::VerifyEnclave))?;

        self.finish(host, digest, code, enclave, None)
    }

    async fn verify_from_bundle(&self, url: &str, repo: &str) -> Result<GroundTruth, EngineError> {
        let at = |step| move |e: Error| EngineError::tagged(step, e);

        let bundle = bundle::fetch(url).await.map_err(at(Step::FetchDigest))?;
        debug!(domain = %bundle.domain, "Fetched attestation bundle");

        let code = sigstore::verify_bundle(&bundle.sigstore_bundle, &bundle.digest, repo, &self.fulcio_roots)
            .map_err(at(Step::VerifyCode))?;

        let vcek = bundle.vcek_der().map_err(at(Step::VerifyEnclave))?;
        let enclave = attestation::verify(
            &bundle.enclave_attestation_report,
            Some(&vcek),
            &self.kds_proxy,
            self.quotes.as_ref(),
        )
        .await
        .map_err(at(Step::VerifyEnclave))?;

        self.finish(
            &bundle.domain,
            bundle.digest.clone(),
            code,
            enclave,
            Some(&bundle.enclave_cert),
        )
    }

    fn finish(
        &self,
        host: &str,
        digest: String,
        code: Measurement,
        enclave: Verification,
        enclave_cert_pem: Option<&str>,
    ) -> Result<GroundTruth, EngineError> {
        code.equals(&enclave.measurement)
            .map_err(|e| EngineError::tagged(Step::CompareMeasurements, e))?;

        if let Some(pem) = enclave_cert_pem {
            let served = fingerprint::pem_cert_fingerprint(pem)
                .map_err(|e| EngineError::from_message(format!("validateTLS: {}", e)))?;
            if served != enclave.tls_public_key_fp {
                return Err(EngineError::from_message(format!(
                    "validateTLS: certificate key {} does not match attested key {}",
                    served, enclave.tls_public_key_fp
                )));
            }
        }

        let hardware = if enclave.measurement.predicate() == PredicateType::TdxGuestV2
            && !self.hardware_measurements.is_empty()
        {
            let matched = tdx::match_hardware(&enclave.measurement, &self.hardware_measurements)
                .map_err(|e| EngineError::from_message(format!("verifyHardware: {}", e)))?;
            Some(matched.clone())
        } else {
            None
        };

        Ok(GroundTruth {
            enclave_host: Some(host.to_string()),
            tls_public_key_fingerprint: enclave.tls_public_key_fp,
            recipient_encryption_key: enclave.hpke_public_key,
            digest,
            code_fingerprint: code.fingerprint(),
            enclave_fingerprint: enclave.measurement.fingerprint(),
            code_measurement: Some(code),
            enclave_measurement: Some(enclave.measurement),
            hardware_measurement: hardware,
        })
    }
}

#[async_trait]
impl AttestationEngine for NativeEngine {
    async fn verify(&self, target: &Target, repo: &str) -> Result<serde_json::Value, EngineError> {
        let ground_truth = match target {
            Target::Enclave(host) => self.verify_direct(host, repo).await?,
            Target::Bundle(url) => self.verify_from_bundle(url, repo).await?,
        };

        serde_json::to_value(&ground_truth)
            .map_err(|e| EngineError::from_message(format!("failed to encode ground truth: {}", e)))
    }
}
