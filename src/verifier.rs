//! Verification orchestration
//!
//! [`Verifier::verify`] runs the attestation engine for the configured
//! target, attributes any failure to one of the four verification steps and
//! records a fresh [`VerificationDocument`] on every call, whether it
//! succeeds or not.
//!
//! ## Steps
//! 1. `fetchDigest` - obtain the release digest and provenance bundle
//! 2. `verifyCode` - prove the digest was built from the repository
//! 3. `verifyEnclave` - validate the enclave's hardware attestation
//! 4. `compareMeasurements` - expected and runtime measurements must match

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::attestation::types::{HardwareMeasurement, Measurement};
use crate::config::Target;
use crate::engine::AttestationEngine;
use crate::error::{Error, Result};

/// The mandatory verification steps, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Step {
    FetchDigest,
    VerifyCode,
    VerifyEnclave,
    CompareMeasurements,
}

impl Step {
    pub const ALL: [Step; 4] = [
        Step::FetchDigest,
        Step::VerifyCode,
        Step::VerifyEnclave,
        Step::CompareMeasurements,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Step::FetchDigest => "fetchDigest",
            Step::VerifyCode => "verifyCode",
            Step::VerifyEnclave => "verifyEnclave",
            Step::CompareMeasurements => "compareMeasurements",
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "error", rename_all = "camelCase")]
pub enum StepState {
    #[default]
    Pending,
    Success,
    Failed(String),
}

impl StepState {
    pub fn is_success(&self) -> bool {
        matches!(self, StepState::Success)
    }
}

/// Per-step outcome of one verification run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationSteps {
    pub fetch_digest: StepState,
    pub verify_code: StepState,
    pub verify_enclave: StepState,
    pub compare_measurements: StepState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create_transport: Option<StepState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verify_hpke_key: Option<StepState>,
    /// Failure whose originating step is unknown
    #[serde(skip_serializing_if = "Option::is_none")]
    pub other_error: Option<String>,
}

impl VerificationSteps {
    pub fn succeeded() -> Self {
        Self {
            fetch_digest: StepState::Success,
            verify_code: StepState::Success,
            verify_enclave: StepState::Success,
            compare_measurements: StepState::Success,
            ..Self::default()
        }
    }

    /// Steps before `failed` succeeded, `failed` failed, the rest never ran
    pub fn failed_at(failed: Step, reason: impl Into<String>) -> Self {
        let mut steps = Self::default();
        let mut reason = Some(reason.into());
        for step in Step::ALL {
            let state = if step == failed {
                StepState::Failed(reason.take().unwrap_or_default())
            } else if reason.is_some() {
                StepState::Success
            } else {
                StepState::Pending
            };
            *steps.state_mut(step) = state;
        }
        steps
    }

    /// A failure that cannot be attributed leaves every step pending
    pub fn unattributed(reason: impl Into<String>) -> Self {
        Self {
            other_error: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn state(&self, step: Step) -> &StepState {
        match step {
            Step::FetchDigest => &self.fetch_digest,
            Step::VerifyCode => &self.verify_code,
            Step::VerifyEnclave => &self.verify_enclave,
            Step::CompareMeasurements => &self.compare_measurements,
        }
    }

    fn state_mut(&mut self, step: Step) -> &mut StepState {
        match step {
            Step::FetchDigest => &mut self.fetch_digest,
            Step::VerifyCode => &mut self.verify_code,
            Step::VerifyEnclave => &mut self.verify_enclave,
            Step::CompareMeasurements => &mut self.compare_measurements,
        }
    }

    pub fn is_complete(&self) -> bool {
        Step::ALL.iter().all(|s| self.state(*s).is_success())
    }

    /// No step is `Success` after a step that is not
    pub fn is_ordered(&self) -> bool {
        Step::ALL
            .windows(2)
            .all(|w| !self.state(w[1]).is_success() || self.state(w[0]).is_success())
    }
}

/// Trust anchor produced by a successful verification run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroundTruth {
    #[serde(default)]
    pub enclave_host: Option<String>,
    #[serde(alias = "tlsPublicKey")]
    pub tls_public_key_fingerprint: String,
    #[serde(default, alias = "hpkePublicKey")]
    pub recipient_encryption_key: Option<String>,
    pub digest: String,
    #[serde(default)]
    pub code_measurement: Option<Measurement>,
    #[serde(default)]
    pub enclave_measurement: Option<Measurement>,
    #[serde(default)]
    pub hardware_measurement: Option<HardwareMeasurement>,
    #[serde(default)]
    pub code_fingerprint: String,
    #[serde(default)]
    pub enclave_fingerprint: String,
}

/// Snapshot of one verification run, successful or not
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationDocument {
    pub config_repo: String,
    pub enclave_host: String,
    pub digest: String,
    pub code_measurement: Option<Measurement>,
    pub enclave_measurement: Option<Measurement>,
    pub tls_public_key: String,
    pub hpke_public_key: String,
    pub hardware_measurement: Option<HardwareMeasurement>,
    pub code_fingerprint: String,
    pub enclave_fingerprint: String,
    pub steps: VerificationSteps,
    security_verified: bool,
}

impl VerificationDocument {
    pub fn new(repo: &str, ground_truth: Option<&GroundTruth>, steps: VerificationSteps) -> Self {
        let security_verified = ground_truth.is_some() && steps.is_complete();
        let gt = ground_truth;

        Self {
            config_repo: repo.to_string(),
            enclave_host: gt.and_then(|g| g.enclave_host.clone()).unwrap_or_default(),
            digest: gt.map(|g| g.digest.clone()).unwrap_or_default(),
            code_measurement: gt.and_then(|g| g.code_measurement.clone()),
            enclave_measurement: gt.and_then(|g| g.enclave_measurement.clone()),
            tls_public_key: gt.map(|g| g.tls_public_key_fingerprint.clone()).unwrap_or_default(),
            hpke_public_key: gt.and_then(|g| g.recipient_encryption_key.clone()).unwrap_or_default(),
            hardware_measurement: gt.and_then(|g| g.hardware_measurement.clone()),
            code_fingerprint: gt.map(|g| g.code_fingerprint.clone()).unwrap_or_default(),
            enclave_fingerprint: gt.map(|g| g.enclave_fingerprint.clone()).unwrap_or_default(),
            steps,
            security_verified,
        }
    }

    /// `true` iff all four mandatory steps succeeded
    pub fn security_verified(&self) -> bool {
        self.security_verified
    }

    /// Copy of this document with the transport steps recorded
    pub fn with_transport_steps(&self, create_transport: StepState, verify_hpke_key: Option<StepState>) -> Self {
        let mut next = self.clone();
        next.steps.create_transport = Some(create_transport);
        next.steps.verify_hpke_key = verify_hpke_key;
        next
    }
}

/// Runs verification against an attestation engine
pub struct Verifier {
    repo: String,
    target: Target,
    engine: Arc<dyn AttestationEngine>,
    last_document: Mutex<Option<VerificationDocument>>,
}

impl Verifier {
    pub fn new(repo: impl Into<String>, target: Target, engine: Arc<dyn AttestationEngine>) -> Self {
        Self {
            repo: repo.into(),
            target,
            engine,
            last_document: Mutex::new(None),
        }
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Document from the most recent `verify()` call
    pub fn last_document(&self) -> Option<VerificationDocument> {
        self.last_document
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Verify the enclave and return its ground truth
    pub async fn verify(&self) -> Result<GroundTruth> {
        info!(repo = %self.repo, target = ?self.target, "Verifying enclave");

        match self.run().await {
            Ok(ground_truth) => {
                self.record(VerificationDocument::new(
                    &self.repo,
                    Some(&ground_truth),
                    VerificationSteps::succeeded(),
                ));
                info!(
                    host = ground_truth.enclave_host.as_deref().unwrap_or_default(),
                    "Enclave verified"
                );
                Ok(ground_truth)
            }
            Err((step, message)) => {
                let steps = match step {
                    Some(step) => VerificationSteps::failed_at(step, message.clone()),
                    None => VerificationSteps::unattributed(message.clone()),
                };
                self.record(VerificationDocument::new(&self.repo, None, steps));
                warn!(step = ?step, "Verification failed: {}", message);
                Err(Error::Verification { step, message })
            }
        }
    }

    fn record(&self, document: VerificationDocument) {
        *self
            .last_document
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(document);
    }

    async fn run(&self) -> std::result::Result<GroundTruth, (Option<Step>, String)> {
        let output = self
            .engine
            .verify(&self.target, &self.repo)
            .await
            .map_err(|e| (e.step(), e.message))?;

        let mut ground_truth: GroundTruth = serde_json::from_value(output)
            .map_err(|e| (None, format!("invalid verification output: {}", e)))?;

        if let Target::Enclave(host) = &self.target {
            ground_truth.enclave_host = Some(host.clone());
        }
        if ground_truth.enclave_host.as_deref().unwrap_or_default().is_empty() {
            return Err((None, "verification output names no enclave host".into()));
        }
        if ground_truth.tls_public_key_fingerprint.is_empty() {
            return Err((
                Some(Step::VerifyEnclave),
                "attestation carries no TLS key fingerprint".into(),
            ));
        }

        let (Some(code), Some(enclave)) = (
            ground_truth.code_measurement.as_ref(),
            ground_truth.enclave_measurement.as_ref(),
        ) else {
            return Err((
                Some(Step::CompareMeasurements),
                "verification output is missing a measurement".into(),
            ));
        };
        code.equals(enclave)
            .map_err(|e| (Some(Step::CompareMeasurements), e.to_string()))?;

        if ground_truth.code_fingerprint.is_empty() {
            ground_truth.code_fingerprint = code.fingerprint();
        }
        if ground_truth.enclave_fingerprint.is_empty() {
            ground_truth.enclave_fingerprint = enclave.fingerprint();
        }

        Ok(ground_truth)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::attestation::types::PredicateType;
    use crate::engine::EngineError;
    use async_trait::async_trait;
    use serde_json::json;

    type EngineResult = std::result::Result<serde_json::Value, EngineError>;

    /// Engine returning canned results in order; the last one repeats
    pub(crate) struct MockEngine(Mutex<std::collections::VecDeque<EngineResult>>);

    impl MockEngine {
        pub(crate) fn new(result: EngineResult) -> Self {
            Self::sequence(vec![result])
        }

        pub(crate) fn sequence(results: Vec<EngineResult>) -> Self {
            Self(Mutex::new(results.into()))
        }
    }

    #[async_trait]
    impl AttestationEngine for MockEngine {
        async fn verify(&self, _target: &Target, _repo: &str) -> EngineResult {
            let mut queue = self.0.lock().unwrap();
            match queue.len() {
                0 => Err(EngineError::from_message("no canned result")),
                1 => queue[0].clone(),
                _ => queue.pop_front().unwrap(),
            }
        }
    }

    pub(crate) fn consistent_output(tls_fp: &str, hpke: Option<&str>) -> serde_json::Value {
        let m = Measurement::new(PredicateType::SevGuestV2, vec!["aa".repeat(48)]);
        json!({
            "tlsPublicKeyFingerprint": tls_fp,
            "recipientEncryptionKey": hpke,
            "digest": "d1gest",
            "codeMeasurement": m,
            "enclaveMeasurement": m,
        })
    }

    fn verifier(result: EngineResult) -> Verifier {
        sequence_verifier(vec![result])
    }

    fn sequence_verifier(results: Vec<EngineResult>) -> Verifier {
        Verifier::new(
            "org/repo",
            Target::Enclave("enclave.example.com".into()),
            Arc::new(MockEngine::sequence(results)),
        )
    }

    #[tokio::test]
    async fn test_consistent_backend_verifies() {
        let v = verifier(Ok(consistent_output(&"ab".repeat(32), Some(&"cd".repeat(32)))));
        let gt = v.verify().await.unwrap();

        assert_eq!(gt.enclave_host.as_deref(), Some("enclave.example.com"));
        assert_eq!(gt.code_fingerprint.len(), 64);

        let doc = v.last_document().unwrap();
        assert!(doc.security_verified());
        assert_eq!(doc.steps, VerificationSteps::succeeded());
        assert_eq!(doc.tls_public_key, "ab".repeat(32));
        assert_eq!(doc.config_repo, "org/repo");
    }

    #[tokio::test]
    async fn test_register_mismatch_fails_compare_step() {
        let mut output = consistent_output(&"ab".repeat(32), None);
        output["enclaveMeasurement"]["registers"] = json!(["ff".repeat(48)]);

        let v = verifier(Ok(output));
        let err = v.verify().await.unwrap_err();
        assert_eq!(err.step(), Some(Step::CompareMeasurements));

        let doc = v.last_document().unwrap();
        assert!(!doc.security_verified());
        assert!(doc.steps.fetch_digest.is_success());
        assert!(doc.steps.verify_code.is_success());
        assert!(doc.steps.verify_enclave.is_success());
        assert!(matches!(doc.steps.compare_measurements, StepState::Failed(_)));
        assert!(doc.tls_public_key.is_empty());
    }

    #[tokio::test]
    async fn test_prefixed_engine_error_is_attributed() {
        let v = verifier(Err(EngineError::from_message("verifyCode: bad signature")));
        let err = v.verify().await.unwrap_err();
        assert_eq!(err.step(), Some(Step::VerifyCode));

        let steps = v.last_document().unwrap().steps;
        assert!(steps.fetch_digest.is_success());
        assert_eq!(steps.verify_code, StepState::Failed("verifyCode: bad signature".into()));
        assert_eq!(steps.verify_enclave, StepState::Pending);
        assert_eq!(steps.compare_measurements, StepState::Pending);
    }

    #[tokio::test]
    async fn test_unclassified_error_goes_to_other_slot() {
        let v = verifier(Err(EngineError::from_message("socket closed")));
        let err = v.verify().await.unwrap_err();
        assert_eq!(err.step(), None);

        let steps = v.last_document().unwrap().steps;
        assert_eq!(steps.other_error.as_deref(), Some("socket closed"));
        for step in Step::ALL {
            assert_eq!(steps.state(step), &StepState::Pending);
        }
    }

    #[tokio::test]
    async fn test_document_replaced_on_each_call() {
        let v = sequence_verifier(vec![
            Err(EngineError::from_message("fetchDigest: 404")),
            Ok(consistent_output(&"ab".repeat(32), None)),
        ]);
        assert!(v.last_document().is_none());

        assert!(v.verify().await.is_err());
        let first = v.last_document().unwrap();
        assert!(matches!(first.steps.fetch_digest, StepState::Failed(_)));

        v.verify().await.unwrap();
        let second = v.last_document().unwrap();
        assert!(second.security_verified());
        assert_eq!(second.steps.fetch_digest, StepState::Success);
    }

    #[tokio::test]
    async fn test_bundle_target_uses_discovered_host() {
        let mut output = consistent_output(&"ab".repeat(32), None);
        output["enclaveHost"] = json!("discovered.example.com");

        let v = Verifier::new(
            "org/repo",
            Target::Bundle("https://atc.example.com/attestation".into()),
            Arc::new(MockEngine::new(Ok(output))),
        );
        let gt = v.verify().await.unwrap();
        assert_eq!(gt.enclave_host.as_deref(), Some("discovered.example.com"));
    }

    #[tokio::test]
    async fn test_malformed_output_is_unattributed() {
        let v = verifier(Ok(json!({ "unexpected": true })));
        let err = v.verify().await.unwrap_err();
        assert_eq!(err.step(), None);
        assert!(v.last_document().unwrap().steps.other_error.is_some());
    }

    #[test]
    fn test_security_verified_iff_all_steps_succeed() {
        let gt: GroundTruth =
            serde_json::from_value(consistent_output(&"ab".repeat(32), None)).unwrap();
        let states = [
            StepState::Pending,
            StepState::Success,
            StepState::Failed("x".into()),
        ];

        for a in &states {
            for b in &states {
                for c in &states {
                    for d in &states {
                        let steps = VerificationSteps {
                            fetch_digest: a.clone(),
                            verify_code: b.clone(),
                            verify_enclave: c.clone(),
                            compare_measurements: d.clone(),
                            ..Default::default()
                        };
                        let all = [a, b, c, d].iter().all(|s| s.is_success());
                        let doc = VerificationDocument::new("org/repo", Some(&gt), steps.clone());
                        assert_eq!(doc.security_verified(), all);

                        let empty = VerificationDocument::new("org/repo", None, steps);
                        assert!(!empty.security_verified());
                    }
                }
            }
        }
    }

    #[test]
    fn test_failed_at_is_ordered() {
        for step in Step::ALL {
            let steps = VerificationSteps::failed_at(step, "boom");
            assert!(steps.is_ordered());
            assert!(!steps.is_complete());
            assert_eq!(steps.state(step), &StepState::Failed("boom".into()));
        }
        assert!(VerificationSteps::succeeded().is_ordered());
    }

    #[test]
    fn test_step_state_json() {
        let json = serde_json::to_value(VerificationSteps::failed_at(Step::VerifyEnclave, "nope")).unwrap();
        assert_eq!(json["fetchDigest"]["status"], "success");
        assert_eq!(json["verifyEnclave"]["status"], "failed");
        assert_eq!(json["verifyEnclave"]["error"], "nope");
        assert_eq!(json["compareMeasurements"]["status"], "pending");
    }
}
