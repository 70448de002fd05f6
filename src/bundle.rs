//! Self-contained attestation bundles
//!
//! A bundle carries everything needed to verify an enclave without talking
//! to it first: the release digest and Sigstore bundle, the enclave's
//! attestation report, the VCEK, and the enclave's TLS certificate.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;

use crate::attestation::AttestationDocument;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestationBundle {
    /// Enclave host the bundle describes
    pub domain: String,
    pub enclave_attestation_report: AttestationDocument,
    pub digest: String,
    #[serde(alias = "provenanceBundle")]
    pub sigstore_bundle: serde_json::Value,
    /// Base64 DER VCEK
    #[serde(alias = "hardwareCert")]
    pub vcek: String,
    /// PEM TLS certificate served by the enclave
    pub enclave_cert: String,
}

impl AttestationBundle {
    pub fn vcek_der(&self) -> Result<Vec<u8>> {
        Ok(STANDARD.decode(self.vcek.trim())?)
    }
}

/// Fetch a bundle from `url`
pub async fn fetch(url: &str) -> Result<AttestationBundle> {
    let response = reqwest::get(url)
        .await
        .map_err(|e| Error::AttestationFetch(format!("Bundle request failed: {}", e)))?;

    if !response.status().is_success() {
        return Err(Error::AttestationFetch(format!(
            "Bundle fetch failed: HTTP {}",
            response.status()
        )));
    }

    response
        .json()
        .await
        .map_err(|e| Error::AttestationFetch(format!("Invalid bundle: {}", e)))
}
