//! Enclave attestation
//!
//! Fetches the enclave's attestation document from
//! `/.well-known/tinfoil-attestation`, decodes it (base64 + gzip) and checks
//! it against the AMD or Intel hardware root, yielding the runtime
//! measurement, the TLS key fingerprint and the HPKE recipient key.

pub mod sev;
pub mod tdx;
pub mod types;

use std::io::Read;

use base64::Engine;
use flate2::read::GzDecoder;

pub use types::{
    AttestationDocument, HardwareMeasurement, Measurement, MeasurementError, PredicateType,
    Verification,
};

use crate::error::{Error, Result};

/// Largest decompressed report accepted. SEV-SNP reports and TDX quotes are
/// a few KiB.
pub const MAX_REPORT_LEN: usize = 1024 * 1024;

/// Fetch attestation document from an enclave
pub async fn fetch(host: &str) -> Result<AttestationDocument> {
    let url = format!("https://{}/.well-known/tinfoil-attestation", host);

    let response = reqwest::get(&url)
        .await
        .map_err(|e| Error::AttestationFetch(format!("HTTP request failed: {}", e)))?;

    if !response.status().is_success() {
        return Err(Error::AttestationFetch(format!(
            "HTTP {}: {}",
            response.status(),
            response.status().canonical_reason().unwrap_or("Unknown error")
        )));
    }

    response
        .json()
        .await
        .map_err(|e| Error::AttestationFetch(format!("JSON parse failed: {}", e)))
}

/// Base64-decode and gunzip a report body
pub fn decode_body(body: &str) -> Result<Vec<u8>> {
    let compressed = base64::engine::general_purpose::STANDARD
        .decode(body.trim())
        .map_err(|e| Error::AttestationVerification(format!("Base64 decode failed: {}", e)))?;

    let mut report = Vec::new();
    GzDecoder::new(&compressed[..])
        .take(MAX_REPORT_LEN as u64 + 1)
        .read_to_end(&mut report)
        .map_err(|e| Error::AttestationVerification(format!("Gzip decompress failed: {}", e)))?;

    if report.len() > MAX_REPORT_LEN {
        return Err(Error::AttestationVerification(format!(
            "Decompressed report exceeds {} bytes",
            MAX_REPORT_LEN
        )));
    }

    Ok(report)
}

/// Verify an attestation document against its hardware root of trust.
///
/// `vcek_der` is used for SEV-SNP reports when the caller already holds the
/// VCEK (bundle mode); otherwise it is fetched from `kds_proxy`. TDX quotes
/// go through `quotes`.
pub async fn verify(
    doc: &AttestationDocument,
    vcek_der: Option<&[u8]>,
    kds_proxy: &str,
    quotes: &dyn tdx::QuoteVerifier,
) -> Result<Verification> {
    let report = decode_body(&doc.body)?;

    match doc.predicate() {
        PredicateType::SevGuestV2 => sev::verify(&report, vcek_der, kds_proxy).await,
        PredicateType::TdxGuestV2 => tdx::verify(&report, quotes).await,
        _ => Err(Error::AttestationVerification(format!(
            "Unsupported attestation format: {}",
            doc.format
        ))),
    }
}
