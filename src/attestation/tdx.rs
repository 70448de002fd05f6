//! Intel TDX attestation verification
//!
//! The quote's ECDSA signature, the PCK chain to Intel's root and the TCB
//! status are checked by a [`QuoteVerifier`]; the production one is
//! [`DcapVerifier`] on top of `dcap-qvl`, with collateral from a PCCS.
//!
//! Only the verified TD report is used afterwards. Its 64 bytes of report
//! data hold the key material: the TLS key fingerprint, then the HPKE
//! recipient key.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::types::{HardwareMeasurement, Measurement, PredicateType, Verification};
use crate::error::{Error, Result};

/// Intel's public PCS, which serves collateral for every platform
pub const INTEL_PCS_URL: &str = "https://api.trustedservices.intel.com";

const REGISTER_LEN: usize = 48;
const REPORT_DATA_LEN: usize = 64;

/// TD attributes bit 0: the TD runs in debug mode
const TD_ATTR_DEBUG: u8 = 0x01;

/// Fields of a TD report whose quote signature has been verified
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TdReport {
    pub mr_td: [u8; REGISTER_LEN],
    pub rt_mrs: [[u8; REGISTER_LEN]; 4],
    pub report_data: [u8; REPORT_DATA_LEN],
    pub td_attributes: [u8; 8],
}

impl TdReport {
    /// MRTD followed by RTMR0..RTMR3
    pub fn measurement(&self) -> Measurement {
        let registers = std::iter::once(&self.mr_td)
            .chain(self.rt_mrs.iter())
            .map(hex::encode)
            .collect();
        Measurement::new(PredicateType::TdxGuestV2, registers)
    }

    pub fn is_debug(&self) -> bool {
        self.td_attributes[0] & TD_ATTR_DEBUG != 0
    }
}

/// Checks a raw TDX quote against Intel's root of trust
#[async_trait]
pub trait QuoteVerifier: Send + Sync {
    /// Return the TD report of `quote` once its signature chain verifies
    async fn verify_quote(&self, quote: &[u8]) -> Result<TdReport>;
}

/// DCAP quote verification with collateral fetched from `pccs_url`
#[derive(Debug, Clone)]
pub struct DcapVerifier {
    pccs_url: String,
}

impl DcapVerifier {
    pub fn new(pccs_url: impl Into<String>) -> Self {
        Self {
            pccs_url: pccs_url.into(),
        }
    }
}

impl Default for DcapVerifier {
    fn default() -> Self {
        Self::new(INTEL_PCS_URL)
    }
}

fn tdx_err(context: &str, e: impl std::fmt::Display) -> Error {
    Error::AttestationVerification(format!("{}: {}", context, e))
}

#[async_trait]
impl QuoteVerifier for DcapVerifier {
    async fn verify_quote(&self, quote: &[u8]) -> Result<TdReport> {
        // Rejects malformed quotes before any collateral request
        dcap_qvl::quote::Quote::parse(quote).map_err(|e| tdx_err("Invalid TDX quote", e))?;

        let collateral = dcap_qvl::collateral::get_collateral(&self.pccs_url, quote)
            .await
            .map_err(|e| tdx_err("Failed to fetch TDX collateral", e))?;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| tdx_err("System clock before epoch", e))?
            .as_secs();
        let verified = dcap_qvl::verify::verify(quote, &collateral, now)
            .map_err(|e| tdx_err("TDX quote verification failed", e))?;

        if verified.status != "UpToDate" {
            warn!(status = %verified.status, advisories = ?verified.advisory_ids, "TDX TCB is not up to date");
        }

        let td = verified
            .report
            .as_td10()
            .ok_or_else(|| Error::AttestationVerification("Quote does not carry a TD report".into()))?;

        Ok(TdReport {
            mr_td: td.mr_td,
            rt_mrs: [td.rt_mr0, td.rt_mr1, td.rt_mr2, td.rt_mr3],
            report_data: td.report_data,
            td_attributes: td.td_attributes,
        })
    }
}

/// Verify a decompressed TDX quote and extract measurements and keys
pub async fn verify(quote: &[u8], verifier: &dyn QuoteVerifier) -> Result<Verification> {
    let report = verifier.verify_quote(quote).await?;

    if report.is_debug() {
        return Err(Error::AttestationVerification("TD is running in debug mode".into()));
    }
    debug!("TDX quote verified");

    Ok(Verification {
        measurement: report.measurement(),
        tls_public_key_fp: hex::encode(&report.report_data[..32]),
        hpke_public_key: Some(hex::encode(&report.report_data[32..])),
    })
}

/// Find the allowlisted platform whose MRTD and RTMR0 match `measurement`
pub fn match_hardware<'a>(
    measurement: &Measurement,
    allowed: &'a [HardwareMeasurement],
) -> Result<&'a HardwareMeasurement> {
    let (mrtd, rtmr0) = match measurement.registers.as_slice() {
        [mrtd, rtmr0, ..] if measurement.predicate() == PredicateType::TdxGuestV2 => (mrtd, rtmr0),
        _ => {
            return Err(Error::AttestationVerification(
                "measurement is not a TDX measurement".into(),
            ))
        }
    };

    allowed
        .iter()
        .find(|hw| hw.mrtd.eq_ignore_ascii_case(mrtd) && hw.rtmr0.eq_ignore_ascii_case(rtmr0))
        .ok_or_else(|| {
            Error::AttestationVerification(format!(
                "no known platform matches MRTD {}",
                &mrtd[..mrtd.len().min(16)]
            ))
        })
}
