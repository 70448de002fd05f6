//! Core types for attestation verification

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const SEV_GUEST_V2: &str = "https://tinfoil.sh/predicate/sev-snp-guest/v2";
pub const TDX_GUEST_V2: &str = "https://tinfoil.sh/predicate/tdx-guest/v2";
pub const SNP_TDX_MULTIPLATFORM_V1: &str = "https://tinfoil.sh/predicate/snp-tdx-multiplatform/v1";

/// Predicate types for different attestation formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredicateType {
    SevGuestV2,
    TdxGuestV2,
    SnpTdxMultiPlatformV1,
    Unknown,
}

impl PredicateType {
    pub fn from_uri(uri: &str) -> Self {
        match uri {
            SEV_GUEST_V2 => PredicateType::SevGuestV2,
            TDX_GUEST_V2 => PredicateType::TdxGuestV2,
            SNP_TDX_MULTIPLATFORM_V1 => PredicateType::SnpTdxMultiPlatformV1,
            _ => PredicateType::Unknown,
        }
    }

    pub fn uri(self) -> &'static str {
        match self {
            PredicateType::SevGuestV2 => SEV_GUEST_V2,
            PredicateType::TdxGuestV2 => TDX_GUEST_V2,
            PredicateType::SnpTdxMultiPlatformV1 => SNP_TDX_MULTIPLATFORM_V1,
            PredicateType::Unknown => "unknown",
        }
    }
}

/// Raw attestation document from the enclave
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationDocument {
    pub format: String,
    /// Base64-encoded, gzipped attestation report
    pub body: String,
}

impl AttestationDocument {
    pub fn predicate(&self) -> PredicateType {
        PredicateType::from_uri(&self.format)
    }
}

/// Measurement registers of code, either expected (from the source
/// release) or observed (from the running enclave)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Measurement {
    /// Predicate URI naming the register layout
    #[serde(rename = "type")]
    pub kind: String,
    pub registers: Vec<String>,
}

impl Measurement {
    pub fn new(kind: PredicateType, registers: Vec<String>) -> Self {
        Self {
            kind: kind.uri().to_string(),
            registers,
        }
    }

    pub fn predicate(&self) -> PredicateType {
        PredicateType::from_uri(&self.kind)
    }

    /// Compare measurements, handling multi-platform predicates.
    ///
    /// Same-platform measurements must agree on kind and on every register
    /// in order; fingerprints alone are never trusted.
    pub fn equals(&self, other: &Measurement) -> Result<(), MeasurementError> {
        if self.predicate() == PredicateType::SnpTdxMultiPlatformV1 {
            return self.compare_multiplatform(other);
        }
        if other.predicate() == PredicateType::SnpTdxMultiPlatformV1 {
            return other.compare_multiplatform(self);
        }

        if self.kind != other.kind {
            return Err(MeasurementError::FormatMismatch);
        }
        if self.registers != other.registers {
            return Err(MeasurementError::RegisterMismatch);
        }

        Ok(())
    }

    /// `self` is the multi-platform source measurement:
    /// `[snp_measurement, rtmr1, rtmr2]`
    fn compare_multiplatform(&self, runtime: &Measurement) -> Result<(), MeasurementError> {
        if self.registers.len() < 3 {
            return Err(MeasurementError::TooFewRegisters);
        }

        match runtime.predicate() {
            PredicateType::SevGuestV2 => {
                let actual = runtime
                    .registers
                    .first()
                    .ok_or(MeasurementError::TooFewRegisters)?;
                if &self.registers[0] != actual {
                    return Err(MeasurementError::SnpMismatch);
                }
            }
            PredicateType::TdxGuestV2 => {
                // Runtime TDX layout: [MRTD, RTMR0, RTMR1, RTMR2, RTMR3]
                if runtime.registers.len() < 5 {
                    return Err(MeasurementError::TooFewRegisters);
                }
                if self.registers[1] != runtime.registers[2] {
                    return Err(MeasurementError::Rtmr1Mismatch);
                }
                if self.registers[2] != runtime.registers[3] {
                    return Err(MeasurementError::Rtmr2Mismatch);
                }
                if runtime.registers[4] != "0".repeat(96) {
                    return Err(MeasurementError::Rtmr3Mismatch);
                }
            }
            PredicateType::SnpTdxMultiPlatformV1 => {
                if self.registers != runtime.registers {
                    return Err(MeasurementError::RegisterMismatch);
                }
            }
            _ => return Err(MeasurementError::FormatMismatch),
        }

        Ok(())
    }

    /// SHA-256 over the `|`-joined registers, hex encoded
    pub fn fingerprint(&self) -> String {
        let joined = self.registers.join("|");
        hex::encode(Sha256::digest(joined.as_bytes()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MeasurementError {
    #[error("Attestation format mismatch")]
    FormatMismatch,

    #[error("Register values don't match")]
    RegisterMismatch,

    #[error("Too few registers in measurement")]
    TooFewRegisters,

    #[error("SNP measurement mismatch")]
    SnpMismatch,

    #[error("RTMR1 mismatch")]
    Rtmr1Mismatch,

    #[error("RTMR2 mismatch")]
    Rtmr2Mismatch,

    #[error("RTMR3 mismatch (expected zeros)")]
    Rtmr3Mismatch,
}

/// Boot-time TDX registers of a known-good platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareMeasurement {
    pub id: String,
    pub mrtd: String,
    pub rtmr0: String,
}

/// Result of successful attestation verification
#[derive(Debug, Clone)]
pub struct Verification {
    /// Enclave measurement registers
    pub measurement: Measurement,

    /// TLS public key fingerprint (hex-encoded SHA256)
    pub tls_public_key_fp: String,

    /// HPKE public key for encrypted communication (hex-encoded)
    pub hpke_public_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regs(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_structural_equality() {
        let a = Measurement::new(PredicateType::SevGuestV2, regs(&["aa"]));
        let b = Measurement::new(PredicateType::SevGuestV2, regs(&["aa"]));
        let c = Measurement::new(PredicateType::SevGuestV2, regs(&["bb"]));

        assert!(a.equals(&b).is_ok());
        assert_eq!(a.equals(&c), Err(MeasurementError::RegisterMismatch));
    }

    #[test]
    fn test_kind_mismatch_with_same_registers() {
        let a = Measurement::new(PredicateType::SevGuestV2, regs(&["aa"]));
        let b = Measurement {
            kind: "https://example.com/other".into(),
            registers: regs(&["aa"]),
        };
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.equals(&b), Err(MeasurementError::FormatMismatch));
    }

    #[test]
    fn test_multiplatform_against_tdx() {
        let zeros = "0".repeat(96);
        let source = Measurement::new(
            PredicateType::SnpTdxMultiPlatformV1,
            regs(&["snp", "r1", "r2"]),
        );
        let runtime = Measurement::new(
            PredicateType::TdxGuestV2,
            regs(&["mrtd", "r0", "r1", "r2", &zeros]),
        );
        assert!(source.equals(&runtime).is_ok());
        assert!(runtime.equals(&source).is_ok());

        let bad = Measurement::new(
            PredicateType::TdxGuestV2,
            regs(&["mrtd", "r0", "r1", "xx", &zeros]),
        );
        assert_eq!(source.equals(&bad), Err(MeasurementError::Rtmr2Mismatch));
    }

    #[test]
    fn test_multiplatform_against_sev() {
        let source = Measurement::new(
            PredicateType::SnpTdxMultiPlatformV1,
            regs(&["snp", "r1", "r2"]),
        );
        let runtime = Measurement::new(PredicateType::SevGuestV2, regs(&["snp"]));
        assert!(source.equals(&runtime).is_ok());

        let other = Measurement::new(PredicateType::SevGuestV2, regs(&["nope"]));
        assert_eq!(source.equals(&other), Err(MeasurementError::SnpMismatch));
    }

    #[test]
    fn test_measurement_json_shape() {
        let m = Measurement::new(PredicateType::TdxGuestV2, regs(&["a", "b"]));
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["type"], TDX_GUEST_V2);
        assert_eq!(json["registers"][1], "b");
    }
}
