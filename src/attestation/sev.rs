//! AMD SEV-SNP attestation verification
//!
//! A report is trusted when:
//! 1. the AMD root key (ARK) matches the pinned fingerprint,
//! 2. ARK → ASK → VCEK signatures verify (RSA-PSS SHA-384),
//! 3. the report body is signed by the VCEK (ECDSA P-384).
//!
//! The VCEK is fetched from the KDS proxy unless the caller already has it
//! (attestation bundles ship it alongside the report).

use der::asn1::Utf8StringRef;
use der::{Decode, Encode};
use sha2::Sha384;
use tracing::debug;
use x509_cert::Certificate;

use super::types::{Measurement, PredicateType, Verification};
use crate::error::{Error, Result};
use crate::fingerprint::spki_fingerprint;

// SEV-SNP report layout (v2/v3)
const REPORT_SIZE: usize = 1184;
const REPORT_DATA: std::ops::Range<usize> = 80..144;
const MEASUREMENT: std::ops::Range<usize> = 144..192;
const REPORTED_TCB: std::ops::Range<usize> = 384..392;
const CHIP_ID: std::ops::Range<usize> = 416..480;
const SIGNED_LEN: usize = 672;

// Signature: R and S as 72-byte little-endian slots holding 48-byte scalars
const SIG_SLOT: usize = 72;
const SIG_SCALAR: usize = 48;

/// SPKI SHA-256 of AMD's ARK for Genoa processors.
///
/// ```bash
/// curl -s 'https://kds.amd.com/vcek/v1/Genoa/cert_chain' | \
///   openssl x509 -pubkey -noout | \
///   openssl pkey -pubin -outform DER | sha256sum
/// ```
const AMD_ARK_GENOA_SPKI_FINGERPRINT: &str =
    "429a69c9422aa258ee4d8db5fcda9c6470ef15f8cd5a9cebd6cbc7d90b863831";

/// The fields of an SNP report this client relies on
pub(crate) struct SnpReport<'a> {
    raw: &'a [u8],
}

/// TCB components used to address the VCEK
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Tcb {
    pub bootloader: u8,
    pub tee: u8,
    pub snp: u8,
    pub microcode: u8,
}

impl<'a> SnpReport<'a> {
    pub fn parse(raw: &'a [u8]) -> Result<Self> {
        if raw.len() != REPORT_SIZE {
            return Err(Error::AttestationVerification(format!(
                "Invalid report size: expected {}, got {}",
                REPORT_SIZE,
                raw.len()
            )));
        }

        let version = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        if !(2..=3).contains(&version) {
            return Err(Error::AttestationVerification(format!(
                "Unexpected report version: {}",
                version
            )));
        }

        Ok(Self { raw })
    }

    pub fn measurement(&self) -> &[u8] {
        &self.raw[MEASUREMENT]
    }

    /// First half: TLS key fingerprint. Second half: HPKE public key.
    pub fn report_data(&self) -> &[u8] {
        &self.raw[REPORT_DATA]
    }

    pub fn chip_id(&self) -> &[u8] {
        &self.raw[CHIP_ID]
    }

    pub fn tcb(&self) -> Tcb {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.raw[REPORTED_TCB]);
        let value = u64::from_le_bytes(bytes);
        Tcb {
            bootloader: (value & 0xFF) as u8,
            tee: ((value >> 8) & 0xFF) as u8,
            snp: ((value >> 48) & 0xFF) as u8,
            microcode: ((value >> 56) & 0xFF) as u8,
        }
    }

    pub fn signed_body(&self) -> &[u8] {
        &self.raw[..SIGNED_LEN]
    }

    /// Big-endian (R, S)
    pub fn signature(&self) -> ([u8; SIG_SCALAR], [u8; SIG_SCALAR]) {
        let sig = &self.raw[SIGNED_LEN..];
        (
            le_scalar(&sig[..SIG_SCALAR]),
            le_scalar(&sig[SIG_SLOT..SIG_SLOT + SIG_SCALAR]),
        )
    }
}

fn le_scalar(le: &[u8]) -> [u8; SIG_SCALAR] {
    let mut be = [0u8; SIG_SCALAR];
    for (dst, src) in be.iter_mut().zip(le.iter().rev()) {
        *dst = *src;
    }
    be
}

/// Verify an SNP report and extract measurement and keys.
///
/// `vcek_der` skips the KDS lookup when the VCEK is already known.
pub async fn verify(report_bytes: &[u8], vcek_der: Option<&[u8]>, kds_proxy: &str) -> Result<Verification> {
    let report = SnpReport::parse(report_bytes)?;

    let vcek = match vcek_der {
        Some(der) => der.to_vec(),
        None => fetch_vcek(kds_proxy, report.chip_id(), report.tcb()).await?,
    };
    let chain = fetch_cert_chain(kds_proxy).await?;

    verify_cert_chain(&vcek, &chain)?;
    verify_report_signature(&report, &vcek)?;
    debug!("SEV-SNP report signature verified against VCEK");

    Ok(extract(&report))
}

fn extract(report: &SnpReport<'_>) -> Verification {
    let report_data = report.report_data();
    Verification {
        measurement: Measurement::new(
            PredicateType::SevGuestV2,
            vec![hex::encode(report.measurement())],
        ),
        tls_public_key_fp: hex::encode(&report_data[..32]),
        hpke_public_key: Some(hex::encode(&report_data[32..])),
    }
}

async fn fetch_vcek(kds_proxy: &str, chip_id: &[u8], tcb: Tcb) -> Result<Vec<u8>> {
    let url = format!(
        "{}/vcek/v1/Genoa/{}?blSPL={}&teeSPL={}&snpSPL={}&ucodeSPL={}",
        kds_proxy,
        hex::encode(chip_id),
        tcb.bootloader,
        tcb.tee,
        tcb.snp,
        tcb.microcode
    );
    fetch_bytes(&url, "VCEK").await
}

async fn fetch_cert_chain(kds_proxy: &str) -> Result<Vec<u8>> {
    let url = format!("{}/vcek/v1/Genoa/cert_chain", kds_proxy);
    fetch_bytes(&url, "cert chain").await
}

async fn fetch_bytes(url: &str, what: &str) -> Result<Vec<u8>> {
    let response = reqwest::get(url)
        .await
        .map_err(|e| Error::AttestationVerification(format!("Failed to fetch {}: {}", what, e)))?;

    if !response.status().is_success() {
        return Err(Error::AttestationVerification(format!(
            "{} fetch failed: HTTP {}",
            what,
            response.status()
        )));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| Error::AttestationVerification(format!("Failed to read {}: {}", what, e)))?;
    Ok(bytes.to_vec())
}

fn parse_cert(der: &[u8], what: &str) -> Result<Certificate> {
    Certificate::from_der(der)
        .map_err(|e| Error::AttestationVerification(format!("Failed to parse {}: {}", what, e)))
}

/// Verify ARK pin, issuer chaining, CNs and the three RSA-PSS signatures
fn verify_cert_chain(vcek_der: &[u8], chain_pem: &[u8]) -> Result<()> {
    let chain = pem::parse_many(chain_pem)
        .map_err(|e| Error::AttestationVerification(format!("Failed to parse PEM chain: {}", e)))?;
    let [ask_pem, ark_pem, ..] = chain.as_slice() else {
        return Err(Error::AttestationVerification(
            "Certificate chain should contain ASK and ARK".into(),
        ));
    };
    let (ask_der, ark_der) = (ask_pem.contents(), ark_pem.contents());

    let ark_fingerprint = spki_fingerprint(ark_der)?;
    if ark_fingerprint != AMD_ARK_GENOA_SPKI_FINGERPRINT {
        return Err(Error::AttestationVerification(format!(
            "ARK public key fingerprint mismatch: expected {}, got {}",
            AMD_ARK_GENOA_SPKI_FINGERPRINT, ark_fingerprint
        )));
    }

    let vcek = parse_cert(vcek_der, "VCEK")?;
    let ask = parse_cert(ask_der, "ASK")?;
    let ark = parse_cert(ark_der, "ARK")?;

    if vcek.tbs_certificate.issuer != ask.tbs_certificate.subject {
        return Err(Error::AttestationVerification(
            "VCEK issuer does not match ASK subject".into(),
        ));
    }
    if ask.tbs_certificate.issuer != ark.tbs_certificate.subject {
        return Err(Error::AttestationVerification(
            "ASK issuer does not match ARK subject".into(),
        ));
    }
    if ark.tbs_certificate.issuer != ark.tbs_certificate.subject {
        return Err(Error::AttestationVerification("ARK is not self-signed".into()));
    }

    expect_cn(&ark, "ARK-Genoa")?;
    expect_cn(&ask, "SEV-Genoa")?;

    verify_rsa_pss(&ark, &ark, "ARK self-signature")?;
    verify_rsa_pss(&ask, &ark, "ASK signature")?;
    verify_rsa_pss(&vcek, &ask, "VCEK signature")?;

    Ok(())
}

fn verify_rsa_pss(subject: &Certificate, issuer: &Certificate, context: &str) -> Result<()> {
    use rsa::pkcs8::DecodePublicKey;
    use rsa::pss::{Signature, VerifyingKey};
    use rsa::signature::Verifier;
    use rsa::RsaPublicKey;

    let issuer_spki = issuer
        .tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(|e| Error::AttestationVerification(format!("Failed to encode SPKI: {}", e)))?;
    let tbs = subject
        .tbs_certificate
        .to_der()
        .map_err(|e| Error::AttestationVerification(format!("Failed to encode TBS: {}", e)))?;

    let key = RsaPublicKey::from_public_key_der(&issuer_spki).map_err(|e| {
        Error::AttestationVerification(format!("Invalid RSA public key for {}: {}", context, e))
    })?;
    let signature = Signature::try_from(subject.signature.raw_bytes()).map_err(|e| {
        Error::AttestationVerification(format!("Invalid signature format for {}: {}", context, e))
    })?;

    VerifyingKey::<Sha384>::new(key)
        .verify(&tbs, &signature)
        .map_err(|e| Error::AttestationVerification(format!("{} verification failed: {}", context, e)))
}

fn expect_cn(cert: &Certificate, expected: &str) -> Result<()> {
    use x509_cert::der::oid::db::rfc4519::CN;

    let cn = cert
        .tbs_certificate
        .subject
        .0
        .iter()
        .flat_map(|rdn| rdn.0.iter())
        .find(|atv| atv.oid == CN)
        .and_then(|atv| {
            atv.value
                .decode_as::<Utf8StringRef<'_>>()
                .map(|s| s.as_str().to_string())
                .ok()
                .or_else(|| std::str::from_utf8(atv.value.value()).ok().map(String::from))
        })
        .ok_or_else(|| Error::AttestationVerification("No CN found in certificate".into()))?;

    if cn != expected {
        return Err(Error::AttestationVerification(format!(
            "Unexpected CN: {}, expected {}",
            cn, expected
        )));
    }
    Ok(())
}

#[allow(deprecated)]
fn verify_report_signature(report: &SnpReport<'_>, vcek_der: &[u8]) -> Result<()> {
    use p384::ecdsa::{signature::Verifier, Signature, VerifyingKey};
    use p384::elliptic_curve::generic_array::GenericArray;

    let vcek = parse_cert(vcek_der, "VCEK")?;
    let point = vcek
        .tbs_certificate
        .subject_public_key_info
        .subject_public_key
        .raw_bytes();
    let key = VerifyingKey::from_sec1_bytes(point)
        .map_err(|e| Error::AttestationVerification(format!("Invalid VCEK public key: {}", e)))?;

    let (r, s) = report.signature();
    if r.iter().all(|&b| b == 0) || s.iter().all(|&b| b == 0) {
        return Err(Error::AttestationVerification(
            "Invalid ECDSA signature components".into(),
        ));
    }
    let signature = Signature::from_scalars(
        GenericArray::clone_from_slice(&r),
        GenericArray::clone_from_slice(&s),
    )
    .map_err(|e| Error::AttestationVerification(format!("Invalid signature format: {}", e)))?;

    key.verify(report.signed_body(), &signature)
        .map_err(|e| Error::AttestationVerification(format!("Signature verification failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_report() -> Vec<u8> {
        let mut raw = vec![0u8; REPORT_SIZE];
        raw[0] = 2;
        raw
    }

    #[test]
    fn test_report_size_and_version_checked() {
        assert!(SnpReport::parse(&[0u8; 100]).is_err());

        let mut raw = blank_report();
        raw[0] = 7;
        assert!(SnpReport::parse(&raw).is_err());
    }

    #[test]
    fn test_signature_scalars_are_byte_swapped() {
        let mut raw = blank_report();
        for i in 0..48 {
            raw[SIGNED_LEN + i] = (48 - i) as u8;
            raw[SIGNED_LEN + SIG_SLOT + i] = (i + 1) as u8;
        }

        let report = SnpReport::parse(&raw).unwrap();
        let (r, s) = report.signature();
        assert_eq!((r[0], r[47]), (1, 48));
        assert_eq!((s[0], s[47]), (48, 1));
    }

    #[test]
    fn test_extract_splits_report_data() {
        let mut raw = blank_report();
        raw[REPORT_DATA.start] = 0xab;
        raw[REPORT_DATA.start + 32] = 0xcd;
        raw[MEASUREMENT.start] = 0x11;

        let verification = extract(&SnpReport::parse(&raw).unwrap());
        assert!(verification.tls_public_key_fp.starts_with("ab"));
        assert_eq!(verification.tls_public_key_fp.len(), 64);
        assert!(verification.hpke_public_key.unwrap().starts_with("cd"));
        assert!(verification.measurement.registers[0].starts_with("11"));
        assert_eq!(verification.measurement.predicate(), PredicateType::SevGuestV2);
    }

    #[test]
    fn test_tcb_components() {
        let mut raw = blank_report();
        raw[REPORTED_TCB.start] = 3;
        raw[REPORTED_TCB.start + 1] = 0;
        raw[REPORTED_TCB.start + 6] = 22;
        raw[REPORTED_TCB.start + 7] = 213;

        let tcb = SnpReport::parse(&raw).unwrap().tcb();
        assert_eq!(
            tcb,
            Tcb { bootloader: 3, tee: 0, snp: 22, microcode: 213 }
        );
    }

    #[test]
    fn test_ark_fingerprint_constant() {
        assert_eq!(AMD_ARK_GENOA_SPKI_FINGERPRINT.len(), 64);
        assert!(AMD_ARK_GENOA_SPKI_FINGERPRINT.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
