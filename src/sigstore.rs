//! Sigstore verification for code provenance
//!
//! A release is trusted when its Sigstore bundle:
//! - carries a Fulcio certificate issued by a pinned Fulcio CA,
//! - carries a DSSE envelope signed by that certificate's P-256 key,
//! - was issued to a GitHub Actions workflow of the expected repository,
//! - names the release digest as the in-toto subject.
//!
//! The in-toto predicate then yields the expected enclave measurement.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use der::Decode;
use serde::Deserialize;
use tracing::debug;
use x509_cert::Certificate;

use crate::attestation::types::{Measurement, PredicateType};
use crate::error::{Error, Result};

const GITHUB_ACTIONS_ISSUER: &str = "https://token.actions.githubusercontent.com";
const IN_TOTO_PAYLOAD_TYPE: &str = "application/vnd.in-toto+json";

// Fulcio certificate extensions
const OID_ISSUER_V1: &str = "1.3.6.1.4.1.57264.1.1";
const OID_ISSUER_V2: &str = "1.3.6.1.4.1.57264.1.8";
const OID_BUILD_SIGNER_URI: &str = "1.3.6.1.4.1.57264.1.9";
const OID_SOURCE_REPOSITORY_URI: &str = "1.3.6.1.4.1.57264.1.12";

const OID_ECDSA_WITH_SHA256: &str = "1.2.840.10045.4.3.2";
const OID_ECDSA_WITH_SHA384: &str = "1.2.840.10045.4.3.3";

/// Sigstore public-good Fulcio intermediate and root
const FULCIO_PUBLIC_GOOD_PEM: &str = "\
-----BEGIN CERTIFICATE-----
MIICGjCCAaGgAwIBAgIUALnViVfnU0brJasmRkHrn/UnfaQwCgYIKoZIzj0EAwMw
KjEVMBMGA1UEChMMc2lnc3RvcmUuZGV2MREwDwYDVQQDEwhzaWdzdG9yZTAeFw0y
MjA0MTMyMDA2MTVaFw0zMTEwMDUxMzU2NThaMDcxFTATBgNVBAoTDHNpZ3N0b3Jl
LmRldjEeMBwGA1UEAxMVc2lnc3RvcmUtaW50ZXJtZWRpYXRlMHYwEAYHKoZIzj0C
AQYFK4EEACIDYgAE8RVS/ysH+NOvuDZyPIZtilgUF9NlarYpAd9HP1vBBH1U5CV7
7LSS7s0ZiH4nE7Hv7ptS6LvvR/STk798LVgMzLlJ4HeIfF3tHSaexLcYpSASr1kS
0N/RgBJz/9jWCiXno3sweTAOBgNVHQ8BAf8EBAMCAQYwEwYDVR0lBAwwCgYIKwYB
BQUHAwMwEgYDVR0TAQH/BAgwBgEB/wIBADAdBgNVHQ4EFgQU39Ppz1YkEZb5qNjp
KFWixi4YZD8wHwYDVR0jBBgwFoAUWMAeX5FFpWapesyQoZMi0CrFxfowCgYIKoZI
zj0EAwMDZwAwZAIwPCsQK4DYiZYDPIaDi5HFKnfxXx6ASSVmERfsynYBiX2X6SJR
nZU84/9DZdnFvvxmAjBOt6QpBlc4J/0DxvkTCqpclvziL6BCCPnjdlIB3Pu3BxsP
mygUY7Ii2zbdCdliiow=
-----END CERTIFICATE-----
-----BEGIN CERTIFICATE-----
MIIB9zCCAXygAwIBAgIUALZNAPFdxHPwjeDloDwyYChAO/4wCgYIKoZIzj0EAwMw
KjEVMBMGA1UEChMMc2lnc3RvcmUuZGV2MREwDwYDVQQDEwhzaWdzdG9yZTAeFw0y
MTEwMDcxMzU2NTlaFw0zMTEwMDUxMzU2NThaMCoxFTATBgNVBAoTDHNpZ3N0b3Jl
LmRldjERMA8GA1UEAxMIc2lnc3RvcmUwdjAQBgcqhkjOPQIBBgUrgQQAIgNiAAT7
XeFT4rb3PQGwS4IajtLk3/OlnpgangaBclYpsYBr5i+4ynB07ceb3LP0OIOZdxex
X69c5iVuyJRQ+Hz05yi+UF3uBWAlHpiS5sh0+H2GHE7SXrk1EC5m1Tr19L9gg92j
YzBhMA4GA1UdDwEB/wQEAwIBBjAPBgNVHRMBAf8EBTADAQH/MB0GA1UdDgQWBBRY
wB5fkUWlZql6zJChkyLQKsXF+jAfBgNVHSMEGDAWgBRYwB5fkUWlZql6zJChkyLQ
KsXF+jAKBggqhkjOPQQDAwNpADBmAjEAj1nHeXZp+13NWBNa+EDsDP8G1WWg1tCM
WP/WHPqpaVo0jhsweNFZgSs0eE7wYI4qAjEA2WB9ot98sIkoF3vZYdd3/VtWB5b9
TNMea7Ix/stJ5TfcLLeABLE4BNJOsQ4vnBHJ
-----END CERTIFICATE-----
";

#[derive(Debug, Deserialize)]
struct ReleaseResponse {
    tag_name: String,
}

#[derive(Debug, Deserialize)]
struct AttestationResponse {
    attestations: Vec<AttestationEntry>,
}

#[derive(Debug, Deserialize)]
struct AttestationEntry {
    bundle: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Bundle {
    verification_material: VerificationMaterial,
    dsse_envelope: DsseEnvelope,
}

#[derive(Debug, Deserialize)]
struct VerificationMaterial {
    certificate: RawBytes,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBytes {
    raw_bytes: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DsseEnvelope {
    payload: String,
    payload_type: String,
    signatures: Vec<DsseSignature>,
}

#[derive(Debug, Deserialize)]
struct DsseSignature {
    sig: String,
}

/// In-toto statement from the decoded payload
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InTotoStatement {
    predicate_type: String,
    predicate: serde_json::Value,
    subject: Vec<Subject>,
}

#[derive(Debug, Deserialize)]
struct Subject {
    digest: HashMap<String, String>,
}

/// Identity claims extracted from the Fulcio certificate
#[derive(Debug, Default)]
pub struct CertificateInfo {
    pub issuer: String,
    pub build_signer: String,
    pub repository: String,
}

fn sigstore_err(context: &str, e: impl std::fmt::Display) -> Error {
    Error::SigstoreVerification(format!("{}: {}", context, e))
}

/// Certificates trusted to issue Fulcio signing certificates.
///
/// Every certificate in the set is a trust anchor; a signing certificate is
/// accepted when one of them with a matching subject signed it.
#[derive(Debug, Clone)]
pub struct FulcioRoots {
    certs: Vec<Certificate>,
}

impl FulcioRoots {
    /// Parse one or more PEM certificates
    pub fn from_pem(pem_text: &str) -> Result<Self> {
        let certs = pem::parse_many(pem_text)
            .map_err(|e| sigstore_err("Failed to parse Fulcio roots", e))?
            .iter()
            .filter(|p| p.tag() == "CERTIFICATE")
            .map(|p| Certificate::from_der(p.contents()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| sigstore_err("Failed to parse Fulcio root", e))?;

        if certs.is_empty() {
            return Err(Error::SigstoreVerification("No Fulcio root certificates".into()));
        }
        Ok(Self { certs })
    }

    /// The Sigstore public-good Fulcio CA
    pub fn public_good() -> Result<Self> {
        Self::from_pem(FULCIO_PUBLIC_GOOD_PEM)
    }

    /// Check that `leaf` was signed by one of the pinned issuers
    pub fn verify_leaf(&self, leaf: &Certificate) -> Result<()> {
        let issuer = &leaf.tbs_certificate.issuer;
        let mut last_err = None;

        for ca in self.certs.iter().filter(|ca| &ca.tbs_certificate.subject == issuer) {
            match verify_issued_by(leaf, ca) {
                Ok(()) => return Ok(()),
                Err(e) => last_err = Some(e),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            Error::SigstoreVerification(format!(
                "Certificate not issued by a trusted Fulcio CA: {}",
                issuer
            ))
        }))
    }
}

/// Verify `cert`'s signature with `issuer`'s ECDSA key
fn verify_issued_by(cert: &Certificate, issuer: &Certificate) -> Result<()> {
    use der::Encode;
    use p256::ecdsa::signature::Verifier;

    let tbs = cert
        .tbs_certificate
        .to_der()
        .map_err(|e| sigstore_err("Failed to encode certificate", e))?;
    let sig = cert
        .signature
        .as_bytes()
        .ok_or_else(|| Error::SigstoreVerification("Malformed certificate signature".into()))?;
    let key = issuer
        .tbs_certificate
        .subject_public_key_info
        .subject_public_key
        .raw_bytes();

    let verified = match cert.signature_algorithm.oid.to_string().as_str() {
        OID_ECDSA_WITH_SHA256 => {
            let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(key)
                .map_err(|e| sigstore_err("Invalid Fulcio CA key", e))?;
            let sig = p256::ecdsa::Signature::from_der(sig)
                .map_err(|e| sigstore_err("Invalid certificate signature", e))?;
            key.verify(&tbs, &sig).is_ok()
        }
        OID_ECDSA_WITH_SHA384 => {
            let key = p384::ecdsa::VerifyingKey::from_sec1_bytes(key)
                .map_err(|e| sigstore_err("Invalid Fulcio CA key", e))?;
            let sig = p384::ecdsa::Signature::from_der(sig)
                .map_err(|e| sigstore_err("Invalid certificate signature", e))?;
            key.verify(&tbs, &sig).is_ok()
        }
        other => {
            return Err(Error::SigstoreVerification(format!(
                "Unsupported certificate signature algorithm: {}",
                other
            )))
        }
    };

    if !verified {
        return Err(Error::SigstoreVerification(
            "Certificate signature does not verify against the Fulcio CA".into(),
        ));
    }
    Ok(())
}

/// Fetch the latest release tag from GitHub
pub async fn fetch_latest_tag(github_proxy: &str, repo: &str) -> Result<String> {
    let url = format!("{}/repos/{}/releases/latest", github_proxy, repo);

    let response: ReleaseResponse = reqwest::get(&url)
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| sigstore_err("Failed to fetch release", e))?
        .json()
        .await
        .map_err(|e| sigstore_err("Failed to parse release", e))?;

    Ok(response.tag_name)
}

/// Fetch the enclave image digest published with a release
pub async fn fetch_digest(github_proxy: &str, repo: &str, tag: &str) -> Result<String> {
    let url = format!("{}/{}/releases/download/{}/tinfoil.hash", github_proxy, repo, tag);

    let digest = reqwest::get(&url)
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| sigstore_err("Failed to fetch digest", e))?
        .text()
        .await
        .map_err(|e| sigstore_err("Failed to read digest", e))?;

    Ok(digest.trim().to_string())
}

/// Fetch the Sigstore bundle attesting `digest`
pub async fn fetch_bundle(attestation_proxy: &str, repo: &str, digest: &str) -> Result<serde_json::Value> {
    let url = format!("{}/repos/{}/attestations/sha256:{}", attestation_proxy, repo, digest);

    let response: AttestationResponse = reqwest::get(&url)
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| sigstore_err("Failed to fetch bundle", e))?
        .json()
        .await
        .map_err(|e| sigstore_err("Failed to parse bundle response", e))?;

    response
        .attestations
        .into_iter()
        .next()
        .map(|entry| entry.bundle)
        .ok_or_else(|| Error::SigstoreVerification("No attestations found".into()))
}

/// Verify a bundle for `repo` attesting `digest` and return the measurement
/// the release commits to
pub fn verify_bundle(
    bundle: &serde_json::Value,
    digest: &str,
    repo: &str,
    roots: &FulcioRoots,
) -> Result<Measurement> {
    let bundle: Bundle = serde_json::from_value(bundle.clone())
        .map_err(|e| sigstore_err("Failed to parse bundle", e))?;

    let cert_der = STANDARD
        .decode(&bundle.verification_material.certificate.raw_bytes)
        .map_err(|e| sigstore_err("Failed to decode certificate", e))?;
    let cert = Certificate::from_der(&cert_der)
        .map_err(|e| sigstore_err("Failed to parse certificate", e))?;

    roots.verify_leaf(&cert)?;
    let payload = verify_dsse(&bundle.dsse_envelope, &cert)?;
    verify_identity(&certificate_info(&cert), repo)?;

    let statement: InTotoStatement = serde_json::from_slice(&payload)
        .map_err(|e| sigstore_err("Failed to parse statement", e))?;

    let digest = digest.to_ascii_lowercase();
    let covers_digest = statement
        .subject
        .iter()
        .any(|s| s.digest.get("sha256").map(|d| d.to_ascii_lowercase()) == Some(digest.clone()));
    if !covers_digest {
        return Err(Error::SigstoreVerification(format!(
            "Statement does not attest digest {}",
            digest
        )));
    }
    debug!(repo, "Sigstore bundle verified");

    measurement_from_predicate(&statement)
}

/// Compute DSSE Pre-Authentication Encoding (PAE)
///
/// PAE(type, body) = "DSSEv1" SP LEN(type) SP type SP LEN(body) SP body
fn compute_pae(payload_type: &str, payload: &[u8]) -> Vec<u8> {
    let mut pae = format!("DSSEv1 {} {} {} ", payload_type.len(), payload_type, payload.len()).into_bytes();
    pae.extend_from_slice(payload);
    pae
}

/// Check the envelope signature and return the decoded payload
fn verify_dsse(envelope: &DsseEnvelope, cert: &Certificate) -> Result<Vec<u8>> {
    use p256::ecdsa::{signature::Verifier, Signature, VerifyingKey};

    if envelope.payload_type != IN_TOTO_PAYLOAD_TYPE {
        return Err(Error::SigstoreVerification(format!(
            "Unexpected payload type: {}",
            envelope.payload_type
        )));
    }

    let key_bytes = cert
        .tbs_certificate
        .subject_public_key_info
        .subject_public_key
        .raw_bytes();
    let key = VerifyingKey::from_sec1_bytes(key_bytes)
        .map_err(|e| sigstore_err("Invalid public key", e))?;

    let payload = STANDARD
        .decode(&envelope.payload)
        .map_err(|e| sigstore_err("Failed to decode payload", e))?;
    let pae = compute_pae(&envelope.payload_type, &payload);

    let sig_b64 = &envelope
        .signatures
        .first()
        .ok_or_else(|| Error::SigstoreVerification("No signature".into()))?
        .sig;
    let sig_bytes = STANDARD
        .decode(sig_b64)
        .map_err(|e| sigstore_err("Failed to decode signature", e))?;

    // DER (0x30 SEQUENCE) or raw r||s
    let signature = if sig_bytes.first() == Some(&0x30) {
        Signature::from_der(&sig_bytes)
    } else {
        Signature::from_slice(&sig_bytes)
    }
    .map_err(|e| sigstore_err("Invalid signature", e))?;

    key.verify(&pae, &signature)
        .map_err(|e| sigstore_err("DSSE signature verification failed", e))?;

    Ok(payload)
}

/// Extension values are DER UTF8Strings in current Fulcio certificates and
/// raw strings in older ones
fn extension_text(value: &[u8]) -> String {
    der::asn1::Utf8StringRef::from_der(value)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| String::from_utf8_lossy(value).to_string())
}

fn certificate_info(cert: &Certificate) -> CertificateInfo {
    let mut info = CertificateInfo::default();

    for ext in cert.tbs_certificate.extensions.iter().flatten() {
        let value = extension_text(ext.extn_value.as_bytes());
        match ext.extn_id.to_string().as_str() {
            OID_ISSUER_V1 | OID_ISSUER_V2 => info.issuer = value,
            OID_BUILD_SIGNER_URI => info.build_signer = value,
            OID_SOURCE_REPOSITORY_URI => info.repository = value,
            _ => {}
        }
    }

    info
}

/// Verify that the certificate is from GitHub Actions for the expected repo
fn verify_identity(info: &CertificateInfo, repo: &str) -> Result<()> {
    if info.issuer != GITHUB_ACTIONS_ISSUER {
        return Err(Error::SigstoreVerification(format!(
            "Certificate not from GitHub Actions. Issuer: {}",
            info.issuer
        )));
    }

    let repo_url = format!("https://github.com/{}", repo);
    let workflow_prefix = format!("{}/", repo_url);
    if !info.repository.eq_ignore_ascii_case(&repo_url) && !info.build_signer.starts_with(&workflow_prefix) {
        return Err(Error::SigstoreVerification(format!(
            "Certificate not for expected repository. Expected: {}, Got repo: {}, workflow: {}",
            repo, info.repository, info.build_signer
        )));
    }

    Ok(())
}

fn predicate_str<'a>(value: &'a serde_json::Value, key: &str) -> Result<&'a str> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::SigstoreVerification(format!("Missing {}", key)))
}

fn measurement_from_predicate(statement: &InTotoStatement) -> Result<Measurement> {
    let predicate = &statement.predicate;
    let kind = PredicateType::from_uri(&statement.predicate_type);

    let registers = match kind {
        PredicateType::SevGuestV2 => vec![predicate_str(predicate, "snp_measurement")?.to_string()],
        PredicateType::SnpTdxMultiPlatformV1 => {
            let tdx = predicate
                .get("tdx_measurement")
                .ok_or_else(|| Error::SigstoreVerification("Missing tdx_measurement".into()))?;
            vec![
                predicate_str(predicate, "snp_measurement")?.to_string(),
                predicate_str(tdx, "rtmr1")?.to_string(),
                predicate_str(tdx, "rtmr2")?.to_string(),
            ]
        }
        _ => {
            return Err(Error::SigstoreVerification(format!(
                "Unsupported predicate type: {}",
                statement.predicate_type
            )))
        }
    };

    Ok(Measurement::new(kind, registers))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use p256::ecdsa::{signature::Signer, Signature, SigningKey};
    use p256::pkcs8::EncodePrivateKey;
    use rand::rngs::OsRng;
    use serde_json::json;

    fn utf8_der(s: &str) -> Vec<u8> {
        use der::Encode;
        der::asn1::Utf8StringRef::new(s).unwrap().to_der().unwrap()
    }

    /// Throwaway Fulcio CA
    pub(crate) struct TestFulcio {
        key: rcgen::KeyPair,
        cert: rcgen::Certificate,
    }

    impl TestFulcio {
        pub(crate) fn new() -> Self {
            let key = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384).unwrap();
            let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
            params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
            params.distinguished_name = rcgen::DistinguishedName::new();
            params.distinguished_name.push(rcgen::DnType::OrganizationName, "sigstore.test");
            params.distinguished_name.push(rcgen::DnType::CommonName, "sigstore-intermediate");
            let cert = params.self_signed(&key).unwrap();
            Self { key, cert }
        }

        pub(crate) fn pem(&self) -> String {
            self.cert.pem()
        }

        pub(crate) fn roots(&self) -> FulcioRoots {
            FulcioRoots::from_pem(&self.pem()).unwrap()
        }

        /// A bundle for `repo` attesting `digest` with an SEV predicate
        pub(crate) fn signed_bundle(&self, repo: &str, digest: &str, snp_measurement: &str) -> serde_json::Value {
            self.signed_bundle_with(
                repo,
                digest,
                crate::attestation::types::SEV_GUEST_V2,
                json!({ "snp_measurement": snp_measurement }),
            )
        }

        pub(crate) fn signed_bundle_with(
            &self,
            repo: &str,
            digest: &str,
            predicate_type: &str,
            predicate: serde_json::Value,
        ) -> serde_json::Value {
            build_bundle(Some(self), repo, digest, predicate_type, predicate)
        }
    }

    /// Same as [`TestFulcio::signed_bundle_with`] but the signing
    /// certificate issues itself
    pub(crate) fn self_signed_bundle_with(
        repo: &str,
        digest: &str,
        predicate_type: &str,
        predicate: serde_json::Value,
    ) -> serde_json::Value {
        build_bundle(None, repo, digest, predicate_type, predicate)
    }

    fn build_bundle(
        ca: Option<&TestFulcio>,
        repo: &str,
        digest: &str,
        predicate_type: &str,
        predicate: serde_json::Value,
    ) -> serde_json::Value {
        let signing_key = SigningKey::random(&mut OsRng);
        let pkcs8 = signing_key.to_pkcs8_der().unwrap();
        let key_pair = rcgen::KeyPair::try_from(pkcs8.as_bytes()).unwrap();

        let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        params.custom_extensions = vec![
            rcgen::CustomExtension::from_oid_content(
                &[1, 3, 6, 1, 4, 1, 57264, 1, 1],
                GITHUB_ACTIONS_ISSUER.as_bytes().to_vec(),
            ),
            rcgen::CustomExtension::from_oid_content(
                &[1, 3, 6, 1, 4, 1, 57264, 1, 12],
                utf8_der(&format!("https://github.com/{}", repo)),
            ),
        ];
        let cert = match ca {
            Some(ca) => params.signed_by(&key_pair, &ca.cert, &ca.key).unwrap(),
            None => params.self_signed(&key_pair).unwrap(),
        };

        let statement = json!({
            "_type": "https://in-toto.io/Statement/v1",
            "predicateType": predicate_type,
            "predicate": predicate,
            "subject": [{ "name": "image", "digest": { "sha256": digest } }],
        });
        let payload = serde_json::to_vec(&statement).unwrap();
        let signature: Signature = signing_key.sign(&compute_pae(IN_TOTO_PAYLOAD_TYPE, &payload));

        json!({
            "verificationMaterial": { "certificate": { "rawBytes": STANDARD.encode(cert.der()) } },
            "dsseEnvelope": {
                "payload": STANDARD.encode(&payload),
                "payloadType": IN_TOTO_PAYLOAD_TYPE,
                "signatures": [{ "sig": STANDARD.encode(signature.to_der().as_bytes()) }],
            },
        })
    }

    #[test]
    fn test_pae_encoding() {
        let pae = compute_pae("http://example.com/HelloWorld", b"hello world");
        assert_eq!(pae, b"DSSEv1 29 http://example.com/HelloWorld 11 hello world");
    }

    #[test]
    fn test_verify_bundle() {
        let fulcio = TestFulcio::new();
        let bundle = fulcio.signed_bundle("org/repo", "abcd", "aa11");
        let measurement = verify_bundle(&bundle, "ABCD", "org/repo", &fulcio.roots()).unwrap();

        assert_eq!(measurement.predicate(), PredicateType::SevGuestV2);
        assert_eq!(measurement.registers, vec!["aa11".to_string()]);
    }

    #[test]
    fn test_self_signed_certificate_rejected() {
        let fulcio = TestFulcio::new();
        let bundle = self_signed_bundle_with(
            "org/repo",
            "abcd",
            crate::attestation::types::SEV_GUEST_V2,
            json!({ "snp_measurement": "aa11" }),
        );

        let err = verify_bundle(&bundle, "abcd", "org/repo", &fulcio.roots()).unwrap_err();
        assert!(err.to_string().contains("not issued by a trusted Fulcio CA"));
    }

    #[test]
    fn test_lookalike_ca_rejected() {
        // Same subject name, different key
        let trusted = TestFulcio::new();
        let forger = TestFulcio::new();
        let bundle = forger.signed_bundle("org/repo", "abcd", "aa11");

        let err = verify_bundle(&bundle, "abcd", "org/repo", &trusted.roots()).unwrap_err();
        assert!(err.to_string().contains("does not verify"));
        assert!(verify_bundle(&bundle, "abcd", "org/repo", &forger.roots()).is_ok());
    }

    #[test]
    fn test_public_good_roots_load() {
        let roots = FulcioRoots::public_good().unwrap();
        assert_eq!(roots.certs.len(), 2);
        assert!(FulcioRoots::from_pem("").is_err());
    }

    #[test]
    fn test_wrong_repository_rejected() {
        let fulcio = TestFulcio::new();
        let bundle = fulcio.signed_bundle("org/repo", "abcd", "aa11");
        let err = verify_bundle(&bundle, "abcd", "org/other", &fulcio.roots()).unwrap_err();
        assert!(err.to_string().contains("expected repository"));
    }

    #[test]
    fn test_wrong_digest_rejected() {
        let fulcio = TestFulcio::new();
        let bundle = fulcio.signed_bundle("org/repo", "abcd", "aa11");
        assert!(verify_bundle(&bundle, "ffff", "org/repo", &fulcio.roots()).is_err());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let fulcio = TestFulcio::new();
        let mut bundle = fulcio.signed_bundle("org/repo", "abcd", "aa11");
        let forged = json!({
            "predicateType": crate::attestation::types::SEV_GUEST_V2,
            "predicate": { "snp_measurement": "evil" },
            "subject": [{ "digest": { "sha256": "abcd" } }],
        });
        bundle["dsseEnvelope"]["payload"] = json!(STANDARD.encode(serde_json::to_vec(&forged).unwrap()));

        let err = verify_bundle(&bundle, "abcd", "org/repo", &fulcio.roots()).unwrap_err();
        assert!(err.to_string().contains("DSSE signature verification failed"));
    }

    #[test]
    fn test_multiplatform_predicate() {
        let statement = InTotoStatement {
            predicate_type: crate::attestation::types::SNP_TDX_MULTIPLATFORM_V1.into(),
            predicate: json!({
                "snp_measurement": "snp",
                "tdx_measurement": { "rtmr1": "r1", "rtmr2": "r2" },
            }),
            subject: vec![],
        };
        let m = measurement_from_predicate(&statement).unwrap();
        assert_eq!(m.registers, vec!["snp", "r1", "r2"]);
    }
}
