//! Public key fingerprints
//!
//! A fingerprint is the hex SHA-256 of the key's DER SubjectPublicKeyInfo,
//! which matches how the enclave (and OpenSSL) fingerprint their TLS keys.
//! Raw SEC1 points are never hashed directly: the same key has several
//! point encodings, but only one SPKI encoding.

use der::{Decode, Encode};
use p256::pkcs8::EncodePublicKey;
use sha2::{Digest, Sha256};
use x509_cert::Certificate;

use crate::error::{Error, Result};

/// Elliptic curves a channel key may use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Curve {
    P256,
    P384,
}

/// Curves tried in order; the first that parses wins
pub const SUPPORTED_CURVES: &[Curve] = &[Curve::P256, Curve::P384];

/// Outcome of trying to interpret raw key bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedKey {
    Parsed { curve: Curve, spki_der: Vec<u8> },
    Unrecognized,
}

impl Curve {
    /// Parse SEC1 point bytes and re-encode them as DER SPKI
    fn to_spki_der(self, point: &[u8]) -> Option<Vec<u8>> {
        let doc = match self {
            Curve::P256 => p256::PublicKey::from_sec1_bytes(point)
                .ok()?
                .to_public_key_der()
                .ok()?,
            Curve::P384 => p384::PublicKey::from_sec1_bytes(point)
                .ok()?
                .to_public_key_der()
                .ok()?,
        };
        Some(doc.as_bytes().to_vec())
    }
}

/// Interpret `point` under each supported curve in turn
pub fn parse_key(point: &[u8]) -> ParsedKey {
    SUPPORTED_CURVES
        .iter()
        .find_map(|curve| {
            curve
                .to_spki_der(point)
                .map(|spki_der| ParsedKey::Parsed { curve: *curve, spki_der })
        })
        .unwrap_or(ParsedKey::Unrecognized)
}

/// Fingerprint raw SEC1 public key bytes
pub fn key_fingerprint(point: &[u8]) -> Result<String> {
    match parse_key(point) {
        ParsedKey::Parsed { spki_der, .. } => Ok(hex::encode(Sha256::digest(&spki_der))),
        ParsedKey::Unrecognized => Err(Error::Tls(
            "public key is not on a supported curve".into(),
        )),
    }
}

/// Fingerprint the public key of a DER-encoded X.509 certificate
pub fn cert_fingerprint(cert_der: &[u8]) -> Result<String> {
    let cert = Certificate::from_der(cert_der)
        .map_err(|e| Error::Tls(format!("Failed to parse certificate: {}", e)))?;

    let point = cert
        .tbs_certificate
        .subject_public_key_info
        .subject_public_key
        .as_bytes()
        .ok_or_else(|| Error::Tls("certificate key has unused bits".into()))?;

    key_fingerprint(point)
}

/// Fingerprint a PEM-encoded certificate (bundle `enclaveCert`)
pub fn pem_cert_fingerprint(pem_text: &str) -> Result<String> {
    let parsed = pem::parse(pem_text)
        .map_err(|e| Error::Tls(format!("Failed to parse PEM certificate: {}", e)))?;
    cert_fingerprint(parsed.contents())
}

/// SHA-256 of a certificate's SPKI exactly as encoded, without curve
/// re-encoding. Used for non-EC keys such as the AMD root.
pub fn spki_fingerprint(cert_der: &[u8]) -> Result<String> {
    let cert = Certificate::from_der(cert_der)
        .map_err(|e| Error::AttestationVerification(format!("Failed to parse cert: {}", e)))?;

    let spki_der = cert
        .tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(|e| Error::AttestationVerification(format!("Failed to encode SPKI: {}", e)))?;

    Ok(hex::encode(Sha256::digest(&spki_der)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::elliptic_curve::sec1::ToEncodedPoint;
    use rand::rngs::OsRng;

    #[test]
    fn test_p256_fingerprint_matches_spki_digest() {
        let secret = p256::SecretKey::random(&mut OsRng);
        let public = secret.public_key();
        let point = public.to_encoded_point(false);

        let expected = hex::encode(Sha256::digest(
            public.to_public_key_der().unwrap().as_bytes(),
        ));
        assert_eq!(key_fingerprint(point.as_bytes()).unwrap(), expected);
        assert_eq!(expected.len(), 64);
    }

    #[test]
    fn test_p384_falls_through_to_second_curve() {
        let secret = p384::SecretKey::random(&mut OsRng);
        let public = secret.public_key();
        let point = public.to_encoded_point(false);

        match parse_key(point.as_bytes()) {
            ParsedKey::Parsed { curve, spki_der } => {
                assert_eq!(curve, Curve::P384);
                assert_eq!(spki_der, public.to_public_key_der().unwrap().as_bytes());
            }
            ParsedKey::Unrecognized => panic!("P-384 key was not recognized"),
        }
    }

    #[test]
    fn test_compressed_and_uncompressed_points_agree() {
        let secret = p256::SecretKey::random(&mut OsRng);
        let public = secret.public_key();

        let uncompressed = key_fingerprint(public.to_encoded_point(false).as_bytes()).unwrap();
        let compressed = key_fingerprint(public.to_encoded_point(true).as_bytes()).unwrap();
        assert_eq!(uncompressed, compressed);
    }

    #[test]
    fn test_garbage_fails_closed() {
        assert_eq!(parse_key(&[0x04; 10]), ParsedKey::Unrecognized);
        assert!(key_fingerprint(b"not a key").is_err());
        assert!(key_fingerprint(&[]).is_err());
    }

    #[test]
    fn test_cert_fingerprint_matches_key_fingerprint() {
        let key_pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let cert = rcgen::CertificateParams::new(vec!["enclave.example.com".into()])
            .unwrap()
            .self_signed(&key_pair)
            .unwrap();

        let from_cert = cert_fingerprint(cert.der()).unwrap();
        let from_pem = pem_cert_fingerprint(&cert.pem()).unwrap();
        let direct = hex::encode(Sha256::digest(key_pair.public_key_der()));

        assert_eq!(from_cert, direct);
        assert_eq!(from_pem, direct);
    }
}
