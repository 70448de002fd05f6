//! Error types for the Tinfoil client

use thiserror::Error;

use crate::verifier::Step;

#[derive(Error, Debug)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Base64 decoding failed: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Hex decoding failed: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("Attestation fetch failed: {0}")]
    AttestationFetch(String),

    #[error("Attestation verification failed: {0}")]
    AttestationVerification(String),

    #[error("Sigstore verification failed: {0}")]
    SigstoreVerification(String),

    /// Verification failed; `step` is `None` when the failure could not be
    /// attributed to one of the mandatory steps.
    #[error("Verification failed at {}: {message}", .step.map(|s| s.as_str()).unwrap_or("unknown step"))]
    Verification {
        step: Option<Step>,
        message: String,
    },

    #[error("TLS error: {0}")]
    Tls(String),

    /// Sealing, unsealing or framing of an encrypted body failed, or the
    /// underlying send failed mid-exchange.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("API error: HTTP {status}: {message}")]
    Api { status: u16, message: String },

    #[error("No embedding in response")]
    NoEmbedding,
}

impl Error {
    /// The verification step this error is attributed to, if any
    pub fn step(&self) -> Option<Step> {
        match self {
            Error::Verification { step, .. } => *step,
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
