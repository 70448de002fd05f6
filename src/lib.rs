//! # Tinfoil Rust Client
//!
//! Secure client for Tinfoil TEE inference with hardware attestation
//! verification, attested TLS pinning and end-to-end encrypted bodies.
//!
//! ## Verification
//!
//! [`Verifier`] drives an [`AttestationEngine`] through four steps and
//! records the outcome of every attempt in a [`VerificationDocument`]:
//!
//! 1. `fetchDigest` - latest release digest and its Sigstore bundle
//! 2. `verifyCode` - DSSE signature, GitHub Actions identity and the
//!    in-toto predicate give the expected measurement
//! 3. `verifyEnclave` - AMD SEV-SNP (VCEK → ASK → ARK) or Intel TDX
//!    attestation gives the runtime measurement, the TLS key fingerprint and
//!    the enclave's recipient key
//! 4. `compareMeasurements` - expected and runtime measurements must match
//!
//! The built-in engine is [`NativeEngine`]; any other engine can be plugged
//! in through the trait.
//!
//! ## Channel pinning
//!
//! The attested TLS key fingerprint is checked on EVERY connection by
//! [`tls::PinnedCertVerifier`]. Strict mode rejects mismatches; relaxed mode
//! reports them to an observer.
//!
//! ## Encrypted bodies
//!
//! Request and response bodies are sealed to the attested recipient key
//! ([`ehbp`]), so a proxy in front of the enclave only ever sees ciphertext.
//! Streamed responses are decrypted chunk by chunk and can be cancelled.
//!
//! ## Example
//!
//! ```rust,ignore
//! use tinfoil_client::{ChatMessage, SecureClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = SecureClient::builder()
//!         .enclave("inference.tinfoil.sh")
//!         .on_verification(|doc| println!("verified: {}", doc.security_verified()))
//!         .build()
//!         .await?;
//!
//!     let response = client.chat(vec![ChatMessage::user("Hello!")]).await?;
//!     println!("{:?}", response.choices[0].message.content);
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod attestation;
pub mod bundle;
pub mod client;
pub mod config;
pub mod ehbp;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod router;
pub mod sigstore;
pub mod tls;
pub mod verifier;

pub use api::{ChatCompletionChunk, ChatMessage, ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse, Tool};
pub use client::{ChatStream, SecureClient, SecureClientBuilder};
pub use config::{Config, PinningMode, Target};
pub use engine::{AttestationEngine, EngineError, NativeEngine};
pub use error::{Error, Result};
pub use verifier::{GroundTruth, Step, StepState, VerificationDocument, VerificationSteps, Verifier};
