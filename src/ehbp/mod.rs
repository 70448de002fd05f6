//! Encrypted HTTP body protocol (EHBP)
//!
//! Request bodies are sealed to the enclave's attested X25519 recipient key
//! and responses are sealed back under keys derived from the same exchange.
//! Bodies travel as length-prefixed AES-256-GCM frames so that streamed
//! responses can be decrypted chunk by chunk; the last frame of a body is
//! flagged so truncation is detected.
//!
//! Header names are lowercase as `http` requires for static names.

pub mod envelope;
pub mod framing;
pub mod transport;

pub use envelope::{Recipient, RecipientKey, ResponseOpener, ResponseSealer, SenderContext};
pub use framing::{Frame, FrameDecoder, MAX_CHUNK_LEN};
pub use transport::{ChunkStream, EncryptedTransport, ResponseMeta, TransportRequest};

/// Hex-encoded ephemeral public key of the sender
pub const ENCAPSULATED_KEY_HEADER: &str = "ehbp-encapsulated-key";

/// Hex-encoded per-response nonce chosen by the enclave
pub const RESPONSE_NONCE_HEADER: &str = "ehbp-response-nonce";

/// Target enclave URL when requests go through a proxy
pub const ENCLAVE_URL_HEADER: &str = "x-tinfoil-enclave-url";
