//! EHBP key schedule and chunk sealing
//!
//! Suite: X25519, HKDF-SHA256, AES-256-GCM. The request context is derived
//! from an ephemeral key agreement with the recipient; the response context
//! from a secret exported by the request context plus a nonce the enclave
//! picks per response.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use bytes::{Bytes, BytesMut};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use super::framing::{self, Frame, MAX_CHUNK_LEN};
use crate::error::{Error, Result};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const RESPONSE_NONCE_LEN: usize = 32;

const REQUEST_KEY_LABEL: &[u8] = b"ehbp request key";
const REQUEST_NONCE_LABEL: &[u8] = b"ehbp request nonce";
const RESPONSE_SECRET_LABEL: &[u8] = b"ehbp response secret";
const RESPONSE_KEY_LABEL: &[u8] = b"ehbp response key";
const RESPONSE_NONCE_LABEL: &[u8] = b"ehbp response nonce";

/// The enclave's attested X25519 public key
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RecipientKey(PublicKey);

impl RecipientKey {
    pub fn from_hex(key: &str) -> Result<Self> {
        let bytes: [u8; KEY_LEN] = hex::decode(key.trim())
            .map_err(|e| Error::Transport(format!("invalid recipient key: {}", e)))?
            .try_into()
            .map_err(|v: Vec<u8>| {
                Error::Transport(format!("recipient key must be {} bytes, got {}", KEY_LEN, v.len()))
            })?;
        Ok(Self(PublicKey::from(bytes)))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        self.0.as_bytes()
    }
}

impl std::fmt::Debug for RecipientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hex = hex::encode(self.as_bytes());
        write!(f, "RecipientKey({}..)", &hex[..16])
    }
}

fn expand<const N: usize>(prk: &Hkdf<Sha256>, label: &[u8]) -> Result<[u8; N]> {
    let mut okm = [0u8; N];
    prk.expand(label, &mut okm)
        .map_err(|e| Error::Transport(format!("key derivation failed: {}", e)))?;
    Ok(okm)
}

fn concat(a: &[u8], b: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    out.extend_from_slice(a);
    out.extend_from_slice(b);
    out
}

/// One direction's AEAD key and nonce base
struct ChunkCipher {
    aead: Aes256Gcm,
    nonce_base: [u8; NONCE_LEN],
}

/// Associated data: whether the chunk ends the body
fn chunk_aad(last: bool) -> [u8; 1] {
    [last as u8]
}

impl ChunkCipher {
    fn new(key: &[u8; KEY_LEN], nonce_base: [u8; NONCE_LEN]) -> Result<Self> {
        let aead = Aes256Gcm::new_from_slice(key)
            .map_err(|e| Error::Transport(format!("invalid AEAD key: {}", e)))?;
        Ok(Self { aead, nonce_base })
    }

    /// Nonce for chunk `index`: base XOR big-endian index in the last 8 bytes
    fn nonce(&self, index: u64) -> [u8; NONCE_LEN] {
        let mut nonce = self.nonce_base;
        for (n, i) in nonce[NONCE_LEN - 8..].iter_mut().zip(index.to_be_bytes()) {
            *n ^= i;
        }
        nonce
    }

    fn seal(&self, index: u64, plaintext: &[u8], last: bool) -> Result<Vec<u8>> {
        let aad = chunk_aad(last);
        let payload = Payload {
            msg: plaintext,
            aad: &aad,
        };
        self.aead
            .encrypt(Nonce::from_slice(&self.nonce(index)), payload)
            .map_err(|_| Error::Transport("encryption failed".into()))
    }

    fn open(&self, index: u64, frame: &Frame) -> Result<Vec<u8>> {
        let aad = chunk_aad(frame.last);
        let payload = Payload {
            msg: &frame.ciphertext,
            aad: &aad,
        };
        self.aead
            .decrypt(Nonce::from_slice(&self.nonce(index)), payload)
            .map_err(|_| Error::Transport(format!("decryption failed for chunk {}", index)))
    }
}

/// Seal `plaintext` as frames `first..`, flagging the last one when `last`.
/// An empty final body still produces one frame.
fn seal_frames(
    cipher: &ChunkCipher,
    first: u64,
    plaintext: &[u8],
    last: bool,
    out: &mut BytesMut,
) -> Result<u64> {
    let mut chunks: Vec<&[u8]> = plaintext.chunks(MAX_CHUNK_LEN).collect();
    if chunks.is_empty() && last {
        chunks.push(&[]);
    }

    let count = chunks.len();
    for (i, chunk) in chunks.into_iter().enumerate() {
        let index = first + i as u64;
        let is_last = last && i + 1 == count;
        framing::encode_frame(&cipher.seal(index, chunk, is_last)?, is_last, out);
    }
    Ok(first + count as u64)
}

/// Opens frames in order and tracks whether the final frame has arrived
struct FrameOpener {
    cipher: ChunkCipher,
    next: u64,
    done: bool,
}

impl FrameOpener {
    fn new(cipher: ChunkCipher) -> Self {
        Self {
            cipher,
            next: 0,
            done: false,
        }
    }

    fn open(&mut self, frame: &Frame) -> Result<Vec<u8>> {
        if self.done {
            return Err(Error::Transport("data after the final frame".into()));
        }
        let plaintext = self.cipher.open(self.next, frame)?;
        self.next += 1;
        self.done = frame.last;
        Ok(plaintext)
    }

    fn finish(&self) -> Result<()> {
        if self.done {
            Ok(())
        } else {
            Err(Error::Transport(format!(
                "body ended after {} frames without a final frame",
                self.next
            )))
        }
    }

    fn open_body(&mut self, body: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(body.len());
        for frame in framing::decode_all(body)? {
            out.extend_from_slice(&self.open(&frame)?);
        }
        self.finish()?;
        Ok(out)
    }
}

/// Derived request-side secrets shared by sender and recipient
struct RequestSecrets {
    cipher: ChunkCipher,
    response_secret: [u8; KEY_LEN],
}

impl RequestSecrets {
    fn derive(shared: &[u8], enc: &[u8; KEY_LEN], recipient: &[u8; KEY_LEN]) -> Result<Self> {
        let prk = Hkdf::<Sha256>::new(Some(concat(enc, recipient).as_slice()), shared);
        let key = expand::<KEY_LEN>(&prk, REQUEST_KEY_LABEL)?;
        let nonce_base = expand::<NONCE_LEN>(&prk, REQUEST_NONCE_LABEL)?;
        Ok(Self {
            cipher: ChunkCipher::new(&key, nonce_base)?,
            response_secret: expand::<KEY_LEN>(&prk, RESPONSE_SECRET_LABEL)?,
        })
    }
}

fn response_cipher(
    response_secret: &[u8; KEY_LEN],
    enc: &[u8; KEY_LEN],
    response_nonce: &[u8; RESPONSE_NONCE_LEN],
) -> Result<ChunkCipher> {
    let prk = Hkdf::<Sha256>::new(Some(concat(enc, response_nonce).as_slice()), response_secret);
    let key = expand::<KEY_LEN>(&prk, RESPONSE_KEY_LABEL)?;
    ChunkCipher::new(&key, expand::<NONCE_LEN>(&prk, RESPONSE_NONCE_LABEL)?)
}

/// Client side of one request/response exchange
pub struct SenderContext {
    enc: [u8; KEY_LEN],
    secrets: RequestSecrets,
}

impl SenderContext {
    /// Fresh ephemeral key agreement with `recipient`
    pub fn new(recipient: &RecipientKey) -> Result<Self> {
        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let enc = PublicKey::from(&ephemeral).to_bytes();
        let shared = ephemeral.diffie_hellman(&recipient.0);
        if !shared.was_contributory() {
            return Err(Error::Transport("recipient key is a low-order point".into()));
        }

        Ok(Self {
            enc,
            secrets: RequestSecrets::derive(shared.as_bytes(), &enc, recipient.as_bytes())?,
        })
    }

    /// Value for the `Ehbp-Encapsulated-Key` header
    pub fn encapsulated_key_hex(&self) -> String {
        hex::encode(self.enc)
    }

    pub fn seal_body(&self, plaintext: &[u8]) -> Result<Bytes> {
        let mut out = BytesMut::new();
        seal_frames(&self.secrets.cipher, 0, plaintext, true, &mut out)?;
        Ok(out.freeze())
    }

    /// Opener for the response carrying `Ehbp-Response-Nonce: nonce_hex`
    pub fn response_opener(&self, nonce_hex: &str) -> Result<ResponseOpener> {
        let nonce: [u8; RESPONSE_NONCE_LEN] = hex::decode(nonce_hex.trim())
            .ok()
            .and_then(|n| n.try_into().ok())
            .ok_or_else(|| Error::Transport("malformed response nonce".into()))?;

        Ok(ResponseOpener(FrameOpener::new(response_cipher(
            &self.secrets.response_secret,
            &self.enc,
            &nonce,
        )?)))
    }
}

/// Decrypts response frames in order
pub struct ResponseOpener(FrameOpener);

impl ResponseOpener {
    pub fn open_chunk(&mut self, frame: &Frame) -> Result<Vec<u8>> {
        self.0.open(frame)
    }

    /// Whether the final frame has been opened
    pub fn is_complete(&self) -> bool {
        self.0.done
    }

    /// Error unless the final frame has been opened
    pub fn finish(&self) -> Result<()> {
        self.0.finish()
    }

    pub fn open_body(&mut self, body: &[u8]) -> Result<Vec<u8>> {
        self.0.open_body(body)
    }
}

/// Enclave side: holds the static recipient secret
pub struct Recipient {
    secret: StaticSecret,
    public: RecipientKey,
}

impl Recipient {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = RecipientKey(PublicKey::from(&secret));
        Self { secret, public }
    }

    pub fn public_key(&self) -> RecipientKey {
        self.public
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public.as_bytes())
    }

    /// Decrypt a request body and prepare the matching response sealer
    pub fn open_request(&self, enc_hex: &str, body: &[u8]) -> Result<(Vec<u8>, ResponseSealer)> {
        let enc: [u8; KEY_LEN] = hex::decode(enc_hex.trim())
            .ok()
            .and_then(|k| k.try_into().ok())
            .ok_or_else(|| Error::Transport("malformed encapsulated key".into()))?;

        let shared = self.secret.diffie_hellman(&PublicKey::from(enc));
        let secrets = RequestSecrets::derive(shared.as_bytes(), &enc, self.public.as_bytes())?;
        let mut opener = FrameOpener::new(secrets.cipher);
        let plaintext = opener.open_body(body)?;

        let mut nonce = [0u8; RESPONSE_NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        Ok((
            plaintext,
            ResponseSealer {
                cipher: response_cipher(&secrets.response_secret, &enc, &nonce)?,
                nonce,
                next: 0,
            },
        ))
    }
}

/// Seals response chunks for one request
pub struct ResponseSealer {
    cipher: ChunkCipher,
    nonce: [u8; RESPONSE_NONCE_LEN],
    next: u64,
}

impl ResponseSealer {
    /// Value for the `Ehbp-Response-Nonce` header
    pub fn nonce_hex(&self) -> String {
        hex::encode(self.nonce)
    }

    /// Frames for one streamed piece; call repeatedly, then [`seal_final`]
    ///
    /// [`seal_final`]: Self::seal_final
    pub fn seal_chunk(&mut self, plaintext: &[u8]) -> Result<Bytes> {
        self.seal(plaintext, false)
    }

    /// Frames for the last piece of the body, which may be empty
    pub fn seal_final(&mut self, plaintext: &[u8]) -> Result<Bytes> {
        self.seal(plaintext, true)
    }

    fn seal(&mut self, plaintext: &[u8], last: bool) -> Result<Bytes> {
        let mut out = BytesMut::new();
        self.next = seal_frames(&self.cipher, self.next, plaintext, last, &mut out)?;
        Ok(out.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_round_trip() {
        let recipient = Recipient::generate();
        let sender = SenderContext::new(&recipient.public_key()).unwrap();

        let body = sender.seal_body(b"{\"prompt\":\"secret\"}").unwrap();
        assert!(!body.windows(6).any(|w| w == b"secret"));

        let (plaintext, _) = recipient
            .open_request(&sender.encapsulated_key_hex(), &body)
            .unwrap();
        assert_eq!(plaintext, b"{\"prompt\":\"secret\"}");
    }

    #[test]
    fn test_response_chunks_in_order() {
        let recipient = Recipient::generate();
        let sender = SenderContext::new(&recipient.public_key()).unwrap();
        let body = sender.seal_body(b"hi").unwrap();
        let (_, mut sealer) = recipient.open_request(&sender.encapsulated_key_hex(), &body).unwrap();

        let mut wire = BytesMut::new();
        wire.extend_from_slice(&sealer.seal_chunk(b"one ").unwrap());
        wire.extend_from_slice(&sealer.seal_final(b"two").unwrap());

        let mut opener = sender.response_opener(&sealer.nonce_hex()).unwrap();
        assert_eq!(opener.open_body(&wire).unwrap(), b"one two");
        assert!(opener.is_complete());
    }

    fn exchange() -> (SenderContext, ResponseSealer) {
        let recipient = Recipient::generate();
        let sender = SenderContext::new(&recipient.public_key()).unwrap();
        let body = sender.seal_body(b"hi").unwrap();
        let (_, sealer) = recipient.open_request(&sender.encapsulated_key_hex(), &body).unwrap();
        (sender, sealer)
    }

    #[test]
    fn test_body_cut_on_frame_boundary_fails() {
        let (sender, mut sealer) = exchange();
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&sealer.seal_chunk(b"first half").unwrap());
        let cut = wire.len();
        wire.extend_from_slice(&sealer.seal_final(b"second half").unwrap());

        let mut opener = sender.response_opener(&sealer.nonce_hex()).unwrap();
        let err = opener.open_body(&wire[..cut]).unwrap_err();
        assert!(err.to_string().contains("without a final frame"));
    }

    #[test]
    fn test_forged_final_flag_fails() {
        let (sender, mut sealer) = exchange();
        let mut wire = sealer.seal_chunk(b"more to come").unwrap().to_vec();
        wire[0] |= 0x80;

        let mut opener = sender.response_opener(&sealer.nonce_hex()).unwrap();
        assert!(opener.open_body(&wire).is_err());
    }

    #[test]
    fn test_frames_after_final_rejected() {
        let (sender, mut sealer) = exchange();
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&sealer.seal_final(b"done").unwrap());
        wire.extend_from_slice(&sealer.seal_final(b"extra").unwrap());

        let mut opener = sender.response_opener(&sealer.nonce_hex()).unwrap();
        let err = opener.open_body(&wire).unwrap_err();
        assert!(err.to_string().contains("after the final frame"));
    }

    #[test]
    fn test_empty_final_piece() {
        let (sender, mut sealer) = exchange();
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&sealer.seal_chunk(b"all of it").unwrap());
        wire.extend_from_slice(&sealer.seal_final(b"").unwrap());

        let mut opener = sender.response_opener(&sealer.nonce_hex()).unwrap();
        assert_eq!(opener.open_body(&wire).unwrap(), b"all of it");
    }

    #[test]
    fn test_reordered_chunks_fail() {
        let recipient = Recipient::generate();
        let sender = SenderContext::new(&recipient.public_key()).unwrap();
        let body = sender.seal_body(b"hi").unwrap();
        let (_, mut sealer) = recipient.open_request(&sender.encapsulated_key_hex(), &body).unwrap();

        let _first = sealer.seal_chunk(b"one").unwrap();
        let second = sealer.seal_chunk(b"two").unwrap();

        let mut opener = sender.response_opener(&sealer.nonce_hex()).unwrap();
        let frames = framing::decode_all(&second).unwrap();
        assert!(opener.open_chunk(&frames[0]).is_err());
    }

    #[test]
    fn test_wrong_recipient_cannot_open() {
        let recipient = Recipient::generate();
        let other = Recipient::generate();
        let sender = SenderContext::new(&recipient.public_key()).unwrap();
        let body = sender.seal_body(b"payload").unwrap();

        assert!(other.open_request(&sender.encapsulated_key_hex(), &body).is_err());
    }

    #[test]
    fn test_large_body_spans_frames() {
        let recipient = Recipient::generate();
        let sender = SenderContext::new(&recipient.public_key()).unwrap();
        let plaintext = vec![0x5a; MAX_CHUNK_LEN * 2 + 10];

        let body = sender.seal_body(&plaintext).unwrap();
        let frames = framing::decode_all(&body).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames.iter().filter(|f| f.last).count(), 1);
        assert!(frames[2].last);

        let (opened, _) = recipient.open_request(&sender.encapsulated_key_hex(), &body).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_nonce_xor_counter() {
        let cipher = ChunkCipher::new(&[1u8; KEY_LEN], [0xff; NONCE_LEN]).unwrap();
        let nonce = cipher.nonce(1);
        assert_eq!(nonce[..11], [0xff; 11]);
        assert_eq!(nonce[11], 0xfe);
        assert_eq!(cipher.nonce(0), [0xff; NONCE_LEN]);
    }

    #[test]
    fn test_recipient_key_parsing() {
        let recipient = Recipient::generate();
        let parsed = RecipientKey::from_hex(&recipient.public_key_hex()).unwrap();
        assert_eq!(parsed, recipient.public_key());

        assert!(RecipientKey::from_hex("zz").is_err());
        assert!(RecipientKey::from_hex(&"ab".repeat(31)).is_err());
    }

    #[test]
    fn test_malformed_response_nonce() {
        let recipient = Recipient::generate();
        let sender = SenderContext::new(&recipient.public_key()).unwrap();
        assert!(sender.response_opener("abcd").is_err());
        assert!(sender.response_opener("not hex").is_err());
    }
}
