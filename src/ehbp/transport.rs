//! Request/response transport with EHBP body encryption
//!
//! Sits on top of a pinned `reqwest::Client`. Non-empty request bodies are
//! sealed to the enclave's recipient key; responses are opened with the
//! matching response context, chunk by chunk for streams. Streams run on a
//! reader task that can be cancelled explicitly or by dropping the stream.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};
use url::Url;

use super::envelope::{RecipientKey, ResponseOpener, SenderContext};
use super::framing::FrameDecoder;
use super::{ENCAPSULATED_KEY_HEADER, ENCLAVE_URL_HEADER, RESPONSE_NONCE_HEADER};
use crate::error::{Error, Result};

/// Chunks buffered between the reader task and the consumer
const STREAM_BUFFER: usize = 16;

/// An outgoing request, relative to the transport's base URL
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    /// Path and query, e.g. `/v1/chat/completions`
    pub path: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl TransportRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self::new(Method::POST, path).body(body)
    }

    /// POST with a JSON body and content type
    pub fn json<T: serde::Serialize>(path: impl Into<String>, value: &T) -> Result<Self> {
        let body = serde_json::to_vec(value)?;
        Self::post(path, body).header("content-type", "application/json")
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::Transport(format!("invalid header name {}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::Transport(format!("invalid header value: {}", e)))?;
        self.headers.insert(name, value);
        Ok(self)
    }
}

/// Status and headers of a response whose body is delivered separately
#[derive(Debug, Clone)]
pub struct ResponseMeta {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

#[derive(Default)]
struct StreamRegistry {
    next_id: AtomicU64,
    active: Mutex<HashMap<u64, AbortHandle>>,
}

impl StreamRegistry {
    fn insert(&self, handle: AbortHandle) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, handle);
        id
    }

    /// Abort and forget stream `id`; returns false if it was already gone
    fn cancel(&self, id: u64) -> bool {
        match self.lock().remove(&id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn drain(&self) -> Vec<AbortHandle> {
        self.lock().drain().map(|(_, h)| h).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, AbortHandle>> {
        // A panic while holding the lock leaves the map itself consistent
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// HTTP transport that encrypts bodies to an attested enclave
#[derive(Clone)]
pub struct EncryptedTransport {
    http: reqwest::Client,
    base_url: Url,
    enclave_url: Url,
    recipient: Option<RecipientKey>,
    streams: Arc<StreamRegistry>,
}

impl EncryptedTransport {
    /// `base_url` is where requests are sent; `enclave_url` is the verified
    /// enclave. When they differ, the enclave URL is forwarded in
    /// `X-Tinfoil-Enclave-Url` for the proxy.
    ///
    /// Without a recipient key bodies travel in plaintext over the pinned
    /// TLS channel.
    pub fn new(
        http: reqwest::Client,
        base_url: &str,
        enclave_url: &str,
        recipient: Option<RecipientKey>,
    ) -> Result<Self> {
        let parse = |s: &str| {
            Url::parse(s).map_err(|e| Error::Config(format!("invalid URL {}: {}", s, e)))
        };

        Ok(Self {
            http,
            base_url: parse(base_url)?,
            enclave_url: parse(enclave_url)?,
            recipient,
            streams: Arc::new(StreamRegistry::default()),
        })
    }

    pub fn is_encrypted(&self) -> bool {
        self.recipient.is_some()
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Number of streams that have not been cancelled or dropped
    pub fn active_requests(&self) -> usize {
        self.streams.len()
    }

    /// Abort every in-flight stream
    pub fn cancel_all(&self) {
        let handles = self.streams.drain();
        if !handles.is_empty() {
            debug!(count = handles.len(), "Cancelling active streams");
        }
        for handle in handles {
            handle.abort();
        }
    }

    fn url_for(&self, path: &str) -> Result<Url> {
        let base = self.base_url.as_str().trim_end_matches('/');
        let path = path.trim_start_matches('/');
        Url::parse(&format!("{}/{}", base, path))
            .map_err(|e| Error::Transport(format!("invalid request path {}: {}", path, e)))
    }

    fn prepare(&self, req: TransportRequest) -> Result<(reqwest::RequestBuilder, Option<SenderContext>)> {
        let mut headers = req.headers;

        if self.base_url.origin() != self.enclave_url.origin() {
            let value = HeaderValue::from_str(self.enclave_url.as_str().trim_end_matches('/'))
                .map_err(|e| Error::Transport(format!("invalid enclave URL header: {}", e)))?;
            headers.insert(ENCLAVE_URL_HEADER, value);
        }

        let mut builder = self.http.request(req.method.clone(), self.url_for(&req.path)?);
        let mut context = None;

        match (req.body, &self.recipient) {
            (Some(body), Some(recipient)) if !body.is_empty() => {
                let sender = SenderContext::new(recipient)?;
                let sealed = sender.seal_body(&body)?;
                let enc = HeaderValue::from_str(&sender.encapsulated_key_hex())
                    .map_err(|e| Error::Transport(format!("invalid key header: {}", e)))?;
                headers.insert(ENCAPSULATED_KEY_HEADER, enc);
                headers.remove(reqwest::header::CONTENT_LENGTH);
                builder = builder.body(sealed);
                context = Some(sender);
            }
            (Some(body), None) if !body.is_empty() => {
                builder = builder.body(body);
            }
            _ => {}
        }

        debug!(method = %req.method, path = %req.path, encrypted = context.is_some(), "Sending request");
        Ok((builder.headers(headers), context))
    }

    async fn send(&self, req: TransportRequest) -> Result<(reqwest::Response, Option<ResponseOpener>)> {
        let (builder, context) = self.prepare(req)?;

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Transport(format!("request failed: {}", e)))?;

        let opener = match context {
            Some(sender) => {
                let nonce = response
                    .headers()
                    .get(RESPONSE_NONCE_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| {
                        Error::Transport(format!(
                            "encrypted request got a response without {} (HTTP {})",
                            RESPONSE_NONCE_HEADER,
                            response.status()
                        ))
                    })?;
                Some(sender.response_opener(nonce)?)
            }
            None => None,
        };

        Ok((response, opener))
    }

    /// Send `req` and return the full decrypted body
    pub async fn request(&self, req: TransportRequest) -> Result<(Bytes, ResponseMeta)> {
        let (response, opener) = self.send(req).await?;
        let meta = ResponseMeta {
            status: response.status(),
            headers: response.headers().clone(),
        };

        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Transport(format!("failed to read response: {}", e)))?;

        let body = match opener {
            Some(mut opener) => Bytes::from(opener.open_body(&body)?),
            None => body,
        };

        Ok((body, meta))
    }

    /// Send `req` and stream the decrypted response chunks
    pub async fn request_stream(&self, req: TransportRequest) -> Result<(ChunkStream, ResponseMeta)> {
        let (response, opener) = self.send(req).await?;
        let meta = ResponseMeta {
            status: response.status(),
            headers: response.headers().clone(),
        };

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let task = tokio::spawn(read_stream(response, opener, tx));
        let id = self.streams.insert(task.abort_handle());
        debug!(stream = id, "Opened response stream");

        Ok((
            ChunkStream {
                id,
                rx,
                registry: self.streams.clone(),
                closed: false,
            },
            meta,
        ))
    }
}

/// Pump the response body into `tx`, decrypting frame by frame. Stops at
/// the first error or when the receiver goes away. An encrypted body must
/// end with its final frame.
async fn read_stream(
    response: reqwest::Response,
    mut opener: Option<ResponseOpener>,
    tx: mpsc::Sender<Result<Bytes>>,
) {
    let mut body = response.bytes_stream();
    let mut decoder = FrameDecoder::new();

    while let Some(piece) = body.next().await {
        let piece = match piece {
            Ok(piece) => piece,
            Err(e) => {
                let _ = tx.send(Err(Error::Transport(format!("stream read failed: {}", e)))).await;
                return;
            }
        };

        let Some(opener) = opener.as_mut() else {
            if tx.send(Ok(piece)).await.is_err() {
                return;
            }
            continue;
        };

        decoder.extend(&piece);
        loop {
            let chunk = match decoder.next_frame() {
                Ok(Some(frame)) => opener.open_chunk(&frame).map(Bytes::from),
                Ok(None) => break,
                Err(e) => Err(e),
            };
            // The final frame may carry no plaintext
            if matches!(&chunk, Ok(c) if c.is_empty()) {
                continue;
            }
            let failed = chunk.is_err();
            if tx.send(chunk).await.is_err() || failed {
                return;
            }
        }
    }

    if let Some(opener) = &opener {
        if let Err(e) = decoder.finish().and_then(|_| opener.finish()) {
            warn!("Encrypted stream ended early: {}", e);
            let _ = tx.send(Err(e)).await;
        }
    }
}

/// Decrypted response body chunks, in order
///
/// Dropping the stream cancels the underlying request.
pub struct ChunkStream {
    id: u64,
    rx: mpsc::Receiver<Result<Bytes>>,
    registry: Arc<StreamRegistry>,
    closed: bool,
}

impl ChunkStream {
    /// Stop reading and close the connection
    pub fn cancel(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.rx.close();
        if self.registry.cancel(self.id) {
            debug!(stream = self.id, "Cancelled response stream");
        }
    }

    /// Collect the remaining chunks into one buffer
    pub async fn collect_bytes(mut self) -> Result<Bytes> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(Bytes::from(out))
    }
}

impl Stream for ChunkStream {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.closed {
            return Poll::Ready(None);
        }
        self.rx.poll_recv(cx)
    }
}

impl Drop for ChunkStream {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for ChunkStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStream")
            .field("id", &self.id)
            .field("closed", &self.closed)
            .finish()
    }
}
