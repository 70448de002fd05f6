//! Secure client with attestation verification, TLS pinning and body
//! encryption
//!
//! [`SecureClient::builder`] verifies the enclave before anything else is
//! sent. API requests to the enclave then go through a TLS connection
//! pinned to the attested key, with bodies sealed to the attested recipient
//! key. Requests through a proxy rely on the sealed bodies alone.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::api::{
    ChatCompletionChunk, ChatMessage, ChatRequest, ChatResponse, EmbeddingRequest,
    EmbeddingResponse, SseDecoder, SseEvent, Tool,
};
use crate::attestation::types::HardwareMeasurement;
use crate::config::{Config, PinningMode, Target};
use crate::ehbp::{ChunkStream, EncryptedTransport, RecipientKey, TransportRequest};
use crate::engine::{AttestationEngine, NativeEngine};
use crate::error::{Error, Result};
use crate::router;
use crate::tls;
use crate::verifier::{GroundTruth, StepState, VerificationDocument, VerificationSteps, Verifier};

/// Default models
pub const DEFAULT_CHAT_MODEL: &str = "qwen3-coder-480b";
pub const DEFAULT_EMBED_MODEL: &str = "nomic-embed-text";

/// Receives the verification document after every verification attempt
pub type VerificationObserver = Arc<dyn Fn(&VerificationDocument) + Send + Sync>;

/// Builder for [`SecureClient`]
#[derive(Default)]
pub struct SecureClientBuilder {
    config: Config,
    enclave: Option<String>,
    bundle_url: Option<String>,
    engine: Option<Arc<dyn AttestationEngine>>,
    observer: Option<VerificationObserver>,
}

impl SecureClientBuilder {
    /// Start from an existing configuration
    pub fn config(mut self, config: Config) -> Self {
        match &config.target {
            Some(Target::Enclave(host)) => self.enclave = Some(host.clone()),
            Some(Target::Bundle(url)) => self.bundle_url = Some(url.clone()),
            None => {}
        }
        self.config = config;
        self
    }

    /// Verify and talk to this enclave host
    pub fn enclave(mut self, host: impl Into<String>) -> Self {
        self.enclave = Some(host.into());
        self
    }

    /// Verify from an attestation bundle; the host comes from the bundle
    pub fn bundle_url(mut self, url: impl Into<String>) -> Self {
        self.bundle_url = Some(url.into());
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = Some(key.into());
        self
    }

    pub fn repo(mut self, repo: impl Into<String>) -> Self {
        self.config.repo = repo.into();
        self
    }

    /// Send requests here instead of directly to the enclave
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = Some(url.into());
        self
    }

    pub fn pinning(mut self, mode: PinningMode) -> Self {
        self.config.pinning = mode;
        self
    }

    pub fn hardware_measurements(mut self, allowed: Vec<HardwareMeasurement>) -> Self {
        self.config.hardware_measurements = allowed;
        self
    }

    pub fn request_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.config.request_timeout = Some(timeout);
        self
    }

    /// Replace the built-in attestation engine
    pub fn engine(mut self, engine: Arc<dyn AttestationEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn on_verification(mut self, observer: impl Fn(&VerificationDocument) + Send + Sync + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Verify the enclave and connect to it
    pub async fn build(self) -> Result<SecureClient> {
        let mut config = self.config;

        // 1. Configuration errors surface before any network traffic
        config.target = match (self.enclave, self.bundle_url) {
            (Some(_), Some(_)) => {
                return Err(Error::Config(
                    "enclave and bundle URL are mutually exclusive".into(),
                ))
            }
            (Some(host), None) => Some(Target::Enclave(host)),
            (None, Some(url)) => Some(Target::Bundle(url)),
            (None, None) => None,
        };
        config.validate()?;
        let api_key = config.resolve_api_key()?;

        // 2. Pick a router when no target is configured
        let target = match config.target.clone() {
            Some(target) => target,
            None => Target::Enclave(router::discover(&config.router_url).await?),
        };

        let engine: Arc<dyn AttestationEngine> = match self.engine {
            Some(engine) => engine,
            None => Arc::new(NativeEngine::from_config(&config)?),
        };
        let verifier = Arc::new(Verifier::new(config.repo.clone(), target, engine));

        SecureClient::connect(config, api_key, verifier, self.observer).await
    }
}

/// Secure client for Tinfoil inference with hardware attestation
///
/// Construction performs the full verification:
/// 1. Fetches the release digest and provenance of the configured repo
/// 2. Verifies the Sigstore signature over the expected measurement
/// 3. Verifies the AMD SEV-SNP or Intel TDX hardware attestation
/// 4. Compares the two measurements
///
/// and then builds an HTTP client that checks the attested certificate key on
/// EVERY connection and seals bodies to the attested recipient key.
pub struct SecureClient {
    config: Config,
    api_key: String,
    verifier: Arc<Verifier>,
    observer: Option<VerificationObserver>,
    ground_truth: GroundTruth,
    document: VerificationDocument,
    transport: EncryptedTransport,
}

impl std::fmt::Debug for SecureClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureClient")
            .field("host", &self.host())
            .field("encrypted", &self.transport.is_encrypted())
            .finish_non_exhaustive()
    }
}

impl SecureClient {
    pub fn builder() -> SecureClientBuilder {
        SecureClientBuilder::default()
    }

    async fn connect(
        config: Config,
        api_key: String,
        verifier: Arc<Verifier>,
        observer: Option<VerificationObserver>,
    ) -> Result<Self> {
        let notify = |doc: &VerificationDocument| {
            if let Some(observer) = &observer {
                observer(doc);
            }
        };

        let verified = verifier.verify().await;
        let document = verifier.last_document();
        let ground_truth = match verified {
            Ok(gt) => gt,
            Err(e) => {
                if let Some(doc) = &document {
                    notify(doc);
                }
                return Err(e);
            }
        };
        let document = document.unwrap_or_else(|| {
            VerificationDocument::new(verifier.repo(), Some(&ground_truth), VerificationSteps::succeeded())
        });

        match build_transport(&config, &ground_truth) {
            Ok((transport, hpke_state)) => {
                let document = document.with_transport_steps(StepState::Success, hpke_state);
                notify(&document);
                info!(
                    host = ground_truth.enclave_host.as_deref().unwrap_or_default(),
                    encrypted = transport.is_encrypted(),
                    "Secure client ready"
                );
                Ok(Self {
                    config,
                    api_key,
                    verifier,
                    observer,
                    ground_truth,
                    document,
                    transport,
                })
            }
            Err((e, hpke_state)) => {
                let document = document
                    .with_transport_steps(StepState::Failed(e.to_string()), hpke_state);
                notify(&document);
                warn!("Failed to set up transport: {}", e);
                Err(e)
            }
        }
    }

    /// Run verification again and replace the pinned transport. Streams on
    /// the old transport are cancelled.
    pub async fn reverify(&mut self) -> Result<()> {
        let next = Self::connect(
            self.config.clone(),
            self.api_key.clone(),
            self.verifier.clone(),
            self.observer.clone(),
        )
        .await?;

        self.transport.cancel_all();
        *self = next;
        Ok(())
    }

    /// Enclave hostname
    pub fn host(&self) -> &str {
        self.ground_truth.enclave_host.as_deref().unwrap_or_default()
    }

    /// Verified ground truth
    pub fn ground_truth(&self) -> &GroundTruth {
        &self.ground_truth
    }

    /// Document for the verification this client was built from
    pub fn document(&self) -> &VerificationDocument {
        &self.document
    }

    pub fn transport(&self) -> &EncryptedTransport {
        &self.transport
    }

    fn authorized(&self, req: TransportRequest) -> Result<TransportRequest> {
        req.header("authorization", &format!("Bearer {}", self.api_key))
    }

    async fn post_json<T: Serialize, R: DeserializeOwned>(&self, path: &str, body: &T) -> Result<R> {
        let req = self.authorized(TransportRequest::json(path, body)?)?;
        let (body, meta) = self.transport.request(req).await?;

        if !meta.status.is_success() {
            return Err(Error::Api {
                status: meta.status.as_u16(),
                message: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        Ok(serde_json::from_slice(&body)?)
    }

    /// Make a chat completion request
    pub async fn chat(&self, messages: Vec<ChatMessage>) -> Result<ChatResponse> {
        self.chat_with_model(DEFAULT_CHAT_MODEL, messages, None).await
    }

    /// Make a chat completion request with tools
    pub async fn chat_with_tools(&self, messages: Vec<ChatMessage>, tools: Vec<Tool>) -> Result<ChatResponse> {
        self.chat_with_model(DEFAULT_CHAT_MODEL, messages, Some(tools)).await
    }

    /// Make a chat completion request with a specific model
    pub async fn chat_with_model(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        tools: Option<Vec<Tool>>,
    ) -> Result<ChatResponse> {
        let mut request = ChatRequest::new(model, messages);
        if let Some(t) = tools {
            request = request.with_tools(t);
        }

        self.post_json("/v1/chat/completions", &request).await
    }

    /// Stream a chat completion as it is generated
    pub async fn chat_stream(&self, model: &str, messages: Vec<ChatMessage>) -> Result<ChatStream> {
        let request = ChatRequest::new(model, messages).streaming();
        let req = self
            .authorized(TransportRequest::json("/v1/chat/completions", &request)?)?
            .header("accept", "text/event-stream")?;

        let (stream, meta) = self.transport.request_stream(req).await?;
        if !meta.status.is_success() {
            let body = stream.collect_bytes().await.unwrap_or_default();
            return Err(Error::Api {
                status: meta.status.as_u16(),
                message: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        Ok(ChatStream::new(stream))
    }

    /// Generate an embedding for the given text
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_with_model(DEFAULT_EMBED_MODEL, text).await
    }

    pub async fn embed_with_model(&self, model: &str, text: &str) -> Result<Vec<f32>> {
        let request = EmbeddingRequest::new(model, text);
        let response: EmbeddingResponse = self.post_json("/v1/embeddings", &request).await?;

        response
            .embedding()
            .map(|e| e.to_vec())
            .ok_or(Error::NoEmbedding)
    }
}

/// HTTP client and transport for a verified enclave.
///
/// Direct connections are pinned to the attested TLS key. A base URL on
/// another origin is a proxy: it gets ordinary CA-verified TLS and is only
/// allowed when bodies can be sealed to the recipient key.
///
/// Also returns the recipient-key step state so failures can be recorded.
fn build_transport(
    config: &Config,
    ground_truth: &GroundTruth,
) -> std::result::Result<(EncryptedTransport, Option<StepState>), (Error, Option<StepState>)> {
    let host = ground_truth
        .enclave_host
        .as_deref()
        .ok_or_else(|| (Error::Config("verified ground truth has no host".into()), None))?;
    let enclave_url = format!("https://{}", host);

    // An advertised key must be usable; only an absent key falls back to
    // the pinned TLS channel alone.
    let (recipient, hpke_state) = match ground_truth.recipient_encryption_key.as_deref() {
        Some(key) if !key.is_empty() => match RecipientKey::from_hex(key) {
            Ok(recipient) => (Some(recipient), Some(StepState::Success)),
            Err(e) => {
                let state = StepState::Failed(e.to_string());
                return Err((e, Some(state)));
            }
        },
        _ => {
            debug!("Enclave advertises no recipient key; using pinned TLS only");
            (None, None)
        }
    };

    let base_url = config.base_url.as_deref().unwrap_or(&enclave_url);
    let proxied = crosses_origin(base_url, &enclave_url).map_err(|e| (e, hpke_state.clone()))?;

    // Through a proxy the TLS peer is the proxy, not the enclave, so only
    // the sealed bodies reach the attested key.
    let http = if proxied {
        if recipient.is_none() {
            let e = Error::Config(format!(
                "base URL {} is not the enclave and the enclave advertises no recipient key",
                base_url
            ));
            return Err((e, hpke_state));
        }
        debug!(base_url, "Routing through proxy with sealed bodies");
        tls::create_proxy_client(config.request_timeout)
    } else {
        tls::create_pinned_client(
            &ground_truth.tls_public_key_fingerprint,
            config.pinning.clone(),
            config.request_timeout,
        )
    }
    .map_err(|e| (e, hpke_state.clone()))?;

    let transport = EncryptedTransport::new(http, base_url, &enclave_url, recipient)
        .map_err(|e| (e, hpke_state.clone()))?;

    Ok((transport, hpke_state))
}

fn crosses_origin(base_url: &str, enclave_url: &str) -> Result<bool> {
    let parse = |s: &str| {
        url::Url::parse(s).map_err(|e| Error::Config(format!("invalid URL {}: {}", s, e)))
    };
    Ok(parse(base_url)?.origin() != parse(enclave_url)?.origin())
}

/// Streamed chat completion chunks decoded from server-sent events
///
/// Dropping the stream cancels the request.
#[derive(Debug)]
pub struct ChatStream {
    inner: ChunkStream,
    decoder: SseDecoder,
    pending: VecDeque<Result<ChatCompletionChunk>>,
    done: bool,
}

impl ChatStream {
    fn new(inner: ChunkStream) -> Self {
        Self {
            inner,
            decoder: SseDecoder::new(),
            pending: VecDeque::new(),
            done: false,
        }
    }

    /// Stop the stream and close the connection
    pub fn cancel(&mut self) {
        self.done = true;
        self.pending.clear();
        self.inner.cancel();
    }
}

impl Stream for ChatStream {
    type Item = Result<ChatCompletionChunk>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(item) = this.pending.pop_front() {
                return Poll::Ready(Some(item));
            }
            if this.done {
                return Poll::Ready(None);
            }

            match this.inner.poll_next_unpin(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => this.done = true,
                Poll::Ready(Some(Err(e))) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(Some(Ok(bytes))) => {
                    for event in this.decoder.push(&bytes) {
                        match event {
                            SseEvent::Data(data) => this
                                .pending
                                .push_back(serde_json::from_str(&data).map_err(Error::from)),
                            SseEvent::Done => {
                                this.done = true;
                                this.inner.cancel();
                                break;
                            }
                        }
                    }
                }
            }
        }
    }
}
