//! Duplex streaming inference transport, one per session (spec.md §4.8).
//!
//! Model: single-threaded cooperative per transport — one outbound queue,
//! one inbound stream, callers never pipeline two prompts on the same
//! transport. Ordering, backpressure, compression, batching, signed-message
//! verification, token refresh and reconnection all live here.

mod messages;
mod rate_limit;
mod signing;
mod token;

pub use messages::{
    BatchedPrompt, ClientFrame, EmbedKind, Envelope, HostFrame, SearchHit, VectorUploadItem,
    PROTOCOL_VERSION,
};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use signing::{now_unix_ms, sign_payload, verify_signature, ReplayGuard};
pub use token::TokenIssuer;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ed25519_dalek::{SigningKey, VerifyingKey};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::warn;

use crate::error::{CoreError, Result};
use crate::model::{ChunkId, HostId, MessageRole, SessionId};

const DEFAULT_COMPRESSION_THRESHOLD: usize = 1000;
const DEFAULT_BATCH_WINDOW_MS: u64 = 100;
const DEFAULT_REPLAY_WINDOW_MS: u64 = 60_000;
const DEFAULT_REFRESH_BEFORE_MS: u64 = 30_000;
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// One duplex channel of raw frames. `WsMessageChannel` is the production
/// websocket-backed implementation; an in-memory pair stands in for tests
/// (see `transport::tests::InMemoryChannel`), exercising all the logic in
/// this module without a live host.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    async fn send_frame(&self, frame: ClientFrame) -> Result<()>;
    /// Returns `None` once the channel has closed.
    async fn recv_frame(&self) -> Result<Option<HostFrame>>;
}

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Production `MessageChannel`: JSON-over-websocket, matching the
/// teacher's `tokio-tungstenite` dependency and the sibling host node's
/// `src/api/websocket/session.rs`.
pub struct WsMessageChannel {
    inner: Mutex<WsStream>,
}

impl WsMessageChannel {
    pub async fn connect(url: &str) -> Result<Self> {
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| CoreError::NetworkTransient {
                message: e.to_string(),
            })?;
        Ok(Self {
            inner: Mutex::new(stream),
        })
    }
}

#[async_trait]
impl MessageChannel for WsMessageChannel {
    async fn send_frame(&self, frame: ClientFrame) -> Result<()> {
        let envelope = Envelope::new(frame);
        let text = serde_json::to_string(&envelope)?;
        let mut guard = self.inner.lock().await;
        guard
            .send(WsMessage::Text(text))
            .await
            .map_err(|_| CoreError::TransportDropped)
    }

    /// Unknown `type` values are logged and ignored (spec.md §6) rather
    /// than tearing down the connection.
    async fn recv_frame(&self) -> Result<Option<HostFrame>> {
        let mut guard = self.inner.lock().await;
        loop {
            match guard.next().await {
                Some(Ok(WsMessage::Text(text))) => match serde_json::from_str::<Envelope<HostFrame>>(&text)
                {
                    Ok(envelope) => return Ok(Some(envelope.payload)),
                    Err(e) => {
                        warn!(error = %e, "ignoring malformed or unrecognized host frame");
                        continue;
                    }
                },
                Some(Ok(WsMessage::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(_)) => return Err(CoreError::TransportDropped),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub compression_enabled: bool,
    pub compression_threshold: usize,
    pub batching_enabled: bool,
    pub batch_window: Duration,
    pub signed_mode: bool,
    pub replay_window: Duration,
    pub refresh_before: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            compression_enabled: false,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            batching_enabled: false,
            batch_window: Duration::from_millis(DEFAULT_BATCH_WINDOW_MS),
            signed_mode: false,
            replay_window: Duration::from_millis(DEFAULT_REPLAY_WINDOW_MS),
            refresh_before: Duration::from_millis(DEFAULT_REFRESH_BEFORE_MS),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

/// Outcome of a completed (non-streaming-observed) prompt round trip.
#[derive(Debug, Clone)]
pub struct PromptOutcome {
    pub content: String,
    pub tokens_used: Option<u64>,
}

/// A single session's duplex channel: prompt send, token streaming,
/// checkpoint notices, compression, batching, rate limiting, signed-message
/// verification and bearer-token refresh.
pub struct InferenceTransport {
    channel: Mutex<Box<dyn MessageChannel>>,
    session_id: SessionId,
    host_id: HostId,
    config: TransportConfig,
    state: Mutex<TransportState>,
    next_message_index: AtomicU64,
    rate_limiter: RateLimiter,
    signing_key: Option<SigningKey>,
    host_verifying_key: Option<VerifyingKey>,
    permitted_operations: Mutex<HashSet<String>>,
    batch_queue: Mutex<Vec<BatchedPrompt>>,
    batch_opened_at: Mutex<Option<std::time::Instant>>,
}

impl InferenceTransport {
    /// Opens a brand-new session: sends `session_init`, awaits the host's
    /// `SessionAck`. Message indices start at 0 (spec.md §4.8).
    pub async fn open(
        channel: Box<dyn MessageChannel>,
        session_id: SessionId,
        model: String,
        bearer_token: String,
        config: TransportConfig,
    ) -> Result<Self> {
        let transport = Self::new(channel, session_id.clone(), config, 0);
        transport
            .channel
            .lock()
            .await
            .send_frame(ClientFrame::SessionInit {
                session_id: session_id.clone(),
                bearer_token,
                model,
            })
            .await?;

        match transport.await_frame_matching(|f| matches!(f, HostFrame::SessionAck { .. })).await? {
            Some(HostFrame::SessionAck { .. }) => Ok(transport),
            _ => Err(CoreError::TransportDropped),
        }
    }

    /// Resumes a session: sends the full conversation history (never
    /// truncated by the client, spec.md §4.9) and picks up `message_index`
    /// at `conversation_context.len()`.
    pub async fn resume(
        channel: Box<dyn MessageChannel>,
        session_id: SessionId,
        bearer_token: String,
        conversation_context: Vec<(MessageRole, String)>,
        config: TransportConfig,
    ) -> Result<Self> {
        let last_message_index = conversation_context.len() as u64;
        let transport = Self::new(channel, session_id.clone(), config, last_message_index);
        transport
            .channel
            .lock()
            .await
            .send_frame(ClientFrame::SessionResume {
                session_id: session_id.clone(),
                bearer_token,
                conversation_context,
                last_message_index,
            })
            .await?;

        match transport.await_frame_matching(|f| matches!(f, HostFrame::SessionAck { .. })).await? {
            Some(HostFrame::SessionAck { .. }) => Ok(transport),
            _ => Err(CoreError::TransportDropped),
        }
    }

    fn new(
        channel: Box<dyn MessageChannel>,
        session_id: SessionId,
        config: TransportConfig,
        starting_index: u64,
    ) -> Self {
        Self {
            channel: Mutex::new(channel),
            session_id,
            host_id: HostId::new(""),
            config,
            state: Mutex::new(TransportState::Connected),
            next_message_index: AtomicU64::new(starting_index),
            rate_limiter: RateLimiter::new(RateLimitConfig::default()),
            signing_key: None,
            host_verifying_key: None,
            permitted_operations: Mutex::new(HashSet::from([
                "inference".to_string(),
                "streaming".to_string(),
                "vector-search".to_string(),
            ])),
            batch_queue: Mutex::new(Vec::new()),
            batch_opened_at: Mutex::new(None),
        }
    }

    pub fn with_host_id(mut self, host_id: HostId) -> Self {
        self.host_id = host_id;
        self
    }

    pub fn with_signing_key(mut self, signing_key: SigningKey) -> Self {
        self.signing_key = Some(signing_key);
        self
    }

    pub fn with_host_verifying_key(mut self, key: VerifyingKey) -> Self {
        self.host_verifying_key = Some(key);
        self
    }

    pub async fn set_permitted_operations(&self, ops: impl IntoIterator<Item = String>) {
        *self.permitted_operations.lock().await = ops.into_iter().collect();
    }

    async fn check_permission(&self, operation: &str) -> Result<()> {
        if self.permitted_operations.lock().await.contains(operation) {
            Ok(())
        } else {
            Err(CoreError::PermissionDenied {
                operation: operation.to_string(),
            })
        }
    }

    pub async fn state(&self) -> TransportState {
        *self.state.lock().await
    }

    async fn mark_disconnected(&self) {
        *self.state.lock().await = TransportState::Disconnected;
    }

    /// Content above the compression threshold is zstd-compressed and
    /// marked `compressed=true`; the host is responsible for decompression
    /// (spec.md §4.8).
    fn maybe_compress(&self, content: &str) -> Result<(String, bool)> {
        if !self.config.compression_enabled || content.len() <= self.config.compression_threshold {
            return Ok((content.to_string(), false));
        }
        let compressed = zstd::encode_all(content.as_bytes(), 0).map_err(|e| CoreError::Internal {
            message: format!("zstd compression failed: {e}"),
        })?;
        Ok((hex::encode(compressed), true))
    }

    fn maybe_sign(&self, content: &str, timestamp_ms: u64, nonce: u64) -> Option<[u8; 64]> {
        self.signing_key.as_ref().map(|key| {
            let payload = format!("{content}{timestamp_ms}{nonce}");
            sign_payload(key, payload.as_bytes())
        })
    }

    /// Verifies an inbound `Response` against the host's announced public
    /// key when signed mode is enabled, rejecting stale or forged frames.
    fn verify_response(&self, delta: &str, signature: Option<[u8; 64]>, timestamp_ms: Option<u64>) -> Result<()> {
        if !self.config.signed_mode {
            return Ok(());
        }
        let verifying_key = self
            .host_verifying_key
            .ok_or_else(|| CoreError::SignatureInvalid {
                reason: "signed mode enabled but no host key configured".to_string(),
            })?;
        let signature = signature.ok_or_else(|| CoreError::SignatureInvalid {
            reason: "response missing required signature".to_string(),
        })?;
        let timestamp_ms = timestamp_ms.ok_or_else(|| CoreError::SignatureInvalid {
            reason: "response missing required timestamp".to_string(),
        })?;

        let now = now_unix_ms();
        if now.saturating_sub(timestamp_ms) > self.config.replay_window.as_millis() as u64 {
            return Err(CoreError::SignatureInvalid {
                reason: "response timestamp outside replay window".to_string(),
            });
        }

        let payload = format!("{delta}{timestamp_ms}");
        if !verify_signature(&verifying_key, payload.as_bytes(), &signature) {
            return Err(CoreError::SignatureInvalid {
                reason: "response signature verification failed".to_string(),
            });
        }
        Ok(())
    }

    async fn rate_limit_wait(&self) -> Result<()> {
        if let Some(wait) = self.rate_limiter.check(self.host_id.as_str()) {
            tokio::time::sleep(wait).await;
        }
        self.rate_limiter.record_request(self.host_id.as_str());
        Ok(())
    }

    /// Sends one prompt and drives the receive loop until the host marks
    /// the response `done=true`, invoking `on_chunk` for every streamed
    /// delta. Ordering is enforced structurally: callers only get a result
    /// once the previous prompt's response is fully resolved.
    pub async fn send_prompt(
        &self,
        content: &str,
        context_chunks: Vec<ChunkId>,
        mut on_chunk: impl FnMut(&str, bool),
    ) -> Result<PromptOutcome> {
        self.check_permission("inference").await?;
        self.rate_limit_wait().await?;

        let message_index = self.next_message_index.fetch_add(1, Ordering::SeqCst);
        let (wire_content, compressed) = self.maybe_compress(content)?;
        let timestamp_ms = now_unix_ms();
        let nonce = rand::random::<u64>();
        let signature = self.maybe_sign(content, timestamp_ms, nonce);

        self.send(ClientFrame::Prompt {
            session_id: self.session_id.clone(),
            message_index,
            content: wire_content,
            context_chunks,
            compressed,
            signature,
            nonce: signature.map(|_| nonce),
            timestamp_ms: signature.map(|_| timestamp_ms),
        })
        .await?;

        let mut accumulated = String::new();
        let mut tokens_used = None;
        loop {
            match self.recv().await? {
                Some(HostFrame::Response {
                    message_index: idx,
                    delta,
                    done,
                    tokens_used: tu,
                    signature,
                    timestamp_ms,
                    ..
                }) if idx == message_index => {
                    self.verify_response(&delta, signature, timestamp_ms)?;
                    accumulated.push_str(&delta);
                    tokens_used = tu.or(tokens_used);
                    on_chunk(&delta, done);
                    if done {
                        return Ok(PromptOutcome {
                            content: accumulated,
                            tokens_used,
                        });
                    }
                }
                Some(HostFrame::Error {
                    code,
                    message,
                    retry_after_ms,
                    ..
                }) => {
                    if let Some(ms) = retry_after_ms {
                        return Err(CoreError::RateLimited { retry_after_ms: ms });
                    }
                    return Err(CoreError::NetworkTransient {
                        message: format!("host error {code}: {message}"),
                    });
                }
                Some(_) => continue,
                None => {
                    self.mark_disconnected().await;
                    return Err(CoreError::TransportDropped);
                }
            }
        }
    }

    /// Queues a prompt for batched delivery rather than sending it
    /// immediately. `flush_batched_prompts` (called by the caller once
    /// `batch_window` has elapsed, or immediately if the queue is full)
    /// sends all queued prompts as a single `PromptBatch` frame.
    pub async fn queue_batched_prompt(&self, content: &str, context_chunks: Vec<ChunkId>) -> u64 {
        let message_index = self.next_message_index.fetch_add(1, Ordering::SeqCst);
        let mut queue = self.batch_queue.lock().await;
        if queue.is_empty() {
            *self.batch_opened_at.lock().await = Some(std::time::Instant::now());
        }
        queue.push(BatchedPrompt {
            message_index,
            content: content.to_string(),
            context_chunks,
        });
        message_index
    }

    pub async fn batch_window_elapsed(&self) -> bool {
        match *self.batch_opened_at.lock().await {
            Some(opened) => opened.elapsed() >= self.config.batch_window,
            None => false,
        }
    }

    pub async fn flush_batched_prompts(&self) -> Result<()> {
        self.check_permission("inference").await?;
        let prompts: Vec<BatchedPrompt> = {
            let mut queue = self.batch_queue.lock().await;
            std::mem::take(&mut *queue)
        };
        *self.batch_opened_at.lock().await = None;
        if prompts.is_empty() {
            return Ok(());
        }
        self.send(ClientFrame::PromptBatch {
            session_id: self.session_id.clone(),
            prompts,
        })
        .await
    }

    pub async fn search_vectors(
        &self,
        query_embedding: Vec<f32>,
        top_k: u32,
        threshold: f32,
    ) -> Result<Vec<SearchHit>> {
        self.check_permission("vector-search").await?;
        self.send(ClientFrame::SearchVectors {
            session_id: self.session_id.clone(),
            query_embedding,
            top_k,
            threshold,
        })
        .await?;
        match self
            .await_frame_matching(|f| matches!(f, HostFrame::SearchResult { .. }))
            .await?
        {
            Some(HostFrame::SearchResult { hits, .. }) => Ok(hits),
            _ => Err(CoreError::TransportDropped),
        }
    }

    pub async fn embed_text(&self, chunk_id: ChunkId, text: String, kind: EmbedKind) -> Result<Vec<f32>> {
        self.send(ClientFrame::EmbedText {
            session_id: self.session_id.clone(),
            chunk_id,
            text,
            kind,
        })
        .await?;
        match self
            .await_frame_matching(|f| matches!(f, HostFrame::EmbedResult { .. }))
            .await?
        {
            Some(HostFrame::EmbedResult { embedding, .. }) => Ok(embedding),
            _ => Err(CoreError::TransportDropped),
        }
    }

    pub async fn upload_vectors(
        &self,
        document_id: crate::model::DocumentId,
        items: Vec<VectorUploadItem>,
    ) -> Result<(Vec<ChunkId>, Vec<ChunkId>, Vec<String>)> {
        self.send(ClientFrame::UploadVectors {
            session_id: self.session_id.clone(),
            document_id,
            items,
        })
        .await?;
        match self
            .await_frame_matching(|f| matches!(f, HostFrame::UploadAck { .. }))
            .await?
        {
            Some(HostFrame::UploadAck {
                uploaded,
                rejected,
                errors,
                ..
            }) => Ok((uploaded, rejected, errors)),
            _ => Err(CoreError::TransportDropped),
        }
    }

    pub async fn end_session(&self, total_tokens: u64) -> Result<()> {
        self.send(ClientFrame::SessionEnd {
            session_id: self.session_id.clone(),
            total_tokens,
        })
        .await
    }

    /// Waits for the next `CheckpointNotice` frame, ignoring any
    /// interleaved `Response`/search/embed frames. `CheckpointEngine` drives
    /// its reconciliation loop from the notices this returns.
    pub async fn next_checkpoint_notice(&self) -> Result<Option<HostFrame>> {
        self.await_frame_matching(|f| matches!(f, HostFrame::CheckpointNotice { .. }))
            .await
    }

    async fn send(&self, frame: ClientFrame) -> Result<()> {
        if *self.state.lock().await != TransportState::Connected {
            return Err(CoreError::TransportClosed);
        }
        self.channel.lock().await.send_frame(frame).await
    }

    async fn recv(&self) -> Result<Option<HostFrame>> {
        self.channel.lock().await.recv_frame().await
    }

    async fn await_frame_matching(&self, pred: impl Fn(&HostFrame) -> bool) -> Result<Option<HostFrame>> {
        loop {
            match self.recv().await? {
                Some(frame) if pred(&frame) => return Ok(Some(frame)),
                Some(_) => continue,
                None => {
                    self.mark_disconnected().await;
                    return Ok(None);
                }
            }
        }
    }

    /// Replaces the underlying channel after a drop, without resending any
    /// unacknowledged prompt (spec.md §4.8: "must not auto-send any prompt
    /// that had not been acknowledged; caller decides resend policy").
    /// Retries up to `max_reconnect_attempts` with exponential backoff,
    /// giving up and returning `TransportDropped` if every attempt fails.
    pub async fn reconnect<F, Fut>(&self, mut connect: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<Box<dyn MessageChannel>>>,
    {
        let mut delay = Duration::from_millis(500);
        for attempt in 0..self.config.max_reconnect_attempts {
            match connect().await {
                Ok(candidate) => {
                    *self.channel.lock().await = candidate;
                    *self.state.lock().await = TransportState::Connected;
                    return Ok(());
                }
                Err(e) if attempt + 1 < self.config.max_reconnect_attempts => {
                    warn!(error = %e, attempt, "reconnect attempt failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
        Err(CoreError::TransportDropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tokio::sync::Mutex as TokioMutex;

    /// In-memory duplex channel: `to_host` captures what the transport
    /// sent, `from_host` is a scripted queue of frames to hand back.
    struct InMemoryChannel {
        to_host: TokioMutex<Vec<ClientFrame>>,
        from_host: TokioMutex<VecDeque<HostFrame>>,
    }

    impl InMemoryChannel {
        fn new(scripted: Vec<HostFrame>) -> Self {
            Self {
                to_host: TokioMutex::new(Vec::new()),
                from_host: TokioMutex::new(scripted.into()),
            }
        }
    }

    #[async_trait]
    impl MessageChannel for InMemoryChannel {
        async fn send_frame(&self, frame: ClientFrame) -> Result<()> {
            self.to_host.lock().await.push(frame);
            Ok(())
        }

        async fn recv_frame(&self) -> Result<Option<HostFrame>> {
            Ok(self.from_host.lock().await.pop_front())
        }
    }

    fn session_id() -> SessionId {
        SessionId::generate()
    }

    #[tokio::test]
    async fn open_sends_init_and_awaits_ack() {
        let sid = session_id();
        let channel = Box::new(InMemoryChannel::new(vec![HostFrame::SessionAck {
            session_id: sid.clone(),
            host_id: HostId::new("h1"),
        }]));
        let transport = InferenceTransport::open(
            channel,
            sid,
            "llama-3-70b".to_string(),
            "tok".to_string(),
            TransportConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(transport.state().await, TransportState::Connected);
    }

    #[tokio::test]
    async fn send_prompt_accumulates_chunks_until_done() {
        let sid = session_id();
        let channel = Box::new(InMemoryChannel::new(vec![
            HostFrame::SessionAck {
                session_id: sid.clone(),
                host_id: HostId::new("h1"),
            },
            HostFrame::Response {
                session_id: sid.clone(),
                message_index: 0,
                delta: "Hello".to_string(),
                done: false,
                tokens_used: None,
                signature: None,
                timestamp_ms: None,
            },
            HostFrame::Response {
                session_id: sid.clone(),
                message_index: 0,
                delta: ", world".to_string(),
                done: true,
                tokens_used: Some(12),
                signature: None,
                timestamp_ms: None,
            },
        ]));
        let transport = InferenceTransport::open(
            channel,
            sid,
            "llama-3-70b".to_string(),
            "tok".to_string(),
            TransportConfig::default(),
        )
        .await
        .unwrap();

        let mut chunks = Vec::new();
        let outcome = transport
            .send_prompt("hi", vec![], |chunk, done| {
                chunks.push((chunk.to_string(), done));
            })
            .await
            .unwrap();

        assert_eq!(outcome.content, "Hello, world");
        assert_eq!(outcome.tokens_used, Some(12));
        assert_eq!(chunks, vec![("Hello".to_string(), false), (", world".to_string(), true)]);
    }

    #[tokio::test]
    async fn message_index_increments_per_prompt() {
        let sid = session_id();
        let channel = Box::new(InMemoryChannel::new(vec![HostFrame::SessionAck {
            session_id: sid.clone(),
            host_id: HostId::new("h1"),
        }]));
        let transport = InferenceTransport::open(
            channel,
            sid,
            "m".to_string(),
            "tok".to_string(),
            TransportConfig::default(),
        )
        .await
        .unwrap();

        assert_eq!(transport.next_message_index.load(Ordering::SeqCst), 0);
        transport.next_message_index.fetch_add(1, Ordering::SeqCst);
        assert_eq!(transport.next_message_index.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn host_error_with_retry_after_surfaces_as_rate_limited() {
        let sid = session_id();
        let channel = Box::new(InMemoryChannel::new(vec![
            HostFrame::SessionAck {
                session_id: sid.clone(),
                host_id: HostId::new("h1"),
            },
            HostFrame::Error {
                session_id: Some(sid.clone()),
                code: "rate_limited".to_string(),
                message: "slow down".to_string(),
                retry_after_ms: Some(250),
            },
        ]));
        let transport = InferenceTransport::open(
            channel,
            sid,
            "m".to_string(),
            "tok".to_string(),
            TransportConfig::default(),
        )
        .await
        .unwrap();

        let err = transport.send_prompt("hi", vec![], |_, _| {}).await.unwrap_err();
        assert!(matches!(err, CoreError::RateLimited { retry_after_ms: 250 }));
    }

    #[tokio::test]
    async fn compression_kicks_in_above_threshold() {
        let sid = session_id();
        let channel = Box::new(InMemoryChannel::new(vec![]));
        let mut config = TransportConfig::default();
        config.compression_enabled = true;
        config.compression_threshold = 10;
        let transport = InferenceTransport::new(channel, sid, config, 0);

        let (_short, compressed_short) = transport.maybe_compress("short").unwrap();
        assert!(!compressed_short);

        let (_long, compressed_long) = transport.maybe_compress(&"x".repeat(50)).unwrap();
        assert!(compressed_long);
    }

    #[tokio::test]
    async fn permission_denied_when_operation_not_permitted() {
        let sid = session_id();
        let channel = Box::new(InMemoryChannel::new(vec![]));
        let transport = InferenceTransport::new(channel, sid, TransportConfig::default(), 0);
        transport.set_permitted_operations(vec!["vector-search".to_string()]).await;

        let err = transport.send_prompt("hi", vec![], |_, _| {}).await.unwrap_err();
        assert!(matches!(err, CoreError::PermissionDenied { .. }));
    }

    #[tokio::test]
    async fn disconnected_transport_rejects_new_sends() {
        let sid = session_id();
        let channel = Box::new(InMemoryChannel::new(vec![]));
        let transport = InferenceTransport::new(channel, sid, TransportConfig::default(), 0);
        transport.mark_disconnected().await;

        let err = transport.send_prompt("hi", vec![], |_, _| {}).await.unwrap_err();
        assert!(matches!(err, CoreError::TransportClosed));
    }

    #[tokio::test]
    async fn queue_and_flush_batched_prompts() {
        let sid = session_id();
        let channel = Box::new(InMemoryChannel::new(vec![]));
        let transport = InferenceTransport::new(channel, sid, TransportConfig::default(), 0);

        transport.queue_batched_prompt("first", vec![]).await;
        transport.queue_batched_prompt("second", vec![]).await;
        transport.flush_batched_prompts().await.unwrap();

        assert!(transport.batch_queue.lock().await.is_empty());
    }
}
