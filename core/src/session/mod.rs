//! `SessionCoordinator`: session lifecycle state machine orchestration
//! (spec.md §4.9) — create-job → open-transport → run-turns → checkpoint
//! → close-and-settle, plus recovery from persisted checkpoints.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use ed25519_dalek::VerifyingKey;
use tokio::sync::Mutex;
use tracing::info;

use crate::checkpoint::CheckpointEngine;
use crate::contract::ContractFacade;
use crate::error::{CoreError, Result};
use crate::model::{ChunkId, Message, MessageRole, Session, SessionConfig, SessionId, SessionState};
use crate::rag::RAGPipeline;
use crate::storage::{ConversationStore, StorageFacade, VectorStore};
use crate::transport::{HostFrame, InferenceTransport, MessageChannel, TransportConfig, WsMessageChannel};

/// Decouples `SessionCoordinator` from concrete websocket I/O so it can be
/// driven in tests with an in-memory channel, the same reasoning `transport`
/// applies one layer down.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self, host_endpoint: &str) -> Result<Box<dyn MessageChannel>>;
}

pub struct WsConnector;

#[async_trait]
impl TransportConnector for WsConnector {
    async fn connect(&self, host_endpoint: &str) -> Result<Box<dyn MessageChannel>> {
        Ok(Box::new(WsMessageChannel::connect(host_endpoint).await?))
    }
}

/// Everything `SessionCoordinator` owns for one active session.
pub struct SessionHandle {
    pub session: Session,
    pub transport: Arc<InferenceTransport>,
    pub checkpoint: Arc<CheckpointEngine>,
}

#[derive(Debug, Clone)]
pub struct PromptOptions {
    pub use_rag: bool,
    pub top_k: u32,
    pub threshold: f32,
}

impl Default for PromptOptions {
    fn default() -> Self {
        Self {
            use_rag: false,
            top_k: 5,
            threshold: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PromptResult {
    pub response: String,
    pub tokens_used: u64,
}

#[derive(Debug, Clone)]
pub struct RecoveredSession {
    pub messages: Vec<Message>,
    pub checkpoints: Vec<crate::model::CheckpointRecord>,
    pub token_count: u64,
}

/// Orchestrates the full session lifecycle, holding each session under a
/// per-session lock so `send_prompt`/`end_session`/`recover_from_checkpoints`
/// never interleave for the same session (spec.md §5).
pub struct SessionCoordinator {
    contract: Arc<dyn ContractFacade>,
    storage: Arc<dyn StorageFacade>,
    conversations: Arc<ConversationStore>,
    vector_store: Arc<VectorStore>,
    rag: Arc<RAGPipeline>,
    connector: Arc<dyn TransportConnector>,
    user_address: String,
    sessions: Mutex<HashMap<SessionId, Arc<Mutex<SessionHandle>>>>,
}

impl SessionCoordinator {
    pub fn new(
        contract: Arc<dyn ContractFacade>,
        storage: Arc<dyn StorageFacade>,
        conversations: Arc<ConversationStore>,
        vector_store: Arc<VectorStore>,
        rag: Arc<RAGPipeline>,
        connector: Arc<dyn TransportConnector>,
        user_address: String,
    ) -> Self {
        Self {
            contract,
            storage,
            conversations,
            vector_store,
            rag,
            connector,
            user_address,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    async fn register(&self, session_id: SessionId, handle: SessionHandle) -> Arc<Mutex<SessionHandle>> {
        let handle = Arc::new(Mutex::new(handle));
        self.sessions.lock().await.insert(session_id, handle.clone());
        handle
    }

    async fn handle_for(&self, session_id: &SessionId) -> Result<Arc<Mutex<SessionHandle>>> {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| CoreError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    /// `startSession(config) -> SessionHandle`: creates the on-chain job,
    /// opens the transport, and advances the session through
    /// Created → Funded → TransportOpen. The final step to Active happens
    /// in `send_prompt`, once the first prompt/response pair completes
    /// (spec.md §4.9).
    pub async fn start_session(
        &self,
        config: SessionConfig,
        host_bearer_token: String,
        host_verifying_key: VerifyingKey,
    ) -> Result<SessionId> {
        let created = self
            .contract
            .create_session_job(
                &config.host_id,
                &config.payment_token,
                config.deposit_amount,
                config.price_per_token,
                config.duration,
                config.proof_interval,
            )
            .await?;

        let mut session = Session {
            session_id: created.session_id.clone(),
            job_id: created.job_id,
            user_address: self.user_address.clone(),
            host_id: config.host_id.clone(),
            host_endpoint: config.host_endpoint.clone(),
            model: config.model.clone(),
            price_per_token: config.price_per_token,
            deposit_amount: config.deposit_amount,
            proof_interval: config.proof_interval,
            duration: config.duration,
            chain_id: config.chain_id,
            state: SessionState::Created,
            started_at: Utc::now(),
            ended_at: None,
        };
        if !session.advance(SessionState::Funded) {
            return Err(CoreError::UnexpectedState {
                description: "newly created session could not advance to Funded".to_string(),
            });
        }

        let channel = self.connector.connect(&config.host_endpoint).await?;
        let transport = InferenceTransport::open(
            channel,
            session.session_id.clone(),
            config.model.clone(),
            host_bearer_token,
            TransportConfig::default(),
        )
        .await?
        .with_host_id(config.host_id.clone());

        if !session.advance(SessionState::TransportOpen) {
            return Err(CoreError::UnexpectedState {
                description: "session could not advance to TransportOpen".to_string(),
            });
        }

        let checkpoint = CheckpointEngine::new(
            session.session_id.clone(),
            session.price_per_token,
            session.proof_interval,
            self.contract.clone(),
            self.storage.clone(),
            host_verifying_key,
        );

        let session_id = session.session_id.clone();
        info!(session_id = %session_id, host_id = %config.host_id, "session started");
        self.register(
            session_id.clone(),
            SessionHandle {
                session,
                transport: Arc::new(transport),
                checkpoint: Arc::new(checkpoint),
            },
        )
        .await;

        Ok(session_id)
    }

    /// `resumeSession(sessionId) -> SessionHandle`: replays conversation
    /// history to the host (never truncated on the client, spec.md §4.9)
    /// and restores the checkpoint cursor from the max verified cumulative
    /// tokens.
    pub async fn resume_session(
        &self,
        session_id: SessionId,
        config: SessionConfig,
        host_bearer_token: String,
        host_verifying_key: VerifyingKey,
    ) -> Result<()> {
        let messages = self.conversations.load(&session_id).await?;
        let conversation_context: Vec<(MessageRole, String)> =
            messages.iter().map(|m| (m.role, m.content.clone())).collect();

        let channel = self.connector.connect(&config.host_endpoint).await?;
        let transport = InferenceTransport::resume(
            channel,
            session_id.clone(),
            host_bearer_token,
            conversation_context,
            TransportConfig::default(),
        )
        .await?
        .with_host_id(config.host_id.clone());

        let checkpoint = CheckpointEngine::new(
            session_id.clone(),
            config.price_per_token,
            config.proof_interval,
            self.contract.clone(),
            self.storage.clone(),
            host_verifying_key,
        );
        let (_records, max_verified) = checkpoint.load_and_verify_all().await?;
        info!(session_id = %session_id, restored_tokens = max_verified, "session resumed");

        let session = Session {
            session_id: session_id.clone(),
            job_id: String::new(),
            user_address: self.user_address.clone(),
            host_id: config.host_id.clone(),
            host_endpoint: config.host_endpoint.clone(),
            model: config.model.clone(),
            price_per_token: config.price_per_token,
            deposit_amount: config.deposit_amount,
            proof_interval: config.proof_interval,
            duration: config.duration,
            chain_id: config.chain_id,
            state: SessionState::Active,
            started_at: Utc::now(),
            ended_at: None,
        };

        self.register(
            session_id,
            SessionHandle {
                session,
                transport: Arc::new(transport),
                checkpoint: Arc::new(checkpoint),
            },
        )
        .await;
        Ok(())
    }

    /// `sendPrompt(handle, text, {useRAG, topK?, threshold?}) -> {response,
    /// tokensUsed}`. Assembles retrieval context first if requested, then
    /// forwards to the transport and persists both turns.
    pub async fn send_prompt(
        &self,
        session_id: &SessionId,
        text: &str,
        options: PromptOptions,
    ) -> Result<PromptResult> {
        let handle = self.handle_for(session_id).await?;
        let mut guard = handle.lock().await;

        if !matches!(
            guard.session.state,
            SessionState::TransportOpen | SessionState::Active
        ) {
            return Err(CoreError::SessionAlreadyClosed {
                session_id: session_id.to_string(),
            });
        }

        let (prompt_text, context_chunks) = if options.use_rag {
            let hits = self
                .rag
                .query(&guard.transport, text, options.top_k, options.threshold)
                .await?;
            let chunk_ids: Vec<ChunkId> = hits.iter().map(|h| h.chunk_id.clone()).collect();
            (RAGPipeline::splice_context(text, &hits), chunk_ids)
        } else {
            (text.to_string(), Vec::new())
        };

        let outcome = guard
            .transport
            .send_prompt(&prompt_text, context_chunks, |_, _| {})
            .await?;
        let tokens_used = outcome.tokens_used.unwrap_or(0);

        // spec.md §4.9: TransportOpen -> Active on the first prompt/response
        // pair completing, not on transport open alone.
        if guard.session.state == SessionState::TransportOpen {
            guard.session.advance(SessionState::Active);
        }

        let now_ms = Utc::now().timestamp_millis();
        self.conversations
            .append(
                session_id,
                Message {
                    id: uuid::Uuid::new_v4().to_string(),
                    session_id: session_id.clone(),
                    role: MessageRole::User,
                    content: text.to_string(),
                    timestamp_ms: now_ms,
                    message_index: 0,
                    tokens: None,
                    web_search_meta: None,
                },
            )
            .await?;
        self.conversations
            .append(
                session_id,
                Message {
                    id: uuid::Uuid::new_v4().to_string(),
                    session_id: session_id.clone(),
                    role: MessageRole::Assistant,
                    content: outcome.content.clone(),
                    timestamp_ms: now_ms,
                    message_index: 0,
                    tokens: Some(tokens_used),
                    web_search_meta: None,
                },
            )
            .await?;

        guard.checkpoint.observe_tokens(tokens_used).await;
        if let Some(notice) = guard.transport.next_checkpoint_notice().await? {
            guard.checkpoint.handle_notice(notice).await?;
        }

        Ok(PromptResult {
            response: outcome.content,
            tokens_used,
        })
    }

    /// `endSession(handle)`: forces a final checkpoint, settles on-chain,
    /// discards session-scoped vector chunks, and closes the transport.
    pub async fn end_session(&self, session_id: &SessionId) -> Result<()> {
        let handle = self.handle_for(session_id).await?;
        let mut guard = handle.lock().await;

        let total_tokens = guard.checkpoint.cumulative_observed().await;
        guard.transport.end_session(total_tokens).await?;

        if !guard.session.advance(SessionState::ClosingPendingHost) {
            return Err(CoreError::UnexpectedState {
                description: "session could not advance to ClosingPendingHost".to_string(),
            });
        }

        let notice = guard.transport.next_checkpoint_notice().await?.ok_or_else(|| {
            CoreError::UnexpectedState {
                description: "host closed the transport without a final checkpoint notice"
                    .to_string(),
            }
        })?;
        let HostFrame::CheckpointNotice {
            cumulative_tokens,
            proof_hash,
            proof_cid,
            host_signature,
            onchain_signature,
            ..
        } = notice
        else {
            return Err(CoreError::UnexpectedState {
                description: "expected a checkpoint notice frame at session end".to_string(),
            });
        };
        guard
            .checkpoint
            .finalize(
                cumulative_tokens,
                proof_hash,
                proof_cid,
                host_signature,
                onchain_signature,
            )
            .await?;

        self.vector_store.discard_session(session_id).await?;

        if !guard.session.advance(SessionState::Settled) {
            return Err(CoreError::UnexpectedState {
                description: "session could not advance to Settled".to_string(),
            });
        }

        self.sessions.lock().await.remove(session_id);
        info!(session_id = %session_id, total_tokens, "session ended");
        Ok(())
    }

    /// `recoverFromCheckpoints(sessionId) -> {messages, checkpoints,
    /// tokenCount}`. Does not require an active in-memory handle: it reads
    /// straight from persisted storage and on-chain state, the path used
    /// after a host crash.
    pub async fn recover_from_checkpoints(
        &self,
        session_id: &SessionId,
        host_verifying_key: VerifyingKey,
        price_per_token: u128,
        proof_interval: u64,
    ) -> Result<RecoveredSession> {
        let messages = self.conversations.load(session_id).await?;
        let checkpoint = CheckpointEngine::new(
            session_id.clone(),
            price_per_token,
            proof_interval,
            self.contract.clone(),
            self.storage.clone(),
            host_verifying_key,
        );
        let (checkpoints, token_count) = checkpoint.load_and_verify_all().await?;
        Ok(RecoveredSession {
            messages,
            checkpoints,
            token_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::MockContractFacade;
    use crate::identity::IdentityKeyDerivation;
    use crate::model::HostId;
    use crate::storage::FsStorageFacade;
    use crate::transport::{ClientFrame, HostFrame};
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;
    use std::collections::VecDeque;
    use tokio::sync::Mutex as TokioMutex;

    struct ScriptedChannel {
        to_host: TokioMutex<Vec<ClientFrame>>,
        from_host: TokioMutex<VecDeque<HostFrame>>,
    }

    impl ScriptedChannel {
        fn new(scripted: Vec<HostFrame>) -> Self {
            Self {
                to_host: TokioMutex::new(Vec::new()),
                from_host: TokioMutex::new(scripted.into()),
            }
        }
    }

    #[async_trait]
    impl MessageChannel for ScriptedChannel {
        async fn send_frame(&self, frame: ClientFrame) -> Result<()> {
            self.to_host.lock().await.push(frame);
            Ok(())
        }

        async fn recv_frame(&self) -> Result<Option<HostFrame>> {
            Ok(self.from_host.lock().await.pop_front())
        }
    }

    struct ScriptedConnector {
        host_id: HostId,
        /// Frames replayed after the session-open `SessionAck`, e.g. a
        /// `Response` to the first prompt.
        follow_up: Vec<HostFrame>,
    }

    #[async_trait]
    impl TransportConnector for ScriptedConnector {
        async fn connect(&self, _host_endpoint: &str) -> Result<Box<dyn MessageChannel>> {
            let mut frames = vec![HostFrame::SessionAck {
                session_id: SessionId::new("placeholder"),
                host_id: self.host_id.clone(),
            }];
            frames.extend(self.follow_up.clone());
            Ok(Box::new(ScriptedChannel::new(frames)))
        }
    }

    async fn coordinator() -> (SessionCoordinator, tempfile::TempDir) {
        coordinator_with_follow_up(Vec::new()).await
    }

    async fn coordinator_with_follow_up(follow_up: Vec<HostFrame>) -> (SessionCoordinator, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let derivation = IdentityKeyDerivation::new();
        let seed = derivation.derive_seed_from_address("0xAAAA", 84532);
        let storage: Arc<dyn crate::storage::StorageFacade> =
            Arc::new(FsStorageFacade::connect(&seed, tmp.path()).unwrap());
        let conversations = Arc::new(ConversationStore::new(storage.clone()));
        let vector_store = Arc::new(VectorStore::new(storage.clone()));
        let rag = Arc::new(RAGPipeline::new(vector_store.clone()));
        let contract: Arc<dyn ContractFacade> = Arc::new(MockContractFacade::new());
        let connector: Arc<dyn TransportConnector> = Arc::new(ScriptedConnector {
            host_id: HostId::new("h1"),
            follow_up,
        });

        (
            SessionCoordinator::new(
                contract,
                storage,
                conversations,
                vector_store,
                rag,
                connector,
                "0xUSER".to_string(),
            ),
            tmp,
        )
    }

    fn config() -> SessionConfig {
        SessionConfig {
            deposit_amount: 500_000,
            price_per_token: 2000,
            proof_interval: 1000,
            duration: 86400,
            payment_token: "USDC".to_string(),
            chain_id: 84532,
            model: "llama-3-70b".to_string(),
            host_id: HostId::new("h1"),
            host_endpoint: "wss://host.example/ws".to_string(),
            use_deposit: true,
        }
    }

    /// spec.md §4.9: `TransportOpen -> Active` happens on the first
    /// prompt/response pair completing, not merely on transport open.
    #[tokio::test]
    async fn start_session_stays_transport_open_until_first_prompt_completes() {
        let (coordinator, _tmp) = coordinator().await;
        let host_key = SigningKey::generate(&mut OsRng);
        let session_id = coordinator
            .start_session(config(), "tok".to_string(), host_key.verifying_key())
            .await
            .unwrap();

        let handle = coordinator.handle_for(&session_id).await.unwrap();
        let guard = handle.lock().await;
        assert_eq!(guard.session.state, SessionState::TransportOpen);
    }

    #[tokio::test]
    async fn send_prompt_advances_session_to_active_on_first_response() {
        let (coordinator, _tmp) = coordinator_with_follow_up(vec![HostFrame::Response {
            session_id: SessionId::new("placeholder"),
            message_index: 0,
            delta: "hello".to_string(),
            done: true,
            tokens_used: Some(12),
            signature: None,
            timestamp_ms: None,
        }])
        .await;
        let host_key = SigningKey::generate(&mut OsRng);
        let session_id = coordinator
            .start_session(config(), "tok".to_string(), host_key.verifying_key())
            .await
            .unwrap();

        {
            let handle = coordinator.handle_for(&session_id).await.unwrap();
            let guard = handle.lock().await;
            assert_eq!(guard.session.state, SessionState::TransportOpen);
        }

        coordinator
            .send_prompt(&session_id, "hi", PromptOptions::default())
            .await
            .unwrap();

        let handle = coordinator.handle_for(&session_id).await.unwrap();
        let guard = handle.lock().await;
        assert_eq!(guard.session.state, SessionState::Active);
    }

    #[tokio::test]
    async fn ending_an_unknown_session_reports_not_found() {
        let (coordinator, _tmp) = coordinator().await;
        let err = coordinator
            .end_session(&SessionId::new("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::SessionNotFound { .. }));
    }

    /// A host double that answers in-character rather than from a fixed
    /// script: it doesn't know the session id `start_session` will mint
    /// until it sees the first frame, so replies are assembled on receipt.
    struct ReactiveHostChannel {
        host_id: HostId,
        host_key: Arc<SigningKey>,
        storage: Arc<dyn crate::storage::StorageFacade>,
        outbox: TokioMutex<VecDeque<HostFrame>>,
    }

    impl ReactiveHostChannel {
        fn sign_checkpoint(&self, session_id: &SessionId, cumulative_tokens: u64, proof_hash: &[u8; 32]) -> [u8; 64] {
            let mut payload = Vec::with_capacity(session_id.as_str().len() + 8 + 32);
            payload.extend_from_slice(session_id.as_str().as_bytes());
            payload.extend_from_slice(&cumulative_tokens.to_be_bytes());
            payload.extend_from_slice(proof_hash);
            self.host_key.sign(&payload).to_bytes()
        }
    }

    #[async_trait]
    impl MessageChannel for ReactiveHostChannel {
        async fn send_frame(&self, frame: ClientFrame) -> Result<()> {
            match frame {
                ClientFrame::SessionInit { session_id, .. } | ClientFrame::SessionResume { session_id, .. } => {
                    self.outbox.lock().await.push_back(HostFrame::SessionAck {
                        session_id,
                        host_id: self.host_id.clone(),
                    });
                }
                ClientFrame::SessionEnd { session_id, total_tokens } => {
                    let proof_bytes = format!("final-proof-{session_id}").into_bytes();
                    let proof_hash = *blake3::hash(&proof_bytes).as_bytes();
                    let proof_cid = format!("proofs/{session_id}/final");
                    self.storage.put(&proof_cid, &proof_bytes).await?;
                    let host_signature = self.sign_checkpoint(&session_id, total_tokens, &proof_hash);
                    self.outbox.lock().await.push_back(HostFrame::CheckpointNotice {
                        session_id,
                        cumulative_tokens: total_tokens,
                        delta_tokens: total_tokens,
                        proof_hash,
                        proof_cid,
                        host_signature,
                        onchain_signature: [0u8; 65],
                    });
                }
                _ => {}
            }
            Ok(())
        }

        async fn recv_frame(&self) -> Result<Option<HostFrame>> {
            Ok(self.outbox.lock().await.pop_front())
        }
    }

    struct ReactiveConnector {
        host_id: HostId,
        host_key: Arc<SigningKey>,
        storage: Arc<dyn crate::storage::StorageFacade>,
    }

    #[async_trait]
    impl TransportConnector for ReactiveConnector {
        async fn connect(&self, _host_endpoint: &str) -> Result<Box<dyn MessageChannel>> {
            Ok(Box::new(ReactiveHostChannel {
                host_id: self.host_id.clone(),
                host_key: self.host_key.clone(),
                storage: self.storage.clone(),
                outbox: TokioMutex::new(VecDeque::new()),
            }))
        }
    }

    #[tokio::test]
    async fn end_session_forces_final_checkpoint_and_settles() {
        let host_key = Arc::new(SigningKey::generate(&mut OsRng));
        let tmp = tempfile::tempdir().unwrap();
        let derivation = IdentityKeyDerivation::new();
        let seed = derivation.derive_seed_from_address("0xBEEF", 84532);
        let storage: Arc<dyn crate::storage::StorageFacade> =
            Arc::new(FsStorageFacade::connect(&seed, tmp.path()).unwrap());
        let conversations = Arc::new(ConversationStore::new(storage.clone()));
        let vector_store = Arc::new(VectorStore::new(storage.clone()));
        let rag = Arc::new(RAGPipeline::new(vector_store.clone()));
        let contract: Arc<dyn ContractFacade> = Arc::new(MockContractFacade::new());
        let connector: Arc<dyn TransportConnector> = Arc::new(ReactiveConnector {
            host_id: HostId::new("h1"),
            host_key: host_key.clone(),
            storage: storage.clone(),
        });

        let coordinator = SessionCoordinator::new(
            contract,
            storage.clone(),
            conversations,
            vector_store,
            rag,
            connector,
            "0xUSER".to_string(),
        );

        let session_id = coordinator
            .start_session(config(), "tok".to_string(), host_key.verifying_key())
            .await
            .unwrap();

        coordinator.end_session(&session_id).await.unwrap();

        // the session handle is gone and no turns were ever observed, so
        // the final checkpoint must have been padded up to the minimum.
        assert!(coordinator.handle_for(&session_id).await.is_err());

        let paths = storage
            .list(&format!("checkpoints/{session_id}"))
            .await
            .unwrap();
        assert_eq!(paths.len(), 1);

        let bytes = storage.get(&paths[0]).await.unwrap().unwrap();
        let record: crate::model::CheckpointRecord = serde_json::from_slice(&bytes).unwrap();
        assert!(record.padded);
        assert_eq!(record.cumulative_tokens, crate::checkpoint::MIN_CHECKPOINT_TOKENS);
    }
}
