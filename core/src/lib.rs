//! Client-side orchestration core for the infermesh decentralized
//! LLM-inference marketplace.
//!
//! # Architecture
//! - `identity`: deterministic seed-phrase <-> keypair derivation
//! - `wallet`: signing/payment capability seam
//! - `contract`: on-chain job/escrow facade
//! - `discovery`: host discovery (multicast, HTTP registry, optional DHT)
//! - `selector`: host ranking and load balancing
//! - `transport`: duplex websocket inference protocol
//! - `checkpoint`: delta-based payment checkpoint/settlement engine
//! - `rag`: document ingestion, chunking and retrieval-augmented prompting
//! - `storage`: encrypted identity-scoped KV storage and derived stores
//! - `session`: session lifecycle orchestration (`SessionCoordinator`)
//! - `config`: on-disk application configuration
//! - `model`: shared wire/storage data types
//! - `error`: single error taxonomy used throughout the crate

#![deny(unsafe_code)]

pub mod checkpoint;
pub mod config;
pub mod contract;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod model;
pub mod rag;
pub mod selector;
pub mod session;
pub mod storage;
pub mod transport;
pub mod wallet;

pub use config::AppConfig;
pub use error::{CoreError, Result};
pub use identity::{IdentityKeyDerivation, SeedPhrase};
pub use model::{Host, Message, MessageRole, Session, SessionConfig, SessionId, SessionState};
pub use session::{PromptOptions, PromptResult, SessionCoordinator};
