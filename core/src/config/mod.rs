//! On-disk application configuration, loaded from `$HOME/.infermesh/config.toml`
//! (spec.md §1 treats environment/config loading as out of scope for the
//! marketplace core's *business logic*, but the ambient settings that wire
//! components together still need a home — generalized from the teacher's
//! `core/src/config/manager.rs::ConfigManager`).
//!
//! Nothing here is part of a spec.md component; it is the glue a CLI or
//! other embedder uses to construct `SessionCoordinator`, `HostDiscovery`,
//! etc. with sane defaults instead of freeform dynamic config objects
//! (spec.md §9: "dynamic config objects with freeform keys are to be
//! replaced with explicit typed config structs").

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{CoreError, Result};

/// Default confirmation depth `ContractFacade` waits for (spec.md §4.5).
const DEFAULT_CONFIRMATION_DEPTH: u32 = 3;
/// Default `MIN_CHECKPOINT_TOKENS` (spec.md §4.9).
const DEFAULT_MIN_CHECKPOINT_TOKENS: u64 = 100;

/// Discovery-related defaults (spec.md §4.6, §5).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DiscoveryConfig {
    pub http_registry_url: String,
    pub cache_ttl_ms: u64,
    pub per_source_timeout_ms: u64,
    pub enable_multicast: bool,
    pub enable_dht: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            http_registry_url: "https://registry.infermesh.example".to_string(),
            cache_ttl_ms: 30_000,
            per_source_timeout_ms: 5_000,
            enable_multicast: true,
            enable_dht: false,
        }
    }
}

/// Transport-related defaults (spec.md §4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TransportConfig {
    pub open_timeout_ms: u64,
    pub prompt_timeout_ms: u64,
    pub max_retries: u32,
    pub compression_threshold_chars: usize,
    pub batch_window_ms: u64,
    pub replay_window_ms: u64,
    pub token_refresh_before_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            open_timeout_ms: 10_000,
            prompt_timeout_ms: 30_000,
            max_retries: 3,
            compression_threshold_chars: 1_000,
            batch_window_ms: 100,
            replay_window_ms: 60_000,
            token_refresh_before_ms: 30_000,
        }
    }
}

/// On-chain confirmation / checkpoint defaults (spec.md §4.5, §4.9, §4.10).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SettlementConfig {
    pub confirmation_depth: u32,
    pub min_checkpoint_tokens: u64,
    pub contract_call_timeout_ms: u64,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            confirmation_depth: DEFAULT_CONFIRMATION_DEPTH,
            min_checkpoint_tokens: DEFAULT_MIN_CHECKPOINT_TOKENS,
            contract_call_timeout_ms: 60_000,
        }
    }
}

/// Top-level application configuration. Every field is explicit and typed
/// (no freeform maps), matching spec.md §9's redesign flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AppConfig {
    /// Root directory for `FsStorageFacade` identity-scoped trees.
    pub storage_root: PathBuf,
    pub discovery: DiscoveryConfig,
    pub transport: TransportConfig,
    pub settlement: SettlementConfig,
    /// RAG ingestion defaults (spec.md §4.11).
    pub rag_chunk_size: usize,
    pub rag_chunk_overlap: usize,
    pub rag_max_document_bytes: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            storage_root: default_storage_root(),
            discovery: DiscoveryConfig::default(),
            transport: TransportConfig::default(),
            settlement: SettlementConfig::default(),
            rag_chunk_size: 800,
            rag_chunk_overlap: 100,
            rag_max_document_bytes: 5 * 1024 * 1024,
        }
    }
}

fn default_storage_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".infermesh")
        .join("storage")
}

/// Default on-disk config file path: `$HOME/.infermesh/config.toml`.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".infermesh")
        .join("config.toml")
}

impl AppConfig {
    /// Validate cross-field invariants that `serde` alone can't express.
    pub fn validate(&self) -> Result<()> {
        if self.rag_chunk_size == 0 {
            return Err(CoreError::InvalidConfig {
                message: "rag_chunk_size must be greater than 0".to_string(),
            });
        }
        if self.rag_chunk_overlap >= self.rag_chunk_size {
            return Err(CoreError::InvalidConfig {
                message: "rag_chunk_overlap must be smaller than rag_chunk_size".to_string(),
            });
        }
        if self.settlement.min_checkpoint_tokens == 0 {
            return Err(CoreError::InvalidConfig {
                message: "settlement.min_checkpoint_tokens must be greater than 0".to_string(),
            });
        }
        if self.settlement.confirmation_depth == 0 {
            return Err(CoreError::InvalidConfig {
                message: "settlement.confirmation_depth must be greater than 0".to_string(),
            });
        }
        Ok(())
    }

    /// Load config from `path`, writing a default file if none exists yet
    /// (mirrors the teacher's `ConfigManager::new` first-run behavior).
    pub async fn load_or_init(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        if !path.exists() {
            let config = Self::default();
            let toml_string = toml::to_string_pretty(&config).map_err(|e| CoreError::InvalidConfig {
                message: format!("failed to serialize default config: {e}"),
            })?;
            fs::write(path, toml_string).await?;
            return Ok(config);
        }

        let content = fs::read_to_string(path).await?;
        let config: Self = toml::from_str(&content).map_err(|e| CoreError::InvalidConfig {
            message: format!("failed to parse config at {}: {e}", path.display()),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the default `$HOME/.infermesh/config.toml` location.
    pub async fn load_default() -> Result<Self> {
        Self::load_or_init(&default_config_path()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk_size() {
        let mut config = AppConfig::default();
        config.rag_chunk_overlap = config.rag_chunk_size;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn load_or_init_writes_then_reloads_identical_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let first = AppConfig::load_or_init(&path).await.unwrap();
        assert!(path.exists());

        let second = AppConfig::load_or_init(&path).await.unwrap();
        assert_eq!(first.rag_chunk_size, second.rag_chunk_size);
        assert_eq!(first.discovery.http_registry_url, second.discovery.http_registry_url);
    }

    #[tokio::test]
    async fn malformed_config_file_is_a_typed_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "not valid toml {{{").await.unwrap();

        let result = AppConfig::load_or_init(&path).await;
        assert!(matches!(result, Err(CoreError::InvalidConfig { .. })));
    }
}
