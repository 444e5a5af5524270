//! `infermesh` - thin CLI wiring for the infermesh decentralized
//! LLM-inference marketplace client core.
//!
//! Owns process concerns only: arg parsing, config file loading, tracing
//! init, and an interactive stdin loop. All domain logic lives in
//! `infermesh-core`.

mod cli;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use console::Style;
use ed25519_dalek::{SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, BufReader};

use infermesh_core::checkpoint::compute_settlement;
use infermesh_core::config::AppConfig;
use infermesh_core::contract::MockContractFacade;
use infermesh_core::discovery::{
    DiscoveryFilter, HostDiscovery, HttpRegistrySource, LocalMulticastSource,
};
use infermesh_core::identity::IdentityKeyDerivation;
use infermesh_core::model::{HostId, SessionConfig, SessionId};
use infermesh_core::rag::RAGPipeline;
use infermesh_core::selector::{HostSelector, RankWeights, SelectionRequirements};
use infermesh_core::session::{PromptOptions, SessionCoordinator, WsConnector};
use infermesh_core::storage::{ConversationStore, FsStorageFacade, StorageFacade, VectorStore};

use cli::{Cli, Commands, HostsCommands, IdentityCommands, SessionCommands, SessionConfigArgs};

/// Placeholder host-signing-key derivation for this demo CLI: a real
/// client would read the host's announced public key from its discovery
/// record or registry entry (spec.md §6). The core's `Host` type carries
/// no such field, so this is an explicit, clearly-labeled stand-in rather
/// than a silent security downgrade.
fn placeholder_host_verifying_key(host_id: &str) -> VerifyingKey {
    let mut hasher = Sha256::new();
    hasher.update(b"infermesh-demo-host-key-v1");
    hasher.update(host_id.as_bytes());
    let digest: [u8; 32] = hasher.finalize().into();
    SigningKey::from_bytes(&digest).verifying_key()
}

fn build_session_config(args: &SessionConfigArgs) -> SessionConfig {
    SessionConfig {
        deposit_amount: args.deposit_amount,
        price_per_token: args.price_per_token,
        proof_interval: args.proof_interval,
        duration: args.duration,
        payment_token: args.payment_token.clone(),
        chain_id: args.chain_id,
        model: args.model.clone(),
        host_id: HostId::new(args.host_id.clone()),
        host_endpoint: args.host_endpoint.clone(),
        use_deposit: args.use_deposit,
    }
}

/// Builds the full component graph for one identity, mirroring the
/// teacher's `main.rs` "load config, build clients, dispatch" shape.
async fn wire_for_identity(user_address: &str, chain_id: u64) -> Result<(AppConfig, SessionCoordinator)> {
    let config = AppConfig::load_default().await?;

    let identity = IdentityKeyDerivation::new();
    let seed = identity.derive_seed_from_address(user_address, chain_id);
    let storage: Arc<dyn StorageFacade> =
        Arc::new(FsStorageFacade::connect(&seed, &config.storage_root)?);

    let conversations = Arc::new(ConversationStore::new(storage.clone()));
    let vector_store = Arc::new(VectorStore::new(storage.clone()));
    let rag = Arc::new(
        RAGPipeline::new(vector_store.clone())
            .with_chunking(config.rag_chunk_size, config.rag_chunk_overlap),
    );
    let contract = Arc::new(MockContractFacade::new());
    let connector = Arc::new(WsConnector);

    let coordinator = SessionCoordinator::new(
        contract,
        storage,
        conversations,
        vector_store,
        rag,
        connector,
        user_address.to_string(),
    );

    Ok((config, coordinator))
}

async fn build_discovery(config: &AppConfig) -> HostDiscovery {
    let discovery = HostDiscovery::new();
    discovery
        .register_source(Arc::new(HttpRegistrySource::new(
            config.discovery.http_registry_url.clone(),
        )))
        .await;
    if config.discovery.enable_multicast {
        discovery
            .register_source(Arc::new(LocalMulticastSource::new()))
            .await;
    }
    discovery
        .set_cache_ttl(std::time::Duration::from_millis(config.discovery.cache_ttl_ms))
        .await;
    discovery
}

/// Drives turns read from stdin against an already-open session until the
/// user types `/end` or closes stdin, then settles the session.
async fn run_prompt_loop(
    coordinator: &SessionCoordinator,
    session_id: &SessionId,
    use_rag: bool,
    top_k: u32,
) -> Result<()> {
    let cyan = Style::new().cyan();
    let dim = Style::new().dim();

    println!(
        "{}",
        dim.apply_to("type a prompt and press enter; `/end` or ctrl-c closes the session")
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                println!();
                println!("{}", dim.apply_to("interrupted, settling session..."));
                break;
            }
        };
        let Some(line) = line else { break };
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if text == "/end" {
            break;
        }

        let options = PromptOptions {
            use_rag,
            top_k,
            threshold: 0.0,
        };
        match coordinator.send_prompt(session_id, text, options).await {
            Ok(result) => {
                println!("{} {}", cyan.apply_to("assistant:"), result.response);
                println!("{}", dim.apply_to(format!("({} tokens)", result.tokens_used)));
            }
            Err(e) => {
                eprintln!("error: {e}");
            }
        }
    }

    coordinator.end_session(session_id).await?;
    println!("{}", cyan.apply_to("session ended and settled"));
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cyan = Style::new().cyan();
    let green = Style::new().green();

    match cli.command {
        Commands::Identity { command } => match command {
            IdentityCommands::Seed { address, chain_id } => {
                let identity = IdentityKeyDerivation::new();
                let phrase = identity.derive_seed_from_address(&address, chain_id);
                println!(
                    "{} {}",
                    cyan.apply_to("seed phrase:"),
                    green.apply_to(phrase.to_string_space_separated())
                );
            }
            IdentityCommands::SeedFromKey { private_key } => {
                let bytes = hex::decode(private_key.trim_start_matches("0x"))
                    .context("private key must be hex-encoded")?;
                let identity = IdentityKeyDerivation::new();
                let phrase = identity.derive_seed_from_private_key(&bytes)?;
                println!(
                    "{} {}",
                    cyan.apply_to("seed phrase:"),
                    green.apply_to(phrase.to_string_space_separated())
                );
            }
        },

        Commands::Hosts { command } => match command {
            HostsCommands::Discover {
                model,
                max_price,
                region,
                force_refresh,
            } => {
                let config = AppConfig::load_default().await?;
                let discovery = build_discovery(&config).await;
                let filter = DiscoveryFilter {
                    model: model.clone(),
                    max_price,
                    region: region.clone(),
                };
                let hosts = discovery.discover_all(Some(&filter), force_refresh).await?;

                let selector = HostSelector::new(RankWeights::default());
                let requirements = SelectionRequirements {
                    model: model.unwrap_or_default(),
                    required_capabilities: Vec::new(),
                    max_price_per_token: max_price,
                    max_latency_ms: None,
                    region,
                };
                let eligible = if requirements.model.is_empty() {
                    hosts.clone()
                } else {
                    selector.filter_by_requirements(&hosts, &requirements)
                };
                let ranked = selector.rank_hosts(&eligible);

                println!(
                    "{} {} host(s) discovered, {} eligible",
                    cyan.apply_to("discovery:"),
                    hosts.len(),
                    ranked.len()
                );
                for entry in &ranked {
                    println!(
                        "  {} {} score={:.3} price={} latency={:?}",
                        green.apply_to(entry.host.id.as_str()),
                        entry.host.url,
                        entry.score,
                        entry.host.price_per_token_stable,
                        entry.host.latency_ms
                    );
                }

                let stats = discovery.statistics().await;
                println!(
                    "{} cache_hit_rate={:.2} total_selections={}",
                    cyan.apply_to("stats:"),
                    stats.cache_hit_rate,
                    stats.total_selections
                );
            }
        },

        Commands::Session { command } => match command {
            SessionCommands::Start { config, use_rag, top_k } => {
                let (_, coordinator) = wire_for_identity(&config.user_address, config.chain_id).await?;
                let session_config = build_session_config(&config);
                let host_verifying_key = placeholder_host_verifying_key(&config.host_id);

                let session_id = coordinator
                    .start_session(session_config, String::new(), host_verifying_key)
                    .await?;

                println!(
                    "{} {}",
                    cyan.apply_to("session started:"),
                    green.apply_to(session_id.as_str())
                );

                run_prompt_loop(&coordinator, &session_id, use_rag, top_k).await?;
            }

            SessionCommands::Resume {
                session_id,
                config,
                use_rag,
                top_k,
            } => {
                let (_, coordinator) = wire_for_identity(&config.user_address, config.chain_id).await?;
                let session_config = build_session_config(&config);
                let host_verifying_key = placeholder_host_verifying_key(&config.host_id);
                let session_id = SessionId::new(session_id);

                coordinator
                    .resume_session(
                        session_id.clone(),
                        session_config,
                        String::new(),
                        host_verifying_key,
                    )
                    .await?;

                println!("{} {}", cyan.apply_to("session resumed:"), green.apply_to(session_id.as_str()));

                run_prompt_loop(&coordinator, &session_id, use_rag, top_k).await?;
            }

            SessionCommands::Recover {
                session_id,
                user_address,
                chain_id,
                price_per_token,
                proof_interval,
            } => {
                let (_, coordinator) = wire_for_identity(&user_address, chain_id).await?;
                let host_verifying_key = placeholder_host_verifying_key("recovery");

                let recovered = coordinator
                    .recover_from_checkpoints(
                        &SessionId::new(session_id),
                        host_verifying_key,
                        price_per_token,
                        proof_interval,
                    )
                    .await?;

                let settlement = compute_settlement(recovered.token_count, price_per_token);
                println!(
                    "{} {} message(s), {} checkpoint(s), {} cumulative tokens",
                    cyan.apply_to("recovered:"),
                    recovered.messages.len(),
                    recovered.checkpoints.len(),
                    recovered.token_count
                );
                println!(
                    "{} total={} host={} treasury={}",
                    cyan.apply_to("settlement:"),
                    settlement.total_cost,
                    settlement.host_share,
                    settlement.treasury_share
                );
            }
        },
    }

    Ok(())
}
