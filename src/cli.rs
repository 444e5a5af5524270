//! Command-line surface for `infermesh` (SPEC_FULL.md §1: a thin binary
//! that wires `infermesh-core` together for manual/interactive use; no
//! cognition, tools, or TUI live here — those are teacher concerns this
//! crate explicitly drops).

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "infermesh")]
#[command(about = "Client for the infermesh decentralized LLM-inference marketplace")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Deterministic identity <-> storage-seed derivation (spec.md §4.1).
    Identity {
        #[command(subcommand)]
        command: IdentityCommands,
    },
    /// Multi-source host discovery and ranking (spec.md §4.6/§4.7).
    Hosts {
        #[command(subcommand)]
        command: HostsCommands,
    },
    /// Session lifecycle: start, resume, prompt, end, recover (spec.md §4.9).
    Session {
        #[command(subcommand)]
        command: SessionCommands,
    },
}

#[derive(Subcommand)]
pub enum IdentityCommands {
    /// Derive the 15-word storage seed phrase for an (address, chainId).
    Seed {
        #[arg(long)]
        address: String,
        #[arg(long, default_value_t = 84532)]
        chain_id: u64,
    },
    /// Derive the 15-word storage seed phrase for a raw private key (hex).
    SeedFromKey {
        #[arg(long)]
        private_key: String,
    },
}

#[derive(Subcommand)]
pub enum HostsCommands {
    /// Query every enabled discovery source, merge, dedup, and rank.
    Discover {
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        max_price: Option<u128>,
        #[arg(long)]
        region: Option<String>,
        #[arg(long)]
        force_refresh: bool,
    },
}

#[derive(Parser, Clone)]
pub struct SessionConfigArgs {
    #[arg(long)]
    pub host_id: String,
    #[arg(long)]
    pub host_endpoint: String,
    #[arg(long)]
    pub model: String,
    #[arg(long)]
    pub deposit_amount: u128,
    #[arg(long)]
    pub price_per_token: u128,
    #[arg(long, default_value_t = 1000)]
    pub proof_interval: u64,
    #[arg(long, default_value_t = 86400)]
    pub duration: u64,
    #[arg(long, default_value = "native")]
    pub payment_token: String,
    #[arg(long, default_value_t = 84532)]
    pub chain_id: u64,
    #[arg(long, default_value_t = true)]
    pub use_deposit: bool,
    #[arg(long)]
    pub user_address: String,
}

#[derive(Subcommand)]
pub enum SessionCommands {
    /// Fund and open a new session against a host, then drive an
    /// interactive prompt loop until the user ends it.
    Start {
        #[command(flatten)]
        config: SessionConfigArgs,
        #[arg(long)]
        use_rag: bool,
        #[arg(long, default_value_t = 5)]
        top_k: u32,
    },
    /// Resume a previously-persisted session against a (possibly
    /// replacement) host, replaying the stored conversation, then drive
    /// an interactive prompt loop.
    Resume {
        session_id: String,
        #[command(flatten)]
        config: SessionConfigArgs,
        #[arg(long)]
        use_rag: bool,
        #[arg(long, default_value_t = 5)]
        top_k: u32,
    },
    /// Reconstruct `{messages, checkpoints, tokenCount}` from on-chain
    /// checkpoint records and verified proof CIDs.
    Recover {
        session_id: String,
        #[arg(long)]
        user_address: String,
        #[arg(long, default_value_t = 84532)]
        chain_id: u64,
        #[arg(long)]
        price_per_token: u128,
        #[arg(long, default_value_t = 1000)]
        proof_interval: u64,
    },
}
