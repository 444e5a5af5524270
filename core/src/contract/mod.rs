//! `ContractFacade`: typed operations against the marketplace/registry/
//! proof/treasury contracts (spec.md §4.5). The real contracts are an
//! external collaborator (§1 non-goals); this module defines the seam the
//! rest of the core consumes.

mod mock;

pub use mock::MockContractFacade;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{Host, HostId, SessionId};

#[derive(Debug, Clone)]
pub struct JobStatus {
    pub tokens_used: u64,
    pub state: String,
    pub accumulated: u128,
}

/// Result of a session-creating contract call.
#[derive(Debug, Clone)]
pub struct CreatedJob {
    pub session_id: SessionId,
    pub job_id: String,
    pub tx_hash: String,
}

#[async_trait]
pub trait ContractFacade: Send + Sync {
    /// Number of confirmations every mutating call waits for before it
    /// returns. Default per spec.md §4.5 is 3.
    fn confirmation_depth(&self) -> u64 {
        3
    }

    async fn create_session_job(
        &self,
        host_id: &HostId,
        token: &str,
        deposit: u128,
        price_per_token: u128,
        duration: u64,
        proof_interval: u64,
    ) -> Result<CreatedJob>;

    async fn get_job_status(&self, session_id: &SessionId) -> Result<JobStatus>;

    async fn submit_checkpoint(
        &self,
        session_id: &SessionId,
        delta_tokens: u64,
        proof_hash: [u8; 32],
        signature: [u8; 65],
        proof_cid: &str,
    ) -> Result<String>;

    async fn complete_session(
        &self,
        session_id: &SessionId,
        final_tokens: u64,
        final_proof: [u8; 32],
    ) -> Result<String>;

    async fn host_withdraw(&self, token: &str) -> Result<String>;

    async fn treasury_withdraw(&self, token: &str) -> Result<String>;

    async fn discover_active_hosts_with_models(&self) -> Result<Vec<Host>>;
}
