use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{ContractFacade, CreatedJob, JobStatus};
use crate::error::{CoreError, Result};
use crate::model::{Host, HostId, SessionId};

struct JobRecord {
    job_id: String,
    price_per_token: u128,
    tokens_used: u64,
    state: String,
}

/// In-memory test double for `ContractFacade`. Simulates confirmation
/// depth with a configurable delay so callers that wait on confirmations
/// (SessionCoordinator) are exercised meaningfully in tests.
pub struct MockContractFacade {
    jobs: Mutex<HashMap<SessionId, JobRecord>>,
    confirmation_delay: Duration,
    hosts: Mutex<Vec<Host>>,
    /// Deposits at or above this amount fail as `InsufficientFunds`; `None`
    /// disables the check (tests opt in explicitly).
    insufficient_funds_above: Option<u128>,
}

impl MockContractFacade {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            confirmation_delay: Duration::from_millis(1),
            hosts: Mutex::new(Vec::new()),
            insufficient_funds_above: None,
        }
    }

    pub fn with_confirmation_delay(mut self, delay: Duration) -> Self {
        self.confirmation_delay = delay;
        self
    }

    pub fn with_insufficient_funds_above(mut self, limit: u128) -> Self {
        self.insufficient_funds_above = Some(limit);
        self
    }

    pub fn seed_hosts(&self, hosts: Vec<Host>) {
        *self.hosts.lock() = hosts;
    }

    async fn wait_for_confirmations(&self) {
        tokio::time::sleep(self.confirmation_delay * self.confirmation_depth() as u32).await;
    }
}

impl Default for MockContractFacade {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContractFacade for MockContractFacade {
    async fn create_session_job(
        &self,
        host_id: &HostId,
        _token: &str,
        deposit: u128,
        price_per_token: u128,
        _duration: u64,
        _proof_interval: u64,
    ) -> Result<CreatedJob> {
        if let Some(limit) = self.insufficient_funds_above {
            if deposit >= limit {
                return Err(CoreError::InsufficientFunds {
                    needed: deposit,
                    available: limit.saturating_sub(1),
                });
            }
        }

        self.wait_for_confirmations().await;

        let session_id = SessionId::generate();
        let job_id = format!("job-{}-{}", host_id.as_str(), session_id.as_str());
        self.jobs.lock().insert(
            session_id.clone(),
            JobRecord {
                job_id: job_id.clone(),
                price_per_token,
                tokens_used: 0,
                state: "Funded".to_string(),
            },
        );

        Ok(CreatedJob {
            session_id,
            job_id,
            tx_hash: format!("0xtx{:x}", rand::random::<u64>()),
        })
    }

    async fn get_job_status(&self, session_id: &SessionId) -> Result<JobStatus> {
        let jobs = self.jobs.lock();
        let record = jobs
            .get(session_id)
            .ok_or_else(|| CoreError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        Ok(JobStatus {
            tokens_used: record.tokens_used,
            state: record.state.clone(),
            accumulated: record.tokens_used as u128 * record.price_per_token,
        })
    }

    async fn submit_checkpoint(
        &self,
        session_id: &SessionId,
        delta_tokens: u64,
        _proof_hash: [u8; 32],
        _signature: [u8; 65],
        _proof_cid: &str,
    ) -> Result<String> {
        self.wait_for_confirmations().await;

        let mut jobs = self.jobs.lock();
        let record = jobs
            .get_mut(session_id)
            .ok_or_else(|| CoreError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        record.tokens_used += delta_tokens;
        record.state = "Active".to_string();

        Ok(format!("0xtx{:x}", rand::random::<u64>()))
    }

    async fn complete_session(
        &self,
        session_id: &SessionId,
        final_tokens: u64,
        _final_proof: [u8; 32],
    ) -> Result<String> {
        self.wait_for_confirmations().await;

        let mut jobs = self.jobs.lock();
        let record = jobs
            .get_mut(session_id)
            .ok_or_else(|| CoreError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        record.tokens_used = final_tokens;
        record.state = "Settled".to_string();

        Ok(format!("0xtx{:x}", rand::random::<u64>()))
    }

    async fn host_withdraw(&self, _token: &str) -> Result<String> {
        self.wait_for_confirmations().await;
        Ok(format!("0xtx{:x}", rand::random::<u64>()))
    }

    async fn treasury_withdraw(&self, _token: &str) -> Result<String> {
        self.wait_for_confirmations().await;
        Ok(format!("0xtx{:x}", rand::random::<u64>()))
    }

    async fn discover_active_hosts_with_models(&self) -> Result<Vec<Host>> {
        Ok(self.hosts.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_session_job_then_checkpoint_accumulates_tokens() {
        let facade = MockContractFacade::new();
        let created = facade
            .create_session_job(&HostId::new("h1"), "USDC", 500_000, 2000, 86400, 1000)
            .await
            .unwrap();

        facade
            .submit_checkpoint(&created.session_id, 1600, [0u8; 32], [0u8; 65], "cidX")
            .await
            .unwrap();

        let status = facade.get_job_status(&created.session_id).await.unwrap();
        assert_eq!(status.tokens_used, 1600);
        assert_eq!(status.accumulated, 1600 * 2000);
    }

    #[tokio::test]
    async fn insufficient_funds_is_reported_as_permanent_error() {
        let facade = MockContractFacade::new().with_insufficient_funds_above(1_000);
        let err = facade
            .create_session_job(&HostId::new("h1"), "USDC", 1_000, 2000, 86400, 1000)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InsufficientFunds { .. }));
        assert!(!err.is_retryable());
    }
}
