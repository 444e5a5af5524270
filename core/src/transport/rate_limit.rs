//! Per-host sliding-window rate limiting with circuit breaking, adapted
//! from the single-tier case of a main/worker split rate limiter.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_rpm: u32,
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_rpm: 120,
            burst_size: 10,
        }
    }
}

#[derive(Debug)]
struct CircuitState {
    blocked_until: Option<Instant>,
    consecutive_errors: u32,
    circuit_open: bool,
    circuit_reset_at: Option<Instant>,
}

impl CircuitState {
    fn new() -> Self {
        Self {
            blocked_until: None,
            consecutive_errors: 0,
            circuit_open: false,
            circuit_reset_at: None,
        }
    }

    fn is_open(&mut self) -> bool {
        if self.circuit_open {
            if let Some(reset_at) = self.circuit_reset_at {
                if Instant::now() > reset_at {
                    self.circuit_open = false;
                    self.consecutive_errors = 0;
                    self.circuit_reset_at = None;
                    return false;
                }
            }
            true
        } else {
            false
        }
    }

    fn record_error(&mut self, retry_after: Option<Duration>) {
        self.consecutive_errors += 1;
        let block_duration = retry_after.unwrap_or_else(|| {
            let base = Duration::from_secs(5);
            base * 2u32.pow(self.consecutive_errors.min(5))
        });
        self.blocked_until = Some(Instant::now() + block_duration);
        if self.consecutive_errors >= 5 {
            self.circuit_open = true;
            self.circuit_reset_at = Some(Instant::now() + Duration::from_secs(60));
        }
    }

    fn record_success(&mut self) {
        self.consecutive_errors = 0;
    }

    fn wait_duration(&self) -> Duration {
        let now = Instant::now();
        if let Some(blocked_until) = self.blocked_until {
            if now < blocked_until {
                return blocked_until - now;
            }
        }
        if self.circuit_open {
            if let Some(reset_at) = self.circuit_reset_at {
                if now < reset_at {
                    return reset_at - now;
                }
            }
        }
        Duration::ZERO
    }
}

#[derive(Debug)]
struct HostState {
    request_times: Vec<Instant>,
    circuit: CircuitState,
}

impl HostState {
    fn new() -> Self {
        Self {
            request_times: Vec::new(),
            circuit: CircuitState::new(),
        }
    }

    fn cleanup(&mut self) {
        let cutoff = Instant::now() - Duration::from_secs(60);
        self.request_times.retain(|&t| t > cutoff);
    }
}

/// Tracks request volume and host-reported rate-limit errors per host id,
/// opening a circuit breaker after repeated failures so a flapping host
/// stops being retried immediately.
pub struct RateLimiter {
    config: RateLimitConfig,
    hosts: Mutex<HashMap<String, HostState>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `Some(wait)` if the caller should back off before issuing a
    /// request against `host_id`, or `None` if it may proceed immediately.
    pub fn check(&self, host_id: &str) -> Option<Duration> {
        let mut hosts = self.hosts.lock();
        let state = hosts.entry(host_id.to_string()).or_insert_with(HostState::new);

        let circuit_wait = state.circuit.wait_duration();
        if !circuit_wait.is_zero() {
            return Some(circuit_wait);
        }

        state.cleanup();
        if state.request_times.len() as u32 >= self.config.max_rpm {
            let oldest = state.request_times[0];
            return Some((oldest + Duration::from_secs(60)).saturating_duration_since(Instant::now()));
        }

        None
    }

    pub fn record_request(&self, host_id: &str) {
        let mut hosts = self.hosts.lock();
        let state = hosts.entry(host_id.to_string()).or_insert_with(HostState::new);
        state.circuit.record_success();
        state.request_times.push(Instant::now());
    }

    pub fn record_rate_limited(&self, host_id: &str, retry_after: Option<Duration>) {
        let mut hosts = self.hosts.lock();
        let state = hosts.entry(host_id.to_string()).or_insert_with(HostState::new);
        state.circuit.record_error(retry_after);
    }

    pub fn is_circuit_open(&self, host_id: &str) -> bool {
        let mut hosts = self.hosts.lock();
        hosts
            .entry(host_id.to_string())
            .or_insert_with(HostState::new)
            .circuit
            .is_open()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn within_limit_does_not_block() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_rpm: 5,
            burst_size: 5,
        });
        for _ in 0..5 {
            assert!(limiter.check("host-a").is_none());
            limiter.record_request("host-a");
        }
        assert!(limiter.check("host-a").is_some());
    }

    #[test]
    fn repeated_rate_limit_errors_open_circuit() {
        let limiter = RateLimiter::new(RateLimitConfig::default());
        for _ in 0..5 {
            limiter.record_rate_limited("host-b", Some(Duration::from_millis(1)));
        }
        std::thread::sleep(Duration::from_millis(5));
        assert!(limiter.is_circuit_open("host-b"));
    }
}
