//! Multi-source host discovery: merge, dedup, TTL cache, blacklist,
//! reputation (spec.md §4.6).

mod dht;
mod multicast;
mod registry;
mod source;

#[cfg(feature = "dht-discovery")]
pub use dht::DhtSource;
pub use multicast::LocalMulticastSource;
pub use registry::HttpRegistrySource;
pub use source::{DiscoveryFilter, DiscoverySource};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::Result;
use crate::model::{DiscoveryObservation, DiscoverySourceKind, Host, HostId};

const STALE_LATENCY_THRESHOLD: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Default)]
pub struct SourceStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub avg_time_ms: f64,
}

#[derive(Debug, Clone)]
pub struct Statistics {
    pub per_source: HashMap<DiscoverySourceKind, SourceStats>,
    pub cache_hit_rate: f64,
    pub total_selections: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionBucket {
    Excellent,
    Good,
    Fair,
    Poor,
}

#[derive(Debug, Clone, Default)]
struct Reputation {
    successful_requests: u64,
    failed_requests: u64,
    ewma_latency_ms: Option<f64>,
}

impl Reputation {
    fn score(&self) -> f64 {
        let total = self.successful_requests + self.failed_requests;
        if total == 0 {
            return 0.5;
        }
        self.successful_requests as f64 / total as f64
    }

    fn bucket(&self) -> ConnectionBucket {
        let loss = if self.successful_requests + self.failed_requests == 0 {
            0.0
        } else {
            self.failed_requests as f64 / (self.successful_requests + self.failed_requests) as f64
        };
        match self.ewma_latency_ms {
            Some(ms) if ms < 100.0 && loss < 0.01 => ConnectionBucket::Excellent,
            Some(ms) if ms < 300.0 && loss < 0.05 => ConnectionBucket::Good,
            Some(ms) if ms < 800.0 && loss < 0.2 => ConnectionBucket::Fair,
            _ => ConnectionBucket::Poor,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionMetrics {
    pub ewma_latency_ms: Option<f64>,
    pub bucket: ConnectionBucket,
}

struct BlacklistEntry {
    reason: String,
    expires_at: Option<DateTime<Utc>>,
}

struct CacheEntry {
    hosts: Vec<Host>,
    cached_at: DateTime<Utc>,
}

struct RegisteredSource {
    kind: DiscoverySourceKind,
    source: Arc<dyn DiscoverySource>,
    enabled: bool,
}

/// Unifies local multicast, DHT, and HTTP registry sources into a ranked,
/// deduplicated host set, with caching, fallback, and per-source health
/// statistics.
pub struct HostDiscovery {
    sources: Mutex<Vec<RegisteredSource>>,
    cache: Mutex<Option<CacheEntry>>,
    cache_ttl: Mutex<Duration>,
    stats: Mutex<HashMap<DiscoverySourceKind, SourceStats>>,
    cache_hits: Mutex<(u64, u64)>, // (hits, misses)
    blacklist: Mutex<HashMap<HostId, BlacklistEntry>>,
    preferred_peers: Mutex<HashMap<HostId, u32>>,
    reputation: Mutex<HashMap<HostId, Reputation>>,
}

impl HostDiscovery {
    pub fn new() -> Self {
        Self {
            sources: Mutex::new(Vec::new()),
            cache: Mutex::new(None),
            cache_ttl: Mutex::new(Duration::from_secs(60)),
            stats: Mutex::new(HashMap::new()),
            cache_hits: Mutex::new((0, 0)),
            blacklist: Mutex::new(HashMap::new()),
            preferred_peers: Mutex::new(HashMap::new()),
            reputation: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a source; sources are queried in registration order, which
    /// also defines priority for `set_priority`.
    pub async fn register_source(&self, source: Arc<dyn DiscoverySource>) {
        let kind = source.kind();
        self.sources.lock().await.push(RegisteredSource {
            kind,
            source,
            enabled: true,
        });
    }

    pub async fn set_priority(&self, order: &[DiscoverySourceKind]) {
        let mut sources = self.sources.lock().await;
        sources.sort_by_key(|s| order.iter().position(|k| *k == s.kind).unwrap_or(usize::MAX));
    }

    pub async fn enable_source(&self, kind: DiscoverySourceKind, enabled: bool) {
        let mut sources = self.sources.lock().await;
        for s in sources.iter_mut() {
            if s.kind == kind {
                s.enabled = enabled;
            }
        }
    }

    pub async fn set_cache_ttl(&self, ttl: Duration) {
        *self.cache_ttl.lock().await = ttl;
    }

    /// Queries all enabled sources in priority order, merges and dedups
    /// results, applies `filter`, and caches the merged set under TTL.
    pub async fn discover_all(
        &self,
        filter: Option<&DiscoveryFilter>,
        force_refresh: bool,
    ) -> Result<Vec<Host>> {
        if !force_refresh {
            if let Some(cached) = self.try_cache().await {
                self.cache_hits.lock().await.0 += 1;
                return Ok(Self::apply_filter(cached, filter));
            }
        }
        self.cache_hits.lock().await.1 += 1;

        let sources: Vec<_> = self
            .sources
            .lock()
            .await
            .iter()
            .filter(|s| s.enabled)
            .map(|s| (s.kind, s.source.clone()))
            .collect();

        let mut observations = Vec::new();
        for (kind, source) in sources {
            let started = std::time::Instant::now();
            let result = source.discover(filter).await;
            let elapsed_ms = started.elapsed().as_millis() as f64;

            let mut stats = self.stats.lock().await;
            let entry = stats.entry(kind).or_default();
            entry.attempts += 1;

            match result {
                Ok(hosts) => {
                    entry.successes += 1;
                    entry.avg_time_ms =
                        (entry.avg_time_ms * (entry.successes - 1) as f64 + elapsed_ms)
                            / entry.successes as f64;
                    let now = Utc::now();
                    for host in hosts {
                        observations.push(DiscoveryObservation {
                            host_id: host.id.clone(),
                            source: kind,
                            observed_at: now,
                            host,
                        });
                    }
                }
                Err(e) => {
                    entry.failures += 1;
                    warn!(source = ?kind, error = %e, "discovery source failed");
                }
            }
        }

        let merged = self.merge_observations(observations).await;
        let filtered_blacklist = self.drop_blacklisted(merged).await;

        if filtered_blacklist.is_empty() {
            if let Some(cached) = self.cache.lock().await.as_ref() {
                return Ok(Self::apply_filter(cached.hosts.clone(), filter));
            }
            return Ok(Vec::new());
        }

        *self.cache.lock().await = Some(CacheEntry {
            hosts: filtered_blacklist.clone(),
            cached_at: Utc::now(),
        });

        Ok(Self::apply_filter(filtered_blacklist, filter))
    }

    async fn try_cache(&self) -> Option<Vec<Host>> {
        let cache = self.cache.lock().await;
        let ttl = *self.cache_ttl.lock().await;
        match cache.as_ref() {
            Some(entry) if Utc::now().signed_duration_since(entry.cached_at).to_std().unwrap_or(ttl) < ttl => {
                Some(entry.hosts.clone())
            }
            _ => None,
        }
    }

    fn apply_filter(hosts: Vec<Host>, filter: Option<&DiscoveryFilter>) -> Vec<Host> {
        match filter {
            Some(f) => hosts.into_iter().filter(|h| f.matches(h)).collect(),
            None => hosts,
        }
    }

    /// Keyed by `host.id`; field-by-field merge keeps the value with the
    /// newer `observedAt`, priority order (registration order) breaks ties.
    async fn merge_observations(&self, observations: Vec<DiscoveryObservation>) -> Vec<Host> {
        let priority: HashMap<DiscoverySourceKind, usize> = self
            .sources
            .lock()
            .await
            .iter()
            .enumerate()
            .map(|(i, s)| (s.kind, i))
            .collect();

        let mut merged: HashMap<HostId, (Host, DateTime<Utc>, usize)> = HashMap::new();

        for obs in observations {
            let rank = priority.get(&obs.source).copied().unwrap_or(usize::MAX);
            merged
                .entry(obs.host_id.clone())
                .and_modify(|(existing, existing_time, existing_rank)| {
                    let newer = obs.observed_at > *existing_time
                        || (obs.observed_at == *existing_time && rank < *existing_rank);
                    if newer {
                        let mut host = obs.host.clone();
                        if let Some(latency) = existing.latency_ms {
                            let stale = Utc::now()
                                .signed_duration_since(*existing_time)
                                .to_std()
                                .map(|d| d > STALE_LATENCY_THRESHOLD)
                                .unwrap_or(true);
                            if host.latency_ms.is_none() && !stale {
                                host.latency_ms = Some(latency);
                            }
                        }
                        *existing = host;
                        *existing_time = obs.observed_at;
                        *existing_rank = rank;
                    }
                })
                .or_insert((obs.host.clone(), obs.observed_at, rank));
        }

        merged.into_values().map(|(host, _, _)| host).collect()
    }

    async fn drop_blacklisted(&self, hosts: Vec<Host>) -> Vec<Host> {
        let mut blacklist = self.blacklist.lock().await;
        let now = Utc::now();
        blacklist.retain(|_, entry| entry.expires_at.map(|exp| exp > now).unwrap_or(true));
        let blocked: std::collections::HashSet<HostId> = blacklist.keys().cloned().collect();
        hosts.into_iter().filter(|h| !blocked.contains(&h.id)).collect()
    }

    pub async fn ping_host(&self, url: &str) -> i64 {
        let client = reqwest::Client::new();
        let started = std::time::Instant::now();
        match client
            .get(format!("{url}/api/hosts/ping"))
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => started.elapsed().as_millis() as i64,
            _ => -1,
        }
    }

    pub async fn report_host(&self, host_id: &HostId, issue: &str) {
        warn!(host_id = %host_id, issue, "host reported");
    }

    pub async fn blacklist(&self, host_id: HostId, reason: impl Into<String>, ttl: Option<Duration>) {
        let expires_at = ttl.map(|d| Utc::now() + chrono::Duration::from_std(d).unwrap_or_default());
        self.blacklist.lock().await.insert(
            host_id,
            BlacklistEntry {
                reason: reason.into(),
                expires_at,
            },
        );
    }

    pub async fn add_preferred_peer(&self, host_id: HostId, priority: u32) {
        self.preferred_peers.lock().await.insert(host_id, priority);
    }

    pub async fn update_reputation(&self, host_id: HostId, successful: u64, failed: u64) {
        let mut reputation = self.reputation.lock().await;
        let entry = reputation.entry(host_id).or_default();
        entry.successful_requests += successful;
        entry.failed_requests += failed;
    }

    pub async fn reputation_score(&self, host_id: &HostId) -> f64 {
        self.reputation
            .lock()
            .await
            .get(host_id)
            .map(|r| r.score())
            .unwrap_or(0.5)
    }

    pub async fn record_latency_sample(&self, host_id: HostId, latency_ms: f64) {
        let mut reputation = self.reputation.lock().await;
        let entry = reputation.entry(host_id).or_default();
        entry.ewma_latency_ms = Some(match entry.ewma_latency_ms {
            Some(prev) => prev * 0.8 + latency_ms * 0.2,
            None => latency_ms,
        });
    }

    pub async fn connection_metrics(&self, host_id: &HostId) -> ConnectionMetrics {
        let reputation = self.reputation.lock().await;
        match reputation.get(host_id) {
            Some(r) => ConnectionMetrics {
                ewma_latency_ms: r.ewma_latency_ms,
                bucket: r.bucket(),
            },
            None => ConnectionMetrics {
                ewma_latency_ms: None,
                bucket: ConnectionBucket::Poor,
            },
        }
    }

    pub async fn statistics(&self) -> Statistics {
        let (hits, misses) = *self.cache_hits.lock().await;
        let total = hits + misses;
        Statistics {
            per_source: self.stats.lock().await.clone(),
            cache_hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
            total_selections: total,
        }
    }
}

impl Default for HostDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use async_trait::async_trait;
    use std::collections::HashSet;

    fn host(id: &str, kind: DiscoverySourceKind) -> Host {
        Host {
            id: HostId::new(id),
            url: format!("wss://{id}.example/ws"),
            models: HashSet::from(["llama-3-70b".to_string()]),
            price_per_token_native: 1_500,
            price_per_token_stable: 1_500,
            latency_ms: None,
            region: None,
            capabilities: HashSet::new(),
            reliability_score: None,
            source: kind,
            last_seen_at: Utc::now(),
        }
    }

    struct FailingSource;

    #[async_trait]
    impl DiscoverySource for FailingSource {
        fn kind(&self) -> DiscoverySourceKind {
            DiscoverySourceKind::LocalMulticast
        }
        async fn discover(&self, _filter: Option<&DiscoveryFilter>) -> Result<Vec<Host>> {
            Err(CoreError::NetworkTransient {
                message: "local multicast socket unavailable".to_string(),
            })
        }
    }

    struct FixedSource {
        kind: DiscoverySourceKind,
        hosts: Vec<Host>,
    }

    #[async_trait]
    impl DiscoverySource for FixedSource {
        fn kind(&self) -> DiscoverySourceKind {
            self.kind
        }
        async fn discover(&self, _filter: Option<&DiscoveryFilter>) -> Result<Vec<Host>> {
            Ok(self.hosts.clone())
        }
    }

    /// One source fails, a second finds `h1`, a third finds `h1` and `h2`:
    /// the merged result is the union, deduped by host id, and statistics
    /// show exactly one failure for the failing source.
    #[tokio::test]
    async fn discovery_falls_back_across_sources_and_merges() {
        let discovery = HostDiscovery::new();
        discovery.register_source(Arc::new(FailingSource)).await;
        discovery
            .register_source(Arc::new(FixedSource {
                kind: DiscoverySourceKind::Dht,
                hosts: vec![host("h1", DiscoverySourceKind::Dht)],
            }))
            .await;
        discovery
            .register_source(Arc::new(FixedSource {
                kind: DiscoverySourceKind::HttpRegistry,
                hosts: vec![
                    host("h1", DiscoverySourceKind::HttpRegistry),
                    host("h2", DiscoverySourceKind::HttpRegistry),
                ],
            }))
            .await;

        let hosts = discovery.discover_all(None, true).await.unwrap();
        let mut ids: Vec<String> = hosts.iter().map(|h| h.id.as_str().to_string()).collect();
        ids.sort();
        assert_eq!(ids, vec!["h1".to_string(), "h2".to_string()]);

        let stats = discovery.statistics().await;
        let local = &stats.per_source[&DiscoverySourceKind::LocalMulticast];
        assert_eq!(local.attempts, 1);
        assert_eq!(local.failures, 1);
        assert_eq!(local.successes, 0);

        let dht = &stats.per_source[&DiscoverySourceKind::Dht];
        assert_eq!(dht.successes, 1);
        let registry = &stats.per_source[&DiscoverySourceKind::HttpRegistry];
        assert_eq!(registry.successes, 1);
    }

    #[tokio::test]
    async fn blacklisted_hosts_are_excluded_from_results() {
        let discovery = HostDiscovery::new();
        discovery
            .register_source(Arc::new(FixedSource {
                kind: DiscoverySourceKind::HttpRegistry,
                hosts: vec![
                    host("h1", DiscoverySourceKind::HttpRegistry),
                    host("h2", DiscoverySourceKind::HttpRegistry),
                ],
            }))
            .await;
        discovery
            .blacklist(HostId::new("h1"), "timed out repeatedly", None)
            .await;

        let hosts = discovery.discover_all(None, true).await.unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].id.as_str(), "h2");
    }

    #[tokio::test]
    async fn cache_is_served_until_forced_refresh() {
        let discovery = HostDiscovery::new();
        discovery
            .register_source(Arc::new(FixedSource {
                kind: DiscoverySourceKind::HttpRegistry,
                hosts: vec![host("h1", DiscoverySourceKind::HttpRegistry)],
            }))
            .await;

        let _ = discovery.discover_all(None, true).await.unwrap();
        let _ = discovery.discover_all(None, false).await.unwrap();

        let stats = discovery.statistics().await;
        let registry = &stats.per_source[&DiscoverySourceKind::HttpRegistry];
        assert_eq!(registry.attempts, 1, "second call should be served from cache");

        let cache = discovery.statistics().await;
        assert_eq!(cache.cache_hit_rate, 0.5);
    }
}
