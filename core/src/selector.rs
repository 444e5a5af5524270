//! Ranks and picks among discovered hosts (spec.md §4.7).

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::model::{Host, HostId};

#[derive(Debug, Clone)]
pub struct SelectionRequirements {
    pub model: String,
    pub required_capabilities: Vec<String>,
    pub max_price_per_token: Option<u128>,
    pub max_latency_ms: Option<u64>,
    pub region: Option<String>,
}

/// Selection strategy (spec.md §4.7): `price` and `latency` rank by a
/// single metric only, `capability` filters on model/capabilities then
/// ranks by count of preferred capabilities, and `composite` is the
/// existing weighted min-max-normalized blend.
#[derive(Debug, Clone)]
pub enum RankStrategy {
    /// Minimize `pricePerTokenStable`.
    Price,
    /// Minimize `latencyMs`; hosts with no reported latency sort last.
    /// Ties are broken in favor of `preferred_region`.
    Latency { preferred_region: Option<String> },
    /// Requires `model` and all `required_capabilities`; survivors rank by
    /// how many `preferred_capabilities` they additionally advertise.
    Capability {
        model: String,
        required_capabilities: Vec<String>,
        preferred_capabilities: Vec<String>,
    },
    /// Weighted sum of min-max normalized price/latency/reliability.
    Composite(RankWeights),
}

#[derive(Debug, Clone, Copy)]
pub struct RankWeights {
    pub price: f64,
    pub latency: f64,
    pub reliability: f64,
}

impl Default for RankWeights {
    fn default() -> Self {
        Self {
            price: 0.4,
            latency: 0.3,
            reliability: 0.3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RankedHost {
    pub host: Host,
    pub score: f64,
}

/// Filters hosts by hard requirements, ranks survivors by a weighted,
/// min-max normalized composite score, and load-balances among ties.
pub struct HostSelector {
    weights: RankWeights,
    // Round-robin cursor keyed by the sorted set of candidate host ids, so a
    // changed candidate set resets the cursor rather than reusing a stale
    // index into a differently-shaped list.
    round_robin: Mutex<HashMap<Vec<HostId>, usize>>,
    successes: Mutex<HashMap<HostId, u64>>,
}

impl HostSelector {
    pub fn new(weights: RankWeights) -> Self {
        Self {
            weights,
            round_robin: Mutex::new(HashMap::new()),
            successes: Mutex::new(HashMap::new()),
        }
    }

    pub fn filter_by_requirements(&self, hosts: &[Host], reqs: &SelectionRequirements) -> Vec<Host> {
        hosts
            .iter()
            .filter(|h| h.has_model(&reqs.model))
            .filter(|h| {
                h.has_all_capabilities(reqs.required_capabilities.iter().map(String::as_str))
            })
            .filter(|h| {
                reqs.max_price_per_token
                    .map(|max| h.price_per_token_stable <= max)
                    .unwrap_or(true)
            })
            .filter(|h| {
                // spec.md §4.7: "hosts with missing data for a present
                // constraint fail that constraint" — a host with no
                // reported latency cannot satisfy a maxLatency requirement.
                reqs.max_latency_ms
                    .map(|max| h.latency_ms.map(|l| l <= max).unwrap_or(false))
                    .unwrap_or(true)
            })
            .filter(|h| {
                reqs.region
                    .as_ref()
                    .map(|r| h.region.as_deref() == Some(r.as_str()))
                    .unwrap_or(true)
            })
            .cloned()
            .collect()
    }

    /// Min-max normalizes price (lower is better) and latency (lower is
    /// better) and reliability (higher is better) across the candidate set,
    /// then combines with `weights`. A host missing a metric gets the
    /// neutral midpoint (0.5) for that dimension rather than being excluded.
    /// Equivalent to `rank_by_strategy(hosts, &RankStrategy::Composite(self.weights))`.
    pub fn rank_hosts(&self, hosts: &[Host]) -> Vec<RankedHost> {
        self.rank_by_strategy(hosts, &RankStrategy::Composite(self.weights))
    }

    /// Ranks `hosts` by one of the four named strategies (spec.md §4.7).
    pub fn rank_by_strategy(&self, hosts: &[Host], strategy: &RankStrategy) -> Vec<RankedHost> {
        match strategy {
            RankStrategy::Price => {
                let mut ranked: Vec<RankedHost> = hosts
                    .iter()
                    .map(|h| RankedHost {
                        host: h.clone(),
                        score: -(h.price_per_token_stable as f64),
                    })
                    .collect();
                ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
                ranked
            }

            RankStrategy::Latency { preferred_region } => {
                let mut ranked: Vec<RankedHost> = hosts
                    .iter()
                    .map(|h| RankedHost {
                        host: h.clone(),
                        score: -(h.latency_ms.unwrap_or(u64::MAX) as f64),
                    })
                    .collect();
                ranked.sort_by(|a, b| {
                    b.score
                        .partial_cmp(&a.score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| {
                            let a_preferred = preferred_region
                                .as_deref()
                                .is_some_and(|r| a.host.region.as_deref() == Some(r));
                            let b_preferred = preferred_region
                                .as_deref()
                                .is_some_and(|r| b.host.region.as_deref() == Some(r));
                            b_preferred.cmp(&a_preferred)
                        })
                });
                ranked
            }

            RankStrategy::Capability {
                model,
                required_capabilities,
                preferred_capabilities,
            } => {
                let mut ranked: Vec<RankedHost> = hosts
                    .iter()
                    .filter(|h| h.has_model(model))
                    .filter(|h| h.has_all_capabilities(required_capabilities.iter().map(String::as_str)))
                    .map(|h| {
                        let preferred_count = preferred_capabilities
                            .iter()
                            .filter(|c| h.capabilities.contains(c.as_str()))
                            .count();
                        RankedHost {
                            host: h.clone(),
                            score: preferred_count as f64,
                        }
                    })
                    .collect();
                ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
                ranked
            }

            RankStrategy::Composite(weights) => {
                if hosts.is_empty() {
                    return Vec::new();
                }

                let prices: Vec<f64> = hosts.iter().map(|h| h.price_per_token_stable as f64).collect();
                let latencies: Vec<f64> =
                    hosts.iter().filter_map(|h| h.latency_ms.map(|l| l as f64)).collect();
                let reliabilities: Vec<f64> = hosts.iter().filter_map(|h| h.reliability_score).collect();

                let price_range = min_max(&prices);
                let latency_range = min_max(&latencies);
                let reliability_range = min_max(&reliabilities);

                let mut ranked: Vec<RankedHost> = hosts
                    .iter()
                    .map(|h| {
                        let price_score = 1.0 - normalize(h.price_per_token_stable as f64, price_range);
                        let latency_score = match h.latency_ms {
                            Some(l) => 1.0 - normalize(l as f64, latency_range),
                            None => 0.5,
                        };
                        let reliability_score = match h.reliability_score {
                            Some(r) => normalize(r, reliability_range),
                            None => 0.5,
                        };

                        let score = price_score * weights.price
                            + latency_score * weights.latency
                            + reliability_score * weights.reliability;

                        RankedHost {
                            host: h.clone(),
                            score,
                        }
                    })
                    .collect();

                ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
                ranked
            }
        }
    }

    /// Stateful round-robin over `candidates` (already filtered/ranked).
    /// Cursor resets whenever the candidate id set changes between calls.
    pub fn load_balance(&self, candidates: &[Host]) -> Option<Host> {
        if candidates.is_empty() {
            return None;
        }
        let mut ids: Vec<HostId> = candidates.iter().map(|h| h.id.clone()).collect();
        ids.sort();

        let mut cursor = self.round_robin.lock();
        cursor.retain(|key, _| key == &ids);
        let idx = cursor.entry(ids).or_insert(0);
        let chosen = candidates[*idx % candidates.len()].clone();
        *idx = (*idx + 1) % candidates.len();
        Some(chosen)
    }

    pub fn record_success(&self, host_id: HostId) {
        *self.successes.lock().entry(host_id).or_insert(0) += 1;
    }

    pub fn success_count(&self, host_id: &HostId) -> u64 {
        self.successes.lock().get(host_id).copied().unwrap_or(0)
    }
}

fn min_max(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 1.0);
    }
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    (min, max)
}

fn normalize(value: f64, (min, max): (f64, f64)) -> f64 {
    if (max - min).abs() < f64::EPSILON {
        0.5
    } else {
        ((value - min) / (max - min)).clamp(0.0, 1.0)
    }
}
