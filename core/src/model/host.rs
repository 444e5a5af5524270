use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::discovery::DiscoverySourceKind;
use super::ids::HostId;

/// An inference host advertised by one or more discovery sources.
///
/// `id` is stable across sources; when the same `id` is observed from
/// multiple sources the fields are merged field-by-field, newest
/// `observedAt` wins (see `HostDiscovery::merge_observation`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Host {
    pub id: HostId,
    pub url: String,
    pub models: HashSet<String>,
    pub price_per_token_native: u128,
    pub price_per_token_stable: u128,
    pub latency_ms: Option<u64>,
    pub region: Option<String>,
    pub capabilities: HashSet<String>,
    pub reliability_score: Option<f64>,
    pub source: DiscoverySourceKind,
    pub last_seen_at: DateTime<Utc>,
}

impl Host {
    pub fn has_model(&self, model: &str) -> bool {
        self.models.contains(model)
    }

    pub fn has_all_capabilities<'a>(&self, required: impl IntoIterator<Item = &'a str>) -> bool {
        required.into_iter().all(|c| self.capabilities.contains(c))
    }
}
