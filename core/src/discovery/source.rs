use async_trait::async_trait;

use crate::error::Result;
use crate::model::{DiscoverySourceKind, Host};

#[derive(Debug, Clone, Default)]
pub struct DiscoveryFilter {
    pub model: Option<String>,
    pub max_price: Option<u128>,
    pub region: Option<String>,
}

impl DiscoveryFilter {
    pub fn matches(&self, host: &Host) -> bool {
        if let Some(model) = &self.model {
            if !host.has_model(model) {
                return false;
            }
        }
        if let Some(max_price) = self.max_price {
            if host.price_per_token_stable > max_price {
                return false;
            }
        }
        if let Some(region) = &self.region {
            if host.region.as_deref() != Some(region.as_str()) {
                return false;
            }
        }
        true
    }
}

/// One discovery channel: local multicast, a global DHT, or an HTTP
/// registry. A per-source failure never aborts the whole discovery
/// (spec.md §4.6 fallback chain); sources report failure by returning
/// `Err`, which `HostDiscovery` catches and records in statistics.
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    fn kind(&self) -> DiscoverySourceKind;
    async fn discover(&self, filter: Option<&DiscoveryFilter>) -> Result<Vec<Host>>;
}
