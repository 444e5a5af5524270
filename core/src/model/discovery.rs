use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::host::Host;
use super::ids::HostId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DiscoverySourceKind {
    LocalMulticast,
    Dht,
    HttpRegistry,
    Bootstrap,
}

/// One source's view of a host at a point in time. Cache entries built from
/// these carry a TTL (see `discovery::HostDiscovery`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryObservation {
    pub host_id: HostId,
    pub source: DiscoverySourceKind,
    pub observed_at: DateTime<Utc>,
    pub host: Host,
}
