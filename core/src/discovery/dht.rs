//! Global DHT discovery source, feature-gated behind `dht-discovery` since
//! a full Kademlia swarm is heavy for a client library's default build
//! (spec.md §4.6 "a global DHT"; dependency grounded on the sibling host
//! node's `libp2p` stack).

#![cfg(feature = "dht-discovery")]

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use libp2p::kad::{self, store::MemoryStore, Behaviour as KadBehaviour, RecordKey};
use libp2p::{identity, noise, tcp, yamux, Multiaddr, PeerId, SwarmBuilder};
use tokio::sync::Mutex;

use super::source::{DiscoveryFilter, DiscoverySource};
use crate::error::{CoreError, Result};
use crate::model::{DiscoverySourceKind, Host};

const HOST_INDEX_KEY: &[u8] = b"infermesh-host-index";

pub struct DhtSource {
    bootstrap_peers: Vec<Multiaddr>,
    query_timeout: Duration,
    // Swarm construction is expensive; serialize discover() calls against a
    // single lazily-built swarm rather than rebuilding one per call.
    swarm: Mutex<Option<libp2p::Swarm<KadBehaviour<MemoryStore>>>>,
}

impl DhtSource {
    pub fn new(bootstrap_peers: Vec<Multiaddr>) -> Self {
        Self {
            bootstrap_peers,
            query_timeout: Duration::from_secs(5),
            swarm: Mutex::new(None),
        }
    }

    async fn ensure_swarm(&self) -> Result<()> {
        let mut guard = self.swarm.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let keypair = identity::Keypair::generate_ed25519();
        let local_peer_id = PeerId::from(keypair.public());
        let store = MemoryStore::new(local_peer_id);
        let behaviour = KadBehaviour::new(local_peer_id, store);

        let mut swarm = SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| CoreError::Internal {
                message: format!("failed to configure dht transport: {e}"),
            })?
            .with_behaviour(|_| behaviour)
            .map_err(|e| CoreError::Internal {
                message: format!("failed to attach kademlia behaviour: {e}"),
            })?
            .build();

        for addr in &self.bootstrap_peers {
            let _ = swarm.dial(addr.clone());
        }

        *guard = Some(swarm);
        Ok(())
    }
}

#[async_trait]
impl DiscoverySource for DhtSource {
    fn kind(&self) -> DiscoverySourceKind {
        DiscoverySourceKind::Dht
    }

    /// Looks up the well-known `infermesh-host-index` record, which hosts
    /// periodically republish with their own `Host` metadata. This module
    /// is intentionally thin: the DHT's record-propagation and republish
    /// cadence live on the host side, out of scope for this core.
    async fn discover(&self, _filter: Option<&DiscoveryFilter>) -> Result<Vec<Host>> {
        self.ensure_swarm().await?;
        let mut guard = self.swarm.lock().await;
        let swarm = guard.as_mut().expect("ensure_swarm populates this");

        let key = RecordKey::new(&HOST_INDEX_KEY);
        swarm.behaviour_mut().get_record(key);

        let deadline = tokio::time::Instant::now() + self.query_timeout;
        let mut hosts = Vec::new();

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, swarm.select_next_some()).await {
                Ok(libp2p::swarm::SwarmEvent::Behaviour(kad::Event::OutboundQueryProgressed {
                    result: kad::QueryResult::GetRecord(Ok(kad::GetRecordOk::FoundRecord(found))),
                    ..
                })) => {
                    if let Ok(parsed) = serde_json::from_slice::<Vec<Host>>(&found.record.value) {
                        hosts = parsed;
                    }
                    break;
                }
                Ok(_) => continue,
                Err(_) => break,
            }
        }

        Ok(hosts)
    }
}
