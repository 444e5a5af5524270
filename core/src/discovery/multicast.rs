//! Local UDP multicast discovery source (spec.md §4.6 "local multicast").

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use super::source::{DiscoveryFilter, DiscoverySource};
use crate::error::Result;
use crate::model::{DiscoverySourceKind, Host};

const DEFAULT_MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(239, 42, 0, 1);
const DEFAULT_MULTICAST_PORT: u16 = 7420;
const BEACON: &[u8] = b"infermesh-discover-v1";

pub struct LocalMulticastSource {
    multicast_addr: Ipv4Addr,
    port: u16,
    listen_window: Duration,
}

impl LocalMulticastSource {
    pub fn new() -> Self {
        Self {
            multicast_addr: DEFAULT_MULTICAST_ADDR,
            port: DEFAULT_MULTICAST_PORT,
            listen_window: Duration::from_millis(500),
        }
    }
}

impl Default for LocalMulticastSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DiscoverySource for LocalMulticastSource {
    fn kind(&self) -> DiscoverySourceKind {
        DiscoverySourceKind::LocalMulticast
    }

    async fn discover(&self, _filter: Option<&DiscoveryFilter>) -> Result<Vec<Host>> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.set_broadcast(true)?;
        socket.join_multicast_v4(self.multicast_addr, Ipv4Addr::UNSPECIFIED)?;

        let target: SocketAddr = (self.multicast_addr, self.port).into();
        socket.send_to(BEACON, target).await?;

        let mut hosts = Vec::new();
        let mut buf = [0u8; 4096];
        let deadline = tokio::time::Instant::now() + self.listen_window;

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, socket.recv_from(&mut buf)).await {
                Ok(Ok((len, _src))) => {
                    if let Ok(host) = serde_json::from_slice::<Host>(&buf[..len]) {
                        hosts.push(host);
                    }
                }
                _ => break,
            }
        }

        Ok(hosts)
    }
}
