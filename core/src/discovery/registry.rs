//! HTTP registry discovery source (spec.md §6 `GET /api/hosts`).

use async_trait::async_trait;
use serde::Deserialize;

use super::source::{DiscoveryFilter, DiscoverySource};
use crate::error::Result;
use crate::model::{DiscoverySourceKind, Host};

#[derive(Debug, Deserialize)]
struct HostsResponse {
    hosts: Vec<Host>,
}

pub struct HttpRegistrySource {
    base_url: String,
    client: reqwest::Client,
}

impl HttpRegistrySource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl DiscoverySource for HttpRegistrySource {
    fn kind(&self) -> DiscoverySourceKind {
        DiscoverySourceKind::HttpRegistry
    }

    /// Malformed or non-2xx responses produce empty results, not errors
    /// (spec.md §6), so a registry outage degrades gracefully rather than
    /// failing the whole `discoverAll`.
    async fn discover(&self, filter: Option<&DiscoveryFilter>) -> Result<Vec<Host>> {
        let mut request = self.client.get(format!("{}/api/hosts", self.base_url));
        if let Some(filter) = filter {
            if let Some(model) = &filter.model {
                request = request.query(&[("model", model)]);
            }
            if let Some(region) = &filter.region {
                request = request.query(&[("region", region)]);
            }
            if let Some(max_price) = filter.max_price {
                request = request.query(&[("maxPrice", max_price.to_string())]);
            }
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(_) => return Ok(Vec::new()),
        };
        if !response.status().is_success() {
            return Ok(Vec::new());
        }
        match response.json::<HostsResponse>().await {
            Ok(body) => Ok(body.hosts),
            Err(_) => Ok(Vec::new()),
        }
    }
}
