use std::collections::HashMap;

use async_trait::async_trait;

/// Label key carrying a backend's availability zone.
pub const ZONE_LABEL: &str = "zone";

/// One backend instance as reported by the topology source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendNode {
    pub ip: String,
    pub status_port: u16,
    pub labels: HashMap<String, String>,
}

impl BackendNode {
    /// The `host:statusPort` address metrics are scraped from; also the
    /// `instance` label value in query results.
    pub fn status_addr(&self) -> String {
        format!("{}:{}", self.ip, self.status_port)
    }

    pub fn zone(&self) -> Option<&str> {
        self.labels.get(ZONE_LABEL).map(String::as_str)
    }
}

/// Supplies the current backend fleet. Implemented by the service-discovery
/// layer of the embedding process.
#[async_trait]
pub trait TopologyFetcher: Send + Sync {
    async fn get_backends(&self) -> Result<Vec<BackendNode>, String>;
}
