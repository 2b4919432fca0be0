//! Cluster-wide backend metrics aggregation.
//!
//! One proxy per availability zone (plus optionally a global one) is
//! elected to scrape the backends' `/metrics` endpoints, derive per-rule
//! time series into bounded histories, and share the marshalled history
//! over HTTP; the other proxies pull from the owners instead of hammering
//! the backends. Every proxy can then answer load-balancing queries from
//! local state.

mod config;
mod history;
mod metrics_reader;
mod reader;
mod rule;
mod topology;

pub use config::ReaderConfig;
pub use history::{purge_history, BackendHistory, HistoryMap};
pub use metrics_reader::MetricsReader;
pub use reader::{BackendReader, ConfigProvider};
pub use rule::{
    InstanceSample, InstanceSeries, MetricFamilies, MetricValue, QueryResult, QueryRule,
    ResultType, SamplePair, INSTANCE_LABEL,
};
pub use topology::{BackendNode, TopologyFetcher, ZONE_LABEL};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("etcd operation failed: {0}")]
    Elect(#[from] sqlbridge_elect::ElectError),
    #[error("scraping {addr} failed: {reason}")]
    Scrape { addr: String, reason: String },
    #[error("reading metrics from owner failed: {0}")]
    ReadFromOwner(String),
    #[error("fetching backend topology failed: {0}")]
    Topology(String),
    #[error("marshalling history failed: {0}")]
    Marshal(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MetricsError>;
