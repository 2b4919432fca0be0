//! Ticker-driven facade over the backend reader.
//!
//! Owns the reader, runs its tick on `metrics_interval`, and collapses
//! repeated failures into one log line per state transition so a flapping
//! peer cannot storm the logs.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use sqlbridge_util::shutdown::{self, ShutdownReceiver, ShutdownSender};

use crate::config::ReaderConfig;
use crate::reader::{BackendReader, ConfigProvider};
use crate::rule::{QueryResult, QueryRule};
use crate::topology::TopologyFetcher;
use crate::Result;

#[derive(Clone, Copy, PartialEq, Eq)]
enum LastOutcome {
    None,
    Ok,
    Fail,
}

pub struct MetricsReader {
    reader: Arc<BackendReader>,
    interval: std::time::Duration,
    shutdown: Option<ShutdownSender>,
    task: Option<JoinHandle<()>>,
}

impl MetricsReader {
    pub fn new(
        cfg: ReaderConfig,
        etcd: etcd_client::Client,
        topology: Arc<dyn TopologyFetcher>,
        config: Arc<dyn ConfigProvider>,
    ) -> Self {
        let interval = cfg.metrics_interval;
        MetricsReader {
            reader: Arc::new(BackendReader::new(cfg, etcd, topology, config)),
            interval,
            shutdown: None,
            task: None,
        }
    }

    /// Starts the election and the periodic tick.
    pub async fn start(&mut self) -> Result<()> {
        self.reader.start().await?;
        let (tx, rx) = shutdown::channel();
        let reader = Arc::clone(&self.reader);
        let interval = self.interval;
        self.task = Some(tokio::spawn(run_ticks(reader, interval, rx)));
        self.shutdown = Some(tx);
        Ok(())
    }

    pub fn reader(&self) -> &Arc<BackendReader> {
        &self.reader
    }

    pub fn add_query_rule(&self, key: impl Into<String>, rule: QueryRule) {
        self.reader.add_query_rule(key, rule);
    }

    pub fn remove_query_rule(&self, key: &str) {
        self.reader.remove_query_rule(key);
    }

    pub fn get_query_result(&self, key: &str) -> QueryResult {
        self.reader.get_query_result(key)
    }

    /// The payload for the owner-metrics HTTP endpoint.
    pub fn marshalled_history(&self) -> Vec<u8> {
        self.reader.marshalled_history()
    }

    pub fn is_owner(&self) -> bool {
        self.reader.is_owner()
    }

    pub async fn close(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            tx.shutdown().await;
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.reader.close().await;
    }
}

async fn run_ticks(
    reader: Arc<BackendReader>,
    interval: std::time::Duration,
    mut shutdown: ShutdownReceiver,
) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last = LastOutcome::None;
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = tick.tick() => {}
        }
        match reader.read_metrics().await {
            Ok(()) => {
                if last != LastOutcome::Ok {
                    last = LastOutcome::Ok;
                    debug!("reading backend metrics succeeded");
                }
            }
            Err(e) => {
                // Log once per failure streak, not once per tick.
                if last != LastOutcome::Fail {
                    last = LastOutcome::Fail;
                    warn!(%e, "reading backend metrics failed");
                }
            }
        }
    }
}
