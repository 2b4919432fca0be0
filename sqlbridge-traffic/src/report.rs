//! Exception collection for replay jobs.
//!
//! Workers push [`Exception`]s into a bounded channel; a [`Report`] consumer
//! drains it. When the channel is full the newest exception is dropped and
//! counted, so a broken backend cannot stall replay.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{info, warn};

use sqlbridge_wire::CommandType;

/// Pending exceptions shared across all connections of one replay.
pub const MAX_PENDING_EXCEPTIONS: usize = 1024;

const DROPPED_EXCEPTIONS_COUNTER: &str = "sqlbridge_replay_dropped_exceptions";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExceptionKind {
    ProtocolMismatch,
    ResultMismatch,
    TransportError,
    Timeout,
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExceptionKind::ProtocolMismatch => "protocol-mismatch",
            ExceptionKind::ResultMismatch => "result-mismatch",
            ExceptionKind::TransportError => "transport-error",
            ExceptionKind::Timeout => "timeout",
        })
    }
}

#[derive(Clone, Debug)]
pub struct Exception {
    pub conn_id: u64,
    pub cmd: CommandType,
    pub kind: ExceptionKind,
    pub message: String,
}

/// Sender half used by workers; overflow drops the new exception and bumps
/// an observable counter instead of blocking.
#[derive(Clone)]
pub struct ExceptionSender {
    tx: mpsc::Sender<Exception>,
    dropped: Arc<AtomicU64>,
}

impl ExceptionSender {
    pub fn channel() -> (ExceptionSender, mpsc::Receiver<Exception>) {
        let (tx, rx) = mpsc::channel(MAX_PENDING_EXCEPTIONS);
        (
            ExceptionSender {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    pub fn push(&self, exception: Exception) {
        if self.tx.try_send(exception).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            counter!(DROPPED_EXCEPTIONS_COUNTER, 1);
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Consumes a replay's exception stream.
#[async_trait]
pub trait Report: Send {
    async fn run(&mut self, rx: mpsc::Receiver<Exception>);
}

/// Aggregates exceptions per kind and logs a digest periodically and a
/// summary once the stream ends.
pub struct LogReport {
    flush_interval: Duration,
}

impl Default for LogReport {
    fn default() -> Self {
        LogReport {
            flush_interval: Duration::from_secs(10),
        }
    }
}

#[async_trait]
impl Report for LogReport {
    async fn run(&mut self, mut rx: mpsc::Receiver<Exception>) {
        let mut totals: HashMap<ExceptionKind, u64> = HashMap::new();
        let mut window: HashMap<ExceptionKind, u64> = HashMap::new();
        let mut sample: Option<Exception> = None;
        let mut tick = tokio::time::interval(self.flush_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                e = rx.recv() => match e {
                    Some(e) => {
                        *totals.entry(e.kind).or_default() += 1;
                        *window.entry(e.kind).or_default() += 1;
                        sample.get_or_insert(e);
                    }
                    None => break,
                },
                _ = tick.tick() => {
                    if !window.is_empty() {
                        let counts = fmt_counts(&window);
                        if let Some(s) = &sample {
                            warn!(
                                counts = %counts,
                                conn_id = s.conn_id,
                                cmd = %s.cmd,
                                sample = %s.message,
                                "replay exceptions",
                            );
                        }
                        window.clear();
                        sample = None;
                    }
                }
            }
        }
        if totals.is_empty() {
            info!("replay finished without exceptions");
        } else {
            info!(counts = %fmt_counts(&totals), "replay exception summary");
        }
    }
}

fn fmt_counts(counts: &HashMap<ExceptionKind, u64>) -> String {
    let mut entries: Vec<_> = counts.iter().collect();
    entries.sort_by_key(|(k, _)| k.to_string());
    entries
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_drops_new_and_counts() {
        let (tx, _rx) = ExceptionSender::channel();
        for i in 0..(MAX_PENDING_EXCEPTIONS as u64 + 10) {
            tx.push(Exception {
                conn_id: i,
                cmd: CommandType::Query,
                kind: ExceptionKind::TransportError,
                message: "boom".to_owned(),
            });
        }
        assert_eq!(tx.dropped(), 10);
    }

    #[tokio::test]
    async fn log_report_drains_until_close() {
        let (tx, rx) = ExceptionSender::channel();
        tx.push(Exception {
            conn_id: 1,
            cmd: CommandType::Query,
            kind: ExceptionKind::ResultMismatch,
            message: "row count differs".to_owned(),
        });
        let handle = tokio::spawn(async move {
            LogReport::default().run(rx).await;
        });
        drop(tx);
        handle.await.unwrap();
    }
}
