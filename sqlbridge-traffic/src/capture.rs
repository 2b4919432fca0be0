//! The capture controller: a state machine between live proxy traffic and
//! the chunk writer.
//!
//! `Idle → Running → Stopping → Idle`. While `Running`, sessions call
//! [`Capture::capture`] on their command path; the call never blocks and
//! never fails, it only drops when the writer's byte budget is exhausted.
//! During `Stopping` new commands are discarded while the writer flushes.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{info, warn};

use sqlbridge_wire::{CommandRecord, CommandType};

use crate::filter::is_sensitive_sql;
use crate::store::{spawn_writer, EncryptMethod, Meta, WriterConfig, WriterHandle};
use crate::{Result, TrafficError};

/// Payload written in place of a redacted statement, so the meta command
/// count still matches the chunk stream.
const TOMBSTONE_SQL: &[u8] = b"SELECT 1";

#[derive(Clone, Debug)]
pub struct CaptureConfig {
    pub output: PathBuf,
    /// Stop automatically after this long.
    pub duration: Option<Duration>,
    pub compress: bool,
    pub encrypt_method: EncryptMethod,
    /// Key-encryption key, required when `encrypt_method` is not `none`.
    pub encryption_key: Option<Vec<u8>>,
}

impl CaptureConfig {
    pub fn new(output: PathBuf) -> Self {
        CaptureConfig {
            output,
            duration: None,
            compress: true,
            encrypt_method: EncryptMethod::None,
            encryption_key: None,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.output.as_os_str().is_empty() {
            return Err(TrafficError::Config("output is required".to_owned()));
        }
        if self.encrypt_method != EncryptMethod::None && self.encryption_key.is_none() {
            return Err(TrafficError::Config(
                "encryption requested but no key supplied".to_owned(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Stopping,
}

struct CaptureState {
    phase: Phase,
    writer: Option<WriterHandle>,
    output: Option<PathBuf>,
    duration: Option<Duration>,
    started_at: Option<Instant>,
    err: Option<String>,
    succeeded: bool,
    final_meta: Option<Meta>,
}

struct CaptureInner {
    state: Mutex<CaptureState>,
    captured: AtomicU64,
    redacted: AtomicU64,
    dropped: AtomicU64,
}

pub struct Capture {
    inner: Arc<CaptureInner>,
}

impl Default for Capture {
    fn default() -> Self {
        Self::new()
    }
}

impl Capture {
    pub fn new() -> Self {
        Capture {
            inner: Arc::new(CaptureInner {
                state: Mutex::new(CaptureState {
                    phase: Phase::Idle,
                    writer: None,
                    output: None,
                    duration: None,
                    started_at: None,
                    err: None,
                    succeeded: false,
                    final_meta: None,
                }),
                captured: AtomicU64::new(0),
                redacted: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn start(&self, cfg: CaptureConfig) -> Result<()> {
        cfg.validate()?;
        let mut st = self.inner.state.lock().expect("capture state poisoned");
        if st.phase != Phase::Idle {
            return Err(TrafficError::JobRunning("capture".to_owned()));
        }

        let mut writer_cfg = WriterConfig::new(cfg.output.clone());
        writer_cfg.compress = cfg.compress;
        writer_cfg.encrypt = cfg.encrypt_method;
        writer_cfg.encryption_key = cfg.encryption_key.clone();
        let (handle, task) = spawn_writer(writer_cfg)?;

        st.phase = Phase::Running;
        st.writer = Some(handle);
        st.output = Some(cfg.output.clone());
        st.duration = cfg.duration;
        st.started_at = Some(Instant::now());
        st.err = None;
        st.succeeded = false;
        st.final_meta = None;
        drop(st);
        self.inner.captured.store(0, Ordering::Relaxed);
        self.inner.redacted.store(0, Ordering::Relaxed);
        self.inner.dropped.store(0, Ordering::Relaxed);
        info!(output = %cfg.output.display(), duration = ?cfg.duration, "capture started");

        // Watcher: the capture is Idle again once the writer has flushed
        // and finalized meta.
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let outcome = task.await;
            let mut st = inner.state.lock().expect("capture state poisoned");
            match outcome {
                Ok(Ok(meta)) => {
                    if st.err.is_none() {
                        st.succeeded = true;
                    }
                    st.final_meta = Some(meta);
                }
                Ok(Err(e)) => {
                    warn!(%e, "capture writer failed");
                    st.err.get_or_insert_with(|| e.to_string());
                }
                Err(e) => {
                    warn!(%e, "capture writer panicked");
                    st.err.get_or_insert_with(|| e.to_string());
                }
            }
            st.phase = Phase::Idle;
            st.writer = None;
        });

        if let Some(duration) = cfg.duration {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                inner.stop(None);
            });
        }
        Ok(())
    }

    /// Hands one live command to the capture. Never blocks; outside
    /// `Running` the command is discarded.
    pub fn capture(&self, record: CommandRecord) {
        let st = self.inner.state.lock().expect("capture state poisoned");
        if st.phase != Phase::Running {
            return;
        }
        let writer = match &st.writer {
            Some(w) => w,
            None => return,
        };
        let record = self.redact(record);
        if writer.push(record) {
            self.inner.captured.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn redact(&self, record: CommandRecord) -> CommandRecord {
        if !matches!(record.cmd, CommandType::Query | CommandType::StmtPrepare) {
            return record;
        }
        let sensitive = std::str::from_utf8(&record.payload)
            .map(is_sensitive_sql)
            .unwrap_or(false);
        if !sensitive {
            return record;
        }
        self.inner.redacted.fetch_add(1, Ordering::Relaxed);
        CommandRecord {
            conn_id: record.conn_id,
            start_ts: record.start_ts,
            cmd: CommandType::Query,
            payload: Bytes::from_static(TOMBSTONE_SQL),
            db: record.db,
        }
    }

    /// Graceful stop; also used by the duration timer. Idempotent.
    pub fn stop(&self, err: Option<String>) {
        self.inner.stop(err);
    }

    /// `elapsed / duration` while running (1.0 once finished successfully),
    /// plus the first error.
    pub fn progress(&self) -> (f64, Option<String>) {
        let st = self.inner.state.lock().expect("capture state poisoned");
        let progress = match st.phase {
            Phase::Idle => {
                if st.succeeded {
                    1.0
                } else {
                    0.0
                }
            }
            Phase::Running | Phase::Stopping => match (st.started_at, st.duration) {
                (Some(started), Some(duration)) if !duration.is_zero() => {
                    (started.elapsed().as_secs_f64() / duration.as_secs_f64()).clamp(0.0, 0.99)
                }
                _ => 0.0,
            },
        };
        (progress, st.err.clone())
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().expect("capture state poisoned").phase != Phase::Idle
    }

    pub fn output(&self) -> Option<PathBuf> {
        self.inner
            .state
            .lock()
            .expect("capture state poisoned")
            .output
            .clone()
    }

    /// Meta of the last finished capture.
    pub fn final_meta(&self) -> Option<Meta> {
        self.inner
            .state
            .lock()
            .expect("capture state poisoned")
            .final_meta
            .clone()
    }

    pub fn captured_cmds(&self) -> u64 {
        self.inner.captured.load(Ordering::Relaxed)
    }

    pub fn redacted_cmds(&self) -> u64 {
        self.inner.redacted.load(Ordering::Relaxed)
    }

    pub fn dropped_cmds(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Stops and waits until the writer has finalized meta.
    pub async fn close(&self) {
        self.inner.stop(Some(TrafficError::ShuttingDown.to_string()));
        while self.is_running() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl CaptureInner {
    fn stop(&self, err: Option<String>) {
        let mut st = self.state.lock().expect("capture state poisoned");
        if st.phase != Phase::Running {
            return;
        }
        st.phase = Phase::Stopping;
        if let Some(e) = err {
            st.err.get_or_insert(e);
        }
        // Dropping the handle closes the queue; the writer drains, flushes
        // the open chunk, and finalizes meta.
        st.writer = None;
        info!(
            captured = self.captured.load(Ordering::Relaxed),
            redacted = self.redacted.load(Ordering::Relaxed),
            dropped = self.dropped.load(Ordering::Relaxed),
            "capture stopping",
        );
    }
}
