//! The replay engine: paces captured commands by their original timestamps
//! and dispatches them to per-connection workers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, error, info};

use sqlbridge_util::shutdown::{self, ShutdownReceiver, ShutdownSender};
use sqlbridge_wire::{CommandRecord, CommandType};

use crate::conn::{BackendConfig, ConnCreator, ConnWorker, MysqlConnCreator};
use crate::filter::is_read_only_sql;
use crate::report::{Exception, ExceptionKind, ExceptionSender, LogReport, Report};
use crate::store::{Loader, LoaderConfig};
use crate::{Result, TrafficError};

const MIN_SPEED: f64 = 0.1;
const MAX_SPEED: f64 = 10.0;
/// Commands buffered per connection before the pacer starts skipping.
const PER_CONN_QUEUE: usize = 256;
/// Records buffered between the loader task and the pacer.
const LOADER_QUEUE: usize = 1024;
/// Close-drain re-check interval.
const DRAIN_TICK: Duration = Duration::from_millis(100);

#[derive(Clone, Debug, Default)]
pub struct ReplayConfig {
    pub input: PathBuf,
    pub username: String,
    pub password: String,
    /// Timing scale: 2.0 replays twice as fast. 0 means the default 1.0.
    pub speed: f64,
    /// Skip statements that are not read-only.
    pub readonly: bool,
    /// `host:port` of the replay target.
    pub backend_addr: String,
    /// Key-encryption key for encrypted captures.
    pub encryption_key: Option<Vec<u8>>,
}

impl ReplayConfig {
    fn validate(&mut self) -> Result<()> {
        match std::fs::metadata(&self.input) {
            Ok(meta) if meta.is_dir() => {}
            _ => {
                return Err(TrafficError::Config(
                    "input must be an existing directory".to_owned(),
                ))
            }
        }
        if self.username.is_empty() {
            return Err(TrafficError::Config("username is required".to_owned()));
        }
        if self.speed == 0.0 {
            self.speed = 1.0;
        } else if !(MIN_SPEED..=MAX_SPEED).contains(&self.speed) {
            return Err(TrafficError::Config(format!(
                "speed must be between {MIN_SPEED} and {MAX_SPEED}"
            )));
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

/// Per-connection dispatch slot. `Closed` is a tombstone: the worker is
/// gone and late commands for the id are rejected instead of forging a new
/// session.
enum ConnSlot {
    Active(mpsc::Sender<CommandRecord>),
    Closed,
}

struct ReplayState {
    phase: Phase,
    conns: HashMap<u64, ConnSlot>,
    active_conns: usize,
    meta_cmds: u64,
    input: Option<PathBuf>,
    err: Option<String>,
    succeeded: bool,
    shutdown: Option<Arc<ShutdownSender>>,
    started_at: Option<Instant>,
}

struct ReplayInner {
    state: Mutex<ReplayState>,
    replayed_cmds: AtomicU64,
    filtered_cmds: AtomicU64,
}

pub struct Replay {
    inner: Arc<ReplayInner>,
}

impl Default for Replay {
    fn default() -> Self {
        Self::new()
    }
}

impl Replay {
    pub fn new() -> Self {
        Replay {
            inner: Arc::new(ReplayInner {
                state: Mutex::new(ReplayState {
                    phase: Phase::Idle,
                    conns: HashMap::new(),
                    active_conns: 0,
                    meta_cmds: 0,
                    input: None,
                    err: None,
                    succeeded: false,
                    shutdown: None,
                    started_at: None,
                }),
                replayed_cmds: AtomicU64::new(0),
                filtered_cmds: AtomicU64::new(0),
            }),
        }
    }

    /// Starts a replay against `cfg.backend_addr` with the default report.
    pub fn start(&self, cfg: ReplayConfig) -> Result<()> {
        if cfg.backend_addr.is_empty() {
            return Err(TrafficError::Config("backend address is required".to_owned()));
        }
        let creator = Arc::new(MysqlConnCreator::new(BackendConfig {
            addr: cfg.backend_addr.clone(),
            username: cfg.username.clone(),
            password: cfg.password.clone(),
        }));
        self.start_with(cfg, creator, Box::new(LogReport::default()))
    }

    /// Starts a replay with an explicit connection factory and report
    /// consumer.
    pub fn start_with(
        &self,
        mut cfg: ReplayConfig,
        creator: Arc<dyn ConnCreator>,
        mut report: Box<dyn Report>,
    ) -> Result<()> {
        cfg.validate()?;
        let loader = Loader::open(LoaderConfig {
            dir: cfg.input.clone(),
            encryption_key: cfg.encryption_key.clone(),
        })?;
        let meta_cmds = loader.meta().cmds;

        let (shutdown_tx, shutdown_rx) = shutdown::channel();
        let shutdown_tx = Arc::new(shutdown_tx);
        {
            let mut st = self.inner.state.lock().expect("replay state poisoned");
            if st.phase != Phase::Idle {
                return Err(TrafficError::JobRunning("replay".to_owned()));
            }
            st.phase = Phase::Running;
            st.conns = HashMap::new();
            st.active_conns = 0;
            st.meta_cmds = meta_cmds;
            st.input = Some(cfg.input.clone());
            st.err = None;
            st.succeeded = false;
            st.shutdown = Some(Arc::clone(&shutdown_tx));
            st.started_at = Some(Instant::now());
        }
        self.inner.replayed_cmds.store(0, Ordering::Relaxed);
        self.inner.filtered_cmds.store(0, Ordering::Relaxed);
        info!(input = %cfg.input.display(), speed = cfg.speed, cmds = meta_cmds, "replay started");

        let records_rx = loader.spawn(LOADER_QUEUE);
        let (exc_tx, exc_rx) = ExceptionSender::channel();
        let (close_tx, close_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            report.run(exc_rx).await;
        });
        tokio::spawn(run_close_drain(
            Arc::clone(&self.inner),
            close_rx,
            shutdown_rx.clone(),
        ));
        let pacer = Pacer {
            inner: Arc::clone(&self.inner),
            creator,
            exceptions: exc_tx,
            close_tx,
            worker_shutdown: shutdown_rx.clone(),
            speed: cfg.speed,
            readonly: cfg.readonly,
        };
        tokio::spawn(pacer.run(records_rx, shutdown_rx));

        // Flip to Idle once every background task has dropped its receiver.
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            shutdown_tx.wait_done().await;
            let mut st = inner.state.lock().expect("replay state poisoned");
            st.phase = Phase::Idle;
            st.shutdown = None;
        });
        Ok(())
    }

    /// Stops the replay. Idempotent; concurrent callers see the first
    /// error.
    pub fn stop(&self, err: Option<String>) {
        self.inner.stop(err);
    }

    /// `(replayed + filtered) / total`, clamped to `[0, 1]`; exactly 1 only
    /// after a successful run. The second element is the first fatal error.
    pub fn progress(&self) -> (f64, Option<String>) {
        let st = self.inner.state.lock().expect("replay state poisoned");
        if st.succeeded {
            return (1.0, None);
        }
        let done = self.inner.replayed_cmds.load(Ordering::Relaxed)
            + self.inner.filtered_cmds.load(Ordering::Relaxed);
        let progress = if st.meta_cmds > 0 {
            (done as f64 / st.meta_cmds as f64).clamp(0.0, 1.0)
        } else {
            0.0
        };
        (progress, st.err.clone())
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().expect("replay state poisoned").phase != Phase::Idle
    }

    pub fn input(&self) -> Option<PathBuf> {
        self.inner
            .state
            .lock()
            .expect("replay state poisoned")
            .input
            .clone()
    }

    pub fn replayed_cmds(&self) -> u64 {
        self.inner.replayed_cmds.load(Ordering::Relaxed)
    }

    pub fn filtered_cmds(&self) -> u64 {
        self.inner.filtered_cmds.load(Ordering::Relaxed)
    }

    /// Stops with a shutdown sentinel and waits for all background tasks.
    pub async fn close(&self) {
        self.inner.stop(Some(TrafficError::ShuttingDown.to_string()));
        let shutdown = {
            let st = self.inner.state.lock().expect("replay state poisoned");
            st.shutdown.clone()
        };
        if let Some(shutdown) = shutdown {
            shutdown.wait_done().await;
        }
        let mut st = self.inner.state.lock().expect("replay state poisoned");
        st.phase = Phase::Idle;
        st.shutdown = None;
    }
}

impl ReplayInner {
    fn stop(&self, err: Option<String>) {
        let mut st = self.state.lock().expect("replay state poisoned");
        if st.phase == Phase::Idle || st.phase == Phase::Stopping {
            // First stop wins; late errors are ignored.
            return;
        }
        st.phase = Phase::Stopping;
        let replayed = self.replayed_cmds.load(Ordering::Relaxed);
        let filtered = self.filtered_cmds.load(Ordering::Relaxed);
        let elapsed = st.started_at.map(|t| t.elapsed());
        match err {
            Some(e) => {
                error!(replayed, filtered, ?elapsed, err = %e, "replay failed");
                st.err = Some(e);
            }
            None => {
                info!(replayed, filtered, ?elapsed, "replay finished");
                st.succeeded = true;
            }
        }
        if let Some(shutdown) = &st.shutdown {
            shutdown.signal();
        }
    }

    fn active_conns(&self) -> usize {
        self.state.lock().expect("replay state poisoned").active_conns
    }
}

enum DispatchOutcome {
    Sent,
    Skipped,
    Rejected,
}

struct Pacer {
    inner: Arc<ReplayInner>,
    creator: Arc<dyn ConnCreator>,
    exceptions: ExceptionSender,
    close_tx: mpsc::UnboundedSender<u64>,
    /// Receiver handed to each spawned worker.
    worker_shutdown: ShutdownReceiver,
    speed: f64,
    readonly: bool,
}

impl Pacer {
    async fn run(
        self,
        mut records: mpsc::Receiver<Result<CommandRecord>>,
        mut shutdown: ShutdownReceiver,
    ) {
        let mut origin: Option<(i64, Instant)> = None;
        loop {
            let item = tokio::select! {
                _ = shutdown.recv() => break,
                item = records.recv() => item,
            };
            let record = match item {
                // Clean end of the capture.
                None => {
                    self.inner.stop(None);
                    break;
                }
                Some(Err(e)) => {
                    self.inner.stop(Some(e.to_string()));
                    break;
                }
                Some(Ok(record)) => record,
            };

            if self.filters_out(&record) {
                self.inner.filtered_cmds.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            match origin {
                None => origin = Some((record.start_ts, Instant::now())),
                Some((ts0, wall0)) => {
                    let captured = (record.start_ts - ts0).max(0) as f64;
                    let expected = Duration::from_nanos((captured / self.speed) as u64);
                    let elapsed = wall0.elapsed();
                    if elapsed + Duration::from_micros(1) < expected {
                        tokio::select! {
                            _ = shutdown.recv() => break,
                            _ = tokio::time::sleep(expected - elapsed) => {}
                        }
                    }
                }
            }
            if shutdown.is_shutdown() {
                break;
            }

            match self.dispatch(record) {
                DispatchOutcome::Sent => {
                    self.inner.replayed_cmds.fetch_add(1, Ordering::Relaxed);
                }
                DispatchOutcome::Skipped | DispatchOutcome::Rejected => {
                    self.inner.filtered_cmds.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        // Dropping `records` stops the loader task.
    }

    fn filters_out(&self, record: &CommandRecord) -> bool {
        // The replay uses one set of credentials; user switches cannot be
        // replayed.
        if record.cmd == CommandType::ChangeUser {
            return true;
        }
        if self.readonly
            && matches!(record.cmd, CommandType::Query | CommandType::StmtPrepare)
        {
            let sql = String::from_utf8_lossy(&record.payload);
            return !is_read_only_sql(&sql);
        }
        false
    }

    fn dispatch(&self, record: CommandRecord) -> DispatchOutcome {
        let conn_id = record.conn_id;
        let mut st = self.inner.state.lock().expect("replay state poisoned");
        match st.conns.get(&conn_id) {
            None => {
                let (tx, rx) = mpsc::channel(PER_CONN_QUEUE);
                let worker = ConnWorker {
                    conn_id,
                    backend: self.creator.create(conn_id),
                    rx,
                    exceptions: self.exceptions.clone(),
                    close_tx: self.close_tx.clone(),
                };
                tokio::spawn(worker.run(self.worker_shutdown.clone()));
                // A fresh channel cannot be full.
                let _ = tx.try_send(record);
                st.conns.insert(conn_id, ConnSlot::Active(tx));
                st.active_conns += 1;
                DispatchOutcome::Sent
            }
            Some(ConnSlot::Active(tx)) => match tx.try_send(record) {
                Ok(()) => DispatchOutcome::Sent,
                Err(mpsc::error::TrySendError::Full(record)) => {
                    // Do not block the pacer on one slow connection.
                    self.exceptions.push(Exception {
                        conn_id,
                        cmd: record.cmd,
                        kind: ExceptionKind::Timeout,
                        message: "per-connection queue full, command skipped".to_owned(),
                    });
                    DispatchOutcome::Skipped
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Worker exited but the close event has not drained yet.
                    DispatchOutcome::Rejected
                }
            },
            Some(ConnSlot::Closed) => {
                // Tombstone: a late command must not forge a new session
                // with a reused id.
                debug!(conn_id, "command for closed connection rejected");
                DispatchOutcome::Rejected
            }
        }
    }
}

/// Reclaims per-connection state as workers exit. Keeps draining after
/// cancellation so workers never block on the close channel; exits once the
/// channel closes or, post-shutdown, a tick finds no active workers.
async fn run_close_drain(
    inner: Arc<ReplayInner>,
    mut close_rx: mpsc::UnboundedReceiver<u64>,
    shutdown: ShutdownReceiver,
) {
    loop {
        tokio::select! {
            closed = close_rx.recv() => match closed {
                Some(conn_id) => {
                    let mut st = inner.state.lock().expect("replay state poisoned");
                    if let Some(slot) = st.conns.get_mut(&conn_id) {
                        if matches!(slot, ConnSlot::Active(_)) {
                            *slot = ConnSlot::Closed;
                            st.active_conns -= 1;
                        }
                    }
                }
                None => break,
            },
            _ = tokio::time::sleep(DRAIN_TICK) => {
                if shutdown.is_shutdown() && inner.active_conns() == 0 {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::{BackendConn, ConnError, ExecOutcome};
    use crate::store::{spawn_writer, WriterConfig};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingBackend {
        executed: Arc<StdMutex<Vec<(u64, String, Instant)>>>,
        connects: Arc<AtomicUsize>,
    }

    struct RecordingConn {
        conn_id: u64,
        executed: Arc<StdMutex<Vec<(u64, String, Instant)>>>,
        connects: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BackendConn for RecordingConn {
        async fn connect(&mut self, _db: Option<&str>) -> std::result::Result<(), ConnError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn execute(
            &mut self,
            record: &CommandRecord,
        ) -> std::result::Result<ExecOutcome, ConnError> {
            if record.cmd == CommandType::Quit {
                return Ok(ExecOutcome::Quit);
            }
            self.executed.lock().unwrap().push((
                record.conn_id,
                String::from_utf8_lossy(&record.payload).to_string(),
                Instant::now(),
            ));
            Ok(ExecOutcome::Done)
        }

        async fn close(&mut self) {}
    }

    impl ConnCreator for RecordingBackend {
        fn create(&self, conn_id: u64) -> Box<dyn BackendConn> {
            Box::new(RecordingConn {
                conn_id,
                executed: Arc::clone(&self.executed),
                connects: Arc::clone(&self.connects),
            })
        }
    }

    struct NullReport;

    #[async_trait]
    impl Report for NullReport {
        async fn run(&mut self, mut rx: mpsc::Receiver<Exception>) {
            while rx.recv().await.is_some() {}
        }
    }

    fn record(conn_id: u64, ts_ms: i64, cmd: CommandType, payload: &str) -> CommandRecord {
        CommandRecord {
            conn_id,
            start_ts: ts_ms * 1_000_000,
            cmd,
            payload: Bytes::copy_from_slice(payload.as_bytes()),
            db: String::new(),
        }
    }

    async fn write_capture(dir: &std::path::Path, records: Vec<CommandRecord>) {
        let mut cfg = WriterConfig::new(dir.to_path_buf());
        cfg.compress = false;
        let (handle, task) = spawn_writer(cfg).unwrap();
        for r in records {
            assert!(handle.push(r));
        }
        drop(handle);
        task.await.unwrap().unwrap();
    }

    async fn wait_success(replay: &Replay) {
        for _ in 0..500 {
            let (p, err) = replay.progress();
            assert!(err.is_none(), "unexpected error: {err:?}");
            if p >= 1.0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("replay did not finish");
    }

    fn config(dir: &std::path::Path) -> ReplayConfig {
        ReplayConfig {
            input: dir.to_path_buf(),
            username: "replayer".to_owned(),
            speed: 10.0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn validation_rejects_bad_configs() {
        let dir = tempfile::tempdir().unwrap();
        let replay = Replay::new();

        let mut cfg = config(dir.path());
        cfg.input = dir.path().join("missing");
        assert!(matches!(
            replay.start_with(cfg, Arc::new(RecordingBackend::default()), Box::new(NullReport)),
            Err(TrafficError::Config(_))
        ));

        let mut cfg = config(dir.path());
        cfg.username = String::new();
        assert!(replay
            .start_with(cfg, Arc::new(RecordingBackend::default()), Box::new(NullReport))
            .is_err());

        let mut cfg = config(dir.path());
        cfg.speed = 100.0;
        assert!(replay
            .start_with(cfg, Arc::new(RecordingBackend::default()), Box::new(NullReport))
            .is_err());
    }

    #[tokio::test]
    async fn change_user_is_filtered_and_commands_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        write_capture(
            dir.path(),
            vec![
                record(7, 0, CommandType::ChangeUser, ""),
                record(7, 1, CommandType::Query, "SELECT 1"),
            ],
        )
        .await;

        let backend = Arc::new(RecordingBackend::default());
        let executed = Arc::clone(&backend.executed);
        let connects = Arc::clone(&backend.connects);
        let replay = Replay::new();
        replay
            .start_with(config(dir.path()), backend, Box::new(NullReport))
            .unwrap();
        wait_success(&replay).await;
        replay.close().await;

        assert_eq!(replay.filtered_cmds(), 1);
        assert_eq!(replay.replayed_cmds(), 1);
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        let executed = executed.lock().unwrap();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].1, "SELECT 1");
    }

    #[tokio::test]
    async fn pacing_scales_intervals_by_speed() {
        let dir = tempfile::tempdir().unwrap();
        write_capture(
            dir.path(),
            vec![
                record(1, 0, CommandType::Query, "q0"),
                record(1, 100, CommandType::Query, "q1"),
                record(1, 300, CommandType::Query, "q2"),
            ],
        )
        .await;

        let backend = Arc::new(RecordingBackend::default());
        let executed = Arc::clone(&backend.executed);
        let replay = Replay::new();
        let mut cfg = config(dir.path());
        cfg.speed = 2.0;
        let started = Instant::now();
        replay
            .start_with(cfg, backend, Box::new(NullReport))
            .unwrap();
        wait_success(&replay).await;

        // 300 ms of capture at speed 2 must take at least ~150 ms.
        assert!(started.elapsed() >= Duration::from_millis(140));
        replay.close().await;

        let executed = executed.lock().unwrap();
        assert_eq!(executed.len(), 3);
        let gap = executed[2].2.duration_since(executed[0].2);
        assert!(gap >= Duration::from_millis(120), "gap was {gap:?}");
    }

    #[tokio::test]
    async fn tombstone_rejects_commands_after_quit() {
        let dir = tempfile::tempdir().unwrap();
        write_capture(
            dir.path(),
            vec![
                record(9, 0, CommandType::Query, "SELECT 1"),
                record(9, 1, CommandType::Quit, ""),
                record(9, 2_000, CommandType::Query, "SELECT late"),
            ],
        )
        .await;

        let backend = Arc::new(RecordingBackend::default());
        let executed = Arc::clone(&backend.executed);
        let replay = Replay::new();
        replay
            .start_with(config(dir.path()), backend, Box::new(NullReport))
            .unwrap();
        wait_success(&replay).await;
        replay.close().await;

        let executed = executed.lock().unwrap();
        assert!(!executed.iter().any(|(_, sql, _)| sql.contains("late")));
    }

    #[tokio::test]
    async fn readonly_filters_writes() {
        let dir = tempfile::tempdir().unwrap();
        write_capture(
            dir.path(),
            vec![
                record(3, 0, CommandType::Query, "SELECT 1"),
                record(3, 1, CommandType::Query, "INSERT INTO t VALUES (1)"),
            ],
        )
        .await;

        let backend = Arc::new(RecordingBackend::default());
        let executed = Arc::clone(&backend.executed);
        let replay = Replay::new();
        let mut cfg = config(dir.path());
        cfg.readonly = true;
        replay
            .start_with(cfg, backend, Box::new(NullReport))
            .unwrap();
        wait_success(&replay).await;
        replay.close().await;

        assert_eq!(replay.filtered_cmds(), 1);
        let executed = executed.lock().unwrap();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].1, "SELECT 1");
    }

    #[tokio::test]
    async fn second_start_is_rejected_while_running() {
        let dir = tempfile::tempdir().unwrap();
        // Enough spacing that the replay is still running when we try again.
        write_capture(
            dir.path(),
            vec![
                record(1, 0, CommandType::Query, "q0"),
                record(1, 2_000, CommandType::Query, "q1"),
            ],
        )
        .await;

        let replay = Replay::new();
        replay
            .start_with(
                config(dir.path()),
                Arc::new(RecordingBackend::default()),
                Box::new(NullReport),
            )
            .unwrap();
        let again = replay.start_with(
            config(dir.path()),
            Arc::new(RecordingBackend::default()),
            Box::new(NullReport),
        );
        assert!(matches!(again, Err(TrafficError::JobRunning(_))));
        replay.close().await;
        assert!(!replay.is_running());
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_first_error_wins() {
        let dir = tempfile::tempdir().unwrap();
        write_capture(
            dir.path(),
            vec![
                record(1, 0, CommandType::Query, "q0"),
                record(1, 5_000, CommandType::Query, "q1"),
            ],
        )
        .await;

        let replay = Replay::new();
        replay
            .start_with(
                config(dir.path()),
                Arc::new(RecordingBackend::default()),
                Box::new(NullReport),
            )
            .unwrap();
        replay.stop(Some("first".to_owned()));
        replay.stop(Some("second".to_owned()));
        let (_, err) = replay.progress();
        assert_eq!(err.as_deref(), Some("first"));
        replay.close().await;
        // The sentinel from close must not replace the original error.
        let (_, err) = replay.progress();
        assert_eq!(err.as_deref(), Some("first"));
    }
}
