//! Per-connection replay workers and the MySQL backend connection they
//! drive.
//!
//! The engine spawns one worker per captured `conn_id`. A worker owns a
//! [`BackendConn`], executes commands in capture order from its bounded
//! inbox, reports failures through the exception channel, and announces its
//! own exit on the close channel so the engine can tombstone the id.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{OptsBuilder, Params, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use sqlbridge_util::shutdown::ShutdownReceiver;
use sqlbridge_wire::stmt::{parse_execute, BinValue, ParamType};
use sqlbridge_wire::{CommandRecord, CommandType};

use crate::report::{Exception, ExceptionKind, ExceptionSender};

/// How long a worker keeps draining its inbox after cancellation.
const DRAIN_GRACE: Duration = Duration::from_millis(100);

/// Connection details for the replay target. Captured credentials are never
/// replayed; every connection uses these.
#[derive(Clone, Debug)]
pub struct BackendConfig {
    /// `host:port` of the target.
    pub addr: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug)]
pub struct ConnError {
    pub kind: ExceptionKind,
    pub message: String,
    /// Fatal errors terminate the worker; others are reported and replay of
    /// this connection continues.
    pub fatal: bool,
}

impl ConnError {
    fn fatal(kind: ExceptionKind, message: impl Into<String>) -> Self {
        ConnError {
            kind,
            message: message.into(),
            fatal: true,
        }
    }

    fn soft(kind: ExceptionKind, message: impl Into<String>) -> Self {
        ConnError {
            kind,
            message: message.into(),
            fatal: false,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ExecOutcome {
    Done,
    /// Command has no replay-side counterpart; skipped silently.
    Skipped,
    /// The captured client disconnected here.
    Quit,
}

/// One backend session. Implemented over `mysql_async` in production;
/// tests substitute their own.
#[async_trait]
pub trait BackendConn: Send {
    async fn connect(&mut self, db: Option<&str>) -> Result<(), ConnError>;
    async fn execute(&mut self, record: &CommandRecord) -> Result<ExecOutcome, ConnError>;
    async fn close(&mut self);
}

/// Factory for backend sessions, one per captured connection.
pub trait ConnCreator: Send + Sync {
    fn create(&self, conn_id: u64) -> Box<dyn BackendConn>;
}

pub struct MysqlConnCreator {
    cfg: BackendConfig,
}

impl MysqlConnCreator {
    pub fn new(cfg: BackendConfig) -> Self {
        MysqlConnCreator { cfg }
    }
}

impl ConnCreator for MysqlConnCreator {
    fn create(&self, conn_id: u64) -> Box<dyn BackendConn> {
        Box::new(MysqlConn {
            cfg: self.cfg.clone(),
            conn_id,
            conn: None,
            stmts: HashMap::new(),
            next_captured_id: 1,
        })
    }
}

struct PreparedStmt {
    stmt: mysql_async::Statement,
    /// Parameter types from the last execution that re-bound them.
    types: Option<Vec<ParamType>>,
}

pub struct MysqlConn {
    cfg: BackendConfig,
    conn_id: u64,
    conn: Option<mysql_async::Conn>,
    /// Captured statement id to target-side statement. The original backend
    /// hands out per-connection ids counting up from 1, so the n-th prepare
    /// on this connection is captured id n.
    stmts: HashMap<u32, PreparedStmt>,
    next_captured_id: u32,
}

impl MysqlConn {
    fn conn(&mut self) -> Result<&mut mysql_async::Conn, ConnError> {
        self.conn.as_mut().ok_or_else(|| {
            ConnError::fatal(ExceptionKind::TransportError, "backend connection not open")
        })
    }

    fn payload_sql<'a>(record: &'a CommandRecord) -> Result<&'a str, ConnError> {
        std::str::from_utf8(&record.payload).map_err(|_| {
            ConnError::soft(
                ExceptionKind::ProtocolMismatch,
                "statement payload is not valid utf8",
            )
        })
    }

    async fn execute_stmt(&mut self, record: &CommandRecord) -> Result<ExecOutcome, ConnError> {
        let captured_id = record.prepared_stmt_id().ok_or_else(|| {
            ConnError::soft(ExceptionKind::ProtocolMismatch, "execute without stmt id")
        })?;
        let (stmt, cached_types) = match self.stmts.get(&captured_id) {
            Some(p) => (p.stmt.clone(), p.types.clone()),
            None => {
                return Err(ConnError::soft(
                    ExceptionKind::ProtocolMismatch,
                    format!("execute of unknown stmt {captured_id}"),
                ))
            }
        };
        let parsed = parse_execute(
            &record.payload,
            stmt.num_params(),
            cached_types.as_deref(),
        )
        .map_err(|e| ConnError::soft(ExceptionKind::ProtocolMismatch, e.to_string()))?;
        if let Some(p) = self.stmts.get_mut(&captured_id) {
            p.types = Some(parsed.types.clone());
        }
        let params = if parsed.values.is_empty() {
            Params::Empty
        } else {
            Params::Positional(parsed.values.into_iter().map(to_mysql_value).collect())
        };
        self.conn()?
            .exec_drop(&stmt, params)
            .await
            .map_err(classify)?;
        Ok(ExecOutcome::Done)
    }
}

#[async_trait]
impl BackendConn for MysqlConn {
    async fn connect(&mut self, db: Option<&str>) -> Result<(), ConnError> {
        let (host, port) = self.cfg.addr.split_once(':').ok_or_else(|| {
            ConnError::fatal(
                ExceptionKind::TransportError,
                format!("bad backend address {:?}", self.cfg.addr),
            )
        })?;
        let port: u16 = port.parse().map_err(|_| {
            ConnError::fatal(
                ExceptionKind::TransportError,
                format!("bad backend port in {:?}", self.cfg.addr),
            )
        })?;
        let mut opts = OptsBuilder::default()
            .ip_or_hostname(host)
            .tcp_port(port)
            .user(Some(self.cfg.username.clone()))
            .pass(Some(self.cfg.password.clone()));
        if let Some(db) = db {
            opts = opts.db_name(Some(db));
        }
        let conn = mysql_async::Conn::new(opts).await.map_err(classify)?;
        debug!(conn_id = self.conn_id, "backend connection opened");
        self.conn = Some(conn);
        Ok(())
    }

    async fn execute(&mut self, record: &CommandRecord) -> Result<ExecOutcome, ConnError> {
        match record.cmd {
            CommandType::Query => {
                let sql = Self::payload_sql(record)?.to_owned();
                self.conn()?.query_drop(sql).await.map_err(classify)?;
                Ok(ExecOutcome::Done)
            }
            CommandType::InitDb => {
                let db = Self::payload_sql(record)?.to_owned();
                self.conn()?
                    .query_drop(format!("USE `{db}`"))
                    .await
                    .map_err(classify)?;
                Ok(ExecOutcome::Done)
            }
            CommandType::StmtPrepare => {
                let sql = Self::payload_sql(record)?.to_owned();
                let stmt = self.conn()?.prep(sql).await.map_err(classify)?;
                let captured_id = self.next_captured_id;
                self.next_captured_id += 1;
                self.stmts
                    .insert(captured_id, PreparedStmt { stmt, types: None });
                Ok(ExecOutcome::Done)
            }
            CommandType::StmtExecute => self.execute_stmt(record).await,
            CommandType::StmtClose => {
                if let Some(id) = record.prepared_stmt_id() {
                    if let Some(p) = self.stmts.remove(&id) {
                        self.conn()?.close(p.stmt).await.map_err(classify)?;
                    }
                }
                Ok(ExecOutcome::Done)
            }
            CommandType::ResetConnection => {
                self.conn()?.reset().await.map_err(classify)?;
                Ok(ExecOutcome::Done)
            }
            CommandType::Ping => {
                self.conn()?.ping().await.map_err(classify)?;
                Ok(ExecOutcome::Done)
            }
            CommandType::Quit => Ok(ExecOutcome::Quit),
            // Commands with no replay-side effect (fetch of a cursor we did
            // not open, long-data chunks, admin commands).
            _ => Ok(ExecOutcome::Skipped),
        }
    }

    async fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(e) = conn.disconnect().await {
                debug!(conn_id = self.conn_id, %e, "backend disconnect failed");
            }
        }
    }
}

fn to_mysql_value(v: BinValue) -> Value {
    match v {
        BinValue::Null => Value::NULL,
        BinValue::Int(i) => Value::Int(i),
        BinValue::UInt(u) => Value::UInt(u),
        BinValue::Float(f) => Value::Float(f),
        BinValue::Double(d) => Value::Double(d),
        BinValue::Bytes(b) => Value::Bytes(b),
        BinValue::Date {
            year,
            month,
            day,
            hour,
            minute,
            second,
            micro,
        } => Value::Date(year, month, day, hour, minute, second, micro),
        BinValue::Time {
            negative,
            days,
            hours,
            minutes,
            seconds,
            micro,
        } => Value::Time(negative, days, hours, minutes, seconds, micro),
    }
}

fn classify(e: mysql_async::Error) -> ConnError {
    match e {
        mysql_async::Error::Server(se) => ConnError::soft(
            ExceptionKind::ResultMismatch,
            format!("server error {}: {}", se.code, se.message),
        ),
        mysql_async::Error::Io(io) => {
            let message = io.to_string();
            if message.contains("timed out") {
                ConnError::fatal(ExceptionKind::Timeout, message)
            } else {
                ConnError::fatal(ExceptionKind::TransportError, message)
            }
        }
        other => ConnError::soft(ExceptionKind::ProtocolMismatch, other.to_string()),
    }
}

/// Why a worker's command loop ended.
enum ExitReason {
    Cancelled,
    InboxClosed,
    Fatal,
    ClientQuit,
}

pub(crate) struct ConnWorker {
    pub(crate) conn_id: u64,
    pub(crate) backend: Box<dyn BackendConn>,
    pub(crate) rx: mpsc::Receiver<CommandRecord>,
    pub(crate) exceptions: ExceptionSender,
    pub(crate) close_tx: mpsc::UnboundedSender<u64>,
}

impl ConnWorker {
    pub(crate) async fn run(mut self, mut shutdown: ShutdownReceiver) {
        let mut connected = false;
        let reason = loop {
            let record = tokio::select! {
                _ = shutdown.recv() => break ExitReason::Cancelled,
                r = self.rx.recv() => match r {
                    Some(r) => r,
                    None => break ExitReason::InboxClosed,
                },
            };
            match self.handle(record, &mut connected).await {
                Some(reason) => break reason,
                None => {}
            }
        };

        if matches!(reason, ExitReason::Cancelled) {
            // Short grace so commands already queued are not lost outright.
            let deadline = Instant::now() + DRAIN_GRACE;
            while Instant::now() < deadline {
                match self.rx.try_recv() {
                    Ok(record) => {
                        if self.handle(record, &mut connected).await.is_some() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        }

        self.backend.close().await;
        // The engine keeps a tombstone for this id; the send only fails if
        // the whole replay is already gone.
        let _ = self.close_tx.send(self.conn_id);
    }

    async fn handle(&mut self, record: CommandRecord, connected: &mut bool) -> Option<ExitReason> {
        if !*connected {
            let db = (!record.db.is_empty()).then_some(record.db.as_str());
            if let Err(e) = self.backend.connect(db).await {
                warn!(conn_id = self.conn_id, err = %e.message, "backend connect failed");
                self.exceptions.push(Exception {
                    conn_id: self.conn_id,
                    cmd: record.cmd,
                    kind: e.kind,
                    message: e.message,
                });
                return Some(ExitReason::Fatal);
            }
            *connected = true;
        }
        match self.backend.execute(&record).await {
            Ok(ExecOutcome::Done) | Ok(ExecOutcome::Skipped) => None,
            Ok(ExecOutcome::Quit) => Some(ExitReason::ClientQuit),
            Err(e) => {
                self.exceptions.push(Exception {
                    conn_id: self.conn_id,
                    cmd: record.cmd,
                    kind: e.kind,
                    message: e.message,
                });
                e.fatal.then_some(ExitReason::Fatal)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    pub(crate) struct ScriptedConn {
        pub(crate) log: Arc<Mutex<Vec<String>>>,
        pub(crate) connects: Arc<AtomicUsize>,
        pub(crate) fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl BackendConn for ScriptedConn {
        async fn connect(&mut self, db: Option<&str>) -> Result<(), ConnError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.log
                .lock()
                .unwrap()
                .push(format!("connect db={}", db.unwrap_or("")));
            Ok(())
        }

        async fn execute(&mut self, record: &CommandRecord) -> Result<ExecOutcome, ConnError> {
            let sql = String::from_utf8_lossy(&record.payload).to_string();
            if let Some(fail) = self.fail_on {
                if sql.contains(fail) {
                    return Err(ConnError::soft(ExceptionKind::ResultMismatch, "scripted"));
                }
            }
            self.log.lock().unwrap().push(sql);
            if record.cmd == CommandType::Quit {
                return Ok(ExecOutcome::Quit);
            }
            Ok(ExecOutcome::Done)
        }

        async fn close(&mut self) {
            self.log.lock().unwrap().push("close".to_owned());
        }
    }

    fn record(cmd: CommandType, sql: &str) -> CommandRecord {
        CommandRecord {
            conn_id: 5,
            start_ts: 0,
            cmd,
            payload: Bytes::copy_from_slice(sql.as_bytes()),
            db: "app".to_owned(),
        }
    }

    #[tokio::test]
    async fn worker_connects_lazily_and_reports_close() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let connects = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel(8);
        let (close_tx, mut close_rx) = mpsc::unbounded_channel();
        let (exc_tx, _exc_rx) = ExceptionSender::channel();
        let (shutdown_tx, shutdown_rx) = sqlbridge_util::shutdown::channel();

        let worker = ConnWorker {
            conn_id: 5,
            backend: Box::new(ScriptedConn {
                log: Arc::clone(&log),
                connects: Arc::clone(&connects),
                fail_on: None,
            }),
            rx,
            exceptions: exc_tx,
            close_tx,
        };
        let handle = tokio::spawn(worker.run(shutdown_rx));

        tx.send(record(CommandType::Query, "SELECT 1")).await.unwrap();
        tx.send(record(CommandType::Query, "SELECT 2")).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(close_rx.recv().await, Some(5));
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        let log = log.lock().unwrap();
        assert_eq!(
            *log,
            vec![
                "connect db=app".to_owned(),
                "SELECT 1".to_owned(),
                "SELECT 2".to_owned(),
                "close".to_owned(),
            ]
        );
        drop(shutdown_tx);
    }

    #[tokio::test]
    async fn quit_ends_worker() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel(8);
        let (close_tx, mut close_rx) = mpsc::unbounded_channel();
        let (exc_tx, _exc_rx) = ExceptionSender::channel();
        let (shutdown_tx, shutdown_rx) = sqlbridge_util::shutdown::channel();

        let worker = ConnWorker {
            conn_id: 5,
            backend: Box::new(ScriptedConn {
                log: Arc::clone(&log),
                connects: Arc::new(AtomicUsize::new(0)),
                fail_on: None,
            }),
            rx,
            exceptions: exc_tx,
            close_tx,
        };
        let handle = tokio::spawn(worker.run(shutdown_rx));

        tx.send(record(CommandType::Quit, "")).await.unwrap();
        // This one arrives after quit and must not execute.
        let _ = tx.send(record(CommandType::Query, "SELECT never")).await;
        handle.await.unwrap();
        assert_eq!(close_rx.recv().await, Some(5));
        assert!(!log.lock().unwrap().iter().any(|l| l.contains("never")));
        drop(shutdown_tx);
    }

    #[tokio::test]
    async fn soft_errors_keep_worker_alive() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel(8);
        let (close_tx, _close_rx) = mpsc::unbounded_channel();
        let (exc_tx, mut exc_rx) = ExceptionSender::channel();
        let (shutdown_tx, shutdown_rx) = sqlbridge_util::shutdown::channel();

        let worker = ConnWorker {
            conn_id: 5,
            backend: Box::new(ScriptedConn {
                log: Arc::clone(&log),
                connects: Arc::new(AtomicUsize::new(0)),
                fail_on: Some("broken"),
            }),
            rx,
            exceptions: exc_tx,
            close_tx,
        };
        let handle = tokio::spawn(worker.run(shutdown_rx));

        tx.send(record(CommandType::Query, "SELECT broken")).await.unwrap();
        tx.send(record(CommandType::Query, "SELECT fine")).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        let e = exc_rx.recv().await.unwrap();
        assert_eq!(e.kind, ExceptionKind::ResultMismatch);
        assert!(log.lock().unwrap().iter().any(|l| l.contains("fine")));
        drop(shutdown_tx);
    }
}
