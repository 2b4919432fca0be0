//! The capture writer: a byte-budgeted queue in front of a single blocking
//! writer task that serializes records, rotates chunks, and keeps meta
//! current.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use sqlbridge_wire::{put_uvarint, CommandRecord};

use super::codec::{generate_data_key, wrap_key, ChunkSink, EncryptMethod};
use super::meta::Meta;
use super::{chunk_file_name, DEFAULT_CHUNK_AGE, DEFAULT_CHUNK_BYTES, DEFAULT_WRITE_BUDGET};
use crate::{Result, TrafficError};

const DROPPED_CMDS_COUNTER: &str = "sqlbridge_capture_dropped_cmds";

#[derive(Clone, Debug)]
pub struct WriterConfig {
    pub dir: PathBuf,
    pub compress: bool,
    pub encrypt: EncryptMethod,
    /// 256-bit key-encryption key, required when `encrypt` is not `None`.
    pub encryption_key: Option<Vec<u8>>,
    pub chunk_bytes: u64,
    pub chunk_age: Duration,
    pub buffer_bytes: usize,
}

impl WriterConfig {
    pub fn new(dir: PathBuf) -> Self {
        WriterConfig {
            dir,
            compress: true,
            encrypt: EncryptMethod::None,
            encryption_key: None,
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            chunk_age: DEFAULT_CHUNK_AGE,
            buffer_bytes: DEFAULT_WRITE_BUDGET,
        }
    }
}

/// Hot-path handle held by the capture controller. `push` never blocks: if
/// the queued bytes would exceed the budget the record is dropped and
/// counted, preferring live proxy traffic over capture completeness.
pub struct WriterHandle {
    tx: mpsc::UnboundedSender<CommandRecord>,
    pending: Arc<AtomicUsize>,
    budget: usize,
    dropped: Arc<AtomicU64>,
}

impl WriterHandle {
    pub fn push(&self, record: CommandRecord) -> bool {
        let size = record.encoded_len();
        let queued = self.pending.load(Ordering::Acquire);
        if queued + size > self.budget {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            counter!(DROPPED_CMDS_COUNTER, 1);
            return false;
        }
        self.pending.fetch_add(size, Ordering::AcqRel);
        if self.tx.send(record).is_err() {
            // Writer already exited; the record is lost either way.
            self.pending.fetch_sub(size, Ordering::AcqRel);
            return false;
        }
        true
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Starts the writer task. Returns the hot-path handle and the task handle,
/// which yields the finalized meta. Dropping the [`WriterHandle`] makes the
/// task flush the current chunk and finalize meta.
pub fn spawn_writer(cfg: WriterConfig) -> Result<(WriterHandle, JoinHandle<Result<Meta>>)> {
    std::fs::create_dir_all(&cfg.dir)?;

    let dek = match cfg.encrypt {
        EncryptMethod::None => None,
        EncryptMethod::Aes256Gcm => Some(generate_data_key()),
    };
    let mut meta = Meta {
        start_time: Some(Utc::now()),
        end_time: None,
        cmds: 0,
        version: env!("CARGO_PKG_VERSION").to_owned(),
        chunks: Vec::new(),
        compress: cfg.compress,
        encrypt_method: cfg.encrypt.to_string(),
        encrypted_key: None,
    };
    if let Some(dek) = &dek {
        let kek = cfg.encryption_key.as_deref().ok_or_else(|| {
            TrafficError::Config("encryption requested but no key supplied".to_owned())
        })?;
        meta.encrypted_key = Some(wrap_key(kek, dek)?);
    }
    meta.write(&cfg.dir)?;

    let pending = Arc::new(AtomicUsize::new(0));
    let dropped = Arc::new(AtomicU64::new(0));
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = WriterHandle {
        tx,
        pending: Arc::clone(&pending),
        budget: cfg.buffer_bytes,
        dropped,
    };
    let task = tokio::task::spawn_blocking(move || write_loop(cfg, dek, meta, rx, pending));
    Ok((handle, task))
}

struct OpenChunk {
    sink: ChunkSink,
    opened_at: Instant,
    bytes: u64,
}

fn write_loop(
    cfg: WriterConfig,
    dek: Option<[u8; 32]>,
    mut meta: Meta,
    mut rx: mpsc::UnboundedReceiver<CommandRecord>,
    pending: Arc<AtomicUsize>,
) -> Result<Meta> {
    let mut current: Option<OpenChunk> = None;
    let mut next_index: u64 = 1;
    let mut buf = Vec::with_capacity(4096);

    let mut outcome = loop {
        let record = match rx.blocking_recv() {
            Some(r) => r,
            None => break Ok(()),
        };
        pending.fetch_sub(record.encoded_len(), Ordering::AcqRel);

        let rotate = matches!(&current, Some(c)
            if c.bytes >= cfg.chunk_bytes || c.opened_at.elapsed() >= cfg.chunk_age);
        if rotate {
            if let Some(chunk) = current.take() {
                if let Err(e) = chunk.sink.finish() {
                    break Err(e);
                }
            }
        }
        if current.is_none() {
            match open_chunk(&cfg, dek.as_ref(), &mut meta, next_index) {
                Ok(c) => {
                    next_index += 1;
                    current = Some(c);
                }
                Err(e) => break Err(e),
            }
        }
        let chunk = match current.as_mut() {
            Some(c) => c,
            None => unreachable!("chunk opened above"),
        };

        buf.clear();
        put_uvarint(&mut buf, record.encoded_len() as u64);
        record.encode(&mut buf);
        if let Err(e) = std::io::Write::write_all(&mut chunk.sink, &buf) {
            break Err(TrafficError::Io(e));
        }
        chunk.bytes += buf.len() as u64;
        meta.cmds += 1;
    };

    if let Some(chunk) = current.take() {
        if let Err(e) = chunk.sink.finish() {
            if outcome.is_ok() {
                outcome = Err(e);
            }
        }
    }
    meta.end_time = Some(Utc::now());
    meta.write(&cfg.dir)?;
    outcome?;
    info!(
        dir = %cfg.dir.display(),
        cmds = meta.cmds,
        chunks = meta.chunks.len(),
        "capture writer finished",
    );
    Ok(meta)
}

fn open_chunk(
    cfg: &WriterConfig,
    dek: Option<&[u8; 32]>,
    meta: &mut Meta,
    index: u64,
) -> Result<OpenChunk> {
    let name = chunk_file_name(index, cfg.compress, dek.is_some());
    let sink = ChunkSink::create(&cfg.dir.join(&name), cfg.compress, dek)?;
    debug!(chunk = %name, "opened capture chunk");
    meta.chunks.push(name);
    // Keep the chunk list durable while the capture runs.
    meta.write(&cfg.dir)?;
    Ok(OpenChunk {
        sink,
        opened_at: Instant::now(),
        bytes: 0,
    })
}
