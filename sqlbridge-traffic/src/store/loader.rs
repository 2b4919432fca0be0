//! Replay-side reader: iterates a capture directory's chunks in meta order
//! and yields decoded records as a finite, non-restartable sequence.

use std::io::Read;
use std::path::PathBuf;
use std::str::FromStr;

use tokio::sync::mpsc;
use tracing::warn;

use sqlbridge_wire::CommandRecord;

use super::codec::{unwrap_key, ChunkSource, EncryptMethod};
use super::meta::Meta;
use crate::{Result, TrafficError};

#[derive(Clone, Debug)]
pub struct LoaderConfig {
    pub dir: PathBuf,
    /// Key-encryption key; required when the capture is encrypted.
    pub encryption_key: Option<Vec<u8>>,
}

pub struct Loader {
    dir: PathBuf,
    meta: Meta,
    compress: bool,
    dek: Option<[u8; 32]>,
    next_chunk: usize,
    current: Option<ChunkSource>,
}

impl Loader {
    pub fn open(cfg: LoaderConfig) -> Result<Loader> {
        let meta = Meta::read(&cfg.dir)?;
        let method = EncryptMethod::from_str(&meta.encrypt_method)?;
        let dek = match method {
            EncryptMethod::None => None,
            EncryptMethod::Aes256Gcm => {
                let kek = cfg.encryption_key.as_deref().ok_or_else(|| {
                    TrafficError::Config("capture is encrypted but no key supplied".to_owned())
                })?;
                let wrapped = meta.encrypted_key.as_deref().ok_or_else(|| {
                    TrafficError::Crypto("meta is missing the wrapped data key".to_owned())
                })?;
                Some(unwrap_key(kek, wrapped)?)
            }
        };
        Ok(Loader {
            dir: cfg.dir,
            compress: meta.compress,
            dek,
            meta,
            next_chunk: 0,
            current: None,
        })
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    /// Next record, or `None` once the last chunk ends cleanly. A decode
    /// error terminates the sequence; further calls keep returning errors.
    pub fn next_record(&mut self) -> Result<Option<CommandRecord>> {
        loop {
            if self.current.is_none() {
                let name = match self.meta.chunks.get(self.next_chunk) {
                    Some(name) => name,
                    None => return Ok(None),
                };
                self.next_chunk += 1;
                let source =
                    ChunkSource::open(&self.dir.join(name), self.compress, self.dek.as_ref())?;
                self.current = Some(source);
            }
            let source = match self.current.as_mut() {
                Some(s) => s,
                None => continue,
            };
            match read_record(source)? {
                Some(record) => return Ok(Some(record)),
                None => {
                    // Clean end of chunk; move on to the next one.
                    self.current = None;
                }
            }
        }
    }

    /// Feeds the record stream through a bounded channel from a blocking
    /// task. The receiver sees each record once; an `Err` item terminates
    /// the stream.
    pub fn spawn(mut self, capacity: usize) -> mpsc::Receiver<Result<CommandRecord>> {
        let (tx, rx) = mpsc::channel(capacity);
        tokio::task::spawn_blocking(move || loop {
            match self.next_record() {
                Ok(Some(record)) => {
                    if tx.blocking_send(Ok(record)).is_err() {
                        // Receiver gone: replay stopped early.
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(%e, "decoding captured traffic failed");
                    let _ = tx.blocking_send(Err(e));
                    break;
                }
            }
        });
        rx
    }
}

/// Reads one `uvarint(len) · record` entry. Clean EOF before the first
/// length byte ends the chunk; EOF anywhere else is corruption.
fn read_record(r: &mut impl Read) -> Result<Option<CommandRecord>> {
    let mut len: u64 = 0;
    let mut shift = 0u32;
    let mut first = true;
    loop {
        let mut byte = [0u8; 1];
        let n = r.read(&mut byte)?;
        if n == 0 {
            if first {
                return Ok(None);
            }
            return Err(TrafficError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "truncated record length",
            )));
        }
        first = false;
        if shift >= 64 {
            return Err(TrafficError::Wire(sqlbridge_wire::WireError::VarintOverflow));
        }
        len |= u64::from(byte[0] & 0x7f) << shift;
        if byte[0] < 0x80 {
            break;
        }
        shift += 7;
    }

    let mut data = vec![0u8; len as usize];
    r.read_exact(&mut data)?;
    Ok(Some(CommandRecord::decode(&data)?))
}
