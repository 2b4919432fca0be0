//! Chunk codec stack: optional zstd compression wrapped by an optional
//! AEAD stream (AES-256-GCM in the STREAM construction with a 32-bit
//! counter). Encrypted chunks start with the 7-byte stream nonce prefix,
//! followed by `u32le(frame_len) · frame` ciphertext frames; the final frame
//! is sealed with the last-block flag, so truncating a chunk is detectable.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::str::FromStr;

use aead::stream::{DecryptorBE32, EncryptorBE32};
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::{Result, TrafficError};

/// Plaintext bytes per AEAD frame.
const AEAD_FRAME_LEN: usize = 64 << 10;
/// Frame length sanity bound when reading: plaintext + GCM tag.
const MAX_CIPHER_FRAME_LEN: usize = AEAD_FRAME_LEN + 64;

const ZSTD_LEVEL: i32 = 3;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EncryptMethod {
    #[default]
    None,
    Aes256Gcm,
}

impl EncryptMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            EncryptMethod::None => "none",
            EncryptMethod::Aes256Gcm => "aes256-gcm",
        }
    }
}

impl FromStr for EncryptMethod {
    type Err = TrafficError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "none" => Ok(EncryptMethod::None),
            // `aes256-ctr` is the spelling older tooling sends; the stored
            // stream has always been the GCM AEAD.
            "aes256-gcm" | "aes256-ctr" => Ok(EncryptMethod::Aes256Gcm),
            other => Err(TrafficError::Config(format!(
                "unknown encryption method {other:?}"
            ))),
        }
    }
}

impl std::fmt::Display for EncryptMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) fn generate_data_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    key
}

/// Wraps the per-capture data key with the environment-supplied key, for
/// storage in meta. Output is base64 of `nonce(12) · ciphertext`.
pub(crate) fn wrap_key(kek: &[u8], dek: &[u8; 32]) -> Result<String> {
    let cipher = key_cipher(kek)?;
    let mut nonce = [0u8; 12];
    OsRng.fill_bytes(&mut nonce);
    let ct = cipher
        .encrypt(Nonce::from_slice(&nonce), dek.as_slice())
        .map_err(|_| TrafficError::Crypto("wrapping data key failed".to_owned()))?;
    let mut out = nonce.to_vec();
    out.extend_from_slice(&ct);
    Ok(BASE64.encode(out))
}

pub(crate) fn unwrap_key(kek: &[u8], wrapped: &str) -> Result<[u8; 32]> {
    let cipher = key_cipher(kek)?;
    let raw = BASE64
        .decode(wrapped)
        .map_err(|e| TrafficError::Crypto(format!("wrapped key is not base64: {e}")))?;
    if raw.len() < 12 {
        return Err(TrafficError::Crypto("wrapped key too short".to_owned()));
    }
    let (nonce, ct) = raw.split_at(12);
    let dek = cipher
        .decrypt(Nonce::from_slice(nonce), ct)
        .map_err(|_| TrafficError::Crypto("unwrapping data key failed".to_owned()))?;
    dek.try_into()
        .map_err(|_| TrafficError::Crypto("data key has wrong length".to_owned()))
}

fn key_cipher(kek: &[u8]) -> Result<Aes256Gcm> {
    if kek.len() != 32 {
        return Err(TrafficError::Crypto(format!(
            "encryption key must be 32 bytes, got {}",
            kek.len()
        )));
    }
    Ok(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(kek)))
}

fn aead_io_err(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("aead failure: {what}"))
}

/// Buffers plaintext into fixed frames and seals each with the stream
/// cipher. The final short frame is sealed by [`AeadWriter::finish`] with
/// the last-block flag.
pub(crate) struct AeadWriter<W: Write> {
    inner: W,
    enc: Option<EncryptorBE32<Aes256Gcm>>,
    buf: Vec<u8>,
}

impl<W: Write> AeadWriter<W> {
    pub(crate) fn new(mut inner: W, key: &[u8; 32]) -> io::Result<Self> {
        let mut nonce = [0u8; 7];
        OsRng.fill_bytes(&mut nonce);
        inner.write_all(&nonce)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        let enc = EncryptorBE32::from_aead(cipher, GenericArray::from_slice(&nonce));
        Ok(AeadWriter {
            inner,
            enc: Some(enc),
            buf: Vec::with_capacity(AEAD_FRAME_LEN),
        })
    }

    fn seal_full_frames(&mut self) -> io::Result<()> {
        while self.buf.len() >= AEAD_FRAME_LEN {
            let rest = self.buf.split_off(AEAD_FRAME_LEN);
            let frame = std::mem::replace(&mut self.buf, rest);
            let ct = self
                .enc
                .as_mut()
                .ok_or_else(|| aead_io_err("writer finished"))?
                .encrypt_next(frame.as_slice())
                .map_err(|_| aead_io_err("sealing frame"))?;
            self.write_frame(&ct)?;
        }
        Ok(())
    }

    fn write_frame(&mut self, ct: &[u8]) -> io::Result<()> {
        self.inner.write_all(&(ct.len() as u32).to_le_bytes())?;
        self.inner.write_all(ct)
    }

    pub(crate) fn finish(mut self) -> io::Result<W> {
        let enc = self
            .enc
            .take()
            .ok_or_else(|| aead_io_err("writer finished twice"))?;
        let ct = enc
            .encrypt_last(self.buf.as_slice())
            .map_err(|_| aead_io_err("sealing final frame"))?;
        self.write_frame(&ct)?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for AeadWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        self.seal_full_frames()?;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        // Partial frames cannot be sealed mid-stream without breaking the
        // framing; only the underlying writer is flushed here.
        self.inner.flush()
    }
}

/// Streaming decryptor. A frame is only released once the following length
/// prefix (or EOF) has been seen, so the final frame is verified with the
/// last-block flag.
pub(crate) struct AeadReader<R: Read> {
    inner: R,
    dec: Option<DecryptorBE32<Aes256Gcm>>,
    pending: Option<Vec<u8>>,
    primed: bool,
    done: bool,
    out: Vec<u8>,
    out_pos: usize,
}

impl<R: Read> AeadReader<R> {
    pub(crate) fn new(mut inner: R, key: &[u8; 32]) -> io::Result<Self> {
        let mut nonce = [0u8; 7];
        inner.read_exact(&mut nonce)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        let dec = DecryptorBE32::from_aead(cipher, GenericArray::from_slice(&nonce));
        Ok(AeadReader {
            inner,
            dec: Some(dec),
            pending: None,
            primed: false,
            done: false,
            out: Vec::new(),
            out_pos: 0,
        })
    }

    /// Reads one raw ciphertext frame; `None` on clean EOF.
    fn read_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut len_buf = [0u8; 4];
        let mut filled = 0;
        while filled < 4 {
            let n = self.inner.read(&mut len_buf[filled..])?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated frame length",
                ));
            }
            filled += n;
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_CIPHER_FRAME_LEN {
            return Err(aead_io_err("frame length out of range"));
        }
        let mut ct = vec![0u8; len];
        self.inner.read_exact(&mut ct)?;
        Ok(Some(ct))
    }

    fn refill(&mut self) -> io::Result<()> {
        if !self.primed {
            self.pending = self.read_frame()?;
            self.primed = true;
        }
        let cur = match self.pending.take() {
            Some(cur) => cur,
            None => {
                // A well-formed stream always ends with a last-flag frame;
                // no frames at all means the chunk was truncated at birth.
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "encrypted chunk has no frames",
                ));
            }
        };
        let next = self.read_frame()?;
        if let Some(next) = next {
            self.out = self
                .dec
                .as_mut()
                .ok_or_else(|| aead_io_err("reader finished"))?
                .decrypt_next(cur.as_slice())
                .map_err(|_| aead_io_err("frame authentication"))?;
            self.pending = Some(next);
        } else {
            let dec = self
                .dec
                .take()
                .ok_or_else(|| aead_io_err("reader finished twice"))?;
            self.out = dec
                .decrypt_last(cur.as_slice())
                .map_err(|_| aead_io_err("final frame authentication"))?;
            self.done = true;
        }
        self.out_pos = 0;
        Ok(())
    }
}

impl<R: Read> Read for AeadReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.out_pos < self.out.len() {
                let n = (self.out.len() - self.out_pos).min(buf.len());
                buf[..n].copy_from_slice(&self.out[self.out_pos..self.out_pos + n]);
                self.out_pos += n;
                return Ok(n);
            }
            if self.done {
                return Ok(0);
            }
            self.refill()?;
        }
    }
}

/// Writer-side codec stack for one chunk file.
pub(crate) enum ChunkSink {
    Plain(BufWriter<File>),
    Zstd(zstd::stream::write::Encoder<'static, BufWriter<File>>),
    Aead(AeadWriter<BufWriter<File>>),
    ZstdAead(zstd::stream::write::Encoder<'static, AeadWriter<BufWriter<File>>>),
}

impl ChunkSink {
    pub(crate) fn create(path: &Path, compress: bool, key: Option<&[u8; 32]>) -> Result<ChunkSink> {
        let file = BufWriter::new(File::create(path)?);
        Ok(match (compress, key) {
            (false, None) => ChunkSink::Plain(file),
            (true, None) => ChunkSink::Zstd(zstd::stream::write::Encoder::new(file, ZSTD_LEVEL)?),
            (false, Some(key)) => ChunkSink::Aead(AeadWriter::new(file, key)?),
            (true, Some(key)) => ChunkSink::ZstdAead(zstd::stream::write::Encoder::new(
                AeadWriter::new(file, key)?,
                ZSTD_LEVEL,
            )?),
        })
    }

    pub(crate) fn finish(self) -> Result<()> {
        match self {
            ChunkSink::Plain(mut w) => w.flush()?,
            ChunkSink::Zstd(enc) => {
                let mut w = enc.finish()?;
                w.flush()?;
            }
            ChunkSink::Aead(w) => {
                w.finish()?;
            }
            ChunkSink::ZstdAead(enc) => {
                enc.finish()?.finish()?;
            }
        }
        Ok(())
    }
}

impl Write for ChunkSink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match self {
            ChunkSink::Plain(w) => w.write(data),
            ChunkSink::Zstd(w) => w.write(data),
            ChunkSink::Aead(w) => w.write(data),
            ChunkSink::ZstdAead(w) => w.write(data),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            ChunkSink::Plain(w) => w.flush(),
            ChunkSink::Zstd(w) => w.flush(),
            ChunkSink::Aead(w) => w.flush(),
            ChunkSink::ZstdAead(w) => w.flush(),
        }
    }
}

/// Reader-side codec stack for one chunk file.
pub(crate) enum ChunkSource {
    Plain(BufReader<File>),
    Zstd(zstd::stream::read::Decoder<'static, BufReader<File>>),
    Aead(AeadReader<BufReader<File>>),
    ZstdAead(zstd::stream::read::Decoder<'static, BufReader<AeadReader<BufReader<File>>>>),
}

impl ChunkSource {
    pub(crate) fn open(path: &Path, compress: bool, key: Option<&[u8; 32]>) -> Result<ChunkSource> {
        let file = File::open(path)?;
        Ok(match (compress, key) {
            (false, None) => ChunkSource::Plain(BufReader::new(file)),
            (true, None) => ChunkSource::Zstd(zstd::stream::read::Decoder::new(file)?),
            (false, Some(key)) => ChunkSource::Aead(AeadReader::new(BufReader::new(file), key)?),
            (true, Some(key)) => ChunkSource::ZstdAead(zstd::stream::read::Decoder::new(
                AeadReader::new(BufReader::new(file), key)?,
            )?),
        })
    }
}

impl Read for ChunkSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ChunkSource::Plain(r) => r.read(buf),
            ChunkSource::Zstd(r) => r.read(buf),
            ChunkSource::Aead(r) => r.read(buf),
            ChunkSource::ZstdAead(r) => r.read(buf),
        }
    }
}
