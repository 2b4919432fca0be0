//! On-disk layout for captured traffic.
//!
//! ```text
//! <output>/
//!   meta.json
//!   chunk-00001.log[.zst][.enc]
//!   chunk-00002.log[.zst][.enc]
//! ```
//!
//! Each chunk is a sequence of `uvarint(record_len) · record_bytes`,
//! optionally wrapped by zstd compression and then by an AEAD stream.

mod codec;
mod loader;
mod meta;
mod writer;

pub use codec::EncryptMethod;
pub use loader::{Loader, LoaderConfig};
pub use meta::Meta;
pub use writer::{spawn_writer, WriterConfig, WriterHandle};

pub const META_FILE: &str = "meta.json";

/// Rotate the current chunk once this much record data has been written.
pub const DEFAULT_CHUNK_BYTES: u64 = 64 << 20;
/// Rotate the current chunk after this long, even if it is small.
pub const DEFAULT_CHUNK_AGE: std::time::Duration = std::time::Duration::from_secs(600);
/// Byte budget for records queued between the proxy and the writer task.
pub const DEFAULT_WRITE_BUDGET: usize = 32 << 20;

pub(crate) fn chunk_file_name(index: u64, compress: bool, encrypt: bool) -> String {
    let mut name = format!("chunk-{index:05}.log");
    if compress {
        name.push_str(".zst");
    }
    if encrypt {
        name.push_str(".enc");
    }
    name
}
