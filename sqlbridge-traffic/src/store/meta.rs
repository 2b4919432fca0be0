use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::META_FILE;
use crate::Result;

/// Sidecar describing a capture. Written when capture starts, updated on
/// every chunk rotation, finalized on stop; an aborted capture leaves a
/// partially filled meta behind, which the loader still accepts.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Total command count across all chunks, tombstones included.
    pub cmds: u64,
    pub version: String,
    /// Chunk file names in record order.
    pub chunks: Vec<String>,
    pub compress: bool,
    /// `none` or `aes256-gcm`.
    pub encrypt_method: String,
    /// Base64 of the wrapped per-capture data key, present when encrypted.
    pub encrypted_key: Option<String>,
}

impl Meta {
    pub fn write(&self, dir: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        // Write-then-rename so a crash mid-write cannot damage an existing
        // meta.
        let tmp = dir.join(format!("{META_FILE}.tmp"));
        fs::write(&tmp, data)?;
        fs::rename(&tmp, dir.join(META_FILE))?;
        Ok(())
    }

    pub fn read(dir: &Path) -> Result<Meta> {
        let data = fs::read(dir.join(META_FILE))?;
        Ok(serde_json::from_slice(&data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let meta = Meta {
            start_time: Some(Utc::now()),
            end_time: Some(Utc::now()),
            cmds: 12,
            version: env!("CARGO_PKG_VERSION").to_owned(),
            chunks: vec!["chunk-00001.log.zst".to_owned()],
            compress: true,
            encrypt_method: "none".to_owned(),
            encrypted_key: None,
        };
        meta.write(dir.path()).unwrap();
        assert_eq!(Meta::read(dir.path()).unwrap(), meta);
    }

    #[test]
    fn missing_meta_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Meta::read(dir.path()).is_err());
    }
}
