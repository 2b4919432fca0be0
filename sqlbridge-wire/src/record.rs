use bytes::Bytes;

use crate::{CommandType, Result, WireError};

/// A single captured command.
///
/// Chunk files are a sequence of `uvarint(record_len) · record_bytes`;
/// [`CommandRecord::encode`] produces `record_bytes` and the store writes the
/// outer length prefix. Record layout:
///
/// ```text
/// uvarint(conn_id) · i64le(start_ts_unix_nanos) · u8(command) ·
/// uvarint(payload_len) · payload · uvarint(db_len) · db
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandRecord {
    /// Session identifier assigned by the proxy; the replay partition key.
    pub conn_id: u64,
    /// Wall-clock nanoseconds since the epoch when the proxy received the
    /// command.
    pub start_ts: i64,
    pub cmd: CommandType,
    /// The command's MySQL body, without the leading command byte.
    pub payload: Bytes,
    /// Current schema at capture time; empty if none.
    pub db: String,
}

impl CommandRecord {
    pub fn encode(&self, out: &mut Vec<u8>) {
        put_uvarint(out, self.conn_id);
        out.extend_from_slice(&self.start_ts.to_le_bytes());
        out.push(self.cmd.as_byte());
        put_uvarint(out, self.payload.len() as u64);
        out.extend_from_slice(&self.payload);
        put_uvarint(out, self.db.len() as u64);
        out.extend_from_slice(self.db.as_bytes());
    }

    pub fn encoded_len(&self) -> usize {
        uvarint_len(self.conn_id)
            + 8
            + 1
            + uvarint_len(self.payload.len() as u64)
            + self.payload.len()
            + uvarint_len(self.db.len() as u64)
            + self.db.len()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        let conn_id = get_uvarint(&mut buf)?;
        if buf.len() < 9 {
            return Err(WireError::Truncated("timestamp/command"));
        }
        let (ts_bytes, rest) = buf.split_at(8);
        let start_ts = i64::from_le_bytes(ts_bytes.try_into().expect("split_at(8)"));
        let cmd = CommandType::from_byte(rest[0])?;
        buf = &rest[1..];

        let payload_len = get_uvarint(&mut buf)? as usize;
        if buf.len() < payload_len {
            return Err(WireError::Truncated("payload"));
        }
        let (payload, rest) = buf.split_at(payload_len);
        let payload = Bytes::copy_from_slice(payload);
        buf = rest;

        let db_len = get_uvarint(&mut buf)? as usize;
        if buf.len() < db_len {
            return Err(WireError::Truncated("db"));
        }
        let db = std::str::from_utf8(&buf[..db_len])
            .map_err(|_| WireError::InvalidUtf8("db"))?
            .to_owned();

        Ok(CommandRecord {
            conn_id,
            start_ts,
            cmd,
            payload,
            db,
        })
    }

    /// The prepared-statement id this command refers to, when it has one
    /// (`StmtExecute`, `StmtClose`, `StmtReset`, `StmtSendLongData`,
    /// `StmtFetch` all lead with a 4-byte id).
    pub fn prepared_stmt_id(&self) -> Option<u32> {
        match self.cmd {
            CommandType::StmtExecute
            | CommandType::StmtClose
            | CommandType::StmtReset
            | CommandType::StmtSendLongData
            | CommandType::StmtFetch => self
                .payload
                .get(..4)
                .map(|b| u32::from_le_bytes(b.try_into().expect("get(..4)"))),
            _ => None,
        }
    }
}

/// Appends `v` to `out` as an unsigned LEB128 varint.
pub fn put_uvarint(out: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        out.push((v as u8) | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
}

/// Reads an unsigned LEB128 varint from the front of `buf`, advancing it.
pub fn get_uvarint(buf: &mut &[u8]) -> Result<u64> {
    let mut v = 0u64;
    let mut shift = 0u32;
    loop {
        let &b = buf.first().ok_or(WireError::Truncated("varint"))?;
        *buf = &buf[1..];
        if shift == 63 && b > 1 {
            return Err(WireError::VarintOverflow);
        }
        v |= u64::from(b & 0x7f) << shift;
        if b < 0x80 {
            return Ok(v);
        }
        shift += 7;
        if shift > 63 {
            return Err(WireError::VarintOverflow);
        }
    }
}

fn uvarint_len(v: u64) -> usize {
    (((64 - v.max(1).leading_zeros()) + 6) / 7) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn record(conn_id: u64, cmd: CommandType, payload: &[u8], db: &str) -> CommandRecord {
        CommandRecord {
            conn_id,
            start_ts: 1_700_000_000_000_000_000,
            cmd,
            payload: Bytes::copy_from_slice(payload),
            db: db.to_owned(),
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let r = record(42, CommandType::Query, b"SELECT 1", "test");
        let mut out = Vec::new();
        r.encode(&mut out);
        assert_eq!(out.len(), r.encoded_len());
        assert_eq!(CommandRecord::decode(&out).unwrap(), r);
    }

    #[test]
    fn empty_payload_and_db() {
        let r = record(1, CommandType::Quit, b"", "");
        let mut out = Vec::new();
        r.encode(&mut out);
        assert_eq!(CommandRecord::decode(&out).unwrap(), r);
    }

    #[test]
    fn truncated_record_is_rejected() {
        let r = record(7, CommandType::Query, b"SELECT 2", "db");
        let mut out = Vec::new();
        r.encode(&mut out);
        for cut in 0..out.len() {
            assert!(CommandRecord::decode(&out[..cut]).is_err());
        }
    }

    #[test]
    fn stmt_id_extraction() {
        let mut payload = 5u32.to_le_bytes().to_vec();
        payload.extend_from_slice(&[0x00, 0x01, 0x00, 0x00, 0x00]);
        let r = record(1, CommandType::StmtExecute, &payload, "");
        assert_eq!(r.prepared_stmt_id(), Some(5));
        assert_eq!(
            record(1, CommandType::Query, b"SELECT 1", "").prepared_stmt_id(),
            None
        );
    }

    #[test]
    fn varint_overflow_is_rejected() {
        let mut buf: &[u8] = &[0xff; 11];
        assert!(get_uvarint(&mut buf).is_err());
    }

    proptest! {
        #[test]
        fn uvarint_round_trip(v in any::<u64>()) {
            let mut out = Vec::new();
            put_uvarint(&mut out, v);
            prop_assert_eq!(out.len(), uvarint_len(v));
            let mut slice = out.as_slice();
            prop_assert_eq!(get_uvarint(&mut slice).unwrap(), v);
            prop_assert!(slice.is_empty());
        }

        #[test]
        fn record_round_trip(conn_id in any::<u64>(), ts in any::<i64>(),
                             payload in proptest::collection::vec(any::<u8>(), 0..256),
                             db in "[a-z0-9_]{0,16}") {
            let r = CommandRecord {
                conn_id,
                start_ts: ts,
                cmd: CommandType::Query,
                payload: Bytes::from(payload),
                db,
            };
            let mut out = Vec::new();
            r.encode(&mut out);
            prop_assert_eq!(CommandRecord::decode(&out).unwrap(), r);
        }
    }
}
