//! Wire-level types shared by the capture and replay paths: MySQL command
//! tags, the length-prefixed capture record codec, and binary
//! `COM_STMT_EXECUTE` parameter decoding.

mod command;
mod record;
pub mod stmt;

pub use command::CommandType;
pub use record::{get_uvarint, put_uvarint, CommandRecord};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("truncated record: {0}")]
    Truncated(&'static str),
    #[error("unknown command byte {0:#04x}")]
    UnknownCommand(u8),
    #[error("varint overflows u64")]
    VarintOverflow,
    #[error("invalid utf8 in {0}")]
    InvalidUtf8(&'static str),
    #[error("malformed statement payload: {0}")]
    MalformedStmt(String),
}

pub type Result<T> = std::result::Result<T, WireError>;
