//! Traffic capture and replay for a MySQL-compatible proxy.
//!
//! Capture side: proxy sessions hand finished commands to the
//! [`capture::Capture`] controller, which redacts sensitive statements,
//! enforces a byte budget, and streams them through the chunked
//! [`store`] (optionally zstd-compressed and AEAD-encrypted). Replay side:
//! the [`replay::Replay`] engine reads the chunks back, re-paces commands by
//! their captured timestamps, and drives them against a target cluster with
//! one worker per captured connection.

pub mod capture;
pub mod conn;
pub mod filter;
pub mod manager;
pub mod replay;
pub mod report;
pub mod store;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrafficError {
    #[error("invalid job config: {0}")]
    Config(String),
    #[error("a traffic job is already running: {0}")]
    JobRunning(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("meta file damaged: {0}")]
    Meta(#[from] serde_json::Error),
    #[error(transparent)]
    Wire(#[from] sqlbridge_wire::WireError),
    #[error("encryption failure: {0}")]
    Crypto(String),
    #[error("shutting down")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, TrafficError>;
