//! etcd-backed leader election and the consumers that ride on it.
//!
//! Multiple peers campaign for the same election key by each writing
//! `<key>/<lease id>` under a session lease; the peer holding the entry with
//! the smallest create-revision owns the key. Observers get exactly one
//! callback per ownership transition.

mod election;
pub mod etcd;
mod vip;

pub use election::{Election, ElectionConfig, ElectionObserver};
pub use vip::{NetworkOps, VipManager, VIP_KEY, VIP_SESSION_TTL};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ElectError {
    #[error("etcd operation failed: {0}")]
    Etcd(#[from] etcd_client::Error),
    #[error("etcd operation timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("election session lease expired")]
    LeaseExpired,
    #[error("virtual IP operation failed: {0}")]
    Network(String),
}

pub type Result<T> = std::result::Result<T, ElectError>;
