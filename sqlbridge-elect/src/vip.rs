//! Virtual-IP failover riding on the election.
//!
//! The elected peer binds the virtual IP to its interface and broadcasts
//! gratuitous ARP; a retired peer removes it. The netlink work itself lives
//! behind [`NetworkOps`] since it is platform plumbing supplied by the
//! embedding process.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::Client;
use metrics::gauge;
use tracing::{error, info, warn};

use crate::election::{Election, ElectionConfig, ElectionObserver};
use crate::Result;

pub const VIP_KEY: &str = "/tiproxy/vip/owner";
/// Short TTL so the address moves quickly when the owner dies.
pub const VIP_SESSION_TTL: Duration = Duration::from_secs(5);

const VIP_OWNER_GAUGE: &str = "sqlbridge_vip_owner";

/// Interface-level operations for holding a virtual IP.
#[async_trait]
pub trait NetworkOps: Send + Sync {
    async fn has_ip(&self) -> Result<bool>;
    async fn add_ip(&self) -> Result<()>;
    async fn delete_ip(&self) -> Result<()>;
    async fn send_arp(&self) -> Result<()>;
}

pub struct VipManager {
    election: Election,
    observer: Arc<VipObserver>,
}

impl VipManager {
    /// `id` is this peer's advertised address (the election key's value).
    pub fn new(client: Client, id: impl Into<String>, ops: Arc<dyn NetworkOps>) -> Self {
        let observer = Arc::new(VipObserver { ops });
        let election = Election::new(
            client,
            ElectionConfig::with_ttl(VIP_SESSION_TTL),
            id,
            VIP_KEY,
            Arc::clone(&observer) as Arc<dyn ElectionObserver>,
        );
        VipManager { election, observer }
    }

    /// Settles the address state, then starts campaigning. The node is
    /// checked against etcd first: if it just restarted it may still own
    /// the key under its old lease, or hold a stale address it must drop.
    pub async fn start(&mut self) {
        let owner = match self.election.is_current_owner().await {
            Ok(owner) => owner,
            Err(e) => {
                warn!(%e, "checking current VIP ownership failed");
                false
            }
        };
        if owner {
            self.observer.on_elected().await;
        } else {
            self.observer.on_retired().await;
        }
        self.election.start();
    }

    pub fn is_owner(&self) -> bool {
        self.election.is_owner()
    }

    pub async fn close(&mut self) {
        self.election.close().await;
    }
}

struct VipObserver {
    ops: Arc<dyn NetworkOps>,
}

#[async_trait]
impl ElectionObserver for VipObserver {
    async fn on_elected(&self) {
        gauge!(VIP_OWNER_GAUGE, 1.0);
        match self.ops.has_ip().await {
            Ok(true) => {
                info!("already holds the virtual IP");
                return;
            }
            Ok(false) => {}
            Err(e) => {
                error!(%e, "checking virtual IP failed");
                return;
            }
        }
        if let Err(e) = self.ops.add_ip().await {
            error!(%e, "adding virtual IP failed");
            return;
        }
        if let Err(e) = self.ops.send_arp().await {
            error!(%e, "broadcasting ARP failed");
            return;
        }
        info!("virtual IP acquired");
    }

    async fn on_retired(&self) {
        gauge!(VIP_OWNER_GAUGE, 0.0);
        match self.ops.has_ip().await {
            Ok(false) => {
                info!("does not hold the virtual IP");
                return;
            }
            Ok(true) => {}
            Err(e) => {
                error!(%e, "checking virtual IP failed");
                return;
            }
        }
        if let Err(e) = self.ops.delete_ip().await {
            error!(%e, "deleting virtual IP failed");
            return;
        }
        info!("virtual IP released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeNet {
        bound: AtomicBool,
        arps: AtomicUsize,
    }

    #[async_trait]
    impl NetworkOps for FakeNet {
        async fn has_ip(&self) -> Result<bool> {
            Ok(self.bound.load(Ordering::SeqCst))
        }
        async fn add_ip(&self) -> Result<()> {
            self.bound.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn delete_ip(&self) -> Result<()> {
            self.bound.store(false, Ordering::SeqCst);
            Ok(())
        }
        async fn send_arp(&self) -> Result<()> {
            self.arps.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn elected_binds_and_broadcasts() {
        let net = Arc::new(FakeNet::default());
        let observer = VipObserver {
            ops: Arc::clone(&net) as Arc<dyn NetworkOps>,
        };
        observer.on_elected().await;
        assert!(net.bound.load(Ordering::SeqCst));
        assert_eq!(net.arps.load(Ordering::SeqCst), 1);

        // Re-election with the address already bound is a no-op.
        observer.on_elected().await;
        assert_eq!(net.arps.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retired_releases() {
        let net = Arc::new(FakeNet::default());
        net.bound.store(true, Ordering::SeqCst);
        let observer = VipObserver {
            ops: Arc::clone(&net) as Arc<dyn NetworkOps>,
        };
        observer.on_retired().await;
        assert!(!net.bound.load(Ordering::SeqCst));

        // Retiring without the address is a no-op.
        observer.on_retired().await;
        assert!(!net.bound.load(Ordering::SeqCst));
    }
}
