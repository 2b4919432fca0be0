use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, PutOptions};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use sqlbridge_util::retry::RetryPolicy;
use sqlbridge_util::shutdown::{self, ShutdownReceiver, ShutdownSender};

use crate::etcd::get_kvs;
use crate::{ElectError, Result};

/// Narrow capability through which the election reports ownership changes.
/// Components hold the election; the election only holds this.
#[async_trait]
pub trait ElectionObserver: Send + Sync {
    async fn on_elected(&self);
    async fn on_retired(&self);
}

#[derive(Clone, Copy, Debug)]
pub struct ElectionConfig {
    /// etcd session TTL. Ownership is checked every TTL/3 alongside the
    /// lease keep-alive.
    pub session_ttl: Duration,
    /// Per-operation etcd timeout.
    pub timeout: Duration,
    pub retry_cnt: usize,
    pub retry_interval: Duration,
}

impl ElectionConfig {
    /// Defaults matching the original deployment: short TTL for VIP-style
    /// fast failover, long TTL for metric readers.
    pub fn with_ttl(session_ttl: Duration) -> Self {
        Self {
            session_ttl,
            timeout: Duration::from_secs(3),
            retry_cnt: 3,
            retry_interval: Duration::from_secs(1),
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_cnt, self.retry_interval)
    }
}

/// A campaign for one election key.
///
/// Each campaigner writes `<key>/<lease id>` with its own session lease; the
/// entry with the smallest create-revision owns the key. The background
/// session task keeps the lease alive, re-checks ownership every TTL/3, and
/// rebuilds the session with backoff when it is lost. The first check after
/// [`Election::start`] always reports the current state through the
/// observer.
pub struct Election {
    inner: Arc<Inner>,
    shutdown: Option<ShutdownSender>,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    id: String,
    key: String,
    cfg: ElectionConfig,
    client: Client,
    observer: Arc<dyn ElectionObserver>,
    is_owner: AtomicBool,
    // None until the first ownership check has reported.
    last_reported: Mutex<Option<bool>>,
    lease_id: Mutex<Option<i64>>,
}

impl Election {
    /// `id` is this peer's status address; it becomes the value of the
    /// campaign key so other peers can reach us once we own it.
    pub fn new(
        client: Client,
        cfg: ElectionConfig,
        id: impl Into<String>,
        key: impl Into<String>,
        observer: Arc<dyn ElectionObserver>,
    ) -> Self {
        Election {
            inner: Arc::new(Inner {
                id: id.into(),
                key: key.into(),
                cfg,
                client,
                observer,
                is_owner: AtomicBool::new(false),
                last_reported: Mutex::new(None),
                lease_id: Mutex::new(None),
            }),
            shutdown: None,
            task: None,
        }
    }

    /// Starts the background session task. Campaigning never blocks the
    /// caller.
    pub fn start(&mut self) {
        let (tx, rx) = shutdown::channel();
        let inner = Arc::clone(&self.inner);
        self.task = Some(tokio::spawn(async move {
            inner.run_sessions(rx).await;
        }));
        self.shutdown = Some(tx);
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn is_owner(&self) -> bool {
        self.inner.is_owner.load(Ordering::Acquire)
    }

    /// Address of the current owner of this key, if any.
    pub async fn owner_id(&self) -> Result<Option<String>> {
        let prefix = format!("{}/", self.inner.key);
        let entries = get_kvs(
            &self.inner.client,
            &prefix,
            self.inner.cfg.timeout,
            self.inner.cfg.retry_policy(),
        )
        .await?;
        Ok(entries.into_iter().next().map(|e| e.value))
    }

    /// Whether a campaign entry carrying this peer's id currently owns the
    /// key. Unlike the session task's ownership check this inspects keys
    /// already in etcd, so a node that restarted within its old lease's TTL
    /// sees its own lingering ownership before campaigning again.
    pub async fn is_current_owner(&self) -> Result<bool> {
        Ok(self.owner_id().await?.as_deref() == Some(self.inner.id.as_str()))
    }

    /// Stops campaigning, revokes the lease, and reports retirement if we
    /// owned the key. Idempotent.
    pub async fn close(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            tx.shutdown().await;
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        let lease = self.inner.lease_id.lock().await.take();
        if let Some(lease) = lease {
            let mut lease_client = self.inner.client.lease_client();
            if let Err(e) = lease_client.revoke(lease).await {
                debug!(%e, key = %self.inner.key, "revoking election lease failed");
            }
        }
        if self.inner.is_owner.load(Ordering::Acquire) {
            self.inner.report(false).await;
        } else {
            // Mark retired without a callback: we were never elected (or
            // already reported retirement).
            *self.inner.last_reported.lock().await = Some(false);
        }
    }
}

impl Inner {
    async fn run_sessions(self: Arc<Self>, mut rx: ShutdownReceiver) {
        let mut backoff = self.cfg.retry_interval;
        loop {
            let outcome = self.run_one_session(&mut rx).await;
            // The session is gone; whatever we owned is no longer ours.
            self.report(false).await;
            match outcome {
                SessionEnd::Shutdown => break,
                SessionEnd::Lost(e) => {
                    warn!(%e, key = %self.key, "election session lost, restarting");
                }
            }
            tokio::select! {
                _ = rx.recv() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.cfg.session_ttl);
        }
    }

    async fn run_one_session(&self, rx: &mut ShutdownReceiver) -> SessionEnd {
        let ttl_secs = self.cfg.session_ttl.as_secs().max(1) as i64;
        let mut lease_client = self.client.lease_client();
        let lease = match self.bounded(lease_client.grant(ttl_secs, None)).await {
            Ok(resp) => resp.id(),
            Err(e) => return SessionEnd::Lost(e),
        };
        *self.lease_id.lock().await = Some(lease);

        let campaign_key = format!("{}/{:x}", self.key, lease);
        let mut kv_client = self.client.kv_client();
        let put = self
            .bounded(kv_client.put(
                campaign_key.clone(),
                self.id.clone(),
                Some(PutOptions::new().with_lease(lease)),
            ))
            .await;
        if let Err(e) = put {
            return SessionEnd::Lost(e);
        }
        debug!(key = %campaign_key, id = %self.id, "campaigning");

        let (mut keeper, mut keepalive_stream) = match self
            .bounded(lease_client.keep_alive(lease))
            .await
        {
            Ok(pair) => pair,
            Err(e) => return SessionEnd::Lost(e),
        };

        let mut tick = tokio::time::interval(self.cfg.session_ttl / 3);
        loop {
            tokio::select! {
                _ = rx.recv() => return SessionEnd::Shutdown,
                _ = tick.tick() => {}
            }
            if let Err(e) = self.bounded(keeper.keep_alive()).await {
                return SessionEnd::Lost(e);
            }
            match self.bounded(keepalive_stream.message()).await {
                Ok(Some(resp)) if resp.ttl() > 0 => {}
                Ok(_) => {
                    return SessionEnd::Lost(ElectError::LeaseExpired);
                }
                Err(e) => return SessionEnd::Lost(e),
            }
            match self.check_owner(&campaign_key).await {
                Ok(owner) => self.report(owner).await,
                Err(e) => {
                    // A failed read is not a lost session; keep the lease
                    // alive and try again next tick.
                    debug!(%e, key = %self.key, "ownership check failed");
                }
            }
        }
    }

    /// Bounds an etcd call by the configured op timeout so a hung endpoint
    /// cannot stall the session task past cancellation.
    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = std::result::Result<T, etcd_client::Error>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.cfg.timeout, fut).await {
            Ok(out) => out.map_err(ElectError::Etcd),
            Err(_) => Err(ElectError::Timeout(self.cfg.timeout)),
        }
    }

    async fn check_owner(&self, campaign_key: &str) -> Result<bool> {
        let prefix = format!("{}/", self.key);
        let entries = get_kvs(
            &self.client,
            &prefix,
            self.cfg.timeout,
            self.cfg.retry_policy(),
        )
        .await?;
        Ok(entries
            .first()
            .map(|e| e.key == campaign_key)
            .unwrap_or(false))
    }

    async fn report(&self, owner: bool) {
        let mut last = self.last_reported.lock().await;
        if *last == Some(owner) {
            return;
        }
        *last = Some(owner);
        self.is_owner.store(owner, Ordering::Release);
        drop(last);
        if owner {
            info!(key = %self.key, id = %self.id, "elected as owner");
            self.observer.on_elected().await;
        } else {
            info!(key = %self.key, id = %self.id, "retired from ownership");
            self.observer.on_retired().await;
        }
    }
}

enum SessionEnd {
    Shutdown,
    Lost(ElectError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingObserver {
        elected: AtomicUsize,
        retired: AtomicUsize,
    }

    impl CountingObserver {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                elected: AtomicUsize::new(0),
                retired: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ElectionObserver for CountingObserver {
        async fn on_elected(&self) {
            self.elected.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_retired(&self) {
            self.retired.fetch_add(1, Ordering::SeqCst);
        }
    }

    // Channels are established lazily, so a client pointed at a dead
    // endpoint works for tests that never issue an etcd request.
    async fn inner_for_test(observer: Arc<CountingObserver>) -> Arc<Inner> {
        let client = Client::connect(["http://127.0.0.1:1"], None)
            .await
            .expect("lazy connect");
        Arc::new(Inner {
            id: "127.0.0.1:6100".to_owned(),
            key: "/tiproxy/metric_reader/owner".to_owned(),
            cfg: ElectionConfig::with_ttl(Duration::from_secs(30)),
            client,
            observer,
            is_owner: AtomicBool::new(false),
            last_reported: Mutex::new(None),
            lease_id: Mutex::new(None),
        })
    }

    #[tokio::test]
    async fn report_fires_once_per_transition() {
        let observer = CountingObserver::new();
        let inner = inner_for_test(Arc::clone(&observer)).await;

        inner.report(true).await;
        inner.report(true).await;
        assert_eq!(observer.elected.load(Ordering::SeqCst), 1);
        assert!(inner.is_owner.load(Ordering::SeqCst));

        inner.report(false).await;
        inner.report(false).await;
        assert_eq!(observer.retired.load(Ordering::SeqCst), 1);
        assert!(!inner.is_owner.load(Ordering::SeqCst));

        inner.report(true).await;
        assert_eq!(observer.elected.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn first_report_reflects_current_state() {
        let observer = CountingObserver::new();
        let inner = inner_for_test(Arc::clone(&observer)).await;

        // A non-owner first check still produces a callback.
        inner.report(false).await;
        assert_eq!(observer.retired.load(Ordering::SeqCst), 1);
        assert_eq!(observer.elected.load(Ordering::SeqCst), 0);
    }
}
