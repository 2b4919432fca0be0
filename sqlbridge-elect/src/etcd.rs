//! Thin helpers over the etcd client: bounded-retry reads with a per-op
//! timeout.

use std::time::Duration;

use etcd_client::{Client, GetOptions, SortOrder, SortTarget};
use sqlbridge_util::retry::{retry, RetryPolicy};

use crate::{ElectError, Result};

/// One key-value entry from a prefix read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: String,
    pub create_revision: i64,
}

/// Reads all keys under `prefix`, sorted ascending by create-revision,
/// retrying transient failures per `policy`. Each attempt is bounded by
/// `timeout`.
pub async fn get_kvs(
    client: &Client,
    prefix: &str,
    timeout: Duration,
    policy: RetryPolicy,
) -> Result<Vec<KvEntry>> {
    let opts = GetOptions::new()
        .with_prefix()
        .with_sort(SortTarget::Create, SortOrder::Ascend);
    retry(policy, is_retryable, || {
        let mut kv = client.kv_client();
        let opts = opts.clone();
        async move {
            let resp = tokio::time::timeout(timeout, kv.get(prefix, Some(opts)))
                .await
                .map_err(|_| ElectError::Timeout(timeout))??;
            let mut entries = Vec::with_capacity(resp.kvs().len());
            for kv in resp.kvs() {
                entries.push(KvEntry {
                    key: kv.key_str()?.to_owned(),
                    value: kv.value_str()?.to_owned(),
                    create_revision: kv.create_revision(),
                });
            }
            Ok(entries)
        }
    })
    .await
}

pub(crate) fn is_retryable(err: &ElectError) -> bool {
    match err {
        ElectError::Timeout(_) => true,
        ElectError::Etcd(e) => matches!(
            e,
            etcd_client::Error::GRpcStatus(_)
                | etcd_client::Error::IoError(_)
                | etcd_client::Error::TransportError(_)
        ),
        _ => false,
    }
}
