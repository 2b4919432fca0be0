//! The backend reader: owner and follower roles plus the owner-discovery
//! glue.
//!
//! The owner for a scope scrapes backends directly and derives rule
//! histories; followers pull the marshalled history from every owner and
//! recompute results locally. One mutex guards rules, results, history and
//! the marshalled payload; it is never held across I/O.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::Mutex as AsyncMutex;
use tracing::error;

use sqlbridge_elect::etcd::{get_kvs, KvEntry};
use sqlbridge_elect::{Election, ElectionConfig, ElectionObserver};
use sqlbridge_util::retry::retry;

use crate::config::ReaderConfig;
use crate::history::{purge_history, BackendHistory, HistoryMap};
use crate::rule::{
    InstanceSample, InstanceSeries, MetricFamilies, MetricValue, QueryResult, QueryRule,
    ResultType,
};
use crate::topology::TopologyFetcher;
use crate::{MetricsError, Result};

const READER_OWNER_PREFIX: &str = "/tiproxy/metric_reader";
const READER_OWNER_SUFFIX: &str = "owner";
/// Long TTL: losing a reader owner briefly only delays metrics.
const READER_SESSION_TTL: Duration = Duration::from_secs(30);
const SCRAPE_CONCURRENCY: usize = 100;
const BACKEND_METRIC_PATH: &str = "/metrics";
const OWNER_METRIC_PATH: &str = "/api/backend/metrics";

/// Zone and advertised address of this peer, re-read every tick so a zone
/// assigned at runtime (k8s) is picked up.
pub trait ConfigProvider: Send + Sync {
    /// `host:statusPort`; the election value and scrape identity.
    fn status_address(&self) -> String;
    fn zone(&self) -> Option<String>;
}

struct OwnerFlag(Arc<AtomicBool>);

#[async_trait]
impl ElectionObserver for OwnerFlag {
    async fn on_elected(&self) {
        self.0.store(true, Ordering::Release);
    }
    async fn on_retired(&self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Default)]
struct ReaderState {
    rules: HashMap<String, QueryRule>,
    results: HashMap<String, QueryResult>,
    history: HistoryMap,
    marshalled: Vec<u8>,
}

pub struct BackendReader {
    state: Mutex<ReaderState>,
    is_owner: Arc<AtomicBool>,
    cfg: ReaderConfig,
    http: reqwest::Client,
    etcd: etcd_client::Client,
    topology: Arc<dyn TopologyFetcher>,
    config: Arc<dyn ConfigProvider>,
    election: AsyncMutex<Option<Election>>,
    last_zone: Mutex<Option<Option<String>>>,
}

impl BackendReader {
    pub fn new(
        cfg: ReaderConfig,
        etcd: etcd_client::Client,
        topology: Arc<dyn TopologyFetcher>,
        config: Arc<dyn ConfigProvider>,
    ) -> Self {
        let http = cfg.build_http_client();
        BackendReader {
            state: Mutex::new(ReaderState::default()),
            is_owner: Arc::new(AtomicBool::new(false)),
            cfg,
            http,
            etcd,
            topology,
            config,
            election: AsyncMutex::new(None),
            last_zone: Mutex::new(None),
        }
    }

    pub async fn start(&self) -> Result<()> {
        self.init_election().await;
        Ok(())
    }

    pub fn id(&self) -> String {
        self.config.status_address()
    }

    pub fn is_owner(&self) -> bool {
        self.is_owner.load(Ordering::Acquire)
    }

    pub fn add_query_rule(&self, key: impl Into<String>, rule: QueryRule) {
        let mut st = self.state.lock().expect("reader state poisoned");
        st.rules.insert(key.into(), rule);
    }

    pub fn remove_query_rule(&self, key: &str) {
        let mut st = self.state.lock().expect("reader state poisoned");
        st.rules.remove(key);
    }

    /// Empty result when the rule is unknown or has no data yet.
    pub fn get_query_result(&self, key: &str) -> QueryResult {
        let st = self.state.lock().expect("reader state poisoned");
        st.results.get(key).cloned().unwrap_or_default()
    }

    /// The payload served to followers at `/api/backend/metrics`.
    pub fn marshalled_history(&self) -> Vec<u8> {
        let st = self.state.lock().expect("reader state poisoned");
        st.marshalled.clone()
    }

    /// One coordinator tick: refresh the election if the zone moved, pull
    /// from every other owner, scrape what this peer owns, purge.
    pub async fn read_metrics(&self) -> Result<()> {
        let zone = self.config.zone();
        let zone_moved = {
            let last = self.last_zone.lock().expect("reader state poisoned");
            last.as_ref() != Some(&zone)
        };
        if zone_moved {
            self.close_election().await;
            self.init_election().await;
        }

        let (owned_zones, owners) = self.query_all_owners().await?;

        let own_id = self.id();
        let mut owner_errs = Vec::new();
        for owner in owners.iter().filter(|o| **o != own_id) {
            if let Err(e) = self.read_from_owner(owner).await {
                owner_errs.push(e.to_string());
            }
        }

        if self.is_owner() {
            let exclude: Vec<String> = owned_zones
                .into_iter()
                .filter(|z| Some(z) != zone.as_ref())
                .collect();
            self.read_from_backends(&exclude).await?;
        }

        self.purge();
        if !owner_errs.is_empty() {
            return Err(MetricsError::ReadFromOwner(owner_errs.join("; ")));
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.close_election().await;
    }

    async fn init_election(&self) {
        let zone = self.config.zone();
        let key = reader_owner_key(zone.as_deref());
        let mut election = Election::new(
            self.etcd.clone(),
            ElectionConfig::with_ttl(READER_SESSION_TTL),
            self.id(),
            key,
            Arc::new(OwnerFlag(Arc::clone(&self.is_owner))),
        );
        election.start();
        *self.election.lock().await = Some(election);
        *self.last_zone.lock().expect("reader state poisoned") = Some(zone);
    }

    async fn close_election(&self) {
        if let Some(mut election) = self.election.lock().await.take() {
            election.close().await;
        }
    }

    /// All current owners, global and zonal. The prefix read is sorted by
    /// create-revision, so the first entry seen per zone is its owner.
    async fn query_all_owners(&self) -> Result<(Vec<String>, Vec<String>)> {
        let entries = get_kvs(
            &self.etcd,
            READER_OWNER_PREFIX,
            self.cfg.metrics_timeout,
            self.cfg.retry_policy(),
        )
        .await?;
        Ok(classify_owners(&entries))
    }

    async fn read_from_backends(&self, exclude_zones: &[String]) -> Result<()> {
        let backends = self
            .topology
            .get_backends()
            .await
            .map_err(MetricsError::Topology)?;
        let addrs: Vec<String> = backends
            .iter()
            .filter(|b| match b.zone() {
                Some(zone) => !exclude_zones.iter().any(|z| z == zone),
                None => true,
            })
            .map(|b| b.status_addr())
            .collect();
        if addrs.is_empty() {
            return Ok(());
        }
        let all_names = self.collect_all_names();
        if all_names.is_empty() {
            return Ok(());
        }

        futures::stream::iter(addrs.clone())
            .for_each_concurrent(SCRAPE_CONCURRENCY, |addr| {
                let all_names = &all_names;
                async move {
                    match self.scrape_one(&addr, all_names).await {
                        Ok(families) => self.ingest_families(&addr, &families),
                        Err(e) => {
                            error!(addr = %addr, %e, "reading backend metrics failed");
                        }
                    }
                }
            })
            .await;

        if let Err(e) = self.marshal_history(&addrs) {
            error!(%e, "marshalling backend history failed");
        }
        Ok(())
    }

    fn collect_all_names(&self) -> Vec<String> {
        let st = self.state.lock().expect("reader state poisoned");
        let mut names = Vec::new();
        for rule in st.rules.values() {
            for name in &rule.names {
                if !names.contains(name) {
                    names.push(name.clone());
                }
            }
        }
        names
    }

    async fn scrape_one(&self, addr: &str, names: &[String]) -> Result<MetricFamilies> {
        let url = format!("http://{addr}{BACKEND_METRIC_PATH}");
        let body = self.fetch_with_retry(&url).await.map_err(|reason| {
            MetricsError::Scrape {
                addr: addr.to_owned(),
                reason,
            }
        })?;
        let filtered = filter_metrics(&body, names);
        parse_families(&filtered).map_err(|reason| MetricsError::Scrape {
            addr: addr.to_owned(),
            reason,
        })
    }

    async fn fetch_with_retry(&self, url: &str) -> std::result::Result<String, String> {
        retry(self.cfg.retry_policy(), is_retryable_http, || async {
            let resp = self
                .http
                .get(url)
                .send()
                .await
                .map_err(FetchError::Transport)?;
            let resp = resp.error_for_status().map_err(FetchError::Status)?;
            resp.text().await.map_err(FetchError::Transport)
        })
        .await
        .map_err(|e| e.to_string())
    }

    /// Owner step: raw families of one backend into the two-step history
    /// and this backend's slice of the results.
    pub(crate) fn ingest_families(&self, backend: &str, families: &MetricFamilies) {
        let now = Utc::now().timestamp_millis();
        let mut st = self.state.lock().expect("reader state poisoned");
        let st = &mut *st;

        for (rule_key, rule) in &st.rules {
            if !rule.names.iter().all(|n| families.contains_key(n)) {
                continue;
            }

            let v1 = (rule.metric2value)(families);
            if v1.is_nan() {
                continue;
            }
            let backend_history = st
                .history
                .entry(rule_key.clone())
                .or_insert_with(BTreeMap::new)
                .entry(backend.to_owned())
                .or_default();
            backend_history.step1.push(crate::rule::SamplePair {
                timestamp: now,
                value: v1,
            });

            let v2 = (rule.range2value)(&backend_history.step1);
            if v2.is_nan() {
                continue;
            }
            backend_history.step2.push(crate::rule::SamplePair {
                timestamp: now,
                value: v2,
            });
        }

        let values = history_to_value(&st.rules, &st.history, backend);
        merge_query_result(&mut st.results, values, backend);
    }

    /// Follower step: pulls one owner's marshalled history and folds it in.
    async fn read_from_owner(&self, owner_addr: &str) -> Result<()> {
        let url = format!("http://{owner_addr}{OWNER_METRIC_PATH}");
        let body = self
            .fetch_with_retry(&url)
            .await
            .map_err(MetricsError::ReadFromOwner)?;
        if body.is_empty() {
            return Ok(());
        }
        let new_history: HistoryMap =
            serde_json::from_str(&body).map_err(|e| MetricsError::ReadFromOwner(e.to_string()))?;
        self.apply_owner_history(new_history);
        Ok(())
    }

    /// Merges a pulled history and refreshes results for every backend it
    /// mentions. Also the path that seeds this peer's own history, so a
    /// follower that wins the next election starts warm.
    pub(crate) fn apply_owner_history(&self, new_history: HistoryMap) {
        let mut backends: HashSet<String> = HashSet::new();
        for rule_history in new_history.values() {
            for backend in rule_history.keys() {
                backends.insert(backend.clone());
            }
        }

        let mut st = self.state.lock().expect("reader state poisoned");
        let st = &mut *st;
        for (rule_key, new_rule_history) in new_history {
            let rule_history = st.history.entry(rule_key).or_insert_with(BTreeMap::new);
            for (backend, new_backend_history) in new_rule_history {
                rule_history
                    .entry(backend)
                    .or_default()
                    .merge_latest(new_backend_history);
            }
        }
        for backend in backends {
            let values = history_to_value(&st.rules, &st.history, &backend);
            merge_query_result(&mut st.results, values, &backend);
        }
    }

    /// Drops expired samples and dead entries; memory stays bounded by
    /// retention. A `(rule, backend)` whose history expired (the backend is
    /// likely down) also disappears from the exposed result, so instance
    /// labels track live backends.
    fn purge(&self) {
        let now = Utc::now();
        let mut st = self.state.lock().expect("reader state poisoned");
        let st = &mut *st;
        let rules = &st.rules;
        let results = &mut st.results;
        let mut dead: Vec<(String, String)> = Vec::new();
        st.history.retain(|rule_key, rule_history| {
            let rule = match rules.get(rule_key) {
                Some(rule) => rule,
                // The rule was removed; its history goes with it.
                None => {
                    results.remove(rule_key);
                    return false;
                }
            };
            rule_history.retain(|backend, backend_history| {
                purge_history(&mut backend_history.step1, rule.retention, now);
                purge_history(&mut backend_history.step2, rule.retention, now);
                if backend_history.is_empty() {
                    dead.push((rule_key.clone(), backend.clone()));
                    return false;
                }
                true
            });
            true
        });
        for (rule_key, backend) in dead {
            if let Some(result) = results.get_mut(&rule_key) {
                if let Some(value) = &mut result.value {
                    value.remove_instance(&backend);
                }
            }
        }
    }

    /// Marshals the slice of history covering `backends` for followers.
    pub(crate) fn marshal_history(&self, backends: &[String]) -> Result<()> {
        let mut st = self.state.lock().expect("reader state poisoned");
        let mut filtered: HistoryMap = BTreeMap::new();
        for (rule_key, rule_history) in &st.history {
            let slice: BTreeMap<String, BackendHistory> = rule_history
                .iter()
                .filter(|(backend, _)| backends.contains(backend))
                .map(|(backend, history)| (backend.clone(), history.clone()))
                .collect();
            filtered.insert(rule_key.clone(), slice);
        }
        st.marshalled = serde_json::to_vec(&filtered)?;
        Ok(())
    }
}

fn reader_owner_key(zone: Option<&str>) -> String {
    match zone {
        Some(zone) if !zone.is_empty() => {
            format!("{READER_OWNER_PREFIX}/{zone}/{READER_OWNER_SUFFIX}")
        }
        _ => format!("{READER_OWNER_PREFIX}/{READER_OWNER_SUFFIX}"),
    }
}

/// Splits owner campaign keys into `(zones that have an owner, distinct
/// owner addresses)`. Entries arrive sorted by create-revision, so the
/// first entry per zone is its owner.
fn classify_owners(entries: &[KvEntry]) -> (Vec<String>, Vec<String>) {
    let mut owner_by_zone: HashMap<String, &KvEntry> = HashMap::new();
    for entry in entries {
        let key = match entry.key.strip_prefix(READER_OWNER_PREFIX) {
            Some(rest) => rest,
            None => continue,
        };
        let key = match key.strip_prefix('/') {
            Some(rest) => rest,
            None => continue,
        };
        let zone = if key.starts_with(READER_OWNER_SUFFIX) {
            // Global owner key: ".../owner/<lease>".
            String::new()
        } else {
            match key.split_once('/') {
                Some((zone, rest)) if rest.starts_with(READER_OWNER_SUFFIX) => zone.to_owned(),
                _ => continue,
            }
        };
        let slot = owner_by_zone.entry(zone).or_insert(entry);
        if entry.create_revision < slot.create_revision {
            *slot = entry;
        }
    }

    let mut zones = Vec::new();
    let mut owners = Vec::new();
    for (zone, entry) in owner_by_zone {
        if !zone.is_empty() && !zones.contains(&zone) {
            zones.push(zone);
        }
        if !owners.contains(&entry.value) {
            owners.push(entry.value.clone());
        }
    }
    zones.sort();
    owners.sort();
    (zones, owners)
}

/// Converts the step-2 history of one backend into per-rule values.
fn history_to_value(
    rules: &HashMap<String, QueryRule>,
    history: &HistoryMap,
    backend: &str,
) -> HashMap<String, MetricValue> {
    let mut values = HashMap::with_capacity(rules.len());
    for (rule_key, rule) in rules {
        let backend_history = match history.get(rule_key).and_then(|h| h.get(backend)) {
            Some(h) => h,
            None => continue,
        };
        let last = match backend_history.step2.last() {
            Some(last) => *last,
            None => continue,
        };
        let value = match rule.result_type {
            ResultType::Vector => MetricValue::Vector(vec![InstanceSample {
                instance: backend.to_owned(),
                pair: last,
            }]),
            ResultType::Matrix => MetricValue::Matrix(vec![InstanceSeries {
                instance: backend.to_owned(),
                // Copy so later appends do not show through the result.
                pairs: backend_history.step2.clone(),
            }]),
        };
        values.insert(rule_key.clone(), value);
    }
    values
}

/// Folds one backend's values into the shared results.
fn merge_query_result(
    results: &mut HashMap<String, QueryResult>,
    values: HashMap<String, MetricValue>,
    backend: &str,
) {
    let now = std::time::Instant::now();
    for (rule_key, value) in values {
        let result = results.entry(rule_key).or_default();
        result.update_time = Some(now);
        result.err = None;
        match &mut result.value {
            Some(existing) => existing.merge_instance(value, backend),
            None => result.value = Some(value),
        }
    }
}

/// Keeps only lines starting with one of the wanted family names; cheaper
/// than parsing the full exposition. Comment and type lines are dropped,
/// so every sample parses as untyped.
pub(crate) fn filter_metrics(text: &str, names: &[String]) -> String {
    let mut out = String::with_capacity(4096);
    for line in text.lines() {
        if names.iter().any(|n| line.starts_with(n.as_str())) {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

pub(crate) fn parse_families(text: &str) -> std::result::Result<MetricFamilies, String> {
    let lines = text.lines().map(|l| Ok(l.to_owned()));
    let scrape = prometheus_parse::Scrape::parse(lines).map_err(|e| e.to_string())?;
    let mut families: MetricFamilies = HashMap::new();
    for sample in scrape.samples {
        families.entry(sample.metric.clone()).or_default().push(sample);
    }
    Ok(families)
}

enum FetchError {
    Transport(reqwest::Error),
    Status(reqwest::Error),
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::Transport(e) => write!(f, "{e}"),
            FetchError::Status(e) => write!(f, "{e}"),
        }
    }
}

fn is_retryable_http(err: &FetchError) -> bool {
    match err {
        FetchError::Transport(e) => e.is_connect() || e.is_timeout() || e.is_request(),
        // 5xx from a restarting backend is worth retrying, 4xx is not.
        FetchError::Status(e) => e
            .status()
            .map(|s| s.is_server_error())
            .unwrap_or(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{irate, latest, sum_of};
    use crate::topology::BackendNode;
    use std::sync::Arc;

    struct StaticConfig {
        addr: String,
        zone: Option<String>,
    }

    impl ConfigProvider for StaticConfig {
        fn status_address(&self) -> String {
            self.addr.clone()
        }
        fn zone(&self) -> Option<String> {
            self.zone.clone()
        }
    }

    struct NoTopology;

    #[async_trait]
    impl TopologyFetcher for NoTopology {
        async fn get_backends(&self) -> std::result::Result<Vec<BackendNode>, String> {
            Ok(Vec::new())
        }
    }

    async fn reader(addr: &str, zone: Option<&str>) -> BackendReader {
        let etcd = etcd_client::Client::connect(["http://127.0.0.1:1"], None)
            .await
            .expect("lazy connect");
        BackendReader::new(
            ReaderConfig::default(),
            etcd,
            Arc::new(NoTopology),
            Arc::new(StaticConfig {
                addr: addr.to_owned(),
                zone: zone.map(str::to_owned),
            }),
        )
    }

    fn ratio_rule(result_type: ResultType) -> QueryRule {
        QueryRule {
            names: vec!["metric_a".to_owned(), "metric_b".to_owned()],
            retention: Duration::from_secs(60),
            result_type,
            metric2value: Arc::new(|fams| sum_of(fams, "metric_a") / sum_of(fams, "metric_b")),
            range2value: Arc::new(|h| latest(h)),
        }
    }

    #[test]
    fn filter_keeps_only_named_lines() {
        let text = "# HELP metric_a help\n# TYPE metric_a counter\nmetric_a 10\nmetric_b 2\nother 5\n";
        let names = vec!["metric_a".to_owned(), "metric_b".to_owned()];
        let filtered = filter_metrics(text, &names);
        assert_eq!(filtered, "metric_a 10\nmetric_b 2\n");
    }

    #[test]
    fn parse_groups_by_family() {
        let fams = parse_families("metric_a 10\nmetric_a{db=\"x\"} 3\nmetric_b 2\n").unwrap();
        assert_eq!(fams.get("metric_a").map(Vec::len), Some(2));
        assert_eq!(fams.get("metric_b").map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn vector_rule_round_trip() {
        let reader = reader("127.0.0.1:6000", None).await;
        reader.add_query_rule("ratio", ratio_rule(ResultType::Vector));

        let fams = parse_families(&filter_metrics(
            "metric_a 10\nmetric_b 2\nnoise 1\n",
            &["metric_a".to_owned(), "metric_b".to_owned()],
        ))
        .unwrap();
        reader.ingest_families("10.0.0.1:10080", &fams);

        let result = reader.get_query_result("ratio");
        match result.value {
            Some(MetricValue::Vector(samples)) => {
                assert_eq!(samples.len(), 1);
                assert_eq!(samples[0].instance, "10.0.0.1:10080");
                assert_eq!(samples[0].pair.value, 5.0);
            }
            other => panic!("expected vector, got {other:?}"),
        }
        assert!(result.update_time.is_some());
    }

    #[tokio::test]
    async fn missing_family_skips_rule() {
        let reader = reader("127.0.0.1:6000", None).await;
        reader.add_query_rule("ratio", ratio_rule(ResultType::Vector));
        let fams = parse_families("metric_a 10\n").unwrap();
        reader.ingest_families("10.0.0.1:10080", &fams);
        assert!(reader.get_query_result("ratio").is_empty());
    }

    #[tokio::test]
    async fn matrix_rule_accumulates_history() {
        let reader = reader("127.0.0.1:6000", None).await;
        let mut rule = ratio_rule(ResultType::Matrix);
        rule.range2value = Arc::new(irate);
        reader.add_query_rule("rate", rule);

        for v in [2.0, 4.0, 8.0] {
            let fams = parse_families(&format!("metric_a {v}\nmetric_b 1\n")).unwrap();
            reader.ingest_families("10.0.0.1:10080", &fams);
            // Distinct timestamps for irate.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let result = reader.get_query_result("rate");
        match result.value {
            Some(MetricValue::Matrix(series)) => {
                assert_eq!(series.len(), 1);
                // First ingest has a single step-1 sample: no irate yet.
                assert_eq!(series[0].pairs.len(), 2);
                assert!(series[0].pairs.iter().all(|p| p.value > 0.0));
            }
            other => panic!("expected matrix, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn results_cover_all_merged_backends() {
        let reader = reader("127.0.0.1:6000", None).await;
        reader.add_query_rule("ratio", ratio_rule(ResultType::Vector));
        for (backend, a) in [("10.0.0.1:10080", 10.0), ("10.0.0.2:10080", 20.0)] {
            let fams = parse_families(&format!("metric_a {a}\nmetric_b 2\n")).unwrap();
            reader.ingest_families(backend, &fams);
        }
        let result = reader.get_query_result("ratio");
        let mut instances = match result.value {
            Some(value) => value
                .instances()
                .into_iter()
                .map(str::to_owned)
                .collect::<Vec<_>>(),
            None => panic!("expected a value"),
        };
        instances.sort();
        assert_eq!(instances, vec!["10.0.0.1:10080", "10.0.0.2:10080"]);
    }

    #[tokio::test]
    async fn owner_follower_round_trip() {
        let owner = reader("10.1.1.1:6000", Some("east")).await;
        owner.add_query_rule("ratio", ratio_rule(ResultType::Vector));
        let fams = parse_families("metric_a 10\nmetric_b 2\n").unwrap();
        owner.ingest_families("10.0.0.1:10080", &fams);
        owner
            .marshal_history(&["10.0.0.1:10080".to_owned()])
            .unwrap();
        let payload = owner.marshalled_history();
        assert!(!payload.is_empty());

        // A follower folds the payload in and serves the same result.
        let follower = reader("10.1.1.2:6000", Some("west")).await;
        follower.add_query_rule("ratio", ratio_rule(ResultType::Vector));
        let parsed: HistoryMap = serde_json::from_slice(&payload).unwrap();
        follower.apply_owner_history(parsed.clone());

        let owner_result = owner.get_query_result("ratio");
        let follower_result = follower.get_query_result("ratio");
        assert_eq!(owner_result.value, follower_result.value);

        // And the pulled history re-marshals to the identical bytes.
        assert_eq!(serde_json::to_vec(&parsed).unwrap(), payload);
    }

    #[tokio::test]
    async fn follower_merge_keeps_newest_history() {
        let reader = reader("10.1.1.2:6000", None).await;
        reader.add_query_rule("ratio", ratio_rule(ResultType::Vector));

        let mut old: HistoryMap = BTreeMap::new();
        old.entry("ratio".to_owned()).or_default().insert(
            "10.0.0.1:10080".to_owned(),
            BackendHistory {
                step1: vec![crate::rule::SamplePair {
                    timestamp: 1_000,
                    value: 1.0,
                }],
                step2: vec![crate::rule::SamplePair {
                    timestamp: 1_000,
                    value: 1.0,
                }],
            },
        );
        let mut newer = old.clone();
        newer.get_mut("ratio").unwrap().insert(
            "10.0.0.1:10080".to_owned(),
            BackendHistory {
                step1: vec![crate::rule::SamplePair {
                    timestamp: 2_000,
                    value: 7.0,
                }],
                step2: vec![crate::rule::SamplePair {
                    timestamp: 2_000,
                    value: 7.0,
                }],
            },
        );

        reader.apply_owner_history(newer);
        reader.apply_owner_history(old);

        let result = reader.get_query_result("ratio");
        match result.value {
            Some(MetricValue::Vector(samples)) => assert_eq!(samples[0].pair.value, 7.0),
            other => panic!("expected vector, got {other:?}"),
        }
    }

    #[test]
    fn classify_owners_picks_smallest_revision_per_zone() {
        let entries = vec![
            KvEntry {
                key: "/tiproxy/metric_reader/owner/1a".to_owned(),
                value: "10.0.0.1:6000".to_owned(),
                create_revision: 5,
            },
            KvEntry {
                key: "/tiproxy/metric_reader/owner/2b".to_owned(),
                value: "10.0.0.2:6000".to_owned(),
                create_revision: 9,
            },
            KvEntry {
                key: "/tiproxy/metric_reader/east/owner/3c".to_owned(),
                value: "10.0.0.3:6000".to_owned(),
                create_revision: 7,
            },
            KvEntry {
                key: "/tiproxy/metric_reader/east/owner/4d".to_owned(),
                value: "10.0.0.4:6000".to_owned(),
                create_revision: 3,
            },
            KvEntry {
                key: "/tiproxy/metric_reader/garbage".to_owned(),
                value: "x".to_owned(),
                create_revision: 1,
            },
        ];
        let (zones, owners) = classify_owners(&entries);
        assert_eq!(zones, vec!["east".to_owned()]);
        assert_eq!(
            owners,
            vec!["10.0.0.1:6000".to_owned(), "10.0.0.4:6000".to_owned()]
        );
    }

    #[tokio::test]
    async fn purge_drops_removed_rules_and_dead_backends() {
        let reader = reader("127.0.0.1:6000", None).await;
        reader.add_query_rule("ratio", ratio_rule(ResultType::Vector));
        let fams = parse_families("metric_a 10\nmetric_b 2\n").unwrap();
        reader.ingest_families("10.0.0.1:10080", &fams);

        reader.remove_query_rule("ratio");
        reader.purge();
        let st = reader.state.lock().unwrap();
        assert!(st.history.is_empty());
        assert!(st.results.is_empty());
    }

    #[tokio::test]
    async fn purge_drops_expired_backends_from_results() {
        let reader = reader("127.0.0.1:6000", None).await;
        let mut rule = ratio_rule(ResultType::Vector);
        rule.retention = Duration::from_millis(0);
        reader.add_query_rule("ratio", rule);
        let fams = parse_families("metric_a 10\nmetric_b 2\n").unwrap();
        reader.ingest_families("10.0.0.1:10080", &fams);
        assert!(!reader.get_query_result("ratio").is_empty());

        tokio::time::sleep(Duration::from_millis(5)).await;
        reader.purge();
        assert!(reader.get_query_result("ratio").is_empty());
    }

    #[test]
    fn owner_key_shapes() {
        assert_eq!(reader_owner_key(None), "/tiproxy/metric_reader/owner");
        assert_eq!(
            reader_owner_key(Some("east")),
            "/tiproxy/metric_reader/east/owner"
        );
    }
}
