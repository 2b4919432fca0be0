//! Query rules and their results.
//!
//! A rule turns raw metric families into one scalar per tick (step 1, e.g.
//! a ratio of two counters) and then reduces the recent step-1 window into
//! the exposed value (step 2, e.g. an irate). Results carry either the
//! latest sample per backend (`Vector`) or the whole step-2 series
//! (`Matrix`).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Label identifying the backend a sample belongs to, always
/// `host:statusPort`.
pub const INSTANCE_LABEL: &str = "instance";

/// Parsed scrape output: raw samples grouped by metric family name.
pub type MetricFamilies = HashMap<String, Vec<prometheus_parse::Sample>>;

/// One timestamped scalar. Timestamps are wall-clock milliseconds and
/// non-decreasing within a history.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SamplePair {
    pub timestamp: i64,
    pub value: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResultType {
    Vector,
    Matrix,
}

/// The latest sample of one backend.
#[derive(Clone, Debug, PartialEq)]
pub struct InstanceSample {
    pub instance: String,
    pub pair: SamplePair,
}

/// The step-2 series of one backend.
#[derive(Clone, Debug, PartialEq)]
pub struct InstanceSeries {
    pub instance: String,
    pub pairs: Vec<SamplePair>,
}

/// Tagged result value; merge paths dispatch on the tag.
#[derive(Clone, Debug, PartialEq)]
pub enum MetricValue {
    Vector(Vec<InstanceSample>),
    Matrix(Vec<InstanceSeries>),
}

impl MetricValue {
    /// Replaces the entry whose instance label matches `instance`, or
    /// appends it. Merging a vector into a matrix (or vice versa) replaces
    /// the whole value; that only happens when a rule's result type was
    /// redefined.
    pub fn merge_instance(&mut self, other: MetricValue, instance: &str) {
        match (self, other) {
            (MetricValue::Vector(mine), MetricValue::Vector(theirs)) => {
                for sample in theirs {
                    match mine.iter_mut().find(|s| s.instance == instance) {
                        Some(slot) => *slot = sample,
                        None => mine.push(sample),
                    }
                }
            }
            (MetricValue::Matrix(mine), MetricValue::Matrix(theirs)) => {
                for series in theirs {
                    match mine.iter_mut().find(|s| s.instance == instance) {
                        Some(slot) => *slot = series,
                        None => mine.push(series),
                    }
                }
            }
            (slot, other) => *slot = other,
        }
    }

    /// Drops the entry for `instance`, if present.
    pub fn remove_instance(&mut self, instance: &str) {
        match self {
            MetricValue::Vector(samples) => samples.retain(|s| s.instance != instance),
            MetricValue::Matrix(series) => series.retain(|s| s.instance != instance),
        }
    }

    pub fn instances(&self) -> Vec<&str> {
        match self {
            MetricValue::Vector(samples) => {
                samples.iter().map(|s| s.instance.as_str()).collect()
            }
            MetricValue::Matrix(series) => series.iter().map(|s| s.instance.as_str()).collect(),
        }
    }
}

pub type Metric2Value = Arc<dyn Fn(&MetricFamilies) -> f64 + Send + Sync>;
pub type Range2Value = Arc<dyn Fn(&[SamplePair]) -> f64 + Send + Sync>;

/// A named recipe for deriving a per-backend time series from raw metrics.
#[derive(Clone)]
pub struct QueryRule {
    /// Metric family names the rule consumes; the rule is skipped for a
    /// backend unless all of them were scraped.
    pub names: Vec<String>,
    pub retention: Duration,
    pub result_type: ResultType,
    /// First-step projection, e.g. `cpu_seconds_total / maxprocs`.
    pub metric2value: Metric2Value,
    /// Second-step reducer over the step-1 window, e.g. an irate.
    pub range2value: Range2Value,
}

impl fmt::Debug for QueryRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryRule")
            .field("names", &self.names)
            .field("retention", &self.retention)
            .field("result_type", &self.result_type)
            .finish_non_exhaustive()
    }
}

/// The exposed result of one rule across all known backends.
#[derive(Clone, Debug, Default)]
pub struct QueryResult {
    pub value: Option<MetricValue>,
    pub update_time: Option<std::time::Instant>,
    pub err: Option<String>,
}

impl QueryResult {
    pub fn is_empty(&self) -> bool {
        match &self.value {
            None => true,
            Some(MetricValue::Vector(v)) => v.is_empty(),
            Some(MetricValue::Matrix(m)) => m.is_empty(),
        }
    }
}

/// Sums all samples of one family; the common projection building block.
pub fn sum_of(families: &MetricFamilies, name: &str) -> f64 {
    match families.get(name) {
        Some(samples) => samples.iter().map(sample_value).sum(),
        None => f64::NAN,
    }
}

fn sample_value(sample: &prometheus_parse::Sample) -> f64 {
    match &sample.value {
        prometheus_parse::Value::Counter(v)
        | prometheus_parse::Value::Gauge(v)
        | prometheus_parse::Value::Untyped(v) => *v,
        prometheus_parse::Value::Histogram(_) | prometheus_parse::Value::Summary(_) => f64::NAN,
    }
}

/// `irate`-style reducer: rate between the last two samples of the window.
pub fn irate(history: &[SamplePair]) -> f64 {
    if history.len() < 2 {
        return f64::NAN;
    }
    let last = history[history.len() - 1];
    let prev = history[history.len() - 2];
    let dt_ms = last.timestamp - prev.timestamp;
    if dt_ms <= 0 {
        return f64::NAN;
    }
    (last.value - prev.value) / (dt_ms as f64 / 1000.0)
}

/// Pass-through reducer: the latest step-1 value.
pub fn latest(history: &[SamplePair]) -> f64 {
    history.last().map(|p| p.value).unwrap_or(f64::NAN)
}
