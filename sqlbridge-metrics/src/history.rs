//! The two-step history the owner builds and shares with followers.
//!
//! Keyed `rule key → backend → {Step1History, Step2History}`. The maps are
//! ordered so the marshalled JSON is byte-stable: followers can re-marshal
//! what they pulled and serve the identical payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::rule::SamplePair;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendHistory {
    #[serde(rename = "Step1History")]
    pub step1: Vec<SamplePair>,
    #[serde(rename = "Step2History")]
    pub step2: Vec<SamplePair>,
}

impl BackendHistory {
    pub fn is_empty(&self) -> bool {
        self.step1.is_empty() && self.step2.is_empty()
    }

    fn latest_step1(&self) -> Option<i64> {
        self.step1.last().map(|p| p.timestamp)
    }

    fn latest_step2(&self) -> Option<i64> {
        self.step2.last().map(|p| p.timestamp)
    }

    /// Keeps, per step, whichever side's latest sample is newer.
    pub fn merge_latest(&mut self, other: BackendHistory) {
        let other_step1_newer = other.latest_step1() > self.latest_step1();
        let other_step2_newer = other.latest_step2() > self.latest_step2();
        if other_step1_newer {
            self.step1 = other.step1;
        }
        if other_step2_newer {
            self.step2 = other.step2;
        }
    }
}

pub type HistoryMap = BTreeMap<String, BTreeMap<String, BackendHistory>>;

/// Drops leading samples older than `retention` before `now`. Safe to apply
/// repeatedly; a second application with the same `now` removes nothing.
pub fn purge_history(history: &mut Vec<SamplePair>, retention: Duration, now: DateTime<Utc>) {
    let cutoff = now.timestamp_millis() - retention.as_millis() as i64;
    let keep_from = history.iter().position(|p| p.timestamp > cutoff);
    match keep_from {
        Some(0) => {}
        Some(idx) => {
            history.drain(..idx);
        }
        None => history.clear(),
    }
}
