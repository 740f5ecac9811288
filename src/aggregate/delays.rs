use serde::Serialize;
use std::collections::BTreeMap;

use crate::aggregate::utility::{pct, percentile_of_counts};
use crate::delay::DelayRecord;

const ONE_MINUTE: i64 = 60;
const FIVE_MINUTES: i64 = 300;

/// Occurrence count per whole-second delay.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct DelayHistogram {
    counts: BTreeMap<i64, u64>,
}

/// Population statistics of a [`DelayHistogram`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DelaySummary {
    pub total: u64,
    pub mean_seconds: f64,
    /// Share of stops served at most one minute late.
    pub pct_within_one_minute: f64,
    pub pct_over_one_minute: f64,
    pub pct_over_five_minutes: f64,
    pub max_seconds: Option<i64>,
    pub p50_seconds: Option<i64>,
    pub p90_seconds: Option<i64>,
    pub p95_seconds: Option<i64>,
}

impl DelayHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, delay_seconds: i64) {
        *self.counts.entry(delay_seconds).or_default() += 1;
    }

    pub fn extend<'a>(&mut self, records: impl IntoIterator<Item = &'a DelayRecord>) {
        for record in records {
            self.add(record.delay_seconds);
        }
    }

    pub fn merge(&mut self, other: &DelayHistogram) {
        for (&delay, &count) in &other.counts {
            *self.counts.entry(delay).or_default() += count;
        }
    }

    pub fn counts(&self) -> &BTreeMap<i64, u64> {
        &self.counts
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn summary(&self) -> DelaySummary {
        let total = self.total();

        let mut weighted = 0.0;
        let mut within_one = 0;
        let mut over_one = 0;
        let mut over_five = 0;

        for (&delay, &count) in &self.counts {
            weighted += delay as f64 * count as f64;
            if delay <= ONE_MINUTE {
                within_one += count;
            } else {
                over_one += count;
            }
            if delay > FIVE_MINUTES {
                over_five += count;
            }
        }

        DelaySummary {
            total,
            mean_seconds: if total == 0 { 0.0 } else { weighted / total as f64 },
            pct_within_one_minute: pct(within_one, total),
            pct_over_one_minute: pct(over_one, total),
            pct_over_five_minutes: pct(over_five, total),
            max_seconds: self.counts.keys().next_back().copied(),
            p50_seconds: percentile_of_counts(&self.counts, total, 50.0),
            p90_seconds: percentile_of_counts(&self.counts, total, 90.0),
            p95_seconds: percentile_of_counts(&self.counts, total, 95.0),
        }
    }
}
