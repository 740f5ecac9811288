use serde::Serialize;
use tracing::warn;

use crate::aggregate::utility::pct;
use crate::config::AnalysisConfig;
use crate::speed::SpeedSample;

/// Which speeds count as violations and which are discarded as noise.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedFilter {
    pub speed_threshold: f64,
    pub outlier_speed: Option<f64>,
}

impl SpeedFilter {
    /// Speeds at or above `outlier_speed` are discarded.
    pub fn keeps(&self, speed_kmh: f64) -> bool {
        self.outlier_speed.is_none_or(|limit| speed_kmh < limit)
    }

    pub fn violates(&self, speed_kmh: f64) -> bool {
        speed_kmh > self.speed_threshold
    }
}

impl From<&AnalysisConfig> for SpeedFilter {
    fn from(config: &AnalysisConfig) -> Self {
        Self {
            speed_threshold: config.speed_threshold,
            outlier_speed: config.outlier_speed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpeedSummary {
    pub count: u64,
    pub min_kmh: Option<f64>,
    pub max_kmh: Option<f64>,
    pub speed_threshold: f64,
    pub pct_exceeding: f64,
    pub outliers_discarded: u64,
    pub sources_with_outliers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramBin {
    pub lower_kmh: f64,
    pub upper_kmh: f64,
    pub count: u64,
    /// Fraction of samples per km/h, so bins integrate to one.
    pub density: f64,
}

/// Every kept speed value across an archive.
#[derive(Debug, Clone)]
pub struct SpeedDistribution {
    filter: SpeedFilter,
    speeds: Vec<f64>,
    exceeding: u64,
    outliers_discarded: u64,
    sources_with_outliers: Vec<String>,
}

impl SpeedDistribution {
    pub fn new(filter: SpeedFilter) -> Self {
        Self {
            filter,
            speeds: Vec::new(),
            exceeding: 0,
            outliers_discarded: 0,
            sources_with_outliers: Vec::new(),
        }
    }

    pub fn filter(&self) -> SpeedFilter {
        self.filter
    }

    /// Adds the speeds of one trace, identified by `source` for diagnostics.
    ///
    /// Outliers are dropped but the rest of the trace is kept. Returns the
    /// number of discarded samples.
    pub fn add_trace(&mut self, source: &str, samples: &[SpeedSample]) -> u64 {
        let mut discarded = 0;
        for s in samples {
            if !self.filter.keeps(s.speed_kmh) {
                discarded += 1;
                continue;
            }
            if self.filter.violates(s.speed_kmh) {
                self.exceeding += 1;
            }
            self.speeds.push(s.speed_kmh);
        }

        if discarded > 0 {
            warn!(
                source,
                discarded,
                outlier_speed = ?self.filter.outlier_speed,
                "Speeds above the outlier limit found"
            );
            self.outliers_discarded += discarded;
            self.sources_with_outliers.push(source.to_string());
        }
        discarded
    }

    pub fn merge(&mut self, other: SpeedDistribution) {
        self.speeds.extend(other.speeds);
        self.exceeding += other.exceeding;
        self.outliers_discarded += other.outliers_discarded;
        self.sources_with_outliers.extend(other.sources_with_outliers);
    }

    pub fn len(&self) -> usize {
        self.speeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.speeds.is_empty()
    }

    pub fn summary(&self) -> SpeedSummary {
        let count = self.speeds.len() as u64;
        let min_kmh = self.speeds.iter().copied().reduce(f64::min);
        let max_kmh = self.speeds.iter().copied().reduce(f64::max);

        let mut sources_with_outliers = self.sources_with_outliers.clone();
        sources_with_outliers.sort();

        SpeedSummary {
            count,
            min_kmh,
            max_kmh,
            speed_threshold: self.filter.speed_threshold,
            pct_exceeding: pct(self.exceeding, count),
            outliers_discarded: self.outliers_discarded,
            sources_with_outliers,
        }
    }

    /// Equal-width histogram between the smallest and largest finite speed.
    pub fn histogram(&self, bins: usize) -> Vec<HistogramBin> {
        let finite: Vec<f64> = self.speeds.iter().copied().filter(|s| s.is_finite()).collect();
        let (Some(lo), Some(hi)) = (
            finite.iter().copied().reduce(f64::min),
            finite.iter().copied().reduce(f64::max),
        ) else {
            return Vec::new();
        };
        if bins == 0 {
            return Vec::new();
        }

        let width = if hi > lo { (hi - lo) / bins as f64 } else { 1.0 };
        let mut counts = vec![0u64; bins];
        for s in &finite {
            let idx = (((s - lo) / width) as usize).min(bins - 1);
            counts[idx] += 1;
        }

        let total = finite.len() as f64;
        counts
            .into_iter()
            .enumerate()
            .map(|(i, count)| HistogramBin {
                lower_kmh: lo + i as f64 * width,
                upper_kmh: lo + (i + 1) as f64 * width,
                count,
                density: count as f64 / (total * width),
            })
            .collect()
    }
}
