use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::config::LatLon;
use crate::error::{AnalysisError, Result};
use crate::geo::{BinSize, bin_size, distance};
use crate::speed::SpeedSample;

/// Grid cell identity: coordinates scaled by `10^round_to` and rounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct BinKey {
    lat_units: i64,
    lon_units: i64,
}

/// Sample counts of one grid cell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LocationBin {
    pub lat: f64,
    pub lon: f64,
    pub total_samples: u64,
    pub violating_samples: u64,
}

impl LocationBin {
    pub fn violation_ratio(&self) -> f64 {
        if self.total_samples == 0 {
            0.0
        } else {
            self.violating_samples as f64 / self.total_samples as f64
        }
    }
}

/// A ranked grid cell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Hotspot {
    pub lat: f64,
    pub lon: f64,
    pub total_samples: u64,
    pub violating_samples: u64,
    pub violation_ratio: f64,
}

impl From<&LocationBin> for Hotspot {
    fn from(bin: &LocationBin) -> Self {
        Self {
            lat: bin.lat,
            lon: bin.lon,
            total_samples: bin.total_samples,
            violating_samples: bin.violating_samples,
            violation_ratio: bin.violation_ratio(),
        }
    }
}

/// Counts of all and of speed-violating samples per rounded location.
#[derive(Debug, Clone)]
pub struct HotspotGrid {
    round_to: u32,
    speed_threshold: f64,
    bins: HashMap<BinKey, LocationBin>,
}

impl HotspotGrid {
    pub fn new(round_to: u32, speed_threshold: f64) -> Self {
        Self {
            round_to,
            speed_threshold,
            bins: HashMap::new(),
        }
    }

    fn scale(&self) -> f64 {
        10f64.powi(self.round_to as i32)
    }

    /// Physical size of one cell measured at `origin`.
    pub fn cell_size(&self, origin: LatLon) -> BinSize {
        bin_size(self.round_to, origin)
    }

    pub fn add(&mut self, sample: &SpeedSample) {
        let scale = self.scale();
        let key = BinKey {
            lat_units: (sample.lat * scale).round() as i64,
            lon_units: (sample.lon * scale).round() as i64,
        };
        let violating = sample.speed_kmh > self.speed_threshold;

        let bin = self.bins.entry(key).or_insert_with(|| LocationBin {
            lat: key.lat_units as f64 / scale,
            lon: key.lon_units as f64 / scale,
            total_samples: 0,
            violating_samples: 0,
        });
        bin.total_samples += 1;
        if violating {
            bin.violating_samples += 1;
        }
    }

    pub fn extend<'a>(&mut self, samples: impl IntoIterator<Item = &'a SpeedSample>) {
        for sample in samples {
            self.add(sample);
        }
    }

    /// Adds another grid's counts; both must share precision and threshold.
    pub fn merge(&mut self, other: &HotspotGrid) -> Result<()> {
        if other.round_to != self.round_to || other.speed_threshold != self.speed_threshold {
            return Err(AnalysisError::DegenerateInput(format!(
                "cannot merge grids binned at {} decimals / {} km/h into {} decimals / {} km/h",
                other.round_to, other.speed_threshold, self.round_to, self.speed_threshold
            )));
        }

        for (key, theirs) in &other.bins {
            let ours = self.bins.entry(*key).or_insert(LocationBin {
                total_samples: 0,
                violating_samples: 0,
                ..*theirs
            });
            ours.total_samples += theirs.total_samples;
            ours.violating_samples += theirs.violating_samples;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    pub fn total_samples(&self) -> u64 {
        self.bins.values().map(|b| b.total_samples).sum()
    }

    pub fn bins(&self) -> impl Iterator<Item = &LocationBin> {
        self.bins.values()
    }

    /// Cells sorted by violation ratio, highest first.
    ///
    /// Equal ratios rank the cell with more violating samples first, then by
    /// location so the order is stable.
    fn sorted(&self, within: Option<(LatLon, f64)>) -> Vec<(BinKey, Hotspot)> {
        let mut ranked: Vec<(BinKey, Hotspot)> = self
            .bins
            .iter()
            .filter(|(_, bin)| {
                within.is_none_or(|(center, radius_km)| {
                    distance(center.lat, center.lon, bin.lat, bin.lon) <= radius_km
                })
            })
            .map(|(key, bin)| (*key, Hotspot::from(bin)))
            .collect();

        ranked.sort_by(|(ka, a), (kb, b)| {
            b.violation_ratio
                .partial_cmp(&a.violation_ratio)
                .unwrap_or(Ordering::Equal)
                .then(b.violating_samples.cmp(&a.violating_samples))
                .then(ka.cmp(kb))
        });
        ranked
    }

    /// The `top_n` cells with the highest violation ratio, optionally only
    /// those whose centre lies within `radius_km` of a reference point.
    pub fn top(&self, top_n: usize, within: Option<(LatLon, f64)>) -> Vec<Hotspot> {
        self.sorted(within)
            .into_iter()
            .take(top_n)
            .map(|(_, h)| h)
            .collect()
    }

    /// Every cell whose violation ratio is strictly above `min_ratio`, ranked.
    pub fn above_ratio(&self, min_ratio: f64) -> Vec<Hotspot> {
        self.sorted(None)
            .into_iter()
            .map(|(_, h)| h)
            .filter(|h| h.violation_ratio > min_ratio)
            .collect()
    }
}
