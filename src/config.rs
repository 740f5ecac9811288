//! Tunable analysis parameters.
//!
//! Stored as a JSON object on disk; every field is optional and falls back
//! to its default:
//! ```json
//! {
//!   "time_weight": 0.001,
//!   "max_speed_around_stop": 40.0,
//!   "speed_threshold": 50.0,
//!   "outlier_speed": 120.0,
//!   "round_to": 2,
//!   "top_n": 5,
//!   "reference_point": { "lat": 52.2297, "lon": 21.0122 },
//!   "radius_km": 10.0
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use crate::error::Result;

/// A (latitude, longitude) pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Kilometres of penalty per second of time offset in the matching cost.
    pub time_weight: f64,
    /// Assumed approach speed (km/h) used to cover the residual gap to a stop.
    pub max_speed_around_stop: f64,
    /// Speeds strictly above this value (km/h) count as violations.
    pub speed_threshold: f64,
    /// Speeds at or above this value (km/h) are discarded as GPS noise.
    pub outlier_speed: Option<f64>,
    /// Decimal places coordinates are rounded to when binning.
    pub round_to: u32,
    pub top_n: usize,
    pub reference_point: Option<LatLon>,
    pub radius_km: Option<f64>,
    /// Trace files processed at once by the batch pipeline.
    pub concurrency: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            time_weight: 0.001,
            max_speed_around_stop: 40.0,
            speed_threshold: 50.0,
            outlier_speed: Some(120.0),
            round_to: 2,
            top_n: 5,
            reference_point: None,
            radius_km: None,
            concurrency: 4,
        }
    }
}

impl AnalysisConfig {
    /// Loads the config from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: AnalysisConfig = serde_json::from_str(&content)?;
        debug!(path = %path.display(), ?config, "Loaded analysis config");
        Ok(config)
    }

    /// Loads from `path` when given, otherwise returns the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    /// The hotspot search area, present only when both center and radius are set.
    pub fn search_area(&self) -> Option<(LatLon, f64)> {
        self.reference_point.zip(self.radius_km)
    }
}
