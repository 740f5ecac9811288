//! Per-stop delay estimation.
//!
//! For every scheduled stop the trace sample closest in space *and* time is
//! taken as the moment the vehicle served the stop. Weighting the time offset
//! keeps a vehicle that passes the same stop twice (e.g. after turning around
//! at a terminal) from being matched to the pass in the wrong direction.

use chrono::NaiveDateTime;
use serde::Serialize;
use tracing::debug;

use crate::config::AnalysisConfig;
use crate::error::{AnalysisError, Result};
use crate::schedule::ScheduledStop;
use crate::trace::Trace;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DelayParams {
    /// Kilometres of matching penalty per second of time offset.
    pub time_weight: f64,
    /// Speed in km/h assumed for covering the gap between matched sample and stop.
    pub max_speed_around_stop: f64,
}

impl Default for DelayParams {
    fn default() -> Self {
        Self {
            time_weight: 0.001,
            max_speed_around_stop: 40.0,
        }
    }
}

impl From<&AnalysisConfig> for DelayParams {
    fn from(config: &AnalysisConfig) -> Self {
        Self {
            time_weight: config.time_weight,
            max_speed_around_stop: config.max_speed_around_stop,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DelayRecord {
    pub stop: ScheduledStop,
    pub matched_sample_time: NaiveDateTime,
    /// Distance between the matched sample and the stop.
    pub match_distance_km: f64,
    /// Whole seconds late; never negative.
    pub delay_seconds: i64,
}

/// Delay for `stop` given the matched sample's time offset and distance.
///
/// The residual gap enters as `distance_km / max_speed_kmh`, added to the
/// offset as is.
fn delay_seconds(time_offset_s: f64, distance_km: f64, max_speed_kmh: f64) -> i64 {
    let delay = (time_offset_s + distance_km / max_speed_kmh).round();
    if delay < 0.0 { 0 } else { delay as i64 }
}

/// Estimates one [`DelayRecord`] per scheduled stop, in schedule order.
///
/// An empty trace or schedule yields an empty result.
pub fn estimate(trace: &Trace, schedule: &[ScheduledStop], params: DelayParams) -> Result<Vec<DelayRecord>> {
    if trace.is_empty() || schedule.is_empty() {
        return Ok(Vec::new());
    }
    if !(params.max_speed_around_stop > 0.0) {
        return Err(AnalysisError::DegenerateInput(format!(
            "max_speed_around_stop must be positive, got {}",
            params.max_speed_around_stop
        )));
    }

    let mut records = Vec::with_capacity(schedule.len());
    for stop in schedule {
        let Some(m) = trace.nearest_in_spacetime(
            stop.stop_lat,
            stop.stop_lon,
            stop.scheduled_arrival,
            params.time_weight,
        )?
        else {
            continue;
        };

        records.push(DelayRecord {
            stop: stop.clone(),
            matched_sample_time: trace.samples()[m.index].time,
            match_distance_km: m.distance_km,
            delay_seconds: delay_seconds(m.time_offset_s, m.distance_km, params.max_speed_around_stop),
        });
    }

    debug!(trace = %trace.key(), stops = records.len(), "Delays estimated");
    Ok(records)
}
