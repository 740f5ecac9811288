//! Vehicle position traces.
//!
//! A trace file holds one `latitude,longitude,timestamp` line per observed
//! position, appended in arrival order. Files ending in `.gz` are read
//! through a gzip decoder.

use chrono::NaiveDateTime;
use flate2::read::GzDecoder;
use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::{debug, warn};

use crate::error::{AnalysisError, Loaded, Result};
use crate::geo::{check_coordinates, distance};

const TIMESTAMP_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Format used whenever a timestamp is written back out.
pub const TIMESTAMP_OUTPUT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Parses a wall-clock timestamp as written by the position collector.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
}

/// Signed difference `a - b` in seconds, millisecond resolution.
pub fn seconds_between(a: NaiveDateTime, b: NaiveDateTime) -> f64 {
    (a - b).num_milliseconds() as f64 / 1000.0
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PositionSample {
    pub lat: f64,
    pub lon: f64,
    pub time: NaiveDateTime,
}

impl PositionSample {
    pub fn new(lat: f64, lon: f64, time: NaiveDateTime) -> Self {
        Self { lat, lon, time }
    }
}

/// Identity of a trace: which route and brigade the vehicle was serving.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TraceKey {
    pub route: String,
    pub brigade: String,
    pub vehicle: String,
}

impl TraceKey {
    pub fn new(
        route: impl Into<String>,
        brigade: impl Into<String>,
        vehicle: impl Into<String>,
    ) -> Self {
        Self {
            route: route.into(),
            brigade: brigade.into(),
            vehicle: vehicle.into(),
        }
    }

    /// Derives the key from an archive path shaped `.../<route>/<brigade>/<vehicle>.txt`.
    pub fn from_path(path: &Path) -> Result<Self> {
        let missing = || AnalysisError::missing("route/brigade/vehicle in path", path.display().to_string());

        let file_name = path.file_name().and_then(|n| n.to_str()).ok_or_else(missing)?;
        let vehicle = file_name
            .strip_suffix(".gz")
            .unwrap_or(file_name)
            .split('.')
            .next()
            .filter(|v| !v.is_empty())
            .ok_or_else(missing)?;

        let brigade_dir = path.parent().ok_or_else(missing)?;
        let brigade = brigade_dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(missing)?;
        let route = brigade_dir
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .ok_or_else(missing)?;

        Ok(Self::new(route, brigade, vehicle))
    }
}

impl fmt::Display for TraceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.route, self.brigade, self.vehicle)
    }
}

/// The sample of a trace closest to a target point in space and time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpacetimeMatch {
    pub index: usize,
    /// Sample time minus target time, in seconds.
    pub time_offset_s: f64,
    pub distance_km: f64,
    pub cost: f64,
}

/// Ordered position history of one vehicle over one archival session.
///
/// Samples are expected in strictly increasing time order; use
/// [`Trace::non_increasing_steps`] to check a trace that did not come
/// through a monotonicity filter.
#[derive(Debug, Clone)]
pub struct Trace {
    key: TraceKey,
    samples: Vec<PositionSample>,
}

impl Trace {
    pub fn new(key: TraceKey, samples: Vec<PositionSample>) -> Self {
        Self { key, samples }
    }

    pub fn key(&self) -> &TraceKey {
        &self.key
    }

    pub fn samples(&self) -> &[PositionSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Earliest and latest timestamp in the trace.
    pub fn time_window(&self) -> Option<(NaiveDateTime, NaiveDateTime)> {
        let first = self.samples.first()?.time;
        Some(self.samples.iter().fold((first, first), |(lo, hi), s| {
            (lo.min(s.time), hi.max(s.time))
        }))
    }

    /// Samples whose timestamp falls in `[start, end]`.
    pub fn within(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> impl Iterator<Item = &PositionSample> {
        self.samples
            .iter()
            .filter(move |s| s.time >= start && s.time <= end)
    }

    /// Indices `k` where `samples[k].time <= samples[k - 1].time`.
    pub fn non_increasing_steps(&self) -> Vec<usize> {
        self.samples
            .windows(2)
            .enumerate()
            .filter(|(_, pair)| pair[1].time <= pair[0].time)
            .map(|(k, _)| k + 1)
            .collect()
    }

    /// Finds the sample minimising `distance_km + time_weight * |time_offset_s|`
    /// relative to the point `(lat, lon)` at time `at`.
    ///
    /// Ties go to the earliest sample. Returns `Ok(None)` for an empty trace
    /// and [`AnalysisError::DegenerateInput`] when no sample has a finite cost.
    pub fn nearest_in_spacetime(
        &self,
        lat: f64,
        lon: f64,
        at: NaiveDateTime,
        time_weight: f64,
    ) -> Result<Option<SpacetimeMatch>> {
        if self.samples.is_empty() {
            return Ok(None);
        }

        let mut best: Option<SpacetimeMatch> = None;
        for (index, sample) in self.samples.iter().enumerate() {
            let time_offset_s = seconds_between(sample.time, at);
            let distance_km = distance(lat, lon, sample.lat, sample.lon);
            let cost = distance_km + time_weight * time_offset_s.abs();

            if !cost.is_finite() {
                continue;
            }
            if best.is_none_or(|b| cost < b.cost) {
                best = Some(SpacetimeMatch {
                    index,
                    time_offset_s,
                    distance_km,
                    cost,
                });
            }
        }

        best.map(Some).ok_or_else(|| {
            AnalysisError::DegenerateInput(format!(
                "no sample of {} has a finite spacetime cost to ({lat}, {lon})",
                self.key
            ))
        })
    }
}

fn open_maybe_gzip(path: &Path) -> Result<Box<dyn Read>> {
    let file = File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => AnalysisError::missing("trace file", path.display().to_string()),
        _ => AnalysisError::Io(e),
    })?;

    if path.extension().and_then(|e| e.to_str()) == Some("gz") {
        Ok(Box::new(GzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

fn parse_sample(record: &csv::StringRecord) -> std::result::Result<PositionSample, String> {
    if record.len() < 3 {
        return Err(format!("expected 3 fields, found {}", record.len()));
    }

    let lat: f64 = record[0]
        .trim()
        .parse()
        .map_err(|_| format!("non-numeric latitude '{}'", &record[0]))?;
    let lon: f64 = record[1]
        .trim()
        .parse()
        .map_err(|_| format!("non-numeric longitude '{}'", &record[1]))?;
    check_coordinates(lat, lon)?;
    let time = parse_timestamp(&record[2]).ok_or_else(|| format!("bad timestamp '{}'", &record[2]))?;

    Ok(PositionSample::new(lat, lon, time))
}

/// Reads every parseable sample from a trace file.
///
/// Lines that fail to parse are skipped and returned in `rejected` with
/// their 1-based line number.
pub fn read_samples(path: &Path) -> Result<Loaded<PositionSample>> {
    let reader = open_maybe_gzip(path)?;
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(reader);

    let mut samples = Vec::new();
    let mut rejected = Vec::new();

    for (i, result) in rdr.records().enumerate() {
        let line = i + 1;
        match result {
            Ok(record) => match parse_sample(&record) {
                Ok(sample) => samples.push(sample),
                Err(reason) => rejected.push(AnalysisError::malformed(path, line, reason)),
            },
            Err(e) if e.is_io_error() => return Err(e.into()),
            Err(e) => rejected.push(AnalysisError::malformed(path, line, e.to_string())),
        }
    }

    if !rejected.is_empty() {
        warn!(path = %path.display(), rejected = rejected.len(), "Skipped malformed trace lines");
    }
    debug!(path = %path.display(), samples = samples.len(), "Trace samples read");

    Ok(Loaded::new(samples, rejected))
}

/// Loads a trace and derives its key from the archive path.
pub fn load_trace(path: &Path) -> Result<(Trace, Vec<AnalysisError>)> {
    let key = TraceKey::from_path(path)?;
    let loaded = read_samples(path)?;
    Ok((Trace::new(key, loaded.records), loaded.rejected))
}
