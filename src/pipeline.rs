//! Batch processing of a trace archive.
//!
//! Every trace file is an independent unit of work. Units run on a bounded
//! pool of blocking tasks and their results are folded into archive-wide
//! reducers in path order. A failing unit is recorded and skipped; the
//! caller decides whether that fails the batch.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, info_span, instrument, warn};

use crate::aggregate::{
    DelayHistogram, DelaySummary, HistogramBin, Hotspot, HotspotGrid, SpeedDistribution,
    SpeedFilter, SpeedSummary,
};
use crate::archive::{speed_archive_root, trace_files, trace_path};
use crate::config::AnalysisConfig;
use crate::delay::{DelayParams, DelayRecord, estimate};
use crate::error::{AnalysisError, Result};
use crate::geo::{BinSize, DEFAULT_BIN_ORIGIN};
use crate::schedule::{ScheduleIndex, StopLookup};
use crate::speed::{SpeedSample, compute, read_speed_file, write_speed_file};
use crate::trace::{TraceKey, load_trace};

const HISTOGRAM_BINS: usize = 30;

/// Runs `work` on every path with at most `concurrency` running at once.
///
/// Results come back in the order of `paths`.
pub async fn map_traces<T, F>(paths: Vec<PathBuf>, concurrency: usize, work: F) -> Vec<(PathBuf, Result<T>)>
where
    T: Send + 'static,
    F: Fn(&Path) -> Result<T> + Send + Sync + 'static,
{
    let semaphore = Arc::new(Semaphore::new(concurrency.clamp(1, Semaphore::MAX_PERMITS)));
    let work = Arc::new(work);

    let mut handles = Vec::with_capacity(paths.len());
    for path in &paths {
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break;
        };
        let work = Arc::clone(&work);
        let path = path.clone();
        let span = info_span!("process_trace", path = %path.display());

        handles.push(tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let _entered = span.enter();
            work(&path)
        }));
    }

    let mut results = Vec::with_capacity(handles.len());
    for (path, handle) in paths.into_iter().zip(handles) {
        let result = handle
            .await
            .unwrap_or_else(|e| Err(AnalysisError::Worker(e.to_string())));
        results.push((path, result));
    }
    results
}

/// A unit of work that failed, kept for the report.
#[derive(Debug, Clone, Serialize)]
pub struct FailedTrace {
    pub path: PathBuf,
    pub error: String,
}

/// Delays found along one trace.
#[derive(Debug)]
pub struct TraceDelays {
    pub key: TraceKey,
    pub samples: usize,
    pub delays: Vec<DelayRecord>,
    pub rejected: Vec<AnalysisError>,
}

/// Matches one trace file against the schedule of its route and brigade.
///
/// The schedule is restricted to the trace's own time window.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn delays_for_trace(
    path: &Path,
    timetable_root: &Path,
    catalog: &impl StopLookup,
    params: DelayParams,
) -> Result<TraceDelays> {
    let (trace, mut rejected) = load_trace(path)?;

    let Some((start, end)) = trace.time_window() else {
        debug!("Empty trace, nothing to match");
        return Ok(TraceDelays {
            key: trace.key().clone(),
            samples: 0,
            delays: Vec::new(),
            rejected,
        });
    };

    let index = ScheduleIndex::new(timetable_root, catalog);
    let schedule = index.load(&trace.key().route, &trace.key().brigade, start, end)?;
    rejected.extend(schedule.rejected);

    let delays = estimate(&trace, &schedule.records, params)?;

    Ok(TraceDelays {
        key: trace.key().clone(),
        samples: trace.len(),
        delays,
        rejected,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct PunctualityReport {
    pub traces_processed: usize,
    pub rejected_records: usize,
    pub failed: Vec<FailedTrace>,
    pub delays: DelaySummary,
}

/// Archive-wide punctuality results.
#[derive(Debug, Default)]
pub struct PunctualityBatch {
    pub histogram: DelayHistogram,
    pub records: Vec<DelayRecord>,
    pub traces_processed: usize,
    pub rejected_records: usize,
    pub failed: Vec<FailedTrace>,
}

impl PunctualityBatch {
    pub fn absorb(&mut self, path: PathBuf, outcome: Result<TraceDelays>) {
        match outcome {
            Ok(found) => {
                for r in &found.rejected {
                    warn!(trace = %found.key, error = %r, "Skipped record");
                }
                self.histogram.extend(&found.delays);
                self.rejected_records += found.rejected.len();
                self.traces_processed += 1;
                self.records.extend(found.delays);
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Trace failed");
                self.failed.push(FailedTrace {
                    path,
                    error: e.to_string(),
                });
            }
        }
    }

    pub fn report(&self) -> PunctualityReport {
        PunctualityReport {
            traces_processed: self.traces_processed,
            rejected_records: self.rejected_records,
            failed: self.failed.clone(),
            delays: self.histogram.summary(),
        }
    }
}

/// Estimates delays for every trace under `archive_root`.
pub async fn punctuality_batch<L>(
    archive_root: &Path,
    timetable_root: &Path,
    catalog: Arc<L>,
    config: &AnalysisConfig,
) -> Result<PunctualityBatch>
where
    L: StopLookup + Send + Sync + 'static,
{
    let paths = trace_files(archive_root)?;
    info!(traces = paths.len(), "Starting punctuality analysis");

    let timetable_root = timetable_root.to_path_buf();
    let params = DelayParams::from(config);
    let results = map_traces(paths, config.concurrency, move |path| {
        delays_for_trace(path, &timetable_root, catalog.as_ref(), params)
    })
    .await;

    let mut batch = PunctualityBatch::default();
    for (path, outcome) in results {
        batch.absorb(path, outcome);
    }

    info!(
        traces = batch.traces_processed,
        failed = batch.failed.len(),
        records = batch.records.len(),
        "Punctuality analysis finished"
    );
    Ok(batch)
}

/// Speeds of one trace file, computed from its positions.
pub fn speeds_for_trace(path: &Path) -> Result<(TraceKey, Vec<SpeedSample>, usize)> {
    let (trace, rejected) = load_trace(path)?;
    for r in &rejected {
        warn!(error = %r, "Skipped trace line");
    }

    let steps = trace.non_increasing_steps();
    if !steps.is_empty() {
        warn!(trace = %trace.key(), count = steps.len(), "Timestamps do not strictly increase");
    }

    Ok((trace.key().clone(), compute(&trace), rejected.len()))
}

#[derive(Debug, Clone, Serialize)]
pub struct SpeedArchiveReport {
    pub output_root: PathBuf,
    pub files_written: usize,
    pub rejected_records: usize,
    pub failed: Vec<FailedTrace>,
}

/// Writes a speed file for every trace under `input_root` into a mirror
/// tree rooted at `output_root` (default `<input_root>_with_speed`).
pub async fn calc_speed_archive(
    input_root: &Path,
    output_root: Option<&Path>,
    concurrency: usize,
) -> Result<SpeedArchiveReport> {
    let output_root = output_root
        .map(Path::to_path_buf)
        .unwrap_or_else(|| speed_archive_root(input_root));
    let paths = trace_files(input_root)?;
    info!(traces = paths.len(), output = %output_root.display(), "Calculating speeds");

    let out = output_root.clone();
    let results = map_traces(paths, concurrency, move |path| {
        let (key, speeds, rejected) = speeds_for_trace(path)?;
        write_speed_file(&trace_path(&out, &key), &speeds)?;
        Ok(rejected)
    })
    .await;

    let mut report = SpeedArchiveReport {
        output_root,
        files_written: 0,
        rejected_records: 0,
        failed: Vec::new(),
    };
    for (path, outcome) in results {
        match outcome {
            Ok(rejected) => {
                report.files_written += 1;
                report.rejected_records += rejected;
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Speed calculation failed");
                report.failed.push(FailedTrace {
                    path,
                    error: e.to_string(),
                });
            }
        }
    }
    Ok(report)
}

#[derive(Debug, Clone, Serialize)]
pub struct SpeedReport {
    pub traces_processed: usize,
    pub rejected_records: usize,
    pub failed: Vec<FailedTrace>,
    pub speeds: SpeedSummary,
    pub histogram: Vec<HistogramBin>,
    pub bin_size: BinSize,
    pub hotspots: Vec<Hotspot>,
}

/// Archive-wide speed distribution and hotspot grid.
///
/// Samples at or above the outlier limit are left out of both reducers.
#[derive(Debug)]
pub struct SpeedBatch {
    pub distribution: SpeedDistribution,
    pub grid: HotspotGrid,
    pub traces_processed: usize,
    pub rejected_records: usize,
    pub failed: Vec<FailedTrace>,
}

impl SpeedBatch {
    pub fn new(config: &AnalysisConfig) -> Self {
        Self {
            distribution: SpeedDistribution::new(SpeedFilter::from(config)),
            grid: HotspotGrid::new(config.round_to, config.speed_threshold),
            traces_processed: 0,
            rejected_records: 0,
            failed: Vec::new(),
        }
    }

    pub fn absorb(&mut self, source: &str, samples: &[SpeedSample]) {
        let filter = self.distribution.filter();
        self.distribution.add_trace(source, samples);
        self.grid
            .extend(samples.iter().filter(|s| filter.keeps(s.speed_kmh)));
        self.traces_processed += 1;
    }

    fn absorb_outcome(&mut self, path: PathBuf, outcome: Result<(String, Vec<SpeedSample>, usize)>) {
        match outcome {
            Ok((source, samples, rejected)) => {
                self.rejected_records += rejected;
                self.absorb(&source, &samples);
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Trace failed");
                self.failed.push(FailedTrace {
                    path,
                    error: e.to_string(),
                });
            }
        }
    }

    pub fn report(&self, config: &AnalysisConfig) -> SpeedReport {
        SpeedReport {
            traces_processed: self.traces_processed,
            rejected_records: self.rejected_records,
            failed: self.failed.clone(),
            speeds: self.distribution.summary(),
            histogram: self.distribution.histogram(HISTOGRAM_BINS),
            bin_size: self
                .grid
                .cell_size(config.reference_point.unwrap_or(DEFAULT_BIN_ORIGIN)),
            hotspots: self.grid.top(config.top_n, config.search_area()),
        }
    }
}

/// Speed statistics computed straight from the raw traces under `archive_root`.
pub async fn speed_batch(archive_root: &Path, config: &AnalysisConfig) -> Result<SpeedBatch> {
    let paths = trace_files(archive_root)?;
    info!(traces = paths.len(), "Starting speed analysis");

    let results = map_traces(paths, config.concurrency, |path| {
        let (key, speeds, rejected) = speeds_for_trace(path)?;
        Ok((key.to_string(), speeds, rejected))
    })
    .await;

    let mut batch = SpeedBatch::new(config);
    for (path, outcome) in results {
        batch.absorb_outcome(path, outcome);
    }
    Ok(batch)
}

/// Speed statistics read from speed files previously written by [`calc_speed_archive`].
pub async fn speed_batch_from_files(speed_root: &Path, config: &AnalysisConfig) -> Result<SpeedBatch> {
    let paths = trace_files(speed_root)?;
    info!(files = paths.len(), "Reading speed files");

    let results = map_traces(paths, config.concurrency, |path| {
        let key = TraceKey::from_path(path)?;
        let loaded = read_speed_file(path)?;
        if !loaded.is_clean() {
            warn!(rejected = loaded.rejected.len(), "Skipped speed file rows");
        }
        Ok((key.to_string(), loaded.records, loaded.rejected.len()))
    })
    .await;

    let mut batch = SpeedBatch::new(config);
    for (path, outcome) in results {
        batch.absorb_outcome(path, outcome);
    }
    Ok(batch)
}

/// A trace whose timestamps do not strictly increase.
#[derive(Debug, Clone, Serialize)]
pub struct MonotonicityIssue {
    pub path: PathBuf,
    pub samples: usize,
    /// Sample indices whose timestamp is not after their predecessor's.
    pub steps: Vec<usize>,
}

/// Lists traces under `archive_root` that would violate the speed
/// calculation's strictly-increasing precondition.
pub async fn check_monotonic(archive_root: &Path, concurrency: usize) -> Result<Vec<MonotonicityIssue>> {
    let paths = trace_files(archive_root)?;

    let results = map_traces(paths, concurrency, |path| {
        let (trace, _) = load_trace(path)?;
        Ok((trace.len(), trace.non_increasing_steps()))
    })
    .await;

    let mut issues = Vec::new();
    for (path, outcome) in results {
        match outcome {
            Ok((_, steps)) if steps.is_empty() => {}
            Ok((samples, steps)) => issues.push(MonotonicityIssue {
                path,
                samples,
                steps,
            }),
            Err(e) => error!(path = %path.display(), error = %e, "Trace could not be checked"),
        }
    }
    Ok(issues)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_map_traces_keeps_path_order() {
        let paths: Vec<PathBuf> = (0..20).map(|i| PathBuf::from(format!("{i}.txt"))).collect();
        let results = map_traces(paths.clone(), 3, |p| {
            Ok(p.file_stem().and_then(|s| s.to_str()).unwrap_or("").len())
        })
        .await;

        assert_eq!(results.len(), 20);
        for ((got, _), want) in results.iter().zip(&paths) {
            assert_eq!(got, want);
        }
    }

    #[tokio::test]
    async fn test_map_traces_clamps_concurrency() {
        let paths = vec![PathBuf::from("a"), PathBuf::from("b")];
        for concurrency in [0, usize::MAX] {
            let results = map_traces(paths.clone(), concurrency, |_| Ok(())).await;
            assert_eq!(results.len(), 2);
            assert!(results.iter().all(|(_, r)| r.is_ok()));
        }
    }

    #[tokio::test]
    async fn test_map_traces_reports_errors_per_path() {
        let paths = vec![PathBuf::from("ok"), PathBuf::from("bad")];
        let results = map_traces(paths, 2, |p| {
            if p == Path::new("bad") {
                Err(AnalysisError::missing("trace file", "bad"))
            } else {
                Ok(())
            }
        })
        .await;

        assert!(results[0].1.is_ok());
        assert!(results[1].1.is_err());
    }

    #[test]
    fn test_speed_batch_grid_excludes_outliers() {
        use chrono::NaiveDate;
        let time = NaiveDate::from_ymd_opt(2021, 2, 3)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap();
        let sample = |speed_kmh| SpeedSample {
            lat: 52.23,
            lon: 21.01,
            time,
            speed_kmh,
        };

        let config = AnalysisConfig::default();
        let mut batch = SpeedBatch::new(&config);
        batch.absorb("128/1/5972", &[sample(30.0), sample(70.0), sample(150.0)]);

        assert_eq!(batch.distribution.len(), 2);
        assert_eq!(batch.grid.total_samples(), 2);

        let report = batch.report(&config);
        assert_eq!(report.speeds.outliers_discarded, 1);
        assert_eq!(report.hotspots.len(), 1);
        assert_eq!(report.hotspots[0].violation_ratio, 0.5);
    }
}
