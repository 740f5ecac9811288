//! Finite-difference speeds along a trace and the derived speed file.
//!
//! The speed file has the trace columns plus `speed_kmh`, one row per sample
//! after the first, with a header line.

use chrono::NaiveDateTime;
use csv::WriterBuilder;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::Path;
use tracing::debug;

use crate::error::{AnalysisError, Loaded, Result};
use crate::geo::{check_coordinates, distance};
use crate::trace::{Trace, parse_timestamp, seconds_between};

/// Keeps sub-second precision so a speed file reads back unchanged.
const SPEED_FILE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// A position sample with the speed it was reached at from its predecessor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedSample {
    pub lat: f64,
    pub lon: f64,
    pub time: NaiveDateTime,
    pub speed_kmh: f64,
}

/// Speeds between consecutive samples, attributed to the later sample.
///
/// The output has `trace.len() - 1` entries (none for traces shorter than
/// two samples). Timestamps must strictly increase: a zero time step gives
/// an infinite or NaN speed rather than an error.
pub fn compute(trace: &Trace) -> Vec<SpeedSample> {
    trace
        .samples()
        .windows(2)
        .map(|pair| {
            let (prev, cur) = (&pair[0], &pair[1]);
            let dt_s = seconds_between(cur.time, prev.time);
            let d_km = distance(prev.lat, prev.lon, cur.lat, cur.lon);
            SpeedSample {
                lat: cur.lat,
                lon: cur.lon,
                time: cur.time,
                speed_kmh: d_km / dt_s * 3600.0,
            }
        })
        .collect()
}

#[derive(Debug, Serialize, Deserialize)]
struct SpeedRow {
    lat: f64,
    lon: f64,
    time: String,
    speed_kmh: f64,
}

/// Writes `samples` as a speed file, creating parent directories.
pub fn write_speed_file(path: &Path, samples: &[SpeedSample]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut writer = WriterBuilder::new().has_headers(true).from_path(path)?;
    for s in samples {
        writer.serialize(SpeedRow {
            lat: s.lat,
            lon: s.lon,
            time: s.time.format(SPEED_FILE_TIMESTAMP_FORMAT).to_string(),
            speed_kmh: s.speed_kmh,
        })?;
    }
    writer.flush()?;

    debug!(path = %path.display(), rows = samples.len(), "Speed file written");
    Ok(())
}

fn parse_row(row: SpeedRow) -> std::result::Result<SpeedSample, String> {
    check_coordinates(row.lat, row.lon)?;
    let time = parse_timestamp(&row.time).ok_or_else(|| format!("bad timestamp '{}'", row.time))?;
    Ok(SpeedSample {
        lat: row.lat,
        lon: row.lon,
        time,
        speed_kmh: row.speed_kmh,
    })
}

/// Reads a speed file back; unparseable rows are skipped and reported.
pub fn read_speed_file(path: &Path) -> Result<Loaded<SpeedSample>> {
    let file = File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => AnalysisError::missing("speed file", path.display().to_string()),
        _ => AnalysisError::Io(e),
    })?;
    let mut rdr = csv::Reader::from_reader(file);

    let mut samples = Vec::new();
    let mut rejected = Vec::new();

    for (i, result) in rdr.deserialize::<SpeedRow>().enumerate() {
        // Line 1 is the header.
        let line = i + 2;
        match result {
            Ok(row) => match parse_row(row) {
                Ok(sample) => samples.push(sample),
                Err(reason) => rejected.push(AnalysisError::malformed(path, line, reason)),
            },
            Err(e) if e.is_io_error() => return Err(e.into()),
            Err(e) => rejected.push(AnalysisError::malformed(path, line, e.to_string())),
        }
    }

    Ok(Loaded::new(samples, rejected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{PositionSample, TraceKey};
    use approx::assert_relative_eq;
    use chrono::{NaiveDate, TimeDelta};
    use std::env;

    fn t(secs: i64) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2021, 2, 3)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap()
            + TimeDelta::seconds(secs)
    }

    /// Latitude `km` kilometres north of 52.0 on the haversine sphere.
    fn north(km: f64) -> f64 {
        52.0 + km / distance(52.0, 21.0, 53.0, 21.0)
    }

    fn trace_of(samples: Vec<PositionSample>) -> Trace {
        Trace::new(TraceKey::new("128", "1", "5972"), samples)
    }

    #[test]
    fn test_one_km_per_minute_is_sixty_kmh() {
        let trace = trace_of(vec![
            PositionSample::new(north(0.0), 21.0, t(0)),
            PositionSample::new(north(1.0), 21.0, t(60)),
            PositionSample::new(north(2.0), 21.0, t(120)),
        ]);
        let speeds = compute(&trace);

        assert_eq!(speeds.len(), 2);
        assert_relative_eq!(speeds[0].speed_kmh, 60.0, epsilon = 1e-6);
        assert_relative_eq!(speeds[1].speed_kmh, 60.0, epsilon = 1e-6);
        assert_eq!(speeds[0].time, t(60));
    }

    #[test]
    fn test_output_is_one_shorter_than_trace() {
        for n in 0usize..5 {
            let samples = (0..n)
                .map(|i| PositionSample::new(52.0, 21.0, t(i as i64 * 10)))
                .collect();
            let expected = n.saturating_sub(1);
            assert_eq!(compute(&trace_of(samples)).len(), expected);
        }
    }

    #[test]
    fn test_zero_time_step_is_not_finite() {
        let trace = trace_of(vec![
            PositionSample::new(52.0, 21.0, t(0)),
            PositionSample::new(52.01, 21.0, t(0)),
        ]);
        let speeds = compute(&trace);
        assert!(speeds[0].speed_kmh.is_infinite());
    }

    #[test]
    fn test_speed_file_round_trip() {
        let path = env::temp_dir()
            .join("transit_adherence_speed_file")
            .join("128/1/5972.txt");
        let samples = vec![
            SpeedSample {
                lat: 52.1,
                lon: 21.2,
                time: t(30),
                speed_kmh: 42.5,
            },
            SpeedSample {
                lat: 52.11,
                lon: 21.2,
                time: t(45) + TimeDelta::milliseconds(250),
                speed_kmh: 38.0,
            },
        ];

        write_speed_file(&path, &samples).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("lat,lon,time,speed_kmh"));
        assert!(content.contains("2021-02-03 08:00:30,"));
        assert!(content.contains("2021-02-03 08:00:45.250"));

        let loaded = read_speed_file(&path).unwrap();
        assert!(loaded.is_clean());
        assert_eq!(loaded.records, samples);

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_read_speed_file_skips_bad_rows() {
        let dir = env::temp_dir().join("transit_adherence_speed_bad");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("1.txt");
        fs::write(
            &path,
            "lat,lon,time,speed_kmh\n\
             52.1,21.2,2021-02-03 08:00:30,40.0\n\
             52.1,21.2,2021-02-03 08:01:00,fast\n\
             NaN,21.2,2021-02-03 08:01:30,40.0\n\
             52.1,inf,2021-02-03 08:02:00,40.0\n",
        )
        .unwrap();

        let loaded = read_speed_file(&path).unwrap();
        assert_eq!(loaded.records.len(), 1);
        assert_eq!(loaded.rejected.len(), 3);

        fs::remove_file(&path).unwrap();
    }
}
