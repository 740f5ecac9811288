//! Output formatting and persistence for analysis results.
//!
//! Supports pretty-printing, JSON reports, and CSV append of delay records.

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info};

use crate::delay::DelayRecord;
use crate::trace::TIMESTAMP_OUTPUT_FORMAT;
use csv::WriterBuilder;
use std::fmt::Debug;
use std::fs::{self, OpenOptions};
use std::path::Path;

/// Logs a value using Rust's debug pretty-print format.
pub fn print_pretty<T: Debug>(value: &T) {
    debug!("{:#?}", value);
}

/// Logs a value as pretty-printed JSON.
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    info!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Writes a report as pretty-printed JSON, replacing any existing file.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_vec_pretty(value)?)?;
    debug!(path = %path.display(), "Report written");
    Ok(())
}

/// One CSV row per matched stop.
#[derive(Debug, Serialize)]
struct DelayRow<'a> {
    route: &'a str,
    brigade: &'a str,
    stop_id: &'a str,
    stop_nr: &'a str,
    stop_name: &'a str,
    direction: &'a str,
    scheduled_arrival: String,
    matched_sample_time: String,
    match_distance_km: f64,
    delay_seconds: i64,
}

impl<'a> From<&'a DelayRecord> for DelayRow<'a> {
    fn from(r: &'a DelayRecord) -> Self {
        Self {
            route: &r.stop.route,
            brigade: &r.stop.brigade,
            stop_id: &r.stop.stop_id,
            stop_nr: &r.stop.stop_nr,
            stop_name: &r.stop.stop_name,
            direction: &r.stop.direction,
            scheduled_arrival: r.stop.scheduled_arrival.format(TIMESTAMP_OUTPUT_FORMAT).to_string(),
            matched_sample_time: r.matched_sample_time.format(TIMESTAMP_OUTPUT_FORMAT).to_string(),
            match_distance_km: r.match_distance_km,
            delay_seconds: r.delay_seconds,
        }
    }
}

/// Appends delay records as rows to a CSV file.
///
/// Creates the file with headers if it does not already exist.
pub fn append_delay_records(path: &Path, records: &[DelayRecord]) -> Result<()> {
    let file_exists = path.exists();
    debug!(path = %path.display(), file_exists, rows = records.len(), "Appending delay records");

    let file = OpenOptions::new().append(true).create(true).open(path)?;

    let mut writer = WriterBuilder::new()
        .has_headers(!file_exists)
        .from_writer(file);

    for record in records {
        writer.serialize(DelayRow::from(record))?;
    }
    writer.flush()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::ScheduledStop;
    use chrono::NaiveDate;
    use std::env;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        env::temp_dir().join(name)
    }

    fn record(delay_seconds: i64) -> DelayRecord {
        let arrival = NaiveDate::from_ymd_opt(2021, 2, 3)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap();
        DelayRecord {
            stop: ScheduledStop {
                route: "128".into(),
                brigade: "1".into(),
                stop_id: "7009".into(),
                stop_nr: "01".into(),
                scheduled_arrival: arrival,
                stop_name: "Dworzec Wschodni".into(),
                stop_lat: 52.2513,
                stop_lon: 21.0524,
                direction: "Os. Górczewska".into(),
                stop_heading: "Kijowska".into(),
            },
            matched_sample_time: arrival + chrono::Duration::seconds(delay_seconds),
            match_distance_km: 0.0,
            delay_seconds,
        }
    }

    #[test]
    fn test_print_pretty_does_not_panic() {
        print_pretty(&record(0));
    }

    #[test]
    fn test_print_json_does_not_panic() {
        print_json(&record(0)).unwrap();
    }

    #[test]
    fn test_append_delay_records_writes_header_once() {
        let path = temp_path("transit_adherence_test_header.csv");
        let _ = fs::remove_file(&path);

        append_delay_records(&path, &[record(0)]).unwrap();
        append_delay_records(&path, &[record(30), record(75)]).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines.iter().filter(|l| l.starts_with("route,")).count(), 1);
        assert!(lines[3].ends_with(",75"));
        assert!(lines[3].contains("2021-02-03 08:01:15"));

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_write_json_creates_parent_dirs() {
        let dir = temp_path("transit_adherence_test_report");
        let _ = fs::remove_dir_all(&dir);
        let path = dir.join("nested").join("report.json");

        write_json(&path, &record(12)).unwrap();

        let parsed: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["delay_seconds"], 12);
        assert_eq!(parsed["stop"]["stop_id"], "7009");

        fs::remove_dir_all(&dir).unwrap();
    }
}
