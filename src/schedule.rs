//! Stop catalog, timetables and the per-brigade schedule built from them.
//!
//! Both the stop catalog and the timetable files use the open-data record
//! layout `[{"values": [{"key": "...", "value": "..."}, ...]}, ...]`.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, instrument, warn};

use crate::archive::{StopRef, timetable_files};
use crate::error::{AnalysisError, Loaded, Result};
use crate::geo::check_coordinates;

#[derive(Debug, Deserialize)]
struct RawField {
    key: String,
    #[serde(default)]
    value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    values: Vec<RawField>,
}

impl RawRecord {
    fn get(&self, key: &str) -> Option<String> {
        let field = self.values.iter().find(|f| f.key == key)?;
        match &field.value {
            serde_json::Value::String(s) if s != "null" => Some(s.trim().to_string()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn require(&self, key: &str) -> std::result::Result<String, String> {
        self.get(key).ok_or_else(|| format!("missing field '{key}'"))
    }
}

fn read_raw_records(path: &Path, what: &'static str) -> Result<Vec<RawRecord>> {
    let content = fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => AnalysisError::missing(what, path.display().to_string()),
        _ => AnalysisError::Io(e),
    })?;
    Ok(serde_json::from_str(&content)?)
}

/// Static metadata of one stop (a numbered post within a stop group).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StopInfo {
    pub stop_id: String,
    pub stop_nr: String,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    /// Heading of the post as published in the catalog.
    pub heading: String,
}

/// Resolves stop metadata by `(stop_id, stop_nr)`.
pub trait StopLookup {
    fn lookup(&self, stop: &StopRef) -> Option<&StopInfo>;
}

/// All stops of the network keyed by `(stop_id, stop_nr)`.
#[derive(Debug, Default)]
pub struct StopCatalog {
    stops: HashMap<StopRef, StopInfo>,
}

impl StopCatalog {
    pub fn from_stops(stops: impl IntoIterator<Item = StopInfo>) -> Self {
        Self {
            stops: stops
                .into_iter()
                .map(|s| (StopRef::new(s.stop_id.clone(), s.stop_nr.clone()), s))
                .collect(),
        }
    }

    /// Loads the catalog file; unparseable entries are skipped and returned.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn load(path: &Path) -> Result<(Self, Vec<AnalysisError>)> {
        let records = read_raw_records(path, "stop catalog")?;

        let mut stops = Vec::with_capacity(records.len());
        let mut rejected = Vec::new();
        for (index, record) in records.iter().enumerate() {
            match parse_stop(record) {
                Ok(stop) => stops.push(stop),
                Err(reason) => rejected.push(AnalysisError::malformed(path, index, reason)),
            }
        }

        if !rejected.is_empty() {
            warn!(rejected = rejected.len(), "Skipped malformed catalog entries");
        }
        debug!(stops = stops.len(), "Stop catalog loaded");
        Ok((Self::from_stops(stops), rejected))
    }

    pub fn len(&self) -> usize {
        self.stops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stops.is_empty()
    }
}

impl StopLookup for StopCatalog {
    fn lookup(&self, stop: &StopRef) -> Option<&StopInfo> {
        self.stops.get(stop)
    }
}

fn parse_stop(record: &RawRecord) -> std::result::Result<StopInfo, String> {
    let coord = |key: &str| -> std::result::Result<f64, String> {
        let raw = record.require(key)?;
        raw.parse().map_err(|_| format!("non-numeric {key} '{raw}'"))
    };

    let lat = coord("szer_geo")?;
    let lon = coord("dlug_geo")?;
    check_coordinates(lat, lon)?;

    Ok(StopInfo {
        stop_id: record.require("zespol")?,
        stop_nr: record.require("slupek")?,
        name: record.get("nazwa_zespolu").unwrap_or_default(),
        lat,
        lon,
        heading: record.get("kierunek").unwrap_or_default(),
    })
}

/// Scheduled time of day, possibly past midnight of the service day (`24:00:00` and later).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ServiceTime {
    seconds: u32,
}

impl ServiceTime {
    const MAX_HOUR: u32 = 47;

    /// Parses `HH:MM:SS` with hours in `0..=47`.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.trim().split(':');
        let h: u32 = parts.next()?.parse().ok()?;
        let m: u32 = parts.next()?.parse().ok()?;
        let s: u32 = parts.next()?.parse().ok()?;
        if parts.next().is_some() || h > Self::MAX_HOUR || m > 59 || s > 59 {
            return None;
        }
        Some(Self {
            seconds: h * 3600 + m * 60 + s,
        })
    }

    /// Absolute instant on the service day starting at `date`; hours of 24 and
    /// above land on the following calendar day.
    pub fn on(self, date: NaiveDate) -> NaiveDateTime {
        date.and_time(NaiveTime::default()) + TimeDelta::seconds(i64::from(self.seconds))
    }
}

/// One departure of one brigade at one stop.
#[derive(Debug, Clone, PartialEq)]
pub struct TimetableEntry {
    pub brigade: String,
    /// Terminal the trip is heading to.
    pub direction: String,
    pub time: ServiceTime,
}

/// All entries of a single `<stopId>_<stopNr>.json` file.
#[derive(Debug, Clone)]
pub struct StopTimetable {
    pub stop: StopRef,
    pub entries: Vec<TimetableEntry>,
}

fn parse_entry(record: &RawRecord) -> std::result::Result<TimetableEntry, String> {
    let raw_time = record.require("czas")?;
    let time = ServiceTime::parse(&raw_time).ok_or_else(|| format!("bad time of day '{raw_time}'"))?;

    Ok(TimetableEntry {
        brigade: record.require("brygada")?,
        direction: record.get("kierunek").unwrap_or_default(),
        time,
    })
}

impl StopTimetable {
    pub fn read(stop: StopRef, path: &Path) -> Result<Loaded<TimetableEntry>> {
        let records = read_raw_records(path, "timetable file")?;

        let mut entries = Vec::with_capacity(records.len());
        let mut rejected = Vec::new();
        for (index, record) in records.iter().enumerate() {
            match parse_entry(record) {
                Ok(entry) => entries.push(entry),
                Err(reason) => rejected.push(AnalysisError::malformed(path, index, reason)),
            }
        }

        debug!(stop_id = %stop.stop_id, stop_nr = %stop.stop_nr, entries = entries.len(), "Timetable read");
        Ok(Loaded::new(entries, rejected))
    }
}

/// A stop the brigade is due at, with everything needed to match it against a trace.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduledStop {
    pub route: String,
    pub brigade: String,
    pub stop_id: String,
    pub stop_nr: String,
    pub scheduled_arrival: NaiveDateTime,
    pub stop_name: String,
    pub stop_lat: f64,
    pub stop_lon: f64,
    /// Terminal of the trip serving this stop.
    pub direction: String,
    pub stop_heading: String,
}

/// Every stop timetable of one route.
#[derive(Debug, Clone)]
pub struct RouteTimetable {
    pub route: String,
    pub stops: Vec<StopTimetable>,
}

impl RouteTimetable {
    /// Reads all timetable files of `route` under `root`.
    ///
    /// A file that is not valid JSON is skipped as a whole and reported
    /// alongside the skipped entries of the readable files.
    pub fn read(root: &Path, route: &str) -> Result<Loaded<StopTimetable>> {
        let mut stops = Vec::new();
        let mut rejected = Vec::new();

        for (stop, path) in timetable_files(root, route)? {
            match StopTimetable::read(stop.clone(), &path) {
                Ok(loaded) => {
                    rejected.extend(loaded.rejected);
                    stops.push(StopTimetable {
                        stop,
                        entries: loaded.records,
                    });
                }
                Err(AnalysisError::Json(e)) => {
                    rejected.push(AnalysisError::malformed(&path, 0, format!("unreadable timetable: {e}")));
                }
                Err(e) => return Err(e),
            }
        }

        Ok(Loaded::new(stops, rejected))
    }

    /// Stops `brigade` is due at within `[window_start, window_end]`.
    ///
    /// Times of day are anchored on the calendar date of `window_start`.
    /// A retained entry whose stop is absent from `catalog` fails the whole
    /// route with [`AnalysisError::MissingInput`].
    pub fn schedule_for(
        &self,
        brigade: &str,
        window_start: NaiveDateTime,
        window_end: NaiveDateTime,
        catalog: &impl StopLookup,
    ) -> Result<Vec<ScheduledStop>> {
        let service_date = window_start.date();
        let mut schedule = Vec::new();

        for timetable in &self.stops {
            for entry in timetable.entries.iter().filter(|e| e.brigade == brigade) {
                let arrival = entry.time.on(service_date);
                if arrival < window_start || arrival > window_end {
                    continue;
                }

                let info = catalog.lookup(&timetable.stop).ok_or_else(|| {
                    AnalysisError::missing(
                        "stop in catalog",
                        format!("{}_{}", timetable.stop.stop_id, timetable.stop.stop_nr),
                    )
                })?;

                schedule.push(ScheduledStop {
                    route: self.route.clone(),
                    brigade: brigade.to_string(),
                    stop_id: info.stop_id.clone(),
                    stop_nr: info.stop_nr.clone(),
                    scheduled_arrival: arrival,
                    stop_name: info.name.clone(),
                    stop_lat: info.lat,
                    stop_lon: info.lon,
                    direction: entry.direction.clone(),
                    stop_heading: info.heading.clone(),
                });
            }
        }

        Ok(schedule)
    }
}

/// Loads scheduled stops for a (route, brigade) pair from a timetable archive.
pub struct ScheduleIndex<'a, L: StopLookup> {
    timetable_root: &'a Path,
    catalog: &'a L,
}

impl<'a, L: StopLookup> ScheduleIndex<'a, L> {
    pub fn new(timetable_root: &'a Path, catalog: &'a L) -> Self {
        Self {
            timetable_root,
            catalog,
        }
    }

    /// Scheduled stops of `brigade` on `route` inside the window; skipped
    /// timetable entries come back in `rejected`.
    #[instrument(skip(self))]
    pub fn load(
        &self,
        route: &str,
        brigade: &str,
        window_start: NaiveDateTime,
        window_end: NaiveDateTime,
    ) -> Result<Loaded<ScheduledStop>> {
        let timetables = RouteTimetable::read(self.timetable_root, route)?;
        let route_timetable = RouteTimetable {
            route: route.to_string(),
            stops: timetables.records,
        };
        let schedule = route_timetable.schedule_for(brigade, window_start, window_end, self.catalog)?;

        debug!(stops = schedule.len(), "Schedule loaded");
        Ok(Loaded::new(schedule, timetables.rejected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::path::PathBuf;

    fn at(day: u32, h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2021, 2, day)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn stop(id: &str, nr: &str, lat: f64, lon: f64) -> StopInfo {
        StopInfo {
            stop_id: id.into(),
            stop_nr: nr.into(),
            name: format!("Stop {id}"),
            lat,
            lon,
            heading: "Centrum".into(),
        }
    }

    fn entry(brigade: &str, time: &str) -> TimetableEntry {
        TimetableEntry {
            brigade: brigade.into(),
            direction: "Dw. Wschodni".into(),
            time: ServiceTime::parse(time).unwrap(),
        }
    }

    #[test]
    fn test_service_time_parse() {
        assert!(ServiceTime::parse("07:15:00").is_some());
        assert!(ServiceTime::parse("47:59:59").is_some());
        assert!(ServiceTime::parse("48:00:00").is_none());
        assert!(ServiceTime::parse("12:61:00").is_none());
        assert!(ServiceTime::parse("12:00").is_none());
        assert!(ServiceTime::parse("ab:cd:ef").is_none());
    }

    #[test]
    fn test_service_time_after_midnight_rolls_over() {
        let date = NaiveDate::from_ymd_opt(2021, 2, 3).unwrap();
        assert_eq!(ServiceTime::parse("23:59:00").unwrap().on(date), at(3, 23, 59, 0));
        assert_eq!(ServiceTime::parse("25:05:00").unwrap().on(date), at(4, 1, 5, 0));
    }

    #[test]
    fn test_schedule_filters_brigade_and_window() {
        let catalog = StopCatalog::from_stops([stop("7009", "01", 52.0, 21.0)]);
        let timetable = RouteTimetable {
            route: "128".into(),
            stops: vec![StopTimetable {
                stop: StopRef::new("7009", "01"),
                entries: vec![
                    entry("1", "09:59:59"),
                    entry("1", "10:00:00"),
                    entry("2", "10:05:00"),
                    entry("1", "10:30:00"),
                    entry("1", "10:30:01"),
                ],
            }],
        };

        let schedule = timetable
            .schedule_for("1", at(3, 10, 0, 0), at(3, 10, 30, 0), &catalog)
            .unwrap();

        assert_eq!(schedule.len(), 2);
        assert_eq!(schedule[0].scheduled_arrival, at(3, 10, 0, 0));
        assert_eq!(schedule[1].scheduled_arrival, at(3, 10, 30, 0));
        assert_eq!(schedule[0].direction, "Dw. Wschodni");
        assert_eq!(schedule[0].stop_heading, "Centrum");
        assert_eq!(schedule[0].stop_lat, 52.0);
    }

    #[test]
    fn test_schedule_includes_after_midnight_entries() {
        let catalog = StopCatalog::from_stops([stop("7009", "01", 52.0, 21.0)]);
        let timetable = RouteTimetable {
            route: "N01".into(),
            stops: vec![StopTimetable {
                stop: StopRef::new("7009", "01"),
                entries: vec![entry("1", "24:10:00")],
            }],
        };

        let schedule = timetable
            .schedule_for("1", at(3, 23, 50, 0), at(4, 0, 30, 0), &catalog)
            .unwrap();
        assert_eq!(schedule.len(), 1);
        assert_eq!(schedule[0].scheduled_arrival, at(4, 0, 10, 0));
    }

    #[test]
    fn test_schedule_missing_stop_is_error() {
        let catalog = StopCatalog::default();
        let timetable = RouteTimetable {
            route: "128".into(),
            stops: vec![StopTimetable {
                stop: StopRef::new("7009", "01"),
                entries: vec![entry("1", "10:00:00")],
            }],
        };

        let err = timetable
            .schedule_for("1", at(3, 9, 0, 0), at(3, 11, 0, 0), &catalog)
            .unwrap_err();
        match err {
            AnalysisError::MissingInput { key, .. } => assert_eq!(key, "7009_01"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_schedule_ignores_missing_stop_outside_window() {
        let catalog = StopCatalog::default();
        let timetable = RouteTimetable {
            route: "128".into(),
            stops: vec![StopTimetable {
                stop: StopRef::new("7009", "01"),
                entries: vec![entry("1", "15:00:00")],
            }],
        };

        let schedule = timetable
            .schedule_for("1", at(3, 9, 0, 0), at(3, 11, 0, 0), &catalog)
            .unwrap();
        assert!(schedule.is_empty());
    }

    fn record(fields: &[(&str, &str)]) -> String {
        let values: Vec<String> = fields
            .iter()
            .map(|(k, v)| format!(r#"{{"key":"{k}","value":"{v}"}}"#))
            .collect();
        format!(r#"{{"values":[{}]}}"#, values.join(","))
    }

    fn scratch(name: &str) -> PathBuf {
        let dir = env::temp_dir().join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_catalog_load_skips_bad_coordinates() {
        let dir = scratch("transit_adherence_catalog");
        let path = dir.join("stops_coord.json");
        let good = record(&[
            ("zespol", "7009"),
            ("slupek", "01"),
            ("nazwa_zespolu", "Sielce"),
            ("szer_geo", "52.196"),
            ("dlug_geo", "21.035"),
            ("kierunek", "Chełmska"),
        ]);
        let bad = record(&[
            ("zespol", "7009"),
            ("slupek", "02"),
            ("szer_geo", "null"),
            ("dlug_geo", "21.035"),
        ]);
        fs::write(&path, format!("[{good},{bad}]")).unwrap();

        let (catalog, rejected) = StopCatalog::load(&path).unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(rejected.len(), 1);

        let info = catalog.lookup(&StopRef::new("7009", "01")).unwrap();
        assert_eq!(info.name, "Sielce");
        assert_eq!(info.heading, "Chełmska");

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_catalog_load_rejects_non_finite_coordinates() {
        let dir = scratch("transit_adherence_catalog_range");
        let path = dir.join("stops_coord.json");
        let stop_with = |nr: &str, lat: &str, lon: &str| {
            record(&[("zespol", "7009"), ("slupek", nr), ("szer_geo", lat), ("dlug_geo", lon)])
        };
        let records = [
            stop_with("01", "52.196", "21.035"),
            stop_with("02", "NaN", "21.035"),
            stop_with("03", "52.196", "inf"),
            stop_with("04", "152.0", "21.035"),
        ];
        fs::write(&path, format!("[{}]", records.join(","))).unwrap();

        let (catalog, rejected) = StopCatalog::load(&path).unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(rejected.len(), 3);
        assert!(catalog.lookup(&StopRef::new("7009", "02")).is_none());
    }

    #[test]
    fn test_catalog_missing_file() {
        let err = StopCatalog::load(Path::new("/no/such/stops_coord.json")).unwrap_err();
        assert!(matches!(err, AnalysisError::MissingInput { .. }));
    }

    #[test]
    fn test_schedule_index_load_reports_bad_entries() {
        let dir = scratch("transit_adherence_schedule_index");
        fs::create_dir_all(dir.join("128")).unwrap();
        let ok = record(&[("brygada", "1"), ("kierunek", "Sielce"), ("czas", "10:00:00")]);
        let bad = record(&[("brygada", "1"), ("kierunek", "Sielce"), ("czas", "1O:00:00")]);
        fs::write(dir.join("128").join("7009_01.json"), format!("[{ok},{bad}]")).unwrap();
        fs::write(dir.join("128").join("7009_02.json"), "not json").unwrap();

        let catalog = StopCatalog::from_stops([stop("7009", "01", 52.0, 21.0)]);
        let index = ScheduleIndex::new(&dir, &catalog);
        let loaded = index.load("128", "1", at(3, 9, 0, 0), at(3, 11, 0, 0)).unwrap();

        assert_eq!(loaded.records.len(), 1);
        assert_eq!(loaded.rejected.len(), 2);

        fs::remove_dir_all(&dir).unwrap();
    }
}
