//! Directory conventions of a collected archive.
//!
//! Traces live at `<root>/<route>/<brigade>/<vehicle>.txt` and timetables at
//! `<root>/<route>/<stopId>_<stopNr>.json`.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{AnalysisError, Result};
use crate::trace::TraceKey;

fn ensure_dir(dir: &Path, what: &'static str) -> Result<()> {
    if dir.is_dir() {
        Ok(())
    } else {
        Err(AnalysisError::missing(what, dir.display().to_string()))
    }
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort();
    Ok(entries)
}

/// Lists every trace file two directory levels below `root`, sorted by path.
pub fn trace_files(root: &Path) -> Result<Vec<PathBuf>> {
    ensure_dir(root, "trace archive directory")?;

    let mut files = Vec::new();
    for route_dir in sorted_entries(root)?.into_iter().filter(|p| p.is_dir()) {
        for brigade_dir in sorted_entries(&route_dir)?.into_iter().filter(|p| p.is_dir()) {
            files.extend(sorted_entries(&brigade_dir)?.into_iter().filter(|p| p.is_file()));
        }
    }

    debug!(root = %root.display(), files = files.len(), "Trace files listed");
    Ok(files)
}

/// Stop id and stop number encoded in a timetable file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StopRef {
    pub stop_id: String,
    pub stop_nr: String,
}

impl StopRef {
    pub fn new(stop_id: impl Into<String>, stop_nr: impl Into<String>) -> Self {
        Self {
            stop_id: stop_id.into(),
            stop_nr: stop_nr.into(),
        }
    }

    /// Parses `<stopId>_<stopNr>.json`.
    pub fn from_file_name(path: &Path) -> Option<Self> {
        let stem = path.file_stem()?.to_str()?;
        let (stop_id, stop_nr) = stem.split_once('_')?;
        if stop_id.is_empty() || stop_nr.is_empty() {
            return None;
        }
        Some(Self::new(stop_id, stop_nr))
    }
}

/// Lists `(stop, path)` for every timetable file of `route`.
pub fn timetable_files(root: &Path, route: &str) -> Result<Vec<(StopRef, PathBuf)>> {
    ensure_dir(root, "timetable directory")?;
    let route_dir = root.join(route);
    ensure_dir(&route_dir, "timetables for route")?;

    let files: Vec<_> = sorted_entries(&route_dir)?
        .into_iter()
        .filter(|p| p.is_file() && p.extension().and_then(|e| e.to_str()) == Some("json"))
        .filter_map(|p| StopRef::from_file_name(&p).map(|stop| (stop, p)))
        .collect();

    debug!(route, files = files.len(), "Timetable files listed");
    Ok(files)
}

/// Default output directory for derived speed files: `<root>_with_speed`.
pub fn speed_archive_root(root: &Path) -> PathBuf {
    let mut name = root
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push("_with_speed");
    root.with_file_name(name)
}

/// Where the file for `key` lives under an archive root.
pub fn trace_path(root: &Path, key: &TraceKey) -> PathBuf {
    root.join(&key.route)
        .join(&key.brigade)
        .join(format!("{}.txt", key.vehicle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn scratch(name: &str) -> PathBuf {
        let dir = env::temp_dir().join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_trace_files_two_levels_deep() {
        let root = scratch("transit_adherence_archive_traces");
        for key in [
            TraceKey::new("128", "1", "5972"),
            TraceKey::new("128", "2", "5980"),
            TraceKey::new("523", "4", "1012"),
        ] {
            let path = trace_path(&root, &key);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, "").unwrap();
        }
        // A stray file at route level is not a trace.
        fs::write(root.join("128").join("notes.txt"), "").unwrap();

        let files = trace_files(&root).unwrap();
        assert_eq!(files.len(), 3);
        assert!(files[0].ends_with("128/1/5972.txt"));

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_missing_archive_root() {
        let err = trace_files(Path::new("/no/such/archive")).unwrap_err();
        assert!(matches!(err, AnalysisError::MissingInput { .. }));
    }

    #[test]
    fn test_timetable_files_parse_stop_ref() {
        let root = scratch("transit_adherence_archive_timetables");
        fs::create_dir_all(root.join("128")).unwrap();
        fs::write(root.join("128").join("7009_01.json"), "[]").unwrap();
        fs::write(root.join("128").join("readme.md"), "").unwrap();

        let files = timetable_files(&root, "128").unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].0, StopRef::new("7009", "01"));

        let err = timetable_files(&root, "999").unwrap_err();
        assert!(err.to_string().contains("999"));

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_speed_archive_root() {
        assert_eq!(
            speed_archive_root(Path::new("/data/busestrams")),
            PathBuf::from("/data/busestrams_with_speed")
        );
    }
}
