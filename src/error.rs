//! Error taxonomy shared by every analysis stage.

use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalysisError {
    /// A required directory, file or catalog entry does not exist.
    #[error("missing {what}: {key}")]
    MissingInput { what: &'static str, key: String },

    /// A single trace or timetable record could not be parsed.
    #[error("malformed record {index} in {}: {reason}", file.display())]
    MalformedRecord {
        file: PathBuf,
        index: usize,
        reason: String,
    },

    /// Input violating a documented precondition (e.g. no finite matching cost).
    #[error("degenerate input: {0}")]
    DegenerateInput(String),

    /// A batch worker stopped without producing a result.
    #[error("worker failed: {0}")]
    Worker(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl AnalysisError {
    pub fn missing(what: &'static str, key: impl Into<String>) -> Self {
        AnalysisError::MissingInput {
            what,
            key: key.into(),
        }
    }

    pub fn malformed(file: &Path, index: usize, reason: impl Into<String>) -> Self {
        AnalysisError::MalformedRecord {
            file: file.to_path_buf(),
            index,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AnalysisError>;

/// Records that parsed, plus the ones that were skipped and why.
#[derive(Debug)]
pub struct Loaded<T> {
    pub records: Vec<T>,
    pub rejected: Vec<AnalysisError>,
}

impl<T> Loaded<T> {
    pub fn new(records: Vec<T>, rejected: Vec<AnalysisError>) -> Self {
        Self { records, rejected }
    }

    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }
}
