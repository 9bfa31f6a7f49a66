//
// error.rs
// radifox
//
// Error taxonomy shared by the naming, ledger, anonymization and conversion layers.
//
// Thales Matheus Mendonça Santos - October 2026

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Why a series was marked non-convertible. Recorded in the series entry, never fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClassificationError {
    #[error("required tag {0} is missing")]
    MissingTag(&'static str),
}

impl ClassificationError {
    /// Stable code written to `SeriesInfo.ErrorCode`.
    pub fn code(&self) -> String {
        match self {
            ClassificationError::MissingTag(tag) => format!("MISSING_{}", tag),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NamingError {
    #[error("ambiguous look-up match for {description:?}: {candidates} rows at equal specificity")]
    Ambiguous { description: String, candidates: usize },

    #[error("invalid override string {0:?}")]
    InvalidOverride(String),
}

#[derive(Error, Debug)]
pub enum LookupError {
    #[error("failed to read look-up table {path:?}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("look-up table {path:?} is missing column {column}")]
    MissingColumn { path: PathBuf, column: &'static str },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum MappingError {
    #[error("no mapping record for {0}")]
    NotFound(String),

    #[error("mapping store error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("mapping store {path:?} unavailable: {reason}")]
    Unavailable { path: PathBuf, reason: String },

    #[error("could not allocate a unique anonymous id after {0} attempts")]
    IdExhausted(usize),
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("no ledger at {0:?}")]
    Missing(PathBuf),

    #[error("corrupt ledger or session record {path:?}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failure of a single external converter invocation.
#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("failed to launch converter {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("converter exited with status {status}")]
    Failed { status: String },

    #[error("converter timed out after {0:?}")]
    Timeout(Duration),

    #[error("converter produced no output at {0:?}")]
    MissingOutput(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Session-level failures. These abort the whole session.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid JSON in {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Lookup(#[from] LookupError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error("output already exists at {0:?}")]
    OutputExists(PathBuf),

    #[error("no DICOM series found under {0:?}")]
    NoSeries(PathBuf),

    #[error("{0}")]
    Invalid(String),
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_codes_are_stable() {
        assert_eq!(
            ClassificationError::MissingTag("SERIES_UID").code(),
            "MISSING_SERIES_UID"
        );
    }
}
