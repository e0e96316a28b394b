//! Error types for recognition, persistence and the scan/save service.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::models::CellPosition;

/// Failure of the recognition pipeline for one frame.
///
/// Every variant is an expected, user-correctable outcome (bad lighting, sheet
/// out of frame) and is turned into a "no digits detected" answer by the
/// service layer.
#[derive(Debug, Error)]
pub enum RecognitionError {
    #[error("image decode failed: {0}")]
    ImageDecode(String),

    #[error("no marks table found: {0}")]
    TableNotFound(String),

    #[error("inconsistent grid: row {row} has {found} columns, expected {expected}")]
    InconsistentGrid {
        row: usize,
        expected: usize,
        found: usize,
    },

    #[error(transparent)]
    RowRejected(#[from] RowRejected),
}

impl RecognitionError {
    /// Stable machine-readable reason, exposed to clients.
    pub fn reason(&self) -> &'static str {
        match self {
            RecognitionError::ImageDecode(_) => "image_decode",
            RecognitionError::TableNotFound(_) => "table_not_found",
            RecognitionError::InconsistentGrid { .. } => "inconsistent_grid",
            RecognitionError::RowRejected(_) => "row_rejected",
        }
    }
}

/// Per-cell classifier failure.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ClassificationError {
    #[error("cell contains no ink")]
    EmptyCell,

    #[error("classifier model failed: {0}")]
    Model(String),

    #[error("classifier returned unusable output: {0}")]
    InvalidOutput(String),
}

/// Why a single cell kept its row from being accepted.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectCause {
    Missing(ClassificationError),
    LowConfidence { digit: u8, confidence: f32 },
}

impl fmt::Display for RejectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectCause::Missing(err) => write!(f, "no prediction ({err})"),
            RejectCause::LowConfidence { digit, confidence } => {
                write!(f, "digit {digit} at confidence {confidence:.2}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RejectedCell {
    pub position: CellPosition,
    pub cause: RejectCause,
}

/// A row that could not be accepted. Carries every offending cell; an empty
/// list means the row had no cells at all.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("row rejected: {}", describe_rejections(.cells))]
pub struct RowRejected {
    pub cells: Vec<RejectedCell>,
}

fn describe_rejections(cells: &[RejectedCell]) -> String {
    if cells.is_empty() {
        return "no cells".to_string();
    }
    cells
        .iter()
        .map(|c| format!("cell ({}, {}): {}", c.position.row, c.position.column, c.cause))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Ledger Store failure.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("invalid ledger path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("ledger persistence failed for {path:?}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: sqlx::Error,
    },

    #[error("ledger migration failed for {path:?}: {source}")]
    Migration {
        path: PathBuf,
        #[source]
        source: sqlx::migrate::MigrateError,
    },

    #[error("ledger storage I/O failed for {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ledger {path:?} is corrupt: {detail}")]
    Corrupt { path: PathBuf, detail: String },
}

impl ScanError {
    /// The ledger-side cause, if any.
    pub fn ledger_error(&self) -> Option<&LedgerError> {
        match self {
            ScanError::Ledger(e) | ScanError::NotSaved { source: e, .. } => Some(e),
            ScanError::Worker(_) => None,
        }
    }
}

impl LedgerError {
    /// True for storage failures, false for a rejected identifier.
    pub fn is_persistence(&self) -> bool {
        !matches!(self, LedgerError::InvalidPath { .. })
    }
}

/// Failure surfaced by the scan/save service. Recognition problems never
/// appear here; they are part of the normal outcome.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// The row was read but the ledger could not store it.
    #[error("marks {marks:?} were recognized but not saved: {source}")]
    NotSaved {
        marks: Vec<u8>,
        #[source]
        source: LedgerError,
    },

    #[error("recognition worker failed: {0}")]
    Worker(String),
}

/// Configuration loading and validation failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Validation(String),
}
