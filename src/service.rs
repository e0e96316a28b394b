//! Scan/Save Orchestrator.
//!
//! `scan` previews a frame without side effects; `save` commits an accepted
//! row to a ledger. Recognition failures are ordinary outcomes here, never
//! errors. Only ledger and worker failures surface as [`ScanError`].

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{error, info, instrument, warn};

use crate::core::ledger::LedgerStore;
use crate::detection::Recognizer;
use crate::detection::aggregate::RecognizedRow;
use crate::error::{RecognitionError, ScanError};
use crate::models::{Frame, LedgerEntry, Prediction, Row};

pub const NO_DIGITS_MESSAGE: &str = "No digits detected";

/// Why nothing was detected, in a form fit for clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoDetection {
    /// Stable machine-readable cause, e.g. `table_not_found`.
    pub reason: &'static str,
    pub detail: String,
}

impl NoDetection {
    pub fn message(&self) -> &'static str {
        NO_DIGITS_MESSAGE
    }
}

impl From<&RecognitionError> for NoDetection {
    fn from(err: &RecognitionError) -> Self {
        Self {
            reason: err.reason(),
            detail: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    Detected(RecognizedRow),
    NoDetection(NoDetection),
}

impl ScanOutcome {
    pub fn predictions(&self) -> &[Prediction] {
        match self {
            ScanOutcome::Detected(recognized) => &recognized.predictions,
            ScanOutcome::NoDetection(_) => &[],
        }
    }
}

/// A row that was recognized and durably appended.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedRow {
    pub predictions: Vec<Prediction>,
    pub entry: LedgerEntry,
    pub grand_total: u64,
}

impl SavedRow {
    pub fn row(&self) -> &Row {
        &self.entry.row
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    Saved(SavedRow),
    NoDetection(NoDetection),
}

/// Entry point shared by the HTTP server and the CLI.
///
/// Recognition runs on the blocking thread pool, at most `workers` frames at a
/// time; further requests wait for a permit.
#[derive(Clone)]
pub struct MarkScanner {
    recognizer: Arc<Recognizer>,
    ledger: Arc<LedgerStore>,
    workers: Arc<Semaphore>,
}

impl MarkScanner {
    pub fn new(recognizer: Recognizer, ledger: LedgerStore, workers: usize) -> Self {
        Self {
            recognizer: Arc::new(recognizer),
            ledger: Arc::new(ledger),
            workers: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    pub fn ledger(&self) -> &LedgerStore {
        &self.ledger
    }

    async fn recognize(&self, frame: Frame) -> Result<Result<RecognizedRow, RecognitionError>, ScanError> {
        let permit = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| ScanError::Worker(e.to_string()))?;
        let recognizer = self.recognizer.clone();
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            recognizer.recognize(&frame)
        })
        .await
        .map_err(|e| ScanError::Worker(e.to_string()))
    }

    /// Recognize a frame without touching any ledger.
    #[instrument(skip_all, fields(len = frame.bytes.len()))]
    pub async fn scan(&self, frame: Frame) -> Result<ScanOutcome, ScanError> {
        match self.recognize(frame).await? {
            Ok(recognized) => {
                info!(count = recognized.predictions.len(), total = recognized.row.total, "Scan detected digits");
                Ok(ScanOutcome::Detected(recognized))
            }
            Err(err) => {
                warn!(reason = err.reason(), error = %err, "Scan found no digits");
                Ok(ScanOutcome::NoDetection(NoDetection::from(&err)))
            }
        }
    }

    /// Recognize a frame and append the accepted row to `excel_path`.
    ///
    /// The path is checked before recognition starts. A rejected row leaves
    /// the ledger untouched.
    #[instrument(skip(self, frame), fields(len = frame.bytes.len()))]
    pub async fn save(&self, frame: Frame, excel_path: &str) -> Result<SaveOutcome, ScanError> {
        if let Err(err) = self.ledger.validate(excel_path) {
            warn!(error = %err, "Rejected ledger path");
            return Err(err.into());
        }

        let recognized = match self.recognize(frame).await? {
            Ok(recognized) => recognized,
            Err(err) => {
                warn!(reason = err.reason(), error = %err, "Nothing saved, no digits detected");
                return Ok(SaveOutcome::NoDetection(NoDetection::from(&err)));
            }
        };

        match self.ledger.append(excel_path, &recognized.row).await {
            Ok(receipt) => Ok(SaveOutcome::Saved(SavedRow {
                predictions: recognized.predictions,
                entry: receipt.entry,
                grand_total: receipt.grand_total,
            })),
            Err(source) => {
                error!(error = %source, marks = ?recognized.row.marks, "Recognized row was not saved");
                Err(ScanError::NotSaved {
                    marks: recognized.row.marks,
                    source,
                })
            }
        }
    }

    pub async fn grand_total(&self, excel_path: &str) -> Result<u64, ScanError> {
        Ok(self.ledger.grand_total(excel_path).await?)
    }

    pub async fn entries(&self, excel_path: &str) -> Result<Vec<LedgerEntry>, ScanError> {
        Ok(self.ledger.entries(excel_path).await?)
    }

    pub async fn export_csv(&self, excel_path: &str) -> Result<String, ScanError> {
        Ok(self.ledger.export_csv(excel_path).await?)
    }
}
