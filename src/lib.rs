pub mod config;
pub mod core;
pub mod detection;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod server;
pub mod service;
pub mod session;

pub use config::Config;
pub use core::ledger::{LedgerPath, LedgerStore};
pub use detection::Recognizer;
pub use detection::classifier::{DigitClassifier, TemplateClassifier};
pub use error::{ClassificationError, LedgerError, RecognitionError, RowRejected, ScanError};
pub use models::{Cell, CellBounds, CellPosition, DigitScore, Frame, LedgerEntry, Prediction, Row};
pub use pipeline::{DebugConfig, Pipeline, PipelineContext, PipelineStep};
pub use service::{MarkScanner, NoDetection, SaveOutcome, ScanOutcome};
pub use session::SessionTally;
