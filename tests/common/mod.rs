#![allow(dead_code)]

mod fixtures;
pub use fixtures::*;

pub use markscan::models::Row;
pub use markscan::{LedgerError, LedgerStore, MarkScanner, SaveOutcome, ScanError, ScanOutcome};
