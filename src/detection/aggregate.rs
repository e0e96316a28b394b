//! Row Aggregator: turn per-cell classifier results into one accepted row, or
//! reject the row as a whole.

use tracing::debug;

use crate::error::{ClassificationError, RejectCause, RejectedCell, RowRejected};
use crate::models::{CellBounds, CellPosition, DigitScore, Prediction, Row};

/// Classifier outcome for one located cell.
#[derive(Debug, Clone)]
pub struct CellResult {
    pub position: CellPosition,
    pub bounds: CellBounds,
    pub outcome: Result<DigitScore, ClassificationError>,
}

/// Accepted row together with the per-cell predictions it was built from.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognizedRow {
    pub predictions: Vec<Prediction>,
    pub row: Row,
}

#[derive(Debug, Clone, Copy)]
pub struct RowAggregator {
    pub min_confidence: f32,
}

impl RowAggregator {
    pub fn new(min_confidence: f32) -> Self {
        Self { min_confidence }
    }

    /// Accept the row only if every cell has a prediction at or above the
    /// confidence threshold. Marks follow grid order (row-major), whatever
    /// order the results arrive in. A rejection lists every failing cell.
    pub fn aggregate(&self, mut results: Vec<CellResult>) -> Result<RecognizedRow, RowRejected> {
        if results.is_empty() {
            return Err(RowRejected { cells: Vec::new() });
        }
        results.sort_by_key(|r| r.position);

        let mut predictions = Vec::with_capacity(results.len());
        let mut rejected = Vec::new();
        for result in results {
            match result.outcome {
                Ok(score) if score.confidence >= self.min_confidence => {
                    predictions.push(Prediction {
                        position: result.position,
                        bounds: result.bounds,
                        digit: score.digit,
                        confidence: score.confidence,
                    });
                }
                Ok(score) => rejected.push(RejectedCell {
                    position: result.position,
                    cause: RejectCause::LowConfidence {
                        digit: score.digit,
                        confidence: score.confidence,
                    },
                }),
                Err(err) => rejected.push(RejectedCell {
                    position: result.position,
                    cause: RejectCause::Missing(err),
                }),
            }
        }

        if !rejected.is_empty() {
            debug!(rejected = rejected.len(), "Row rejected");
            return Err(RowRejected { cells: rejected });
        }

        let row = Row::from_marks(predictions.iter().map(|p| p.digit).collect());
        Ok(RecognizedRow { predictions, row })
    }
}
