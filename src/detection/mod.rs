//! Digit recognition: from an encoded frame to an accepted row of marks.

pub mod aggregate;
pub mod classifier;
pub mod contours;
pub mod glyph;
pub mod preprocessing;
pub mod steps;
pub mod table;

use std::path::Path;
use std::sync::Arc;

use image::GrayImage;
use tracing::{info, instrument};

use crate::config::RecognitionConfig;
use crate::error::RecognitionError;
use crate::models::{Cell, Frame};
use crate::pipeline::Pipeline;

use aggregate::{CellResult, RecognizedRow, RowAggregator};
use classifier::{DigitClassifier, classify_cell};
use table::{CellGrid, TableLocator};

/// Recognition pipeline orchestrator.
///
/// Stateless between calls, so one instance can serve concurrent frames.
pub struct Recognizer {
    preprocessing: Pipeline,
    locator: TableLocator,
    classifier: Arc<dyn DigitClassifier>,
    aggregator: RowAggregator,
    min_glyph_area: u32,
}

impl Recognizer {
    pub fn new(config: &RecognitionConfig, classifier: Arc<dyn DigitClassifier>) -> Self {
        Self {
            preprocessing: steps::build_preprocessing_pipeline(config),
            locator: TableLocator::from(config),
            classifier,
            aggregator: RowAggregator::new(config.min_confidence),
            min_glyph_area: config.min_glyph_area,
        }
    }

    /// Write intermediate images (preprocessing stages, rectified table,
    /// cells) under `output_dir`, which must be empty or absent.
    pub fn with_debug(mut self, output_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        self.preprocessing = self.preprocessing.with_debug(output_dir)?;
        Ok(self)
    }

    pub fn classifier_name(&self) -> &str {
        self.classifier.name()
    }

    /// Decode the frame and run the preprocessing chain, yielding the ink mask
    /// in the canonical frame.
    pub fn preprocess(&self, frame: &Frame) -> Result<GrayImage, RecognitionError> {
        let decoded = preprocessing::decode_frame(frame)?;
        let gray = preprocessing::to_grayscale(&decoded);
        Ok(self.preprocessing.run(gray))
    }

    pub fn locate(&self, mask: &GrayImage) -> Result<CellGrid, RecognitionError> {
        self.locator.locate_cells(mask, self.preprocessing.context())
    }

    /// Classify each cell independently; failures stay attached to their cell.
    pub fn classify_cells(&self, cells: &[Cell]) -> Vec<CellResult> {
        let context = self.preprocessing.context();
        cells
            .iter()
            .map(|cell| {
                let file = format!("r{:02}-c{:02}.png", cell.position.row, cell.position.column);
                context.save_debug_image("cells", &file, &cell.image);
                CellResult {
                    position: cell.position,
                    bounds: cell.bounds,
                    outcome: classify_cell(self.classifier.as_ref(), cell, self.min_glyph_area),
                }
            })
            .collect()
    }

    /// Run the full pipeline on one frame.
    #[instrument(skip_all, fields(classifier = self.classifier.name()))]
    pub fn recognize(&self, frame: &Frame) -> Result<RecognizedRow, RecognitionError> {
        let mask = self.preprocess(frame)?;
        let grid = self.locate(&mask)?;
        let results = self.classify_cells(&grid.cells);
        let recognized = self.aggregator.aggregate(results)?;
        info!(
            rows = grid.rows,
            columns = grid.columns,
            marks = ?recognized.row.marks,
            total = recognized.row.total,
            "Row recognized"
        );
        Ok(recognized)
    }
}
