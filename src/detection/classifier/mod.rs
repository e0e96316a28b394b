//! Digit Classifier Adapter.
//!
//! The recognizer only depends on [`DigitClassifier`]; the network-backed
//! implementation and the deterministic template matcher are interchangeable.

pub mod cnn;
pub mod template;

use std::sync::Arc;

use image::GrayImage;
use tracing::debug;

use crate::config::{ClassifierConfig, ClassifierKind};
use crate::detection::glyph::extract_glyph;
use crate::error::{ClassificationError, ConfigError};
use crate::models::{Cell, DigitScore};

pub use cnn::CnnClassifier;
pub use template::TemplateClassifier;

/// Capability: name the digit drawn in a glyph.
pub trait DigitClassifier: Send + Sync {
    /// `glyph` is a tight crop of the ink (ink = 255, background = 0).
    fn classify(&self, glyph: &GrayImage) -> Result<DigitScore, ClassificationError>;

    fn name(&self) -> &str;
}

/// Classify one cell: isolate its glyph, run the classifier, and check that
/// the answer is a digit with a probability-valued confidence.
///
/// Classifier failures are returned as-is; there are no retries because the
/// same input produces the same failure.
pub fn classify_cell(
    classifier: &dyn DigitClassifier,
    cell: &Cell,
    min_glyph_area: u32,
) -> Result<DigitScore, ClassificationError> {
    let glyph = extract_glyph(&cell.image, min_glyph_area).ok_or(ClassificationError::EmptyCell)?;
    let score = classifier.classify(&glyph)?;

    if score.digit > 9 {
        return Err(ClassificationError::InvalidOutput(format!(
            "digit {} out of range",
            score.digit
        )));
    }
    if !score.confidence.is_finite() || !(0.0..=1.0).contains(&score.confidence) {
        return Err(ClassificationError::InvalidOutput(format!(
            "confidence {} is not a probability",
            score.confidence
        )));
    }
    debug!(
        row = cell.position.row,
        column = cell.position.column,
        digit = score.digit,
        confidence = score.confidence,
        "Cell classified"
    );
    Ok(score)
}

/// Build the classifier selected by configuration.
pub fn from_config(config: &ClassifierConfig) -> Result<Arc<dyn DigitClassifier>, ConfigError> {
    match config.kind {
        ClassifierKind::Template => Ok(Arc::new(TemplateClassifier::new(config.temperature))),
        ClassifierKind::Cnn => {
            let path = config.model_path.as_ref().ok_or_else(|| {
                ConfigError::Validation("classifier.model_path is required".to_string())
            })?;
            let classifier = CnnClassifier::load(path)
                .map_err(|e| ConfigError::Validation(format!("cannot load model: {e}")))?;
            Ok(Arc::new(classifier))
        }
    }
}

/// Turn raw network outputs into probabilities. Outputs that already form a
/// distribution are returned unchanged; anything else is treated as logits.
pub fn to_probabilities(scores: &[f32]) -> Vec<f32> {
    let sum: f32 = scores.iter().sum();
    let is_distribution =
        scores.iter().all(|s| (0.0..=1.0).contains(s)) && (sum - 1.0).abs() < 1e-3;
    if is_distribution {
        return scores.to_vec();
    }
    softmax(scores)
}

pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let total: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}

/// Index and value of the largest probability.
pub fn best_digit(probabilities: &[f32]) -> Option<DigitScore> {
    probabilities
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(digit, &confidence)| DigitScore {
            digit: digit as u8,
            confidence,
        })
}
