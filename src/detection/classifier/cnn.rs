use std::path::Path;

use image::GrayImage;
use rten::Model;
use rten_tensor::NdTensor;
use rten_tensor::prelude::*;
use tracing::info;

use super::{DigitClassifier, best_digit, to_probabilities};
use crate::detection::glyph::{INPUT_SIZE, normalize_for_network};
use crate::error::ClassificationError;
use crate::models::DigitScore;

/// MNIST-style network loaded from an `.rten` model file.
///
/// The model takes a `[1, 1, 28, 28]` tensor with values in `0.0..=1.0`
/// (ink bright) and yields ten scores, either logits or probabilities.
pub struct CnnClassifier {
    model: Model,
}

impl CnnClassifier {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ClassificationError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(ClassificationError::Model(format!(
                "digit model not found at {}",
                path.display()
            )));
        }
        let model = Model::load_file(path)
            .map_err(|e| ClassificationError::Model(format!("{}: {e}", path.display())))?;
        info!(path = %path.display(), "Digit model loaded");
        Ok(Self { model })
    }

    fn input_tensor(glyph: &GrayImage) -> NdTensor<f32, 4> {
        let normalized = normalize_for_network(glyph);
        let data: Vec<f32> = normalized.pixels().map(|p| p[0] as f32 / 255.0).collect();
        let side = INPUT_SIZE as usize;
        NdTensor::from_data([1, 1, side, side], data)
    }
}

impl DigitClassifier for CnnClassifier {
    fn classify(&self, glyph: &GrayImage) -> Result<DigitScore, ClassificationError> {
        let input = Self::input_tensor(glyph);
        let output = self
            .model
            .run_one(input.view().into(), None)
            .map_err(|e| ClassificationError::Model(e.to_string()))?;
        let scores: NdTensor<f32, 2> = output
            .try_into()
            .map_err(|e| ClassificationError::InvalidOutput(format!("{e:?}")))?;

        let raw: Vec<f32> = scores.iter().copied().collect();
        if raw.len() != 10 {
            return Err(ClassificationError::InvalidOutput(format!(
                "expected 10 scores, got {}",
                raw.len()
            )));
        }
        if raw.iter().any(|s| !s.is_finite()) {
            return Err(ClassificationError::InvalidOutput("non-finite score".to_string()));
        }

        best_digit(&to_probabilities(&raw))
            .ok_or_else(|| ClassificationError::InvalidOutput("no scores".to_string()))
    }

    fn name(&self) -> &str {
        "cnn"
    }
}
