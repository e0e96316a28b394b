use image::GrayImage;

use crate::config::RecognitionConfig;
use crate::detection::preprocessing;
use crate::pipeline::{Pipeline, PipelineContext, PipelineStep};

/// Downscale oversized frames to a bounded working width
pub struct WidthLimitStep {
    pub max_width: u32,
}

impl PipelineStep for WidthLimitStep {
    fn process(&self, image: GrayImage, _context: &PipelineContext) -> GrayImage {
        preprocessing::limit_width(image, self.max_width)
    }

    fn name(&self) -> &str {
        "Width Limit"
    }
}

/// Percentile contrast stretch
pub struct ContrastNormalizationStep;

impl PipelineStep for ContrastNormalizationStep {
    fn process(&self, image: GrayImage, _context: &PipelineContext) -> GrayImage {
        preprocessing::normalize_contrast(&image)
    }

    fn name(&self) -> &str {
        "Contrast Normalization"
    }
}

/// Apply Gaussian blur
pub struct BlurStep {
    pub sigma: f32,
}

impl PipelineStep for BlurStep {
    fn process(&self, image: GrayImage, _context: &PipelineContext) -> GrayImage {
        preprocessing::apply_blur(&image, self.sigma)
    }

    fn name(&self) -> &str {
        "Gaussian Blur"
    }
}

/// Local-mean thresholding into an ink mask (ink = 255)
pub struct AdaptiveThresholdStep {
    pub block_radius: u32,
    pub offset: i32,
}

impl PipelineStep for AdaptiveThresholdStep {
    fn process(&self, image: GrayImage, _context: &PipelineContext) -> GrayImage {
        preprocessing::binarize_adaptive(&image, self.block_radius, self.offset)
    }

    fn name(&self) -> &str {
        "Adaptive Threshold"
    }
}

/// Build the standard preprocessing chain from configuration.
pub fn build_preprocessing_pipeline(config: &RecognitionConfig) -> Pipeline {
    Pipeline::new()
        .add_step(Box::new(WidthLimitStep {
            max_width: config.max_width,
        }))
        .add_step(Box::new(ContrastNormalizationStep))
        .add_step(Box::new(BlurStep {
            sigma: config.blur_sigma,
        }))
        .add_step(Box::new(AdaptiveThresholdStep {
            block_radius: config.threshold_block_radius,
            offset: config.threshold_offset,
        }))
}
