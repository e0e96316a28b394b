use image::GrayImage;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Debug configuration for pipeline execution
#[derive(Clone, Debug)]
pub struct DebugConfig {
    /// Root directory for debug outputs
    pub output_dir: PathBuf,
}

/// Context available to all pipeline steps
#[derive(Clone, Debug, Default)]
pub struct PipelineContext {
    pub debug: Option<DebugConfig>,
}

impl PipelineContext {
    /// Save an intermediate image under `<debug dir>/<stage>/<file>` when a
    /// debug directory is set. Failures are logged and otherwise ignored: debug output
    /// never changes the recognition result.
    pub fn save_debug_image(&self, stage: &str, file: &str, image: &GrayImage) {
        let Some(debug_config) = &self.debug else {
            return;
        };

        let stage_dir = debug_config.output_dir.join(stage);
        if let Err(e) = std::fs::create_dir_all(&stage_dir) {
            warn!(dir = %stage_dir.display(), error = %e, "Failed to create debug directory");
            return;
        }
        let output_path = stage_dir.join(file);
        match image.save(&output_path) {
            Ok(()) => debug!(path = %output_path.display(), "Saved debug image"),
            Err(e) => warn!(path = %output_path.display(), error = %e, "Failed to save debug image"),
        }
    }
}

/// One grayscale-to-grayscale transform of the preprocessing chain.
pub trait PipelineStep: Send + Sync {
    fn process(&self, image: GrayImage, context: &PipelineContext) -> GrayImage;

    /// Human-readable name for this step (used in logs and debug directories)
    fn name(&self) -> &str;
}

/// Directory name for a step's debug output, e.g. `02_gaussian_blur`.
fn step_dir_name(index: usize, name: &str) -> String {
    format!("{:02}_{}", index, name.to_lowercase().replace(' ', "_"))
}

/// Composable pipeline builder
#[derive(Clone, Default)]
pub struct Pipeline {
    steps: Vec<Arc<dyn PipelineStep>>,
    context: PipelineContext,
}

impl Pipeline {
    /// Create a new empty pipeline
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable debug mode with output directory.
    /// The directory must be empty or non-existent.
    pub fn with_debug(mut self, output_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let output_dir = output_dir.as_ref().to_path_buf();
        if output_dir.exists() {
            if std::fs::read_dir(&output_dir)?.next().is_some() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!("debug directory is not empty: {}", output_dir.display()),
                ));
            }
        } else {
            std::fs::create_dir_all(&output_dir)?;
        }

        self.context.debug = Some(DebugConfig { output_dir });
        Ok(self)
    }

    /// Add a processing step to the pipeline
    pub fn add_step(mut self, step: Box<dyn PipelineStep>) -> Self {
        self.steps.push(Arc::from(step));
        self
    }

    pub fn context(&self) -> &PipelineContext {
        &self.context
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Run every step in order.
    pub fn run(&self, input: GrayImage) -> GrayImage {
        self.run_partial(input, self.steps.len())
    }

    /// Run the pipeline but stop after `num_steps` steps (useful for debugging)
    pub fn run_partial(&self, input: GrayImage, num_steps: usize) -> GrayImage {
        self.context.save_debug_image("00_input", "01.png", &input);

        let mut image = input;
        for (step_idx, step) in self.steps.iter().take(num_steps).enumerate() {
            debug!(
                step = step.name(),
                width = image.width(),
                height = image.height(),
                "Running preprocessing step"
            );
            image = step.process(image, &self.context);
            self.context
                .save_debug_image(&step_dir_name(step_idx + 1, step.name()), "01.png", &image);
        }
        image
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    struct Invert;

    impl PipelineStep for Invert {
        fn process(&self, mut image: GrayImage, _context: &PipelineContext) -> GrayImage {
            image::imageops::invert(&mut image);
            image
        }

        fn name(&self) -> &str {
            "Invert"
        }
    }

    #[test]
    fn steps_run_in_order_and_partial_stops_early() {
        let pipeline = Pipeline::new()
            .add_step(Box::new(Invert))
            .add_step(Box::new(Invert));
        let input = GrayImage::from_pixel(4, 4, Luma([10u8]));

        assert_eq!(pipeline.run(input.clone()).get_pixel(0, 0)[0], 10);
        assert_eq!(pipeline.run_partial(input, 1).get_pixel(0, 0)[0], 245);
        assert_eq!(pipeline.step_names(), vec!["Invert", "Invert"]);
    }

    #[test]
    fn debug_mode_writes_each_stage() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let out = dir.path().join("debug");
        let pipeline = Pipeline::new()
            .add_step(Box::new(Invert))
            .with_debug(&out)
            .expect("debug dir");

        pipeline.run(GrayImage::from_pixel(3, 3, Luma([0u8])));

        assert!(out.join("00_input/01.png").is_file());
        assert!(out.join("01_invert/01.png").is_file());
    }

    #[test]
    fn debug_mode_refuses_non_empty_directory() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        std::fs::write(dir.path().join("stale.txt"), b"x").expect("write");
        assert!(Pipeline::new().with_debug(dir.path()).is_err());
    }
}
