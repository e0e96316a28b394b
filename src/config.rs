//! Service configuration.
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration. Values loaded from TOML can be overridden by CLI flags.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use axum::http::HeaderValue;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub recognition: RecognitionConfig,
    pub classifier: ClassifierConfig,
    pub ledger: LedgerConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.workers == 0 {
            return Err(ConfigError::Validation(
                "server.workers must be at least 1".to_string(),
            ));
        }
        validate_origin(&self.server.allow_origin)?;
        self.recognition.validate()?;
        if let ClassifierKind::Cnn = self.classifier.kind {
            if self.classifier.model_path.is_none() {
                return Err(ConfigError::Validation(
                    "classifier.model_path is required for the cnn classifier".to_string(),
                ));
            }
        }
        if self.classifier.temperature <= 0.0 {
            return Err(ConfigError::Validation(
                "classifier.temperature must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Settings that are valid but unsuitable for serving real marksheets.
    pub fn serve_warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.classifier.kind == ClassifierKind::Template {
            warnings.push(
                "classifier.kind is \"template\": handwriting is matched against a 5x7 block \
                 font and its confidence is not calibrated; set kind = \"cnn\" with a model_path"
                    .to_string(),
            );
        }
        if self.server.allow_origin == "*" {
            warnings.push("server.allow_origin is \"*\": any web origin may call the API".to_string());
        }
        warnings
    }
}

/// Parse a CORS origin into a header value. Empty or non-header text is an
/// error.
pub fn validate_origin(origin: &str) -> Result<HeaderValue, ConfigError> {
    if origin.trim().is_empty() {
        return Err(ConfigError::Validation(
            "server.allow_origin must not be empty".to_string(),
        ));
    }
    HeaderValue::from_str(origin).map_err(|_| {
        ConfigError::Validation(format!(
            "server.allow_origin {origin:?} is not a valid header value"
        ))
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Upper bound on concurrently running recognition pipelines.
    pub workers: usize,
    pub max_body_bytes: usize,
    pub allow_origin: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8000)),
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            max_body_bytes: 16 * 1024 * 1024,
            allow_origin: "*".to_string(),
        }
    }
}

/// Tuning for the preprocessor, cell locator and row aggregator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    /// Frames wider than this are downscaled before processing.
    pub max_width: u32,
    pub blur_sigma: f32,
    pub threshold_block_radius: u32,
    pub threshold_offset: i32,
    /// Minimum table bounding-box area as a fraction of the frame.
    pub min_table_area: f32,
    pub min_table_aspect: f32,
    pub max_table_aspect: f32,
    /// Fraction of a row/column that must be ink to count as a ruling line.
    pub line_coverage: f32,
    pub min_cell_size: u32,
    /// Margin trimmed from each cell side, as a fraction of that side.
    pub cell_inset: f32,
    /// Ink components smaller than this (in pixels) are treated as noise.
    pub min_glyph_area: u32,
    pub min_confidence: f32,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            max_width: 1600,
            blur_sigma: 1.0,
            threshold_block_radius: 15,
            threshold_offset: 10,
            min_table_area: 0.05,
            min_table_aspect: 0.1,
            max_table_aspect: 15.0,
            line_coverage: 0.75,
            min_cell_size: 8,
            cell_inset: 0.08,
            min_glyph_area: 12,
            min_confidence: 0.6,
        }
    }
}

impl RecognitionConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Validation(msg.to_string()));
        if self.max_width == 0 {
            return invalid("recognition.max_width must be positive");
        }
        if self.blur_sigma < 0.0 {
            return invalid("recognition.blur_sigma must not be negative");
        }
        if self.threshold_block_radius == 0 {
            return invalid("recognition.threshold_block_radius must be positive");
        }
        if !(0.0..1.0).contains(&self.min_table_area) {
            return invalid("recognition.min_table_area must be in [0, 1)");
        }
        if self.min_table_aspect <= 0.0 || self.min_table_aspect > self.max_table_aspect {
            return invalid("recognition table aspect bounds are inverted or non-positive");
        }
        if !(0.0..=1.0).contains(&self.line_coverage) || self.line_coverage == 0.0 {
            return invalid("recognition.line_coverage must be in (0, 1]");
        }
        if !(0.0..0.5).contains(&self.cell_inset) {
            return invalid("recognition.cell_inset must be in [0, 0.5)");
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return invalid("recognition.min_confidence must be in [0, 1]");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassifierKind {
    /// Built-in 5x7 glyph templates; deterministic.
    Template,
    /// Convolutional network loaded from an `.rten` model file.
    Cnn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub kind: ClassifierKind,
    pub model_path: Option<PathBuf>,
    pub temperature: f32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            kind: ClassifierKind::Template,
            model_path: None,
            temperature: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Directory every `excel_path` is resolved against.
    pub root: PathBuf,
    pub default_path: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("ledgers"),
            default_path: "marks.xlsx".to_string(),
        }
    }
}
