use image::GrayImage;
use serde::Serialize;
use time::OffsetDateTime;

/// Raw encoded image as received from a client. Lives for one request.
#[derive(Debug, Clone)]
pub struct Frame {
    pub bytes: Vec<u8>,
    /// Declared media type, when the client sent a data URL.
    pub media_type: Option<String>,
}

impl Frame {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            media_type: None,
        }
    }

    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = Some(media_type.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Connected ink region in a binary mask.
#[derive(Debug, Clone)]
pub struct Contour {
    pub label: u32,
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
    pub pixel_count: u32,
}

impl Contour {
    pub fn width(&self) -> u32 {
        self.max_x - self.min_x + 1
    }

    pub fn height(&self) -> u32 {
        self.max_y - self.min_y + 1
    }

    /// Area of the bounding box, not the ink.
    pub fn box_area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    pub fn aspect_ratio(&self) -> f32 {
        let h = self.height() as f32;
        if h == 0.0 {
            return 0.0;
        }
        self.width() as f32 / h
    }

    /// Smallest box containing both contours.
    pub fn union(&self, other: &Contour) -> Contour {
        Contour {
            label: self.label,
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
            pixel_count: self.pixel_count + other.pixel_count,
        }
    }
}

/// Grid position of a cell, zero based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct CellPosition {
    pub row: usize,
    pub column: usize,
}

/// Axis-aligned pixel bounds of a cell in the canonical (preprocessed) frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CellBounds {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CellBounds {
    /// `[x, y, w, h]`, the shape clients expect.
    pub fn as_box(&self) -> [u32; 4] {
        [self.x, self.y, self.width, self.height]
    }
}

/// One digit-sized sub-image of the marks table.
#[derive(Debug, Clone)]
pub struct Cell {
    pub position: CellPosition,
    pub bounds: CellBounds,
    /// Binary ink mask of the cell interior (ink = 255).
    pub image: GrayImage,
}

/// Raw classifier answer for one glyph.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DigitScore {
    pub digit: u8,
    pub confidence: f32,
}

/// Accepted classifier answer bound to its cell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Prediction {
    pub position: CellPosition,
    pub bounds: CellBounds,
    pub digit: u8,
    pub confidence: f32,
}

/// Marks read from one scan, in column order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Row {
    pub marks: Vec<u8>,
    pub total: u32,
}

impl Row {
    pub fn from_marks(marks: Vec<u8>) -> Self {
        let total = marks.iter().map(|&m| m as u32).sum();
        Self { marks, total }
    }
}

/// A persisted row. Never modified after it is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub sequence_id: i64,
    pub recorded_at: OffsetDateTime,
    pub row: Row,
}

/// Result of a successful append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendReceipt {
    pub entry: LedgerEntry,
    pub grand_total: u64,
}
