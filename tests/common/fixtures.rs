use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use image::{DynamicImage, GrayImage, ImageFormat, Rgb, RgbImage};
use markscan::config::RecognitionConfig;
use markscan::detection::classifier::template::render_glyph;
use markscan::{
    ClassificationError, DigitClassifier, DigitScore, Frame, LedgerStore, MarkScanner, Recognizer,
    TemplateClassifier,
};

/// Side of one table cell, rulings included.
pub const CELL: u32 = 100;
pub const RULING: u32 = 3;
pub const MARGIN: u32 = 60;
/// Font cell size used to draw digits; a digit is 30x42 px.
pub const GLYPH_SCALE: u32 = 6;

const PAPER: Rgb<u8> = Rgb([250, 250, 245]);
const INK: Rgb<u8> = Rgb([25, 25, 40]);

fn fill(img: &mut RgbImage, x0: u32, y0: u32, w: u32, h: u32, color: Rgb<u8>) {
    for y in y0..y0 + h {
        for x in x0..x0 + w {
            img.put_pixel(x, y, color);
        }
    }
}

/// Photograph-like marksheet: a ruled table with one digit per cell, dark ink
/// on paper. `None` leaves a cell blank.
pub fn render_sheet(rows: &[&[Option<u8>]]) -> RgbImage {
    render_sheet_scaled(rows, GLYPH_SCALE)
}

/// [`render_sheet`] with digits drawn at `glyph_scale` (5x7 font blocks).
pub fn render_sheet_scaled(rows: &[&[Option<u8>]], glyph_scale: u32) -> RgbImage {
    assert!(7 * glyph_scale < CELL - RULING, "glyph must fit inside a cell");
    let row_count = rows.len() as u32;
    let columns = rows.iter().map(|r| r.len()).max().unwrap_or(0) as u32;
    let table_w = columns * CELL + RULING;
    let table_h = row_count * CELL + RULING;
    let mut img = RgbImage::from_pixel(table_w + 2 * MARGIN, table_h + 2 * MARGIN, PAPER);

    for r in 0..=row_count {
        fill(&mut img, MARGIN, MARGIN + r * CELL, table_w, RULING, INK);
    }
    for c in 0..=columns {
        fill(&mut img, MARGIN + c * CELL, MARGIN, RULING, table_h, INK);
    }

    for (r, row) in rows.iter().enumerate() {
        for (c, digit) in row.iter().enumerate() {
            let Some(digit) = digit else { continue };
            let glyph = render_glyph(*digit, glyph_scale);
            let x0 = MARGIN + c as u32 * CELL + (CELL + RULING - glyph.width()) / 2;
            let y0 = MARGIN + r as u32 * CELL + (CELL + RULING - glyph.height()) / 2;
            for (x, y, p) in glyph.enumerate_pixels() {
                if p[0] > 0 {
                    img.put_pixel(x0 + x, y0 + y, INK);
                }
            }
        }
    }
    img
}

/// Single-row sheet with every cell filled.
pub fn render_row(digits: &[u8]) -> RgbImage {
    let row: Vec<Option<u8>> = digits.iter().copied().map(Some).collect();
    render_sheet(&[&row])
}

pub fn encode_png(img: &RgbImage) -> Vec<u8> {
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(img.clone())
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .expect("Failed to encode test image");
    bytes
}

pub fn row_frame(digits: &[u8]) -> Frame {
    Frame::new(encode_png(&render_row(digits)))
}

/// Two-row sheet whose second row is missing its first inner ruling, so the
/// rows disagree on the number of cells.
pub fn merged_cell_frame() -> Frame {
    let mut img = render_sheet(&[&[Some(1), Some(2), Some(3)], &[Some(4), Some(5), Some(6)]]);
    fill(&mut img, MARGIN + CELL, MARGIN + CELL + RULING, RULING, CELL - RULING, PAPER);
    Frame::new(encode_png(&img))
}

/// Bytes that are not an image in any supported format.
pub fn garbage_frame() -> Frame {
    Frame::new(b"definitely not a png".to_vec())
}

/// Paper with a few scribbles and no table.
pub fn blank_page_frame() -> Frame {
    let mut img = RgbImage::from_pixel(400, 300, PAPER);
    fill(&mut img, 50, 40, 60, 4, INK);
    fill(&mut img, 200, 150, 4, 30, INK);
    Frame::new(encode_png(&img))
}

/// Wraps the template classifier but reports a fixed confidence.
pub struct FixedConfidence {
    pub inner: TemplateClassifier,
    pub confidence: f32,
}

impl DigitClassifier for FixedConfidence {
    fn classify(&self, glyph: &GrayImage) -> Result<DigitScore, ClassificationError> {
        let score = self.inner.classify(glyph)?;
        Ok(DigitScore {
            digit: score.digit,
            confidence: self.confidence,
        })
    }

    fn name(&self) -> &str {
        "fixed-confidence"
    }
}

/// Template classifier whose confidence drops for one digit.
pub struct UnsureAbout {
    pub inner: TemplateClassifier,
    pub digit: u8,
}

impl DigitClassifier for UnsureAbout {
    fn classify(&self, glyph: &GrayImage) -> Result<DigitScore, ClassificationError> {
        let mut score = self.inner.classify(glyph)?;
        if score.digit == self.digit {
            score.confidence = 0.2;
        }
        Ok(score)
    }

    fn name(&self) -> &str {
        "unsure"
    }
}

pub struct FailingClassifier;

impl DigitClassifier for FailingClassifier {
    fn classify(&self, _glyph: &GrayImage) -> Result<DigitScore, ClassificationError> {
        Err(ClassificationError::Model("model unavailable".to_string()))
    }

    fn name(&self) -> &str {
        "failing"
    }
}

pub fn template_recognizer() -> Recognizer {
    recognizer_with(Arc::new(TemplateClassifier::default()))
}

pub fn recognizer_with(classifier: Arc<dyn DigitClassifier>) -> Recognizer {
    Recognizer::new(&RecognitionConfig::default(), classifier)
}

pub fn scanner_with(classifier: Arc<dyn DigitClassifier>, ledger_root: &Path) -> MarkScanner {
    MarkScanner::new(recognizer_with(classifier), LedgerStore::new(ledger_root), 2)
}

/// Scanner with the template classifier and a fresh temporary ledger root.
/// Keep the returned directory alive for the duration of the test.
pub fn create_test_scanner() -> (MarkScanner, tempfile::TempDir) {
    let dir = tempfile::TempDir::new().expect("Failed to create temp directory");
    let scanner = scanner_with(Arc::new(TemplateClassifier::default()), dir.path());
    (scanner, dir)
}

pub fn create_test_ledger() -> (LedgerStore, tempfile::TempDir) {
    let dir = tempfile::TempDir::new().expect("Failed to create temp directory");
    let store = LedgerStore::new(dir.path());
    (store, dir)
}
