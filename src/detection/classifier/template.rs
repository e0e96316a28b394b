//! Deterministic template matcher over a 5x7 block font.
//!
//! Useful without a trained model and as a reproducible classifier in tests:
//! a glyph rendered with [`render_glyph`] is recognized with near-certain
//! confidence.

use image::{GrayImage, Luma};

use super::{DigitClassifier, best_digit, softmax};
use crate::error::ClassificationError;
use crate::models::DigitScore;

pub const GLYPH_COLUMNS: u32 = 5;
pub const GLYPH_ROWS: u32 = 7;

const GLYPHS: [[&str; 7]; 10] = [
    ["#####", "#...#", "#..##", "#.#.#", "##..#", "#...#", "#####"],
    ["..#..", ".##..", "#.#..", "..#..", "..#..", "..#..", "#####"],
    ["#####", "....#", "....#", "#####", "#....", "#....", "#####"],
    ["#####", "....#", "....#", ".####", "....#", "....#", "#####"],
    ["#...#", "#...#", "#...#", "#####", "....#", "....#", "....#"],
    ["#####", "#....", "#....", "#####", "....#", "....#", "#####"],
    ["#####", "#....", "#....", "#####", "#...#", "#...#", "#####"],
    ["#####", "....#", "...#.", "..#..", ".#...", "#....", "#...."],
    ["#####", "#...#", "#...#", "#####", "#...#", "#...#", "#####"],
    ["#####", "#...#", "#...#", "#####", "....#", "....#", "#####"],
];

fn glyph_bit(digit: usize, column: u32, row: u32) -> bool {
    GLYPHS[digit][row as usize].as_bytes()[column as usize] == b'#'
}

/// Draw `digit` from the block font, each font cell `scale` pixels square.
/// Ink is 255 on a 0 background. Digits above 9 render blank.
pub fn render_glyph(digit: u8, scale: u32) -> GrayImage {
    let scale = scale.max(1);
    let mut img = GrayImage::new(GLYPH_COLUMNS * scale, GLYPH_ROWS * scale);
    if digit > 9 {
        return img;
    }
    for (x, y, pixel) in img.enumerate_pixels_mut() {
        if glyph_bit(digit as usize, x / scale, y / scale) {
            *pixel = Luma([255]);
        }
    }
    img
}

pub struct TemplateClassifier {
    temperature: f32,
}

impl TemplateClassifier {
    pub fn new(temperature: f32) -> Self {
        Self {
            temperature: if temperature > 0.0 { temperature } else { 0.5 },
        }
    }

    /// Share of ink in each of the 5x7 blocks covering the glyph, row-major.
    fn block_coverage(glyph: &GrayImage) -> Vec<f32> {
        let (w, h) = glyph.dimensions();
        let mut coverage = Vec::with_capacity((GLYPH_COLUMNS * GLYPH_ROWS) as usize);
        for row in 0..GLYPH_ROWS {
            let (y0, y1) = block_span(row, GLYPH_ROWS, h);
            for column in 0..GLYPH_COLUMNS {
                let (x0, x1) = block_span(column, GLYPH_COLUMNS, w);
                let mut ink = 0u32;
                for y in y0..y1 {
                    for x in x0..x1 {
                        if glyph.get_pixel(x, y)[0] >= 128 {
                            ink += 1;
                        }
                    }
                }
                let area = (x1 - x0) * (y1 - y0);
                coverage.push(if area == 0 { 0.0 } else { ink as f32 / area as f32 });
            }
        }
        coverage
    }
}

impl Default for TemplateClassifier {
    fn default() -> Self {
        Self::new(0.5)
    }
}

/// Pixel range of block `index` when `len` pixels are split into `blocks`.
/// Blocks are never empty while `len > 0`.
fn block_span(index: u32, blocks: u32, len: u32) -> (u32, u32) {
    let start = (index * len / blocks).min(len.saturating_sub(1));
    let end = ((index + 1) * len / blocks).max(start + 1).min(len);
    (start, end)
}

impl DigitClassifier for TemplateClassifier {
    fn classify(&self, glyph: &GrayImage) -> Result<DigitScore, ClassificationError> {
        if glyph.width() == 0 || glyph.height() == 0 {
            return Err(ClassificationError::EmptyCell);
        }
        let coverage = Self::block_coverage(glyph);

        let scores: Vec<f32> = (0..10)
            .map(|digit| {
                let distance: f32 = coverage
                    .iter()
                    .enumerate()
                    .map(|(i, &share)| {
                        let bit = glyph_bit(digit, i as u32 % GLYPH_COLUMNS, i as u32 / GLYPH_COLUMNS);
                        (share - if bit { 1.0 } else { 0.0 }).abs()
                    })
                    .sum();
                -distance / self.temperature
            })
            .collect();

        best_digit(&softmax(&scores))
            .ok_or_else(|| ClassificationError::InvalidOutput("no scores".to_string()))
    }

    fn name(&self) -> &str {
        "template"
    }
}
