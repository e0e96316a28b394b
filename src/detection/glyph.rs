//! Glyph isolation inside a cell and normalization for the digit network.

use image::imageops::FilterType;
use image::{GrayImage, Luma};

use crate::detection::contours::find_contours;
use crate::models::Contour;

/// Side of the square input the digit network expects.
pub const INPUT_SIZE: u32 = 28;
/// Longest side of the glyph inside the network input.
pub const GLYPH_SIZE: u32 = 22;

/// Tight crop of the handwritten ink in a cell (ink = 255), or `None` when
/// the cell is blank.
///
/// Components smaller than `min_area` are noise. Thin components touching the
/// cell border are ruling remnants and are ignored as well.
pub fn extract_glyph(cell: &GrayImage, min_area: u32) -> Option<GrayImage> {
    let (width, height) = cell.dimensions();
    if width == 0 || height == 0 {
        return None;
    }

    let bbox = find_contours(cell, min_area.max(1))
        .into_iter()
        .filter(|c| !is_ruling_remnant(c, width, height))
        .reduce(|acc, c| acc.union(&c))?;

    Some(
        image::imageops::crop_imm(cell, bbox.min_x, bbox.min_y, bbox.width(), bbox.height())
            .to_image(),
    )
}

fn is_ruling_remnant(c: &Contour, width: u32, height: u32) -> bool {
    let touches_border =
        c.min_x == 0 || c.min_y == 0 || c.max_x + 1 == width || c.max_y + 1 == height;
    let thin = c.width() * 4 < width || c.height() * 4 < height;
    let spans = c.width() * 2 > width || c.height() * 2 > height;
    touches_border && thin && spans
}

/// Scale a glyph so its longer side is [`GLYPH_SIZE`] and center it on a black
/// [`INPUT_SIZE`]² canvas. Padding puts the extra pixel before the glyph when
/// the margin is odd.
pub fn normalize_for_network(glyph: &GrayImage) -> GrayImage {
    let (w, h) = glyph.dimensions();
    if w == 0 || h == 0 {
        return GrayImage::new(INPUT_SIZE, INPUT_SIZE);
    }

    let (cols, rows) = if h > w {
        let cols = (w as f32 * GLYPH_SIZE as f32 / h as f32).round() as u32;
        (cols.max(1), GLYPH_SIZE)
    } else {
        let rows = (h as f32 * GLYPH_SIZE as f32 / w as f32).round() as u32;
        (GLYPH_SIZE, rows.max(1))
    };
    let scaled = image::imageops::resize(glyph, cols, rows, FilterType::Triangle);

    let pad_left = (INPUT_SIZE - cols).div_ceil(2);
    let pad_top = (INPUT_SIZE - rows).div_ceil(2);
    let mut canvas = GrayImage::from_pixel(INPUT_SIZE, INPUT_SIZE, Luma([0u8]));
    image::imageops::overlay(&mut canvas, &scaled, pad_left as i64, pad_top as i64);
    canvas
}
