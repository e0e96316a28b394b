use std::io::Cursor;

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, ImageDecoder, ImageReader, Luma};
use imageproc::filter::gaussian_blur_f32;
use tracing::{debug, instrument};

use crate::error::RecognitionError;
use crate::models::Frame;

/// Decode an encoded frame and apply its EXIF orientation, if any.
#[instrument(skip(frame), fields(len = frame.bytes.len()))]
pub fn decode_frame(frame: &Frame) -> Result<DynamicImage, RecognitionError> {
    if frame.is_empty() {
        return Err(RecognitionError::ImageDecode("empty frame".to_string()));
    }

    let reader = ImageReader::new(Cursor::new(frame.bytes.as_slice()))
        .with_guessed_format()
        .map_err(|e| RecognitionError::ImageDecode(e.to_string()))?;
    let mut decoder = reader
        .into_decoder()
        .map_err(|e| RecognitionError::ImageDecode(e.to_string()))?;
    let orientation = decoder
        .orientation()
        .map_err(|e| RecognitionError::ImageDecode(e.to_string()))?;
    let mut img = DynamicImage::from_decoder(decoder)
        .map_err(|e| RecognitionError::ImageDecode(e.to_string()))?;
    img.apply_orientation(orientation);

    if img.width() == 0 || img.height() == 0 {
        return Err(RecognitionError::ImageDecode("image has no pixels".to_string()));
    }
    debug!(width = img.width(), height = img.height(), ?orientation, "Frame decoded");
    Ok(img)
}

/// Convert image to grayscale
pub fn to_grayscale(img: &DynamicImage) -> GrayImage {
    img.to_luma8()
}

/// Shrink images wider than `max_width`, keeping the aspect ratio.
pub fn limit_width(img: GrayImage, max_width: u32) -> GrayImage {
    let (width, height) = img.dimensions();
    if width <= max_width {
        return img;
    }
    let new_height = ((height as f64 * max_width as f64 / width as f64).round() as u32).max(1);
    image::imageops::resize(&img, max_width, new_height, FilterType::Triangle)
}

/// Stretch intensities so the darkest 1% maps to 0 and the brightest 1% to 255.
pub fn normalize_contrast(img: &GrayImage) -> GrayImage {
    let mut histogram = [0u64; 256];
    for pixel in img.pixels() {
        histogram[pixel[0] as usize] += 1;
    }
    let total = img.width() as u64 * img.height() as u64;
    if total == 0 {
        return img.clone();
    }

    let clip = total / 100;
    let low = percentile_bin(&histogram, clip);
    let high = 255 - percentile_bin_rev(&histogram, clip);
    if high <= low {
        return img.clone();
    }

    let scale = 255.0 / (high - low) as f32;
    let mut out = img.clone();
    for pixel in out.pixels_mut() {
        let v = pixel[0].clamp(low, high);
        pixel[0] = ((v - low) as f32 * scale).round() as u8;
    }
    out
}

fn percentile_bin(histogram: &[u64; 256], clip: u64) -> u8 {
    let mut seen = 0;
    for (value, &count) in histogram.iter().enumerate() {
        seen += count;
        if seen > clip {
            return value as u8;
        }
    }
    255
}

fn percentile_bin_rev(histogram: &[u64; 256], clip: u64) -> u8 {
    let mut seen = 0;
    for (offset, &count) in histogram.iter().rev().enumerate() {
        seen += count;
        if seen > clip {
            return offset as u8;
        }
    }
    255
}

/// Apply Gaussian blur to reduce noise
pub fn apply_blur(img: &GrayImage, sigma: f32) -> GrayImage {
    if sigma <= 0.0 {
        return img.clone();
    }
    gaussian_blur_f32(img, sigma)
}

/// Adaptive binarization into an ink mask.
///
/// A pixel is ink (255) when it is darker than the mean of its
/// `(2 * block_radius + 1)²` neighbourhood minus `offset`; everything else
/// becomes background (0).
pub fn binarize_adaptive(img: &GrayImage, block_radius: u32, offset: i32) -> GrayImage {
    let (width, height) = img.dimensions();
    let integral = integral_image(img);
    let mut output = GrayImage::new(width, height);

    for y in 0..height {
        for x in 0..width {
            let local_mean = region_mean(&integral, width, height, x, y, block_radius);
            let threshold = (local_mean.round() as i32 - offset).clamp(0, 255);
            let value = img.get_pixel(x, y)[0] as i32;
            let ink = if value < threshold { 255u8 } else { 0u8 };
            output.put_pixel(x, y, Luma([ink]));
        }
    }
    output
}

/// Summed-area table with a zero border: `(width + 1) x (height + 1)` entries.
fn integral_image(gray: &GrayImage) -> Vec<u64> {
    let (w, h) = gray.dimensions();
    let stride = (w + 1) as usize;
    let mut table = vec![0u64; stride * (h + 1) as usize];

    for y in 0..h {
        let mut row_sum: u64 = 0;
        for x in 0..w {
            row_sum += gray.get_pixel(x, y)[0] as u64;
            let idx = (y + 1) as usize * stride + (x + 1) as usize;
            let above = y as usize * stride + (x + 1) as usize;
            table[idx] = row_sum + table[above];
        }
    }
    table
}

fn region_mean(
    integral: &[u64],
    img_width: u32,
    img_height: u32,
    cx: u32,
    cy: u32,
    radius: u32,
) -> f64 {
    let stride = (img_width + 1) as usize;

    let x1 = cx.saturating_sub(radius) as usize;
    let y1 = cy.saturating_sub(radius) as usize;
    let x2 = (cx as usize + radius as usize + 1).min(img_width as usize);
    let y2 = (cy as usize + radius as usize + 1).min(img_height as usize);

    let area = ((x2 - x1) * (y2 - y1)) as f64;
    if area == 0.0 {
        return 128.0;
    }

    let sum = integral[y2 * stride + x2] as f64 - integral[y1 * stride + x2] as f64
        - integral[y2 * stride + x1] as f64
        + integral[y1 * stride + x1] as f64;
    sum / area
}
