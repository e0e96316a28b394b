use image::{GrayImage, ImageBuffer, Luma};
use imageproc::region_labelling::{Connectivity, connected_components};
use std::collections::HashMap;

use crate::models::Contour;

/// Labelled ink components of a binary mask.
pub struct ComponentMap {
    pub labels: ImageBuffer<Luma<u32>, Vec<u32>>,
    pub contours: Vec<Contour>,
}

impl ComponentMap {
    /// Pixel coordinates belonging to `label`.
    pub fn pixels_of(&self, label: u32) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.labels
            .enumerate_pixels()
            .filter(move |(_, _, l)| l[0] == label)
            .map(|(x, y, _)| (x, y))
    }
}

/// Label connected ink regions (ink = non-zero) and collect their bounding
/// boxes. Regions with fewer than `min_area` pixels are dropped. Contours are
/// returned sorted by label, which follows raster order of first appearance.
pub fn label_components(mask: &GrayImage, min_area: u32) -> ComponentMap {
    let labels = connected_components(mask, Connectivity::Eight, Luma([0u8]));

    let mut regions: HashMap<u32, (u32, u32, u32, u32, u32)> = HashMap::new();
    for (x, y, label) in labels.enumerate_pixels() {
        let label_val = label[0];
        if label_val == 0 {
            continue; // background
        }

        regions
            .entry(label_val)
            .and_modify(|(min_x, min_y, max_x, max_y, count)| {
                *min_x = (*min_x).min(x);
                *min_y = (*min_y).min(y);
                *max_x = (*max_x).max(x);
                *max_y = (*max_y).max(y);
                *count += 1;
            })
            .or_insert((x, y, x, y, 1));
    }

    let mut contours: Vec<Contour> = regions
        .into_iter()
        .map(|(label, (min_x, min_y, max_x, max_y, count))| Contour {
            label,
            min_x,
            min_y,
            max_x,
            max_y,
            pixel_count: count,
        })
        .filter(|c| c.pixel_count >= min_area)
        .collect();
    contours.sort_by_key(|c| c.label);

    ComponentMap { labels, contours }
}

/// Find contours in a binary mask using connected components
pub fn find_contours(mask: &GrayImage, min_area: u32) -> Vec<Contour> {
    label_components(mask, min_area).contours
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(mask: &mut GrayImage, x0: u32, y0: u32, x1: u32, y1: u32) {
        for y in y0..=y1 {
            for x in x0..=x1 {
                mask.put_pixel(x, y, Luma([255]));
            }
        }
    }

    #[test]
    fn separate_blobs_become_separate_contours() {
        let mut mask = GrayImage::new(30, 30);
        fill(&mut mask, 2, 2, 6, 6);
        fill(&mut mask, 15, 10, 25, 12);
        mask.put_pixel(28, 28, Luma([255])); // speck

        let contours = find_contours(&mask, 4);
        assert_eq!(contours.len(), 2);

        let wide = contours.iter().find(|c| c.min_x == 15).expect("bar");
        assert_eq!((wide.width(), wide.height()), (11, 3));
        assert_eq!(wide.pixel_count, 33);
    }

    #[test]
    fn pixels_of_returns_only_that_component() {
        let mut mask = GrayImage::new(10, 10);
        fill(&mut mask, 1, 1, 2, 2);
        fill(&mut mask, 6, 6, 8, 8);

        let map = label_components(&mask, 1);
        let first = &map.contours[0];
        let pixels: Vec<_> = map.pixels_of(first.label).collect();
        assert_eq!(pixels.len(), 4);
        assert!(pixels.iter().all(|&(x, y)| x <= 2 && y <= 2));
    }
}
