//! Cell Locator: find the marks table in an ink mask, square it up, and cut it
//! into cells along its ruling lines.
//!
//! ## Steps
//!
//! 1. Label ink components; the ruling of a table is one connected component.
//! 2. Keep components whose bounding box is large enough and whose aspect ratio
//!    is table-like; pick the one with the largest box.
//! 3. Take the component's extreme pixels as the table's four corners.
//! 4. Warp the quadrilateral onto an upright rectangle, once for the whole
//!    mask and once for the table component on its own.
//! 5. Rows whose ruling coverage reaches `line_coverage` are horizontal rulings;
//!    the gaps between them are grid rows.
//! 6. Within each grid row, columns with enough coverage are vertical rulings;
//!    the gaps between them are cells. Every grid row must yield the same
//!    number of cells.

use image::{GrayImage, Luma};
use imageproc::geometric_transformations::{Interpolation, Projection, warp_into};
use tracing::{debug, instrument};

use crate::config::RecognitionConfig;
use crate::detection::contours::label_components;
use crate::error::RecognitionError;
use crate::models::{Cell, CellBounds, CellPosition, Contour};
use crate::pipeline::PipelineContext;

type Point = (f32, f32);

/// Cells of one located table, row-major.
#[derive(Debug, Clone)]
pub struct CellGrid {
    pub rows: usize,
    pub columns: usize,
    pub cells: Vec<Cell>,
    /// Table corners in the canonical frame: top-left, top-right,
    /// bottom-right, bottom-left.
    pub corners: [Point; 4],
}

/// Tuning for table detection and segmentation.
#[derive(Debug, Clone)]
pub struct TableLocator {
    pub min_table_area: f32,
    pub min_aspect: f32,
    pub max_aspect: f32,
    pub line_coverage: f32,
    pub min_cell_size: u32,
    pub cell_inset: f32,
}

impl From<&RecognitionConfig> for TableLocator {
    fn from(config: &RecognitionConfig) -> Self {
        Self {
            min_table_area: config.min_table_area,
            min_aspect: config.min_table_aspect,
            max_aspect: config.max_table_aspect,
            line_coverage: config.line_coverage,
            min_cell_size: config.min_cell_size,
            cell_inset: config.cell_inset,
        }
    }
}

impl TableLocator {
    /// Segment the canonical ink mask into an ordered grid of cells.
    #[instrument(skip_all, fields(width = mask.width(), height = mask.height()))]
    pub fn locate_cells(
        &self,
        mask: &GrayImage,
        context: &PipelineContext,
    ) -> Result<CellGrid, RecognitionError> {
        let components = label_components(mask, 1);
        let frame_area = mask.width() as u64 * mask.height() as u64;

        let table = self
            .select_table_region(&components.contours, frame_area)
            .ok_or_else(|| {
                RecognitionError::TableNotFound(
                    "no ink region with table size and proportions".to_string(),
                )
            })?;
        debug!(
            x = table.min_x,
            y = table.min_y,
            width = table.width(),
            height = table.height(),
            "Table region selected"
        );

        let corners = extreme_corners(components.pixels_of(table.label)).ok_or_else(|| {
            RecognitionError::TableNotFound("table region has no pixels".to_string())
        })?;
        let degenerate =
            || RecognitionError::TableNotFound("table corners are degenerate".to_string());
        let rectified = rectify(mask, &corners).ok_or_else(degenerate)?;
        // Rulings are measured on the table component alone so handwriting
        // that does not touch the grid never reads as a line.
        let ruling_mask =
            component_mask(mask.width(), mask.height(), components.pixels_of(table.label));
        let rulings = rectify(&ruling_mask, &corners).ok_or_else(degenerate)?;
        context.save_debug_image("table", "rectified.png", &rectified);
        context.save_debug_image("table", "rulings.png", &rulings);

        let (width, height) = rulings.dimensions();
        let row_profile = ink_profile(&rulings, Axis::Rows, 0, height);
        let row_rulings = line_runs(&row_profile, self.line_coverage * width as f32);
        let row_spans = spans_between(&row_rulings, self.min_cell_size);
        if row_spans.is_empty() {
            return Err(RecognitionError::TableNotFound(
                "no ruled rows inside table".to_string(),
            ));
        }

        let mut column_spans_per_row: Vec<Vec<(u32, u32)>> = Vec::with_capacity(row_spans.len());
        for (row, &(y0, y1)) in row_spans.iter().enumerate() {
            let band = y1 - y0 + 1;
            let profile = ink_profile(&rulings, Axis::Columns, y0, y1 + 1);
            let column_rulings = line_runs(&profile, self.line_coverage * band as f32);
            let spans = spans_between(&column_rulings, self.min_cell_size);
            if let Some(first) = column_spans_per_row.first() {
                let expected = first.len();
                if spans.len() != expected {
                    return Err(RecognitionError::InconsistentGrid {
                        row,
                        expected,
                        found: spans.len(),
                    });
                }
            }
            column_spans_per_row.push(spans);
        }

        let columns = column_spans_per_row[0].len();
        if columns == 0 {
            return Err(RecognitionError::TableNotFound(
                "no ruled columns inside table".to_string(),
            ));
        }
        debug!(rows = row_spans.len(), columns, "Grid segmented");

        let quad = QuadMap::new(corners, width, height);
        let mut cells = Vec::with_capacity(row_spans.len() * columns);
        for (row, (&(y0, y1), column_spans)) in
            row_spans.iter().zip(&column_spans_per_row).enumerate()
        {
            for (column, &(x0, x1)) in column_spans.iter().enumerate() {
                let image = self.cell_interior(&rectified, x0, y0, x1, y1);
                cells.push(Cell {
                    position: CellPosition { row, column },
                    bounds: quad.frame_bounds(x0, y0, x1, y1),
                    image,
                });
            }
        }

        Ok(CellGrid {
            rows: row_spans.len(),
            columns,
            cells,
            corners,
        })
    }

    /// Largest component whose bounding box covers at least `min_table_area` of
    /// the frame and whose aspect ratio lies within the table tolerance.
    pub fn select_table_region<'a>(
        &self,
        contours: &'a [Contour],
        frame_area: u64,
    ) -> Option<&'a Contour> {
        let min_area = (frame_area as f64 * self.min_table_area as f64).ceil() as u64;
        contours
            .iter()
            .filter(|c| c.box_area() >= min_area.max(1))
            .filter(|c| {
                let aspect = c.aspect_ratio();
                aspect >= self.min_aspect && aspect <= self.max_aspect
            })
            .max_by_key(|c| c.box_area())
    }

    /// Crop a cell, trimming `cell_inset` from each side to drop ruling remnants.
    fn cell_interior(&self, table: &GrayImage, x0: u32, y0: u32, x1: u32, y1: u32) -> GrayImage {
        let w = x1 - x0 + 1;
        let h = y1 - y0 + 1;
        let inset_x = ((w as f32 * self.cell_inset).round() as u32).min((w - 1) / 2);
        let inset_y = ((h as f32 * self.cell_inset).round() as u32).min((h - 1) / 2);
        image::imageops::crop_imm(
            table,
            x0 + inset_x,
            y0 + inset_y,
            w - 2 * inset_x,
            h - 2 * inset_y,
        )
        .to_image()
    }
}

#[derive(Debug, Clone, Copy)]
enum Axis {
    /// One entry per row: ink count across the full width.
    Rows,
    /// One entry per column: ink count within rows `y_start..y_end`.
    Columns,
}

/// Binary mask holding only `pixels`.
fn component_mask(width: u32, height: u32, pixels: impl Iterator<Item = (u32, u32)>) -> GrayImage {
    let mut out = GrayImage::new(width, height);
    for (x, y) in pixels {
        out.put_pixel(x, y, Luma([255]));
    }
    out
}

fn ink_profile(mask: &GrayImage, axis: Axis, y_start: u32, y_end: u32) -> Vec<u32> {
    let (width, height) = mask.dimensions();
    match axis {
        Axis::Rows => (0..height)
            .map(|y| (0..width).filter(|&x| mask.get_pixel(x, y)[0] > 0).count() as u32)
            .collect(),
        Axis::Columns => (0..width)
            .map(|x| {
                (y_start..y_end.min(height))
                    .filter(|&y| mask.get_pixel(x, y)[0] > 0)
                    .count() as u32
            })
            .collect(),
    }
}

/// Maximal runs of consecutive indices whose value reaches `threshold`,
/// as inclusive `(start, end)` pairs.
fn line_runs(profile: &[u32], threshold: f32) -> Vec<(u32, u32)> {
    let mut runs = Vec::new();
    let mut start: Option<usize> = None;
    for (i, &count) in profile.iter().enumerate() {
        let is_line = count as f32 >= threshold;
        match (is_line, start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                runs.push((s as u32, i as u32 - 1));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        runs.push((s as u32, profile.len() as u32 - 1));
    }
    runs
}

/// Inclusive spans strictly between consecutive rulings, skipping any
/// narrower than `min_size`.
fn spans_between(rulings: &[(u32, u32)], min_size: u32) -> Vec<(u32, u32)> {
    rulings
        .windows(2)
        .filter_map(|pair| {
            let start = pair[0].1 + 1;
            let end = pair[1].0.checked_sub(1)?;
            (end >= start && end - start + 1 >= min_size.max(1)).then_some((start, end))
        })
        .collect()
}

/// Table corners from the extreme pixels of its ruling: top-left minimises
/// `x + y`, bottom-right maximises it, top-right maximises `x - y`,
/// bottom-left maximises `y - x`.
fn extreme_corners(pixels: impl Iterator<Item = (u32, u32)>) -> Option<[Point; 4]> {
    let mut tl: Option<(i64, (u32, u32))> = None;
    let mut br: Option<(i64, (u32, u32))> = None;
    let mut tr: Option<(i64, (u32, u32))> = None;
    let mut bl: Option<(i64, (u32, u32))> = None;

    fn keep_max(slot: &mut Option<(i64, (u32, u32))>, score: i64, p: (u32, u32)) {
        if slot.is_none_or(|(best, _)| score > best) {
            *slot = Some((score, p));
        }
    }

    for (x, y) in pixels {
        let (xi, yi) = (x as i64, y as i64);
        keep_max(&mut tl, -(xi + yi), (x, y));
        keep_max(&mut br, xi + yi, (x, y));
        keep_max(&mut tr, xi - yi, (x, y));
        keep_max(&mut bl, yi - xi, (x, y));
    }

    let to_point = |slot: Option<(i64, (u32, u32))>| slot.map(|(_, (x, y))| (x as f32, y as f32));
    Some([to_point(tl)?, to_point(tr)?, to_point(br)?, to_point(bl)?])
}

fn distance(a: Point, b: Point) -> f32 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}

/// Warp the quadrilateral `corners` onto an upright rectangle.
fn rectify(mask: &GrayImage, corners: &[Point; 4]) -> Option<GrayImage> {
    let [tl, tr, br, bl] = *corners;
    let width = distance(tl, tr).max(distance(bl, br)).round() as u32 + 1;
    let height = distance(tl, bl).max(distance(tr, br)).round() as u32 + 1;
    if width < 2 || height < 2 {
        return None;
    }

    let (w, h) = ((width - 1) as f32, (height - 1) as f32);
    let dest = [(0.0, 0.0), (w, 0.0), (w, h), (0.0, h)];
    let projection = Projection::from_control_points(*corners, dest)?;

    let mut output = GrayImage::new(width, height);
    warp_into(mask, &projection, Interpolation::Nearest, Luma([0u8]), &mut output);
    Some(output)
}

/// Maps rectified-table coordinates back onto the frame by bilinear
/// interpolation between the table corners.
struct QuadMap {
    corners: [Point; 4],
    width: f32,
    height: f32,
}

impl QuadMap {
    fn new(corners: [Point; 4], width: u32, height: u32) -> Self {
        Self {
            corners,
            width: (width.max(2) - 1) as f32,
            height: (height.max(2) - 1) as f32,
        }
    }

    fn to_frame(&self, x: f32, y: f32) -> Point {
        let [tl, tr, br, bl] = self.corners;
        let u = x / self.width;
        let v = y / self.height;
        let top = (tl.0 + (tr.0 - tl.0) * u, tl.1 + (tr.1 - tl.1) * u);
        let bottom = (bl.0 + (br.0 - bl.0) * u, bl.1 + (br.1 - bl.1) * u);
        (top.0 + (bottom.0 - top.0) * v, top.1 + (bottom.1 - top.1) * v)
    }

    fn frame_bounds(&self, x0: u32, y0: u32, x1: u32, y1: u32) -> CellBounds {
        let points = [
            self.to_frame(x0 as f32, y0 as f32),
            self.to_frame(x1 as f32, y0 as f32),
            self.to_frame(x1 as f32, y1 as f32),
            self.to_frame(x0 as f32, y1 as f32),
        ];
        let min_x = points.iter().map(|p| p.0).fold(f32::INFINITY, f32::min).max(0.0);
        let min_y = points.iter().map(|p| p.1).fold(f32::INFINITY, f32::min).max(0.0);
        let max_x = points.iter().map(|p| p.0).fold(0.0, f32::max);
        let max_y = points.iter().map(|p| p.1).fold(0.0, f32::max);
        CellBounds {
            x: min_x.round() as u32,
            y: min_y.round() as u32,
            width: (max_x - min_x).round() as u32 + 1,
            height: (max_y - min_y).round() as u32 + 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locator() -> TableLocator {
        TableLocator::from(&RecognitionConfig::default())
    }

    /// Ink mask of a ruled grid: `cols x rows` cells of `cell` px with
    /// `line` px rulings, offset by `(ox, oy)` in a `w x h` frame.
    fn ruled_grid(
        w: u32,
        h: u32,
        (ox, oy): (u32, u32),
        rows: u32,
        cols: u32,
        cell: u32,
        line: u32,
    ) -> GrayImage {
        let mut mask = GrayImage::new(w, h);
        let pitch = cell + line;
        let table_w = cols * pitch + line;
        let table_h = rows * pitch + line;
        for y in 0..table_h {
            for x in 0..table_w {
                if x % pitch < line || y % pitch < line {
                    mask.put_pixel(ox + x, oy + y, Luma([255]));
                }
            }
        }
        mask
    }

    #[test]
    fn line_runs_groups_consecutive_hits() {
        let profile = [9, 9, 0, 1, 0, 8, 9, 0, 10];
        assert_eq!(line_runs(&profile, 8.0), vec![(0, 1), (5, 6), (8, 8)]);
    }

    #[test]
    fn spans_between_skips_narrow_gaps() {
        let rulings = [(0, 2), (4, 5), (30, 32), (60, 62)];
        assert_eq!(spans_between(&rulings, 8), vec![(6, 29), (33, 59)]);
    }

    #[test]
    fn corners_of_a_skewed_quadrilateral() {
        let pixels = vec![(2, 5), (50, 1), (54, 30), (5, 33), (20, 15)];
        let corners = extreme_corners(pixels.into_iter()).expect("corners");
        assert_eq!(corners[0], (2.0, 5.0));
        assert_eq!(corners[1], (50.0, 1.0));
        assert_eq!(corners[2], (54.0, 30.0));
        assert_eq!(corners[3], (5.0, 33.0));
    }

    #[test]
    fn select_prefers_largest_table_shaped_region() {
        let contour = |label, w: u32, h: u32| Contour {
            label,
            min_x: 0,
            min_y: 0,
            max_x: w - 1,
            max_y: h - 1,
            pixel_count: w + h,
        };
        let contours = vec![
            contour(1, 200, 100),
            contour(2, 300, 120),
            contour(3, 900, 10), // too elongated
            contour(4, 20, 20),  // too small
        ];
        let chosen = locator()
            .select_table_region(&contours, 1000 * 1000)
            .expect("table");
        assert_eq!(chosen.label, 2);
    }

    #[test]
    fn segments_a_single_row_grid() {
        let mask = ruled_grid(500, 250, (40, 60), 1, 3, 100, 3);
        let grid = locator()
            .locate_cells(&mask, &PipelineContext::default())
            .expect("grid");

        assert_eq!((grid.rows, grid.columns), (1, 3));
        let positions: Vec<_> = grid.cells.iter().map(|c| (c.position.row, c.position.column)).collect();
        assert_eq!(positions, vec![(0, 0), (0, 1), (0, 2)]);

        let first = &grid.cells[0].bounds;
        assert_eq!((first.x, first.y), (43, 63));
        assert_eq!((first.width, first.height), (100, 100));
        assert!(grid.cells.iter().all(|c| c.image.pixels().all(|p| p[0] == 0)));
    }

    #[test]
    fn segments_multi_row_grid_in_row_major_order() {
        let mask = ruled_grid(600, 400, (10, 10), 2, 4, 80, 2);
        let grid = locator()
            .locate_cells(&mask, &PipelineContext::default())
            .expect("grid");
        assert_eq!((grid.rows, grid.columns), (2, 4));
        assert_eq!(grid.cells.len(), 8);
        assert_eq!(grid.cells[4].position, CellPosition { row: 1, column: 0 });
        assert!(grid.cells[4].bounds.y > grid.cells[3].bounds.y);
    }

    #[test]
    fn tall_stroke_inside_a_cell_is_not_a_ruling() {
        let mut mask = ruled_grid(500, 250, (40, 60), 1, 3, 100, 3);
        // A "1" filling 90% of the middle cell's height, clear of the grid.
        for y in 68..158 {
            for x in 190..200 {
                mask.put_pixel(x, y, Luma([255]));
            }
        }
        let grid = locator()
            .locate_cells(&mask, &PipelineContext::default())
            .expect("grid");
        assert_eq!((grid.rows, grid.columns), (1, 3));
        assert!(grid.cells[1].image.pixels().any(|p| p[0] > 0));
    }

    #[test]
    fn blank_mask_has_no_table() {
        let mask = GrayImage::new(300, 200);
        let err = locator()
            .locate_cells(&mask, &PipelineContext::default())
            .unwrap_err();
        assert!(matches!(err, RecognitionError::TableNotFound(_)));
    }

    #[test]
    fn merged_cell_in_second_row_is_inconsistent() {
        let mut mask = ruled_grid(600, 400, (10, 10), 2, 3, 100, 3);
        // Erase the second vertical ruling inside the second row.
        let pitch = 103;
        for y in (10 + pitch + 3)..(10 + 2 * pitch) {
            for x in (10 + pitch)..(10 + pitch + 3) {
                mask.put_pixel(x, y, Luma([0]));
            }
        }
        let err = locator()
            .locate_cells(&mask, &PipelineContext::default())
            .unwrap_err();
        assert!(matches!(
            err,
            RecognitionError::InconsistentGrid { row: 1, expected: 3, found: 2 }
        ));
    }
}
