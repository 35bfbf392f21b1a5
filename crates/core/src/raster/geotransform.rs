//! Affine geotransformation for rasters

use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Affine transformation coefficients for georeferencing rasters.
///
/// Converts between pixel coordinates (col, row) and geographic coordinates (x, y):
/// ```text
/// x = origin_x + col * pixel_width + row * row_rotation
/// y = origin_y + col * col_rotation + row * pixel_height
/// ```
///
/// For north-up images, `row_rotation` and `col_rotation` are typically 0,
/// and `pixel_height` is negative.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    /// X coordinate of the upper-left corner
    pub origin_x: f64,
    /// Y coordinate of the upper-left corner
    pub origin_y: f64,
    /// Pixel width (cell size in X direction)
    pub pixel_width: f64,
    /// Pixel height (cell size in Y direction, usually negative)
    pub pixel_height: f64,
    /// Rotation about X axis (usually 0)
    pub row_rotation: f64,
    /// Rotation about Y axis (usually 0)
    pub col_rotation: f64,
}

/// Rectangular block of pixels, half-open in both directions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelWindow {
    pub rows: Range<usize>,
    pub cols: Range<usize>,
}

impl PixelWindow {
    /// Number of pixels covered by the window
    pub fn len(&self) -> usize {
        self.rows.len() * self.cols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl GeoTransform {
    /// Create a new GeoTransform with no rotation (north-up image)
    pub fn new(origin_x: f64, origin_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            origin_x,
            origin_y,
            pixel_width,
            pixel_height,
            row_rotation: 0.0,
            col_rotation: 0.0,
        }
    }

    /// Create from GDAL-style array [origin_x, pixel_width, row_rotation, origin_y, col_rotation, pixel_height]
    pub fn from_gdal(coeffs: [f64; 6]) -> Self {
        Self {
            origin_x: coeffs[0],
            pixel_width: coeffs[1],
            row_rotation: coeffs[2],
            origin_y: coeffs[3],
            col_rotation: coeffs[4],
            pixel_height: coeffs[5],
        }
    }

    /// Geographic coordinates of the centre of pixel (col, row)
    pub fn cell_center(&self, col: usize, row: usize) -> (f64, f64) {
        self.apply(col as f64 + 0.5, row as f64 + 0.5)
    }

    /// Geographic coordinates of the top-left corner of pixel (col, row)
    pub fn cell_corner(&self, col: usize, row: usize) -> (f64, f64) {
        self.apply(col as f64, row as f64)
    }

    fn apply(&self, col: f64, row: f64) -> (f64, f64) {
        let x = self.origin_x + col * self.pixel_width + row * self.row_rotation;
        let y = self.origin_y + col * self.col_rotation + row * self.pixel_height;
        (x, y)
    }

    /// Convert geographic coordinates to fractional pixel coordinates (col, row)
    pub fn geo_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        let det = self.pixel_width * self.pixel_height - self.row_rotation * self.col_rotation;

        if det.abs() < 1e-12 {
            return (f64::NAN, f64::NAN);
        }

        let dx = x - self.origin_x;
        let dy = y - self.origin_y;

        let col = (self.pixel_height * dx - self.row_rotation * dy) / det;
        let row = (-self.col_rotation * dx + self.pixel_width * dy) / det;

        (col, row)
    }

    /// Bounding box (min_x, min_y, max_x, max_y) of a raster of given dimensions
    pub fn bounds(&self, cols: usize, rows: usize) -> (f64, f64, f64, f64) {
        let corners = [
            self.cell_corner(0, 0),
            self.cell_corner(cols, 0),
            self.cell_corner(0, rows),
            self.cell_corner(cols, rows),
        ];

        corners.iter().fold(
            (f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY),
            |(min_x, min_y, max_x, max_y), &(x, y)| {
                (min_x.min(x), min_y.min(y), max_x.max(x), max_y.max(y))
            },
        )
    }

    /// Pixels of a `cols` x `rows` grid whose footprint can intersect the
    /// geographic box, clamped to the grid. `None` when the box lies
    /// entirely outside the raster.
    pub fn window_for_bbox(
        &self,
        (min_x, min_y, max_x, max_y): (f64, f64, f64, f64),
        cols: usize,
        rows: usize,
    ) -> Option<PixelWindow> {
        let corners = [
            self.geo_to_pixel(min_x, min_y),
            self.geo_to_pixel(min_x, max_y),
            self.geo_to_pixel(max_x, min_y),
            self.geo_to_pixel(max_x, max_y),
        ];

        if corners.iter().any(|(c, r)| !c.is_finite() || !r.is_finite()) {
            return None;
        }

        let col_lo = corners.iter().map(|c| c.0).fold(f64::INFINITY, f64::min);
        let col_hi = corners.iter().map(|c| c.0).fold(f64::NEG_INFINITY, f64::max);
        let row_lo = corners.iter().map(|c| c.1).fold(f64::INFINITY, f64::min);
        let row_hi = corners.iter().map(|c| c.1).fold(f64::NEG_INFINITY, f64::max);

        if col_hi <= 0.0 || row_hi <= 0.0 || col_lo >= cols as f64 || row_lo >= rows as f64 {
            return None;
        }

        let c0 = col_lo.floor().max(0.0) as usize;
        let c1 = (col_hi.ceil() as usize).min(cols);
        let r0 = row_lo.floor().max(0.0) as usize;
        let r1 = (row_hi.ceil() as usize).min(rows);

        let window = PixelWindow {
            rows: r0..r1,
            cols: c0..c1,
        };
        (!window.is_empty()).then_some(window)
    }
}

impl Default for GeoTransform {
    fn default() -> Self {
        Self::new(0.0, 0.0, 1.0, -1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_cell_center_inverts() {
        let gt = GeoTransform::new(100.0, 200.0, 10.0, -10.0);

        let (x, y) = gt.cell_center(5, 10);
        let (col, row) = gt.geo_to_pixel(x, y);

        assert_relative_eq!(col, 5.5, epsilon = 1e-10);
        assert_relative_eq!(row, 10.5, epsilon = 1e-10);
    }

    #[test]
    fn test_bounds() {
        let gt = GeoTransform::new(0.0, 100.0, 1.0, -1.0);
        let (min_x, min_y, max_x, max_y) = gt.bounds(100, 100);

        assert_relative_eq!(min_x, 0.0, epsilon = 1e-10);
        assert_relative_eq!(min_y, 0.0, epsilon = 1e-10);
        assert_relative_eq!(max_x, 100.0, epsilon = 1e-10);
        assert_relative_eq!(max_y, 100.0, epsilon = 1e-10);
    }

    #[test]
    fn test_window_clamped_to_grid() {
        let gt = GeoTransform::new(0.0, 10.0, 1.0, -1.0);
        // Box hangs off the right edge of a 10x10 grid
        let w = gt.window_for_bbox((8.0, 2.0, 14.0, 6.0), 10, 10).unwrap();
        assert_eq!(w.cols, 8..10);
        assert_eq!(w.rows, 4..8);
    }

    #[test]
    fn test_window_outside_grid() {
        let gt = GeoTransform::new(0.0, 10.0, 1.0, -1.0);
        assert!(gt.window_for_bbox((20.0, 20.0, 30.0, 30.0), 10, 10).is_none());
        assert!(gt.window_for_bbox((-5.0, 2.0, 0.0, 6.0), 10, 10).is_none());
    }
}
