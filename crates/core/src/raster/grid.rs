//! Single-band raster grid

use crate::crs::CRS;
use crate::error::{Error, Result};
use crate::raster::GeoTransform;
use ndarray::{Array2, ArrayView2};

/// A georeferenced 2D raster grid of `f64` cells.
///
/// Band values are widened to `f64` on load so that index formulas can be
/// evaluated without per-type dispatch. Derived rasters use NaN as their
/// no-data value.
///
/// # Example
///
/// ```ignore
/// use raster2sensor_core::Raster;
///
/// let mut raster = Raster::filled(100, 100, 0.0);
/// raster.set_nodata(Some(-9999.0));
/// let value = raster.get(10, 20)?;
/// ```
#[derive(Debug, Clone)]
pub struct Raster {
    /// Raster data stored in row-major order (row, col)
    data: Array2<f64>,
    /// Affine transformation
    transform: GeoTransform,
    /// Coordinate reference system
    crs: Option<CRS>,
    /// No-data value
    nodata: Option<f64>,
}

impl Raster {
    /// Create a new raster filled with a specific value
    pub fn filled(rows: usize, cols: usize, value: f64) -> Self {
        Self::from_array(Array2::from_elem((rows, cols), value))
    }

    /// Create a raster from row-major data
    pub fn from_vec(data: Vec<f64>, rows: usize, cols: usize) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(Error::InvalidDimensions {
                width: cols,
                height: rows,
            });
        }

        let array = Array2::from_shape_vec((rows, cols), data)
            .map_err(|e| Error::Other(e.to_string()))?;

        Ok(Self::from_array(array))
    }

    /// Create a raster from an ndarray
    pub fn from_array(data: Array2<f64>) -> Self {
        Self {
            data,
            transform: GeoTransform::default(),
            crs: None,
            nodata: None,
        }
    }

    /// Create a raster sharing this raster's georeferencing but holding
    /// `data`, with NaN as no-data.
    pub fn derive(&self, data: Array2<f64>) -> Result<Self> {
        if data.dim() != self.data.dim() {
            let (er, ec) = self.data.dim();
            let (ar, ac) = data.dim();
            return Err(Error::SizeMismatch { er, ec, ar, ac });
        }
        Ok(Self {
            data,
            transform: self.transform,
            crs: self.crs.clone(),
            nodata: Some(f64::NAN),
        })
    }

    /// Number of rows
    pub fn rows(&self) -> usize {
        self.data.nrows()
    }

    /// Number of columns
    pub fn cols(&self) -> usize {
        self.data.ncols()
    }

    /// Dimensions as (rows, cols)
    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    /// Get value at (row, col)
    pub fn get(&self, row: usize, col: usize) -> Result<f64> {
        self.data
            .get((row, col))
            .copied()
            .ok_or(Error::IndexOutOfBounds {
                row,
                col,
                rows: self.rows(),
                cols: self.cols(),
            })
    }

    /// Set value at (row, col)
    pub fn set(&mut self, row: usize, col: usize, value: f64) -> Result<()> {
        match self.data.get_mut((row, col)) {
            Some(cell) => {
                *cell = value;
                Ok(())
            }
            None => Err(Error::IndexOutOfBounds {
                row,
                col,
                rows: self.rows(),
                cols: self.cols(),
            }),
        }
    }

    /// Get a view of the underlying data
    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.data.view()
    }

    /// Get a reference to the underlying array
    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    // Metadata

    pub fn transform(&self) -> &GeoTransform {
        &self.transform
    }

    pub fn set_transform(&mut self, transform: GeoTransform) {
        self.transform = transform;
    }

    pub fn crs(&self) -> Option<&CRS> {
        self.crs.as_ref()
    }

    pub fn set_crs(&mut self, crs: Option<CRS>) {
        self.crs = crs;
    }

    pub fn nodata(&self) -> Option<f64> {
        self.nodata
    }

    pub fn set_nodata(&mut self, nodata: Option<f64>) {
        self.nodata = nodata;
    }

    /// Geographic bounds (min_x, min_y, max_x, max_y)
    pub fn bounds(&self) -> (f64, f64, f64, f64) {
        self.transform.bounds(self.cols(), self.rows())
    }

    /// Whether a cell value is no-data. NaN is always no-data.
    pub fn is_nodata(&self, value: f64) -> bool {
        if value.is_nan() {
            return true;
        }
        match self.nodata {
            Some(nd) if nd.is_nan() => false,
            Some(nd) => (value - nd).abs() <= f64::EPSILON * nd.abs().max(1.0) * 100.0,
            None => false,
        }
    }

    /// Per-cell no-data mask (`true` where the cell holds no valid value)
    pub fn nodata_mask(&self) -> Array2<bool> {
        self.data.map(|&v| self.is_nodata(v))
    }

    /// Basic statistics over valid cells
    pub fn statistics(&self) -> RasterStatistics {
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        let mut count = 0usize;

        for &value in self.data.iter().filter(|&&v| !self.is_nodata(v)) {
            min = min.min(value);
            max = max.max(value);
            sum += value;
            count += 1;
        }

        RasterStatistics {
            min: (count > 0).then_some(min),
            max: (count > 0).then_some(max),
            mean: (count > 0).then(|| sum / count as f64),
            valid_count: count,
            nodata_count: self.data.len() - count,
        }
    }
}

/// Basic statistics for a raster
#[derive(Debug, Clone)]
pub struct RasterStatistics {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
    pub valid_count: usize,
    pub nodata_count: usize,
}
