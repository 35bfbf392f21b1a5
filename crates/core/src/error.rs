//! Error types for raster2sensor core

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for raster and vector operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot read raster {path}: {reason}")]
    RasterIo { path: PathBuf, reason: String },

    #[error("band {band} out of range for {path} ({count} band(s) available)")]
    BandOutOfRange {
        path: PathBuf,
        band: usize,
        count: usize,
    },

    #[error("band role '{0}' is not mapped for this raster")]
    MissingBand(String),

    #[error("unknown band role '{0}'")]
    UnknownBandRole(String),

    #[error("Invalid raster dimensions: {width}x{height}")]
    InvalidDimensions { width: usize, height: usize },

    #[error("Index out of bounds: ({row}, {col}) in raster of size ({rows}, {cols})")]
    IndexOutOfBounds {
        row: usize,
        col: usize,
        rows: usize,
        cols: usize,
    },

    #[error("Raster size mismatch: expected ({er}, {ec}), got ({ar}, {ac})")]
    SizeMismatch { er: usize, ec: usize, ar: usize, ac: usize },

    #[error("CRS mismatch: {0} vs {1}")]
    CrsMismatch(String, String),

    #[error("Unsupported data type: {0}")]
    UnsupportedDataType(String),

    #[error("invalid vector source {path}: {reason}")]
    Vector { path: PathBuf, reason: String },

    #[error("plot {plot_id}: invalid geometry: {reason}")]
    InvalidGeometry { plot_id: String, reason: String },

    #[error("feature {feature} has no '{field}' attribute")]
    MissingPlotId { feature: usize, field: String },

    #[error("GDAL error: {0}")]
    #[cfg(feature = "gdal")]
    Gdal(String),

    #[error("{0}")]
    Other(String),
}

#[cfg(feature = "gdal")]
impl From<gdal::errors::GdalError> for Error {
    fn from(e: gdal::errors::GdalError) -> Self {
        Error::Gdal(e.to_string())
    }
}

/// Result type alias for raster2sensor core operations
pub type Result<T> = std::result::Result<T, Error>;
