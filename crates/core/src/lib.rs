//! # raster2sensor core
//!
//! Core types and I/O for the raster2sensor pipeline.
//!
//! This crate provides:
//! - `Raster`: Georeferenced single-band grid of f64 cells
//! - `GeoTransform`: Affine transformation for georeferencing
//! - `CRS`: Coordinate Reference System handling
//! - `RasterImage`: A multi-band image whose bands are addressed by role
//! - `PlotGeometry`: Trial plot polygons loaded from vector files

pub mod crs;
pub mod error;
pub mod io;
pub mod raster;
pub mod vector;

pub use crs::CRS;
pub use error::{Error, Result};
pub use raster::{
    BandRole, BandView, GeoTransform, PixelWindow, Raster, RasterElement, RasterImage,
};
pub use vector::{PlotCollection, PlotGeometry};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::crs::CRS;
    pub use crate::error::{Error, Result};
    pub use crate::raster::{BandRole, GeoTransform, Raster, RasterElement, RasterImage};
    pub use crate::vector::{PlotCollection, PlotGeometry};
}
