//! Imagery analysis algorithms
//!
//! Vegetation indices evaluated per pixel over the bands of a
//! [`RasterImage`](raster2sensor_core::RasterImage).

mod indices;

pub use indices::{compute, DerivedRaster, VegetationIndex};
