//! # raster2sensor algorithms
//!
//! Per-pixel and per-plot analysis for the raster2sensor pipeline.
//!
//! ## Available Algorithm Categories
//!
//! - **imagery**: Vegetation indices computed from multispectral band roles
//! - **statistics**: Zonal statistics of a derived raster over plot polygons

pub mod imagery;
pub mod statistics;

pub(crate) mod maybe_rayon;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::imagery::{compute, DerivedRaster, VegetationIndex};
    pub use crate::statistics::{aggregate, ZonalStatisticResult, ZonalStats};
    pub use raster2sensor_core::prelude::*;
}
