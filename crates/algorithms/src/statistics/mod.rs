//! Statistical analysis of derived rasters
//!
//! - **zonal**: Statistics over plot polygons

pub mod zonal;

pub use zonal::{aggregate, zonal_statistics, ZonalStatisticResult, ZonalStats};
