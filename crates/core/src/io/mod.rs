//! Reading and writing of georeferenced rasters

#[cfg(feature = "gdal")]
mod gdal_io;
mod native;

#[cfg(feature = "gdal")]
pub use gdal_io::read_bands;

#[cfg(not(feature = "gdal"))]
pub use native::read_bands;

pub use native::{write_geotiff, write_geotiff_bands};
