//! Raster data structures

mod geotransform;
mod grid;
mod image;

pub use geotransform::{GeoTransform, PixelWindow};
pub use grid::{Raster, RasterStatistics};
pub use image::{BandRole, BandView, RasterImage};

/// Cell types that can be read into a [`Raster`].
///
/// Every band is widened to `f64` on load; this trait only exists so the
/// readers can accept whatever sample format the file carries.
pub trait RasterElement: Copy + num_traits::NumCast {
    /// Convert to f64, mapping unrepresentable values to NaN
    fn to_f64_or_nan(self) -> f64 {
        num_traits::cast(self).unwrap_or(f64::NAN)
    }
}

macro_rules! impl_raster_element {
    ($($t:ty),*) => {
        $(impl RasterElement for $t {})*
    };
}

impl_raster_element!(i8, i16, i32, i64, u8, u16, u32, u64, f32, f64);
