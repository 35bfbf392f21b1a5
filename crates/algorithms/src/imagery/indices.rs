//! Vegetation indices
//!
//! A closed registry of indices computed from multispectral imagery. Each
//! variant pairs a name, the band roles it reads and a pure per-pixel formula.

use crate::maybe_rayon::*;
use chrono::{DateTime, FixedOffset};
use ndarray::{Array2, ArrayView2};
use raster2sensor_core::{BandRole, Error, Raster, RasterImage, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Soil brightness correction factor used by SAVI
const SAVI_L: f64 = 0.5;

/// Supported vegetation indices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VegetationIndex {
    /// Normalized Difference Vegetation Index
    Ndvi,
    /// Normalized Difference Red Edge Index
    Ndre,
    /// Green Normalized Difference Vegetation Index
    Gndvi,
    /// Soil Adjusted Vegetation Index
    Savi,
    /// Red Edge Chlorophyll Index
    CiRedEdge,
    /// Modified Chlorophyll Absorption in Reflectance Index
    Mcari,
    /// Visible Atmospherically Resistant Index
    Vari,
}

impl VegetationIndex {
    pub const ALL: [VegetationIndex; 7] = [
        VegetationIndex::Ndvi,
        VegetationIndex::Ndre,
        VegetationIndex::Gndvi,
        VegetationIndex::Savi,
        VegetationIndex::CiRedEdge,
        VegetationIndex::Mcari,
        VegetationIndex::Vari,
    ];

    /// Canonical name, also used as the `raster_data` key in the registry
    pub fn name(&self) -> &'static str {
        match self {
            VegetationIndex::Ndvi => "NDVI",
            VegetationIndex::Ndre => "NDRE",
            VegetationIndex::Gndvi => "GNDVI",
            VegetationIndex::Savi => "SAVI",
            VegetationIndex::CiRedEdge => "CIRedEdge",
            VegetationIndex::Mcari => "MCARI",
            VegetationIndex::Vari => "VARI",
        }
    }

    /// Band roles read by the formula, in the order [`evaluate`](Self::evaluate) expects
    pub fn required_roles(&self) -> &'static [BandRole] {
        use BandRole::*;
        match self {
            VegetationIndex::Ndvi => &[Nir, Red],
            VegetationIndex::Ndre => &[Nir, RedEdge],
            VegetationIndex::Gndvi => &[Nir, Green],
            VegetationIndex::Savi => &[Nir, Red],
            VegetationIndex::CiRedEdge => &[Nir, RedEdge],
            VegetationIndex::Mcari => &[RedEdge, Red, Green],
            VegetationIndex::Vari => &[Green, Red, Blue],
        }
    }

    /// Evaluate the formula for one pixel.
    ///
    /// `v` holds the values of [`required_roles`](Self::required_roles) in
    /// order. Undefined results (0/0, x/0) come back as NaN.
    pub fn evaluate(&self, v: &[f64]) -> f64 {
        let value = match self {
            VegetationIndex::Ndvi | VegetationIndex::Ndre | VegetationIndex::Gndvi => {
                normalized_difference(v[0], v[1])
            }
            VegetationIndex::Savi => {
                let (nir, red) = (v[0], v[1]);
                (nir - red) / (nir + red + SAVI_L) * (1.0 + SAVI_L)
            }
            VegetationIndex::CiRedEdge => v[0] / v[1] - 1.0,
            VegetationIndex::Mcari => {
                let (re, red, green) = (v[0], v[1], v[2]);
                ((re - red) - 0.2 * (re - green)) * (re / red)
            }
            VegetationIndex::Vari => {
                let (green, red, blue) = (v[0], v[1], v[2]);
                (green - red) / (green + red - blue)
            }
        };

        if value.is_finite() {
            value
        } else {
            f64::NAN
        }
    }
}

fn normalized_difference(a: f64, b: f64) -> f64 {
    (a - b) / (a + b)
}

impl fmt::Display for VegetationIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for VegetationIndex {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        VegetationIndex::ALL
            .into_iter()
            .find(|idx| idx.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::Other(format!("unknown vegetation index '{}'", s)))
    }
}

/// A per-pixel index raster computed from one image
#[derive(Debug, Clone)]
pub struct DerivedRaster {
    pub index: VegetationIndex,
    pub timestamp: DateTime<FixedOffset>,
    /// NaN marks pixels where any input band was no-data or the formula was undefined
    pub raster: Raster,
}

/// Compute a vegetation index over an image.
///
/// A pixel is no-data in the output if any required band is no-data there.
/// Fails with [`Error::MissingBand`] only when a required role is not
/// mapped for the image.
pub fn compute(index: VegetationIndex, image: &RasterImage) -> Result<DerivedRaster> {
    let views = index
        .required_roles()
        .iter()
        .map(|&role| image.read_band(role))
        .collect::<Result<Vec<_>>>()?;

    let Some(reference) = views.first().map(|v| v.raster()) else {
        return Err(Error::Other(format!("{} reads no bands", index)));
    };

    let (rows, cols) = reference.shape();
    let bands: Vec<(ArrayView2<'_, f64>, &Array2<bool>)> =
        views.iter().map(|v| (v.data(), v.mask())).collect();
    let n = bands.len();

    let data: Vec<f64> = (0..rows)
        .into_par_iter()
        .flat_map(|row| {
            let mut row_data = vec![f64::NAN; cols];
            let mut values = [0.0_f64; 5];
            'pixel: for col in 0..cols {
                for (k, (band, mask)) in bands.iter().enumerate() {
                    if mask[(row, col)] {
                        continue 'pixel;
                    }
                    values[k] = band[(row, col)];
                }
                row_data[col] = index.evaluate(&values[..n]);
            }
            row_data
        })
        .collect();

    let array = Array2::from_shape_vec((rows, cols), data).map_err(|e| Error::Other(e.to_string()))?;
    let raster = reference.derive(array)?;

    tracing::debug!(
        index = %index,
        image = %image.path().display(),
        valid = raster.statistics().valid_count,
        "computed vegetation index"
    );

    Ok(DerivedRaster {
        index,
        timestamp: image.timestamp(),
        raster,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ts() -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339("2024-06-01T10:00:00+02:00").unwrap()
    }

    fn image(bands: Vec<(BandRole, Vec<f64>)>, rows: usize, cols: usize) -> RasterImage {
        let bands = bands
            .into_iter()
            .map(|(role, data)| (role, Raster::from_vec(data, rows, cols).unwrap()))
            .collect();
        RasterImage::from_bands("test.tif", ts(), bands).unwrap()
    }

    #[test]
    fn test_ndvi_uniform() {
        // (0.4 - 0.2) / (0.4 + 0.2) = 1/3
        let img = image(
            vec![
                (BandRole::Red, vec![0.2; 4]),
                (BandRole::Nir, vec![0.4; 4]),
            ],
            2,
            2,
        );
        let derived = compute(VegetationIndex::Ndvi, &img).unwrap();
        for &v in derived.raster.data().iter() {
            assert_relative_eq!(v, 1.0 / 3.0, epsilon = 1e-12);
        }
        assert_eq!(derived.timestamp, ts());
    }

    #[test]
    fn test_ndvi_integer_reflectance() {
        let img = image(
            vec![
                (BandRole::Red, vec![100.0; 4]),
                (BandRole::Nir, vec![200.0; 4]),
            ],
            2,
            2,
        );
        let derived = compute(VegetationIndex::Ndvi, &img).unwrap();
        assert_eq!(derived.raster.shape(), (2, 2));
        for &v in derived.raster.data().iter() {
            assert_relative_eq!(v, 1.0 / 3.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_nodata_propagates_from_any_band() {
        let mut red = Raster::from_vec(vec![0.2, 0.2, -1.0, 0.2], 2, 2).unwrap();
        red.set_nodata(Some(-1.0));
        let nir = Raster::from_vec(vec![0.4, f64::NAN, 0.4, 0.4], 2, 2).unwrap();
        let img =
            RasterImage::from_bands("t.tif", ts(), vec![(BandRole::Red, red), (BandRole::Nir, nir)])
                .unwrap();

        let derived = compute(VegetationIndex::Ndvi, &img).unwrap();
        let d = derived.raster.data();
        assert!(!d[(0, 0)].is_nan());
        assert!(d[(0, 1)].is_nan());
        assert!(d[(1, 0)].is_nan());
        assert!(!d[(1, 1)].is_nan());
    }

    #[test]
    fn test_zero_division_is_nodata() {
        let img = image(
            vec![
                (BandRole::Red, vec![0.0, 0.1]),
                (BandRole::Nir, vec![0.0, 0.3]),
            ],
            1,
            2,
        );
        let derived = compute(VegetationIndex::Ndvi, &img).unwrap();
        assert!(derived.raster.get(0, 0).unwrap().is_nan());
        assert_relative_eq!(derived.raster.get(0, 1).unwrap(), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_missing_band_role() {
        let img = image(vec![(BandRole::Red, vec![0.1]), (BandRole::Nir, vec![0.5])], 1, 1);
        assert!(matches!(
            compute(VegetationIndex::Ndre, &img),
            Err(Error::MissingBand(role)) if role == "red_edge"
        ));
    }

    #[test]
    fn test_formulas() {
        assert_relative_eq!(VegetationIndex::Savi.evaluate(&[0.5, 0.1]), 0.4 / 1.1 * 1.5);
        assert_relative_eq!(VegetationIndex::CiRedEdge.evaluate(&[0.6, 0.3]), 1.0);
        // ((0.3 - 0.1) - 0.2 * (0.3 - 0.2)) * (0.3 / 0.1) = 0.18 * 3
        assert_relative_eq!(
            VegetationIndex::Mcari.evaluate(&[0.3, 0.1, 0.2]),
            0.54,
            epsilon = 1e-12
        );
        // (0.3 - 0.2) / (0.3 + 0.2 - 0.1)
        assert_relative_eq!(VegetationIndex::Vari.evaluate(&[0.3, 0.2, 0.1]), 0.25, epsilon = 1e-12);
        assert!(VegetationIndex::Vari.evaluate(&[0.1, 0.1, 0.2]).is_nan());
    }

    #[test]
    fn test_lookup_by_name() {
        assert_eq!("ndvi".parse::<VegetationIndex>().unwrap(), VegetationIndex::Ndvi);
        assert_eq!("cirededge".parse::<VegetationIndex>().unwrap(), VegetationIndex::CiRedEdge);
        assert!("evi".parse::<VegetationIndex>().is_err());
    }
}
