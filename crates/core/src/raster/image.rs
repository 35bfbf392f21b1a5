//! Multi-band images addressed by spectral role

use crate::crs::CRS;
use crate::error::{Error, Result};
use crate::io;
use crate::raster::{GeoTransform, Raster};
use chrono::{DateTime, FixedOffset};
use ndarray::{Array2, ArrayView2};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Spectral role of a band within a multispectral image
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BandRole {
    Blue,
    Green,
    Red,
    RedEdge,
    Nir,
}

impl BandRole {
    pub const ALL: [BandRole; 5] = [
        BandRole::Blue,
        BandRole::Green,
        BandRole::Red,
        BandRole::RedEdge,
        BandRole::Nir,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BandRole::Blue => "blue",
            BandRole::Green => "green",
            BandRole::Red => "red",
            BandRole::RedEdge => "red_edge",
            BandRole::Nir => "nir",
        }
    }
}

impl fmt::Display for BandRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BandRole {
    type Err = Error;

    /// Accepts `red`, `Red`, `red_band`, `rededge`, `red_edge_band`, ...
    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        let name = lower.strip_suffix("_band").unwrap_or(&lower);
        match name {
            "blue" | "b" => Ok(BandRole::Blue),
            "green" | "g" => Ok(BandRole::Green),
            "red" | "r" => Ok(BandRole::Red),
            "red_edge" | "rededge" | "re" => Ok(BandRole::RedEdge),
            "nir" | "near_infrared" => Ok(BandRole::Nir),
            _ => Err(Error::UnknownBandRole(s.to_string())),
        }
    }
}

/// Read-only view over one band of a [`RasterImage`]
#[derive(Debug)]
pub struct BandView<'a> {
    raster: &'a Raster,
    mask: Array2<bool>,
}

impl<'a> BandView<'a> {
    /// Cell values (row, col)
    pub fn data(&self) -> ArrayView2<'a, f64> {
        self.raster.view()
    }

    /// `true` where the cell is no-data
    pub fn mask(&self) -> &Array2<bool> {
        &self.mask
    }

    pub fn transform(&self) -> &GeoTransform {
        self.raster.transform()
    }

    pub fn crs(&self) -> Option<&CRS> {
        self.raster.crs()
    }

    pub fn raster(&self) -> &'a Raster {
        self.raster
    }
}

/// A multispectral image with a capture timestamp and a role-to-band mapping.
///
/// Bands are 1-indexed. Only bands referenced by the mapping are read, and
/// each distinct band index is read at most once. The file handle is not
/// held after [`RasterImage::load`] returns.
#[derive(Debug, Clone)]
pub struct RasterImage {
    path: PathBuf,
    timestamp: DateTime<FixedOffset>,
    band_map: BTreeMap<BandRole, usize>,
    bands: BTreeMap<usize, Raster>,
    shape: (usize, usize),
    transform: GeoTransform,
    crs: Option<CRS>,
}

impl RasterImage {
    /// Read the mapped bands of the image at `path`
    pub fn load<P: AsRef<Path>>(
        path: P,
        timestamp: DateTime<FixedOffset>,
        band_map: BTreeMap<BandRole, usize>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if band_map.is_empty() {
            return Err(Error::RasterIo {
                path,
                reason: "no bands requested".into(),
            });
        }

        let mut indices: Vec<usize> = band_map.values().copied().collect();
        indices.sort_unstable();
        indices.dedup();

        tracing::debug!(path = %path.display(), bands = ?indices, "reading raster bands");
        let rasters = io::read_bands(&path, &indices)?;
        let Some(first) = rasters.first() else {
            return Err(Error::RasterIo {
                path,
                reason: "reader returned no bands".into(),
            });
        };
        let (shape, transform, crs) = (first.shape(), *first.transform(), first.crs().cloned());
        let bands = indices.into_iter().zip(rasters).collect();

        Ok(Self {
            path,
            timestamp,
            band_map,
            bands,
            shape,
            transform,
            crs,
        })
    }

    /// Build an image from in-memory bands. Band `i` of the list gets index `i + 1`.
    pub fn from_bands(
        path: impl Into<PathBuf>,
        timestamp: DateTime<FixedOffset>,
        bands: Vec<(BandRole, Raster)>,
    ) -> Result<Self> {
        let path = path.into();
        let Some((_, first)) = bands.first() else {
            return Err(Error::RasterIo {
                path,
                reason: "no bands supplied".into(),
            });
        };
        let (er, ec) = first.shape();
        let (transform, crs) = (*first.transform(), first.crs().cloned());

        let mut band_map = BTreeMap::new();
        let mut stored = BTreeMap::new();
        for (i, (role, raster)) in bands.into_iter().enumerate() {
            let (ar, ac) = raster.shape();
            if (ar, ac) != (er, ec) {
                return Err(Error::SizeMismatch { er, ec, ar, ac });
            }
            band_map.insert(role, i + 1);
            stored.insert(i + 1, raster);
        }

        Ok(Self {
            path,
            timestamp,
            band_map,
            bands: stored,
            shape: (er, ec),
            transform,
            crs,
        })
    }

    /// View of the band mapped to `role`
    pub fn read_band(&self, role: BandRole) -> Result<BandView<'_>> {
        let raster = self
            .band_map
            .get(&role)
            .and_then(|idx| self.bands.get(idx))
            .ok_or_else(|| Error::MissingBand(role.to_string()))?;

        Ok(BandView {
            raster,
            mask: raster.nodata_mask(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn timestamp(&self) -> DateTime<FixedOffset> {
        self.timestamp
    }

    pub fn band_map(&self) -> &BTreeMap<BandRole, usize> {
        &self.band_map
    }

    pub fn transform(&self) -> &GeoTransform {
        &self.transform
    }

    pub fn crs(&self) -> Option<&CRS> {
        self.crs.as_ref()
    }

    /// Dimensions as (rows, cols)
    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }
}
