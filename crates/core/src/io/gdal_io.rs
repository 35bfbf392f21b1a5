//! Raster band reading through GDAL

use crate::crs::CRS;
use crate::error::{Error, Result};
use crate::raster::{GeoTransform, Raster};
use gdal::Dataset;
use std::path::Path;

/// Read the given 1-indexed bands of any GDAL-readable raster.
///
/// Rasters are returned in the order of `bands`. The dataset is closed
/// before this function returns.
pub fn read_bands<P: AsRef<Path>>(path: P, bands: &[usize]) -> Result<Vec<Raster>> {
    let path = path.as_ref();
    let dataset = Dataset::open(path).map_err(|e| Error::RasterIo {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let count = dataset.raster_count() as usize;
    if let Some(&bad) = bands.iter().find(|&&b| b == 0 || b > count) {
        return Err(Error::BandOutOfRange {
            path: path.to_path_buf(),
            band: bad,
            count,
        });
    }

    let (cols, rows) = dataset.raster_size();
    let transform = dataset.geo_transform().ok().map(GeoTransform::from_gdal);
    let crs = dataset.spatial_ref().ok().and_then(|srs| {
        match srs.auth_code() {
            Ok(code) => Some(CRS::from_epsg(code as u32)),
            Err(_) => srs.to_wkt().ok().map(CRS::from_wkt),
        }
    });

    let mut rasters = Vec::with_capacity(bands.len());
    for &band in bands {
        let rasterband = dataset.rasterband(band)?;
        let buffer = rasterband.read_as::<f64>((0, 0), (cols, rows), (cols, rows), None)?;

        let mut raster = Raster::from_vec(buffer.data().to_vec(), rows, cols)?;
        if let Some(gt) = transform {
            raster.set_transform(gt);
        }
        raster.set_crs(crs.clone());
        raster.set_nodata(rasterband.no_data_value());
        rasters.push(raster);
    }

    Ok(rasters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::write_geotiff;
    use tempfile::NamedTempFile;

    #[test]
    fn test_reads_natively_written_tiff() {
        let mut raster = Raster::filled(10, 10, 0.5);
        raster.set_transform(GeoTransform::new(0.0, 10.0, 1.0, -1.0));
        raster.set_crs(Some(CRS::from_epsg(32633)));

        let tmp = NamedTempFile::with_suffix(".tif").unwrap();
        write_geotiff(&raster, tmp.path()).unwrap();

        let loaded = read_bands(tmp.path(), &[1]).unwrap();
        assert_eq!(loaded[0].shape(), (10, 10));
        assert_eq!(loaded[0].get(5, 5).unwrap(), 0.5);
        assert!(matches!(
            read_bands(tmp.path(), &[4]),
            Err(Error::BandOutOfRange { .. })
        ));
    }
}
