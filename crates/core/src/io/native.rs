//! Native GeoTIFF reading/writing (without GDAL dependency)
//!
//! Uses the `tiff` crate. Chunky (pixel-interleaved) multi-sample images are
//! split into bands; georeferencing comes from the ModelPixelScale and
//! ModelTiepoint tags, the EPSG code from the GeoKeyDirectory and the no-data
//! value from the GDAL_NODATA tag. Enable the `gdal` feature for other
//! formats and layouts.

use crate::crs::CRS;
use crate::error::{Error, Result};
use crate::raster::{GeoTransform, Raster, RasterElement};
use std::fs::File;
use std::io::{BufReader, Read, Seek, Write};
use std::path::Path;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::colortype::{Gray32Float, RGB32Float, RGBA32Float};
use tiff::encoder::{colortype::ColorType, TiffEncoder};
use tiff::tags::Tag;

const GEOGRAPHIC_TYPE_KEY: u32 = 2048;
const PROJECTED_CS_TYPE_KEY: u32 = 3072;
const USER_DEFINED: u32 = 32767;

/// Read the given 1-indexed bands of a GeoTIFF.
///
/// Rasters are returned in the order of `bands`. An index of zero or past
/// the sample count fails with [`Error::BandOutOfRange`].
#[cfg_attr(feature = "gdal", allow(dead_code))]
pub fn read_bands<P: AsRef<Path>>(path: P, bands: &[usize]) -> Result<Vec<Raster>> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| Error::RasterIo {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    decode_bands(BufReader::new(file), path, bands)
}

fn decode_bands<R: Read + Seek>(reader: R, path: &Path, bands: &[usize]) -> Result<Vec<Raster>> {
    let io_err = |reason: String| Error::RasterIo {
        path: path.to_path_buf(),
        reason,
    };

    let mut decoder = Decoder::new(reader)
        .map_err(|e| io_err(format!("TIFF decode error: {}", e)))?
        .with_limits(Limits::unlimited());

    let (width, height) = decoder
        .dimensions()
        .map_err(|e| io_err(format!("cannot read dimensions: {}", e)))?;
    let rows = height as usize;
    let cols = width as usize;

    let samples = decoder
        .get_tag_u32(Tag::SamplesPerPixel)
        .map(|s| s as usize)
        .unwrap_or(1);

    if let Some(&bad) = bands.iter().find(|&&b| b == 0 || b > samples) {
        return Err(Error::BandOutOfRange {
            path: path.to_path_buf(),
            band: bad,
            count: samples,
        });
    }

    let transform = read_geotransform(&mut decoder);
    let crs = read_epsg(&mut decoder).map(CRS::from_epsg);
    let nodata = read_nodata(&mut decoder);

    let result = decoder
        .read_image()
        .map_err(|e| io_err(format!("cannot read image data: {}", e)))?;

    let interleaved: Vec<f64> = match result {
        DecodingResult::U8(buf) => widen(buf),
        DecodingResult::U16(buf) => widen(buf),
        DecodingResult::U32(buf) => widen(buf),
        DecodingResult::U64(buf) => widen(buf),
        DecodingResult::I8(buf) => widen(buf),
        DecodingResult::I16(buf) => widen(buf),
        DecodingResult::I32(buf) => widen(buf),
        DecodingResult::I64(buf) => widen(buf),
        DecodingResult::F32(buf) => widen(buf),
        DecodingResult::F64(buf) => widen(buf),
        #[allow(unreachable_patterns)]
        _ => {
            return Err(Error::UnsupportedDataType(format!(
                "{}: unsupported TIFF sample format",
                path.display()
            )))
        }
    };

    if interleaved.len() != rows * cols * samples {
        return Err(io_err(format!(
            "expected {} samples, decoded {}",
            rows * cols * samples,
            interleaved.len()
        )));
    }

    bands
        .iter()
        .map(|&band| {
            let data: Vec<f64> = interleaved
                .iter()
                .skip(band - 1)
                .step_by(samples)
                .copied()
                .collect();
            let mut raster = Raster::from_vec(data, rows, cols)?;
            if let Some(gt) = transform {
                raster.set_transform(gt);
            }
            raster.set_crs(crs.clone());
            raster.set_nodata(nodata);
            Ok(raster)
        })
        .collect()
}

fn widen<T: RasterElement>(buf: Vec<T>) -> Vec<f64> {
    buf.into_iter().map(RasterElement::to_f64_or_nan).collect()
}

fn read_geotransform<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<GeoTransform> {
    let scale = decoder.get_tag_f64_vec(Tag::ModelPixelScaleTag).ok()?;
    let tiepoint = decoder.get_tag_f64_vec(Tag::ModelTiepointTag).ok()?;

    if scale.len() < 2 || tiepoint.len() < 6 {
        return None;
    }

    // tiepoint: [I, J, K, X, Y, Z], scale: [ScaleX, ScaleY, ScaleZ]
    let origin_x = tiepoint[3] - tiepoint[0] * scale[0];
    let origin_y = tiepoint[4] + tiepoint[1] * scale[1];
    Some(GeoTransform::new(origin_x, origin_y, scale[0], -scale[1]))
}

fn read_epsg<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<u32> {
    let keys = decoder.get_tag_u32_vec(Tag::GeoKeyDirectoryTag).ok()?;
    parse_geokey_epsg(&keys)
}

/// Pull the EPSG code out of a GeoKeyDirectory, preferring the projected
/// CRS key over the geographic one.
fn parse_geokey_epsg(keys: &[u32]) -> Option<u32> {
    let count = *keys.get(3)? as usize;
    let mut geographic = None;
    let mut projected = None;

    for entry in keys.get(4..)?.chunks_exact(4).take(count) {
        let (key, location, value) = (entry[0], entry[1], entry[3]);
        if location != 0 || value == 0 || value == USER_DEFINED {
            continue;
        }
        match key {
            PROJECTED_CS_TYPE_KEY => projected = Some(value),
            GEOGRAPHIC_TYPE_KEY => geographic = Some(value),
            _ => {}
        }
    }

    projected.or(geographic)
}

fn read_nodata<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<f64> {
    let text = decoder.get_tag_ascii_string(Tag::GdalNodata).ok()?;
    text.trim_matches(|c: char| c == '\0' || c.is_whitespace())
        .parse::<f64>()
        .ok()
}

/// Write a single raster as a 32-bit float GeoTIFF
pub fn write_geotiff<P: AsRef<Path>>(raster: &Raster, path: P) -> Result<()> {
    write_geotiff_bands(std::slice::from_ref(raster), path)
}

/// Write 1, 3 or 4 same-shaped rasters as a pixel-interleaved 32-bit float
/// GeoTIFF. Georeferencing and the no-data value are taken from the first
/// raster.
pub fn write_geotiff_bands<P: AsRef<Path>>(bands: &[Raster], path: P) -> Result<()> {
    let file = File::create(path.as_ref())?;
    match bands.len() {
        1 => encode::<Gray32Float, _>(bands, file),
        3 => encode::<RGB32Float, _>(bands, file),
        4 => encode::<RGBA32Float, _>(bands, file),
        n => Err(Error::UnsupportedDataType(format!(
            "cannot write {} bands natively (1, 3 or 4 supported)",
            n
        ))),
    }
}

fn encode<C, W>(bands: &[Raster], writer: W) -> Result<()>
where
    C: ColorType<Inner = f32>,
    W: Write + Seek,
{
    let Some(first) = bands.first() else {
        return Err(Error::Other("no bands to write".into()));
    };
    let (rows, cols) = first.shape();
    if let Some(other) = bands.iter().find(|b| b.shape() != (rows, cols)) {
        let (ar, ac) = other.shape();
        return Err(Error::SizeMismatch { er: rows, ec: cols, ar, ac });
    }

    let mut data = Vec::with_capacity(rows * cols * bands.len());
    for ((row, col), _) in first.data().indexed_iter() {
        for band in bands {
            data.push(band.data()[(row, col)] as f32);
        }
    }

    let mut encoder =
        TiffEncoder::new(writer).map_err(|e| Error::Other(format!("TIFF encoder error: {}", e)))?;
    let mut image = encoder
        .new_image::<C>(cols as u32, rows as u32)
        .map_err(|e| Error::Other(format!("cannot create TIFF image: {}", e)))?;

    let gt = first.transform();
    let scale = [gt.pixel_width, gt.pixel_height.abs(), 0.0];
    image
        .encoder()
        .write_tag(Tag::ModelPixelScaleTag, &scale[..])
        .map_err(|e| Error::Other(format!("cannot write scale tag: {}", e)))?;

    let tiepoint = [0.0, 0.0, 0.0, gt.origin_x, gt.origin_y, 0.0];
    image
        .encoder()
        .write_tag(Tag::ModelTiepointTag, &tiepoint[..])
        .map_err(|e| Error::Other(format!("cannot write tiepoint tag: {}", e)))?;

    let geokeys = geokey_directory(first.crs().and_then(CRS::epsg));
    image
        .encoder()
        .write_tag(Tag::GeoKeyDirectoryTag, &geokeys[..])
        .map_err(|e| Error::Other(format!("cannot write geokey tag: {}", e)))?;

    // NaN needs no sentinel
    if let Some(nodata) = first.nodata().filter(|v| v.is_finite()) {
        image
            .encoder()
            .write_tag(Tag::GdalNodata, nodata.to_string().as_str())
            .map_err(|e| Error::Other(format!("cannot write nodata tag: {}", e)))?;
    }

    image
        .write_data(&data)
        .map_err(|e| Error::Other(format!("cannot write image data: {}", e)))?;

    Ok(())
}

/// Minimal GeoKeyDirectory: model type, raster type and, when known, the
/// EPSG code under the projected or geographic key.
fn geokey_directory(epsg: Option<u32>) -> Vec<u16> {
    let epsg = epsg.and_then(|code| u16::try_from(code).ok());
    let geographic = matches!(epsg, Some(4000..=4999));
    let model_type = if geographic { 2 } else { 1 };

    let mut keys: Vec<u16> = vec![
        1024, 0, 1, model_type, // GTModelTypeGeoKey
        1025, 0, 1, 1, // GTRasterTypeGeoKey = RasterPixelIsArea
    ];
    if let Some(code) = epsg {
        let key = if geographic { GEOGRAPHIC_TYPE_KEY } else { PROJECTED_CS_TYPE_KEY };
        keys.extend_from_slice(&[key as u16, 0, 1, code]);
    }

    let mut directory = vec![1, 1, 0, (keys.len() / 4) as u16];
    directory.extend(keys);
    directory
}
