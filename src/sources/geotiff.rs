//! GeoTIFF decoding into [`NativeRaster`].
//!
//! Georeferencing comes from the ModelPixelScale and ModelTiepoint tags; the CRS
//! is declared by the source configuration rather than parsed from GeoKeys.

use std::fs::File;
use std::io::BufReader;

use camino::Utf8Path;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::tags::Tag;

use crate::crs::Crs;
use crate::error::FiregridError;
use crate::grid::Extent;
use crate::raster::NativeRaster;

pub const MODEL_PIXEL_SCALE_TAG: u16 = 33550;
pub const MODEL_TIEPOINT_TAG: u16 = 33922;
pub const GDAL_NODATA_TAG: u16 = 42113;

struct Georef {
    origin_x: f64,
    origin_y: f64,
    pixel_width: f64,
    pixel_height: f64,
    width: usize,
    height: usize,
    nodata: Option<f64>,
}

fn open(path: &Utf8Path) -> Result<Decoder<BufReader<File>>, FiregridError> {
    let file = File::open(path.as_std_path())
        .map_err(|err| FiregridError::Filesystem(format!("open {path}: {err}")))?;
    let decoder = Decoder::new(BufReader::new(file)).map_err(|err| FiregridError::Decode {
        path: path.to_string(),
        detail: err.to_string(),
    })?;
    Ok(decoder.with_limits(Limits::unlimited()))
}

fn read_georef(
    path: &Utf8Path,
    decoder: &mut Decoder<BufReader<File>>,
) -> Result<Georef, FiregridError> {
    let decode_err = |detail: String| FiregridError::Decode {
        path: path.to_string(),
        detail,
    };
    let (width, height) = decoder
        .dimensions()
        .map_err(|err| decode_err(err.to_string()))?;
    let scale = decoder
        .get_tag_f64_vec(Tag::from_u16_exhaustive(MODEL_PIXEL_SCALE_TAG))
        .map_err(|err| decode_err(format!("missing pixel scale: {err}")))?;
    let tiepoint = decoder
        .get_tag_f64_vec(Tag::from_u16_exhaustive(MODEL_TIEPOINT_TAG))
        .map_err(|err| decode_err(format!("missing tiepoint: {err}")))?;
    if scale.len() < 2 || tiepoint.len() < 6 {
        return Err(decode_err("malformed georeferencing tags".to_string()));
    }
    if scale[0] <= 0.0 || scale[1] <= 0.0 {
        return Err(decode_err(format!(
            "non-positive pixel size {} x {}",
            scale[0], scale[1]
        )));
    }
    let nodata = decoder
        .get_tag_ascii_string(Tag::from_u16_exhaustive(GDAL_NODATA_TAG))
        .ok()
        .and_then(|text| text.trim_matches(|c: char| c == '\0' || c.is_whitespace()).parse().ok());

    // Tiepoint (i, j, k, x, y, z) anchors raster pixel (i, j) at model (x, y).
    Ok(Georef {
        origin_x: tiepoint[3] - tiepoint[0] * scale[0],
        origin_y: tiepoint[4] + tiepoint[1] * scale[1],
        pixel_width: scale[0],
        pixel_height: scale[1],
        width: width as usize,
        height: height as usize,
        nodata,
    })
}

/// Reads the extent without decoding pixel data.
pub fn read_geotiff_extent(path: &Utf8Path) -> Result<Extent, FiregridError> {
    let mut decoder = open(path)?;
    let georef = read_georef(path, &mut decoder)?;
    Ok(Extent::new(
        georef.origin_x,
        georef.origin_y - georef.height as f64 * georef.pixel_height,
        georef.origin_x + georef.width as f64 * georef.pixel_width,
        georef.origin_y,
    ))
}

/// Decodes a single-band GeoTIFF. No-data and non-finite pixels are invalid.
pub fn read_geotiff(path: &Utf8Path, crs: &Crs) -> Result<NativeRaster, FiregridError> {
    let mut decoder = open(path)?;
    let georef = read_georef(path, &mut decoder)?;
    let decode_err = |detail: String| FiregridError::Decode {
        path: path.to_string(),
        detail,
    };
    let image = decoder
        .read_image()
        .map_err(|err| decode_err(err.to_string()))?;
    let values: Vec<f64> = match image {
        DecodingResult::U8(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I8(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I16(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::F32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::F64(v) => v,
        _ => return Err(decode_err("unsupported sample type".to_string())),
    };
    if values.len() != georef.width * georef.height {
        return Err(decode_err(format!(
            "expected a single band of {} pixels, found {} samples",
            georef.width * georef.height,
            values.len()
        )));
    }

    let mut raster = NativeRaster::new(
        crs.clone(),
        (georef.origin_x, georef.origin_y),
        (georef.pixel_width, georef.pixel_height),
        georef.width,
        georef.height,
        values,
    );
    if let Some(nodata) = georef.nodata {
        let values = raster.values.clone();
        raster.mask_where(|i| values[i] != nodata);
    }
    Ok(raster)
}
