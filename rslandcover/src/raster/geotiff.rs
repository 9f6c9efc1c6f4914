//! Single-band Float32 GeoTIFF reader/writer built on the `tiff` crate.
//!
//! Georeferencing uses the ModelPixelScale (33550), ModelTiepoint (33922) and
//! GeoKeyDirectory (34735) tags. Band names, EPSG code and raster properties
//! (taxonomy metadata included) travel as JSON in the ImageDescription tag.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, Write};
use std::path::Path;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;

use crate::error::{ClassificationError, Result};
use crate::geo_core::{is_geographic, EPSG_WGS84};
use crate::raster::{GridSpec, Raster};

const GT_MODEL_TYPE_GEO_KEY: u16 = 1024;
const GT_RASTER_TYPE_GEO_KEY: u16 = 1025;
const GEOGRAPHIC_TYPE_GEO_KEY: u16 = 2048;
const PROJECTED_CS_TYPE_GEO_KEY: u16 = 3072;
const MODEL_TYPE_PROJECTED: u16 = 1;
const MODEL_TYPE_GEOGRAPHIC: u16 = 2;
const RASTER_PIXEL_IS_AREA: u16 = 1;
const USER_DEFINED: u16 = 32767;

/// JSON document stored in the ImageDescription tag
#[derive(Debug, Default, Serialize, Deserialize)]
struct Description {
    #[serde(default)]
    bands: Vec<String>,
    #[serde(default)]
    epsg: Option<i32>,
    #[serde(default)]
    properties: Map<String, Value>,
}

/// Write a single-band raster
pub fn write_raster(path: &Path, raster: &Raster) -> Result<()> {
    if raster.bands().len() != 1 {
        return Err(ClassificationError::InvalidParameter(format!(
            "GeoTIFF export expects one band, raster has {}",
            raster.bands().len()
        )));
    }
    write_band(path, raster, &raster.bands()[0].name)
}

/// Write one band of a raster, carrying the raster properties along
pub fn write_band(path: &Path, raster: &Raster, band_name: &str) -> Result<()> {
    let band = raster.band(band_name).ok_or_else(|| {
        ClassificationError::BandMismatch(format!("band '{}' not in raster", band_name))
    })?;
    let grid = raster.grid();

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| ClassificationError::io(parent, e))?;
        }
    }

    let description = ascii_json(&serde_json::to_string(&Description {
        bands: vec![band.name.clone()],
        epsg: Some(grid.epsg),
        properties: raster.properties().clone(),
    })?);

    let file = File::create(path).map_err(|e| ClassificationError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    {
        let mut encoder = TiffEncoder::new(&mut writer)?;
        let mut image =
            encoder.new_image::<colortype::Gray32Float>(grid.width as u32, grid.height as u32)?;

        let pixel_scale = [grid.pixel_width, grid.pixel_height, 0.0];
        let tiepoint = [0.0, 0.0, 0.0, grid.origin_x, grid.origin_y, 0.0];
        let geo_keys = geo_key_directory(grid.epsg);
        image
            .encoder()
            .write_tag(Tag::ImageDescription, description.as_str())?;
        image
            .encoder()
            .write_tag(Tag::ModelPixelScaleTag, &pixel_scale[..])?;
        image
            .encoder()
            .write_tag(Tag::ModelTiepointTag, &tiepoint[..])?;
        image
            .encoder()
            .write_tag(Tag::GeoKeyDirectoryTag, &geo_keys[..])?;
        image.write_data(&band.data)?;
    }
    writer.flush().map_err(|e| ClassificationError::io(path, e))?;

    Ok(())
}

/// Read a GeoTIFF; interleaved multi-sample images become one band per sample
pub fn read_raster(path: &Path) -> Result<Raster> {
    let file = File::open(path).map_err(|e| ClassificationError::io(path, e))?;
    let mut decoder = Decoder::new(BufReader::new(file))?.with_limits(Limits::unlimited());
    let (grid, description) = read_header(&mut decoder)?;

    let raw: Vec<f32> = match decoder.read_image()? {
        DecodingResult::F32(v) => v,
        DecodingResult::F64(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::U8(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::U16(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::U32(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I8(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I16(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I32(v) => v.into_iter().map(|x| x as f32).collect(),
        _ => {
            return Err(ClassificationError::InvalidParameter(format!(
                "unsupported pixel format in {:?}",
                path
            )))
        }
    };

    let cells = grid.len();
    if cells == 0 || raw.len() % cells != 0 {
        return Err(ClassificationError::InvalidParameter(format!(
            "{:?}: {} samples do not fit a {}x{} grid",
            path,
            raw.len(),
            grid.width,
            grid.height
        )));
    }
    let samples = raw.len() / cells;

    let band_name = |s: usize| {
        description
            .bands
            .get(s)
            .cloned()
            .unwrap_or_else(|| format!("b{}", s + 1))
    };
    let mut raster = Raster::new(grid);
    if samples == 1 {
        raster.add_band(&band_name(0), raw)?;
    } else {
        for s in 0..samples {
            let data = raw.iter().skip(s).step_by(samples).copied().collect();
            raster.add_band(&band_name(s), data)?;
        }
    }
    raster.set_properties(description.properties);
    Ok(raster)
}

/// Grid of a GeoTIFF without decoding its pixels
pub fn read_grid(path: &Path) -> Result<GridSpec> {
    let file = File::open(path).map_err(|e| ClassificationError::io(path, e))?;
    let mut decoder = Decoder::new(BufReader::new(file))?;
    let (grid, _) = read_header(&mut decoder)?;
    Ok(grid)
}

fn read_header<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<(GridSpec, Description)> {
    let (width, height) = decoder.dimensions()?;

    let description: Description = decoder
        .get_tag_ascii_string(Tag::ImageDescription)
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or_default();

    let mut pixel_width = 1.0;
    let mut pixel_height = 1.0;
    if let Some(scale) = decoder.find_tag(Tag::ModelPixelScaleTag)? {
        let scale = scale.into_f64_vec()?;
        if scale.len() >= 2 {
            pixel_width = scale[0];
            pixel_height = scale[1];
        }
    }

    let mut origin_x = 0.0;
    let mut origin_y = 0.0;
    if let Some(tiepoint) = decoder.find_tag(Tag::ModelTiepointTag)? {
        let tie = tiepoint.into_f64_vec()?;
        if tie.len() >= 6 {
            // tiepoint maps raster (i, j) to model (x, y)
            origin_x = tie[3] - tie[0] * pixel_width;
            origin_y = tie[4] + tie[1] * pixel_height;
        }
    }

    let epsg = match description.epsg {
        Some(epsg) => epsg,
        None => match decoder.find_tag(Tag::GeoKeyDirectoryTag)? {
            Some(keys) => epsg_from_geo_keys(&keys.into_u32_vec()?).unwrap_or(EPSG_WGS84),
            None => EPSG_WGS84,
        },
    };

    let grid = GridSpec::new(
        origin_x,
        origin_y,
        pixel_width,
        pixel_height,
        width as usize,
        height as usize,
        epsg,
    );
    Ok((grid, description))
}

/// ASCII tags cannot hold UTF-8, escape everything else as `\uXXXX`
fn ascii_json(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    for c in json.chars() {
        if c.is_ascii() {
            out.push(c);
            continue;
        }
        let mut units = [0u16; 2];
        for unit in c.encode_utf16(&mut units) {
            out.push_str(&format!("\\u{:04x}", unit));
        }
    }
    out
}

fn geo_key_directory(epsg: i32) -> Vec<u16> {
    let code = u16::try_from(epsg).unwrap_or(USER_DEFINED);
    let (model_type, crs_key) = if is_geographic(epsg) {
        (MODEL_TYPE_GEOGRAPHIC, GEOGRAPHIC_TYPE_GEO_KEY)
    } else {
        (MODEL_TYPE_PROJECTED, PROJECTED_CS_TYPE_GEO_KEY)
    };
    vec![
        1, 1, 0, 3, // version, revision, minor, key count
        GT_MODEL_TYPE_GEO_KEY, 0, 1, model_type,
        GT_RASTER_TYPE_GEO_KEY, 0, 1, RASTER_PIXEL_IS_AREA,
        crs_key, 0, 1, code,
    ]
}

fn epsg_from_geo_keys(keys: &[u32]) -> Option<i32> {
    if keys.len() < 4 {
        return None;
    }
    keys[4..]
        .chunks_exact(4)
        .find(|entry| {
            (entry[0] == GEOGRAPHIC_TYPE_GEO_KEY as u32 || entry[0] == PROJECTED_CS_TYPE_GEO_KEY as u32)
                && entry[1] == 0
                && entry[3] != USER_DEFINED as u32
        })
        .map(|entry| entry[3] as i32)
}
