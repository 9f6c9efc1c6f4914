use image::codecs::jpeg::JpegEncoder;
use image::{imageops, Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::classification::export::CLASSIFICATION_PREFIX;
use crate::classification::reference::Taxonomy;
use crate::error::{ClassificationError, Result};
use crate::raster::{geotiff, Raster};

/// JPEG preview settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThumbnailOptions {
    /// Longest side in pixels; larger rasters are downscaled
    pub max_dimension: u32,
    /// JPEG quality, clamped to 1..=100
    pub quality: u8,
}

impl Default for ThumbnailOptions {
    fn default() -> Self {
        ThumbnailOptions {
            max_dimension: 1024,
            quality: 95,
        }
    }
}

/// Outcome of a folder conversion
#[derive(Debug, Default)]
pub struct ThumbnailReport {
    pub generated: Vec<PathBuf>,
    /// Rasters that already had a preview
    pub skipped: Vec<PathBuf>,
    pub failed: Vec<ClassificationError>,
}

/// Render a `.jpg` next to every `.tif` under `dir` that lacks one
///
/// Per-file failures are logged and recorded, the batch always continues.
/// Only an unreadable `dir` itself is an error.
pub fn convert_folder(dir: &Path, options: &ThumbnailOptions) -> Result<ThumbnailReport> {
    let mut report = ThumbnailReport::default();
    let mut pending = vec![dir.to_path_buf()];
    let mut rasters = Vec::new();
    while let Some(current) = pending.pop() {
        let entries = fs::read_dir(&current).map_err(|e| ClassificationError::io(&current, e))?;
        for entry in entries {
            let path = entry.map_err(|e| ClassificationError::io(&current, e))?.path();
            if path.is_dir() {
                pending.push(path);
            } else if is_tif(&path) {
                rasters.push(path);
            }
        }
    }
    rasters.sort();

    for path in rasters {
        let preview = path.with_extension("jpg");
        if preview.is_file() {
            info!(file = %path.display(), "preview already exists");
            report.skipped.push(path);
            continue;
        }
        match convert_file(&path, &preview, options) {
            Ok(()) => {
                info!(file = %path.display(), preview = %preview.display(), "preview generated");
                report.generated.push(preview);
            }
            Err(e) => {
                warn!(file = %path.display(), error = %e, "preview skipped");
                report.failed.push(e);
            }
        }
    }
    Ok(report)
}

fn is_tif(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("tif"))
        .unwrap_or(false)
}

/// Convert one raster; every failure is a [`ClassificationError::ThumbnailConversion`]
pub fn convert_file(source: &Path, target: &Path, options: &ThumbnailOptions) -> Result<()> {
    let failure = |message: String| ClassificationError::ThumbnailConversion {
        path: source.to_path_buf(),
        message,
    };

    let rendered = match geotiff::read_raster(source) {
        Ok(raster) => render(&raster).ok_or_else(|| failure("raster has no band".to_string()))?,
        // 8-bit and RGB TIFFs without georeferencing
        Err(_) => image::open(source)
            .map_err(|e| failure(e.to_string()))?
            .to_rgb8(),
    };

    let (width, height) = rendered.dimensions();
    let longest = width.max(height);
    let max_dimension = options.max_dimension.max(1);
    let image = if longest > max_dimension {
        let ratio = max_dimension as f64 / longest as f64;
        let w = ((width as f64 * ratio).round() as u32).max(1);
        let h = ((height as f64 * ratio).round() as u32).max(1);
        imageops::thumbnail(&rendered, w, h)
    } else {
        rendered
    };

    let file = File::create(target).map_err(|e| failure(e.to_string()))?;
    let mut writer = BufWriter::new(file);
    JpegEncoder::new_with_quality(&mut writer, options.quality.clamp(1, 100))
        .encode_image(&image)
        .map_err(|e| failure(e.to_string()))?;
    Ok(())
}

/// Palette colours when the raster carries a classification taxonomy,
/// min/max grayscale of the first band otherwise; nodata is black
fn render(raster: &Raster) -> Option<RgbImage> {
    let band = raster.bands().first()?;
    let grid = raster.grid();
    let taxonomy = Taxonomy::from_properties(raster.properties(), CLASSIFICATION_PREFIX).ok();

    let (lo, hi) = band
        .data
        .iter()
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let span = if hi > lo { hi - lo } else { 1.0 };

    let mut image = RgbImage::new(grid.width as u32, grid.height as u32);
    for row in 0..grid.height {
        for col in 0..grid.width {
            let v = band.data[grid.index(row, col)];
            let pixel = if !v.is_finite() {
                Rgb([0, 0, 0])
            } else if let Some(taxonomy) = &taxonomy {
                match taxonomy.get(v.round() as i32) {
                    Some(class) => Rgb([class.color.0, class.color.1, class.color.2]),
                    None => Rgb([0, 0, 0]),
                }
            } else {
                let g = (((v - lo) / span) * 255.0).round().clamp(0.0, 255.0) as u8;
                Rgb([g, g, g])
            };
            image.put_pixel(col as u32, row as u32, pixel);
        }
    }
    Some(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classification::reference::{Rgb as ClassColor, TaxonomyClass};
    use crate::raster::GridSpec;
    use tempfile::TempDir;

    fn classified_raster() -> Raster {
        let grid = GridSpec::new(0.0, 3.0, 1.0, 1.0, 3, 3, 32610);
        let mut raster = Raster::new(grid)
            .with_band("classification", vec![11.0, 11.0, 41.0, 41.0, f32::NAN, 11.0, 41.0, 41.0, 11.0])
            .unwrap();
        let taxonomy = Taxonomy::new(vec![
            TaxonomyClass {
                code: 11,
                name: "Water".to_string(),
                color: ClassColor(0, 0, 255),
            },
            TaxonomyClass {
                code: 41,
                name: "Forest".to_string(),
                color: ClassColor(0, 255, 0),
            },
        ])
        .unwrap();
        for (k, v) in taxonomy.to_properties(CLASSIFICATION_PREFIX) {
            raster.set_property(&k, v);
        }
        raster
    }

    #[test]
    fn test_render_uses_palette() {
        let image = render(&classified_raster()).unwrap();
        assert_eq!(image.get_pixel(0, 0), &Rgb([0, 0, 255]));
        assert_eq!(image.get_pixel(2, 0), &Rgb([0, 255, 0]));
        assert_eq!(image.get_pixel(1, 1), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_render_grayscale_stretch() {
        let grid = GridSpec::new(0.0, 1.0, 1.0, 1.0, 2, 1, 32610);
        let raster = Raster::new(grid).with_band("B1", vec![100.0, 300.0]).unwrap();
        let image = render(&raster).unwrap();
        assert_eq!(image.get_pixel(0, 0), &Rgb([0, 0, 0]));
        assert_eq!(image.get_pixel(1, 0), &Rgb([255, 255, 255]));
    }

    #[test]
    fn test_convert_folder_skips_existing_and_survives_bad_files() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("nested");
        geotiff::write_raster(&dir.path().join("a.tif"), &classified_raster()).unwrap();
        geotiff::write_raster(&nested.join("b.TIF"), &classified_raster()).unwrap();
        geotiff::write_raster(&dir.path().join("c.tif"), &classified_raster()).unwrap();
        fs::write(dir.path().join("c.jpg"), b"existing").unwrap();
        fs::write(dir.path().join("broken.tif"), b"not a tiff").unwrap();

        let options = ThumbnailOptions {
            max_dimension: 2,
            quality: 80,
        };
        let report = convert_folder(dir.path(), &options).unwrap();
        assert_eq!(report.generated.len(), 2);
        assert_eq!(report.skipped, vec![dir.path().join("c.tif")]);
        assert_eq!(report.failed.len(), 1);
        assert!(!report.failed[0].is_fatal());
        assert!(dir.path().join("a.jpg").exists());
        assert!(nested.join("b.jpg").exists());

        let preview = image::open(dir.path().join("a.jpg")).unwrap();
        assert_eq!((preview.width(), preview.height()), (2, 2));
        assert_eq!(fs::read(dir.path().join("c.jpg")).unwrap(), b"existing");
    }

    #[test]
    fn test_missing_folder_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(convert_folder(&dir.path().join("absent"), &ThumbnailOptions::default()).is_err());
    }
}
