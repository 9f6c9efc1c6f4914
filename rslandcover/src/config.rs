use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::classification::export::Destination;
use crate::collect::global_variables::get_data_path;
use crate::commons::thumbnail::ThumbnailOptions;
use crate::error::{ClassificationError, Result};
use crate::geo_core::{DateRange, Region};

/// Sampling parameters of the training points
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Upper bound on the number of points
    pub count: usize,
    /// Sampling and band-reading resolution in metres
    pub scale: f64,
    pub seed: u64,
    /// Keep point geometries (spatial join) or only labels
    pub with_geometry: bool,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        SamplingConfig {
            count: 5000,
            scale: 30.0,
            seed: 0,
            with_geometry: true,
        }
    }
}

/// Every parameter of a pipeline run
///
/// All fields have defaults, so a JSON file only needs the values it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub collection: String,
    pub region: Region,
    /// `YYYY-MM-DD`, inclusive
    pub start_date: String,
    /// `YYYY-MM-DD`, exclusive
    pub end_date: String,
    /// Scene property sorted ascending, lower is better
    pub quality_property: String,
    /// Regex that scene band names must match in full
    pub band_pattern: String,
    /// Bands used for training and classification
    pub bands: Vec<String>,
    pub reference_layer: String,
    /// Reference band, also the label field of the samples
    pub label_band: String,
    pub sampling: SamplingConfig,
    /// Also write the training records as CSV
    pub training_csv: Option<PathBuf>,
    pub destination: Destination,
    /// Export resolution in metres
    pub export_scale: f64,
    /// Render JPEG previews after a local export
    pub thumbnails: bool,
    pub thumbnail_options: ThumbnailOptions,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            collection: "LANDSAT/LC08/C01/T1_RT".to_string(),
            region: Region::point(-123.116226, 49.246292),
            start_date: "2020-01-01".to_string(),
            end_date: "2020-12-31".to_string(),
            quality_property: "CLOUD_COVER".to_string(),
            band_pattern: "B[1-7]".to_string(),
            bands: (1..=7).map(|b| format!("B{}", b)).collect(),
            reference_layer: "USGS/NLCD/NLCD2016".to_string(),
            label_band: "landcover".to_string(),
            sampling: SamplingConfig::default(),
            training_csv: None,
            destination: Destination::LocalFile {
                path: get_data_path().join("landcover.tif"),
            },
            export_scale: 900.0,
            thumbnails: true,
            thumbnail_options: ThumbnailOptions::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| ClassificationError::io(path, e))?;
        let config: PipelineConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| ClassificationError::io(parent, e))?;
        }
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text).map_err(|e| ClassificationError::io(path, e))
    }

    pub fn date_range(&self) -> Result<DateRange> {
        DateRange::parse(&self.start_date, &self.end_date)
    }

    pub fn validate(&self) -> Result<()> {
        self.date_range()?;
        if self.bands.is_empty() {
            return Err(ClassificationError::InvalidParameter(
                "at least one classification band is required".to_string(),
            ));
        }
        for (name, value) in [
            ("sampling.scale", self.sampling.scale),
            ("export_scale", self.export_scale),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(ClassificationError::InvalidParameter(format!(
                    "{} must be positive, got {}",
                    name, value
                )));
            }
        }
        if self.label_band.is_empty() {
            return Err(ClassificationError::InvalidParameter(
                "label_band must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.bands, vec!["B1", "B2", "B3", "B4", "B5", "B6", "B7"]);
        assert_eq!(config.sampling.count, 5000);
        assert_eq!(config.sampling.seed, 0);
        assert_eq!(config.export_scale, 900.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: PipelineConfig = serde_json::from_str(
            r#"{"sampling": {"count": 100}, "region": {"type": "point", "lon": 1.0, "lat": 2.0}}"#,
        )
        .unwrap();
        assert_eq!(config.sampling.count, 100);
        assert_eq!(config.sampling.scale, 30.0);
        assert_eq!(config.region, Region::point(1.0, 2.0));
        assert_eq!(config.collection, "LANDSAT/LC08/C01/T1_RT");
    }

    #[test]
    fn test_json_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cfg").join("pipeline.json");
        let mut config = PipelineConfig::default();
        config.destination = Destination::RemoteStorage {
            folder: "earthengine".to_string(),
            description: "landcover".to_string(),
            region: Some(Region::bbox(-123.2, 49.2, -123.0, 49.3)),
        };
        config.to_json_file(&path).unwrap();
        let back = PipelineConfig::from_json_file(&path).unwrap();
        assert_eq!(back.bands, config.bands);
        assert_eq!(back.sampling, config.sampling);
        assert!(matches!(
            back.destination,
            Destination::RemoteStorage { ref folder, region: Some(_), .. } if folder == "earthengine"
        ));
        let center = back.region.center();
        assert!((center.x() + 123.116226).abs() < 1e-9);
        assert!((center.y() - 49.246292).abs() < 1e-9);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = PipelineConfig::default();
        config.export_scale = 0.0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.end_date = "2019-01-01".to_string();
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.bands.clear();
        assert!(config.validate().is_err());
    }
}
