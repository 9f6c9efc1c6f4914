use geo::Point;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use crate::classification::sampler::SampleSet;
use crate::classification::scene::Scene;
use crate::error::{ClassificationError, Result};

/// Sample enriched with the scene's band values at its location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRecord {
    pub location: Option<(f64, f64)>,
    pub label: i32,
    pub values: Vec<f64>,
}

/// Ordered training records over a fixed band list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSet {
    bands: Vec<String>,
    label_field: String,
    records: Vec<TrainingRecord>,
}

impl TrainingSet {
    pub fn new(bands: Vec<String>, label_field: &str) -> Self {
        TrainingSet {
            bands,
            label_field: label_field.to_string(),
            records: Vec::new(),
        }
    }

    pub fn push(&mut self, record: TrainingRecord) -> Result<()> {
        if record.values.len() != self.bands.len() {
            return Err(ClassificationError::BandMismatch(format!(
                "record has {} values for {} bands",
                record.values.len(),
                self.bands.len()
            )));
        }
        self.records.push(record);
        Ok(())
    }

    pub fn records(&self) -> &[TrainingRecord] {
        &self.records
    }

    pub fn bands(&self) -> &[String] {
        &self.bands
    }

    pub fn label_field(&self) -> &str {
        &self.label_field
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn first(&self) -> Option<&TrainingRecord> {
        self.records.first()
    }

    pub fn band_index(&self, band: &str) -> Option<usize> {
        self.bands.iter().position(|b| b == band)
    }

    pub fn labels(&self) -> Vec<i32> {
        self.records.iter().map(|r| r.label).collect()
    }

    /// One row per record: optional lon/lat, the label, then every band
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ClassificationError::io(parent, e))?;
        }
        let mut writer = csv::Writer::from_path(path)?;
        let mut header = vec!["x".to_string(), "y".to_string(), self.label_field.clone()];
        header.extend(self.bands.iter().cloned());
        writer.write_record(&header)?;
        for record in &self.records {
            let (x, y) = match record.location {
                Some((x, y)) => (x.to_string(), y.to_string()),
                None => (String::new(), String::new()),
            };
            let mut row = vec![x, y, record.label.to_string()];
            row.extend(record.values.iter().map(|v| v.to_string()));
            writer.write_record(&row)?;
        }
        writer
            .flush()
            .map_err(|e| ClassificationError::io(path, e))?;
        Ok(())
    }
}

/// Read `bands` of `scene` at every sample location, at `scale` metres
///
/// Samples carrying a geometry are joined spatially; otherwise the location
/// is the centre of their sampling-grid cell. A sample is dropped when any
/// band is nodata or outside the scene there. Sample order is kept.
pub fn build_training_set(
    scene: &Scene,
    bands: &[String],
    samples: &SampleSet,
    scale: f64,
) -> Result<TrainingSet> {
    let raster = scene.raster();
    if samples.grid.epsg != raster.grid().epsg {
        return Err(ClassificationError::CrsMismatch {
            expected: raster.grid().epsg,
            found: samples.grid.epsg,
        });
    }
    let indices = bands
        .iter()
        .map(|name| {
            raster.band_index(name).ok_or_else(|| {
                ClassificationError::BandMismatch(format!(
                    "band '{}' not in scene '{}' (available: {:?})",
                    name,
                    scene.id(),
                    raster.band_names()
                ))
            })
        })
        .collect::<Result<Vec<usize>>>()?;

    let mut set = TrainingSet::new(bands.to_vec(), &samples.label_field);
    let mut dropped = 0usize;
    for sample in &samples.points {
        let location: Point<f64> = sample
            .location
            .unwrap_or_else(|| samples.grid.cell_center(sample.cell.0, sample.cell.1));
        let values: Option<Vec<f64>> = indices
            .iter()
            .map(|&b| raster.sample_at(b, &location, scale).map(f64::from))
            .collect();
        match values {
            Some(values) => set.push(TrainingRecord {
                location: sample.location.map(|p| (p.x(), p.y())),
                label: sample.label,
                values,
            })?,
            None => dropped += 1,
        }
    }

    debug!(dropped, "samples outside valid scene data");
    info!(
        records = set.len(),
        samples = samples.len(),
        bands = ?bands,
        "training set built"
    );
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classification::sampler::SamplePoint;
    use crate::raster::{GridSpec, Raster};
    use chrono::{TimeZone, Utc};
    use serde_json::Map;
    use tempfile::TempDir;

    fn scene() -> Scene {
        let grid = GridSpec::new(0.0, 40.0, 10.0, 10.0, 4, 4, 32610);
        let b1: Vec<f32> = (0..16).map(|v| v as f32).collect();
        let mut b2: Vec<f32> = (0..16).map(|v| 100.0 + v as f32).collect();
        b2[5] = f32::NAN;
        let raster = Raster::new(grid)
            .with_band("B1", b1)
            .unwrap()
            .with_band("B2", b2)
            .unwrap();
        let t = Utc.with_ymd_and_hms(2020, 5, 5, 0, 0, 0).unwrap();
        Scene::new("s", "c", t, Map::new(), raster)
    }

    fn samples(with_geometry: bool) -> SampleSet {
        let grid = GridSpec::new(0.0, 40.0, 10.0, 10.0, 4, 4, 32610);
        let points = [((0, 0), 11), ((1, 1), 41), ((2, 3), 82)]
            .into_iter()
            .map(|(cell, label)| SamplePoint {
                cell,
                location: with_geometry.then(|| grid.cell_center(cell.0, cell.1)),
                label,
            })
            .collect();
        SampleSet {
            grid,
            label_field: "landcover".to_string(),
            points,
        }
    }

    fn bands() -> Vec<String> {
        vec!["B1".to_string(), "B2".to_string()]
    }

    #[test]
    fn test_drops_samples_on_nodata() {
        let set = build_training_set(&scene(), &bands(), &samples(true), 10.0).unwrap();
        // cell (1,1) is nodata in B2
        assert_eq!(set.len(), 2);
        assert_eq!(set.labels(), vec![11, 82]);
        assert_eq!(set.records()[1].values, vec![11.0, 111.0]);
        assert_eq!(set.records()[0].location, Some((5.0, 35.0)));
        assert_eq!(set.label_field(), "landcover");
    }

    #[test]
    fn test_non_spatial_join_matches_spatial() {
        let spatial = build_training_set(&scene(), &bands(), &samples(true), 10.0).unwrap();
        let tabular = build_training_set(&scene(), &bands(), &samples(false), 10.0).unwrap();
        assert_eq!(spatial.labels(), tabular.labels());
        assert_eq!(spatial.records()[1].values, tabular.records()[1].values);
        assert!(tabular.records().iter().all(|r| r.location.is_none()));
    }

    #[test]
    fn test_unknown_band() {
        let err = build_training_set(&scene(), &["B9".to_string()], &samples(true), 10.0);
        assert!(matches!(err, Err(ClassificationError::BandMismatch(_))));
    }

    #[test]
    fn test_write_csv() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out").join("training.csv");
        let set = build_training_set(&scene(), &bands(), &samples(true), 10.0).unwrap();
        set.write_csv(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("x,y,landcover,B1,B2"));
        assert_eq!(lines.next(), Some("5,35,11,0,100"));
    }
}
