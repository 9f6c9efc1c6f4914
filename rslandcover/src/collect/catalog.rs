use chrono::{DateTime, Utc};
use geo::Polygon;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::classification::scene::Scene;
use crate::collect::global_variables::CATALOG_MANIFEST;
use crate::error::{ClassificationError, Result};
use crate::geo_core::BoundingBox;
use crate::raster::{geotiff, Raster};

/// Scene description available without reading any pixel
#[derive(Debug, Clone, PartialEq)]
pub struct SceneMetadata {
    pub id: String,
    pub collection: String,
    pub time: DateTime<Utc>,
    pub properties: Map<String, Value>,
    pub extent: BoundingBox,
    pub band_names: Vec<String>,
}

impl SceneMetadata {
    pub fn footprint(&self) -> Polygon<f64> {
        self.extent.to_polygon()
    }

    /// Numeric property, `None` when absent, non-numeric or NaN
    pub fn property_f64(&self, key: &str) -> Option<f64> {
        self.properties
            .get(key)
            .and_then(Value::as_f64)
            .filter(|v| !v.is_nan())
    }
}

/// Scene collections of the geospatial data service
pub trait SceneCatalog {
    /// Every scene of a collection, in catalog order
    fn list(&self, collection: &str) -> Result<Vec<SceneMetadata>>;

    /// Materialise the requested bands of one scene
    fn load(&self, metadata: &SceneMetadata, bands: &[String]) -> Result<Scene>;
}

/// Named reference images (e.g. land-cover products) of the data service
pub trait ReferenceStore {
    /// Full image with its properties
    fn load_image(&self, id: &str) -> Result<Raster>;
}

#[derive(Debug, Clone)]
enum BandSource {
    Files(Vec<(String, PathBuf)>),
    Memory(Raster),
}

#[derive(Debug, Clone)]
struct SceneEntry {
    metadata: SceneMetadata,
    source: BandSource,
}

#[derive(Debug, Clone)]
struct ReferenceEntry {
    id: String,
    properties: Map<String, Value>,
    source: BandSource,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    #[serde(default)]
    scenes: Vec<SceneManifest>,
    #[serde(default)]
    references: Vec<ReferenceManifest>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SceneManifest {
    id: String,
    collection: String,
    time: DateTime<Utc>,
    #[serde(default)]
    properties: Map<String, Value>,
    bands: Vec<BandFile>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ReferenceManifest {
    id: String,
    #[serde(default)]
    properties: Map<String, Value>,
    bands: Vec<BandFile>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BandFile {
    name: String,
    path: PathBuf,
}

/// Catalog backed by a JSON manifest and per-band GeoTIFF files
///
/// Scenes and reference images can also be inserted in memory, which is how
/// the synthetic demo data and the tests feed the pipeline.
#[derive(Debug, Clone, Default)]
pub struct LocalCatalog {
    scenes: Vec<SceneEntry>,
    references: Vec<ReferenceEntry>,
}

impl LocalCatalog {
    pub fn new() -> Self {
        LocalCatalog::default()
    }

    /// Open a manifest; relative band paths resolve against its directory
    pub fn open(manifest_path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(manifest_path)
            .map_err(|e| ClassificationError::io(manifest_path, e))?;
        let manifest: Manifest = serde_json::from_str(&text)?;
        let root = manifest_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let resolve = |files: Vec<BandFile>| -> Vec<(String, PathBuf)> {
            files
                .into_iter()
                .map(|f| {
                    let path = if f.path.is_absolute() {
                        f.path
                    } else {
                        root.join(f.path)
                    };
                    (f.name, path)
                })
                .collect()
        };

        let mut catalog = LocalCatalog::new();
        for scene in manifest.scenes {
            let files = resolve(scene.bands);
            let (_, first_path) = files.first().ok_or_else(|| {
                ClassificationError::InvalidParameter(format!("scene '{}' lists no bands", scene.id))
            })?;
            let grid = geotiff::read_grid(first_path)?;
            catalog.scenes.push(SceneEntry {
                metadata: SceneMetadata {
                    id: scene.id,
                    collection: scene.collection,
                    time: scene.time,
                    properties: scene.properties,
                    extent: grid.extent(),
                    band_names: files.iter().map(|(name, _)| name.clone()).collect(),
                },
                source: BandSource::Files(files),
            });
        }
        for reference in manifest.references {
            catalog.references.push(ReferenceEntry {
                id: reference.id,
                properties: reference.properties,
                source: BandSource::Files(resolve(reference.bands)),
            });
        }

        info!(
            manifest = %manifest_path.display(),
            scenes = catalog.scenes.len(),
            references = catalog.references.len(),
            "catalog opened"
        );
        Ok(catalog)
    }

    pub fn insert_scene(
        &mut self,
        collection: &str,
        id: &str,
        time: DateTime<Utc>,
        properties: Map<String, Value>,
        raster: Raster,
    ) -> Result<()> {
        if raster.bands().is_empty() {
            return Err(ClassificationError::InvalidParameter(format!(
                "scene '{}' has no bands",
                id
            )));
        }
        self.scenes.push(SceneEntry {
            metadata: SceneMetadata {
                id: id.to_string(),
                collection: collection.to_string(),
                time,
                properties,
                extent: raster.grid().extent(),
                band_names: raster.band_names(),
            },
            source: BandSource::Memory(raster),
        });
        Ok(())
    }

    pub fn insert_reference(&mut self, id: &str, raster: Raster) -> Result<()> {
        if raster.bands().is_empty() {
            return Err(ClassificationError::InvalidParameter(format!(
                "reference '{}' has no bands",
                id
            )));
        }
        self.references.push(ReferenceEntry {
            id: id.to_string(),
            properties: raster.properties().clone(),
            source: BandSource::Memory(raster),
        });
        Ok(())
    }

    pub fn scene_count(&self) -> usize {
        self.scenes.len()
    }

    /// Write every in-memory raster as GeoTIFF under `dir` plus the manifest
    ///
    /// Returns the manifest path. File-backed entries keep their paths.
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir).map_err(|e| ClassificationError::io(dir, e))?;
        let mut manifest = Manifest::default();

        for entry in &self.scenes {
            let folder = PathBuf::from("scenes").join(sanitize(&entry.metadata.id));
            manifest.scenes.push(SceneManifest {
                id: entry.metadata.id.clone(),
                collection: entry.metadata.collection.clone(),
                time: entry.metadata.time,
                properties: entry.metadata.properties.clone(),
                bands: write_source(&entry.source, dir, &folder)?,
            });
        }
        for entry in &self.references {
            let folder = PathBuf::from("references").join(sanitize(&entry.id));
            manifest.references.push(ReferenceManifest {
                id: entry.id.clone(),
                properties: entry.properties.clone(),
                bands: write_source(&entry.source, dir, &folder)?,
            });
        }

        let manifest_path = dir.join(CATALOG_MANIFEST);
        let text = serde_json::to_string_pretty(&manifest)?;
        std::fs::write(&manifest_path, text)
            .map_err(|e| ClassificationError::io(&manifest_path, e))?;
        info!(manifest = %manifest_path.display(), "catalog saved");
        Ok(manifest_path)
    }
}

impl SceneCatalog for LocalCatalog {
    fn list(&self, collection: &str) -> Result<Vec<SceneMetadata>> {
        let scenes: Vec<SceneMetadata> = self
            .scenes
            .iter()
            .filter(|e| e.metadata.collection == collection)
            .map(|e| e.metadata.clone())
            .collect();
        debug!(collection, count = scenes.len(), "listed scenes");
        Ok(scenes)
    }

    fn load(&self, metadata: &SceneMetadata, bands: &[String]) -> Result<Scene> {
        let entry = self
            .scenes
            .iter()
            .find(|e| e.metadata.id == metadata.id && e.metadata.collection == metadata.collection)
            .ok_or_else(|| ClassificationError::UnknownLayer(metadata.id.clone()))?;
        let raster = load_bands(&entry.source, bands)?;
        info!(scene = %metadata.id, bands = ?bands, "scene loaded");
        Ok(Scene::new(
            &entry.metadata.id,
            &entry.metadata.collection,
            entry.metadata.time,
            entry.metadata.properties.clone(),
            raster,
        ))
    }
}

impl ReferenceStore for LocalCatalog {
    fn load_image(&self, id: &str) -> Result<Raster> {
        let entry = self
            .references
            .iter()
            .find(|e| e.id == id)
            .ok_or_else(|| ClassificationError::UnknownLayer(id.to_string()))?;
        let names = match &entry.source {
            BandSource::Files(files) => files.iter().map(|(n, _)| n.clone()).collect(),
            BandSource::Memory(raster) => raster.band_names(),
        };
        let mut raster = load_bands(&entry.source, &names)?;
        for (key, value) in &entry.properties {
            raster.set_property(key, value.clone());
        }
        info!(reference = id, "reference image loaded");
        Ok(raster)
    }
}

fn load_bands(source: &BandSource, bands: &[String]) -> Result<Raster> {
    match source {
        BandSource::Memory(raster) => raster.select(bands),
        BandSource::Files(files) => {
            let mut raster: Option<Raster> = None;
            for name in bands {
                let (_, path) = files.iter().find(|(n, _)| n == name).ok_or_else(|| {
                    ClassificationError::BandMismatch(format!("band '{}' not in catalog entry", name))
                })?;
                let file_raster = geotiff::read_raster(path)?;
                let data = file_raster
                    .bands()
                    .first()
                    .map(|b| b.data.clone())
                    .ok_or_else(|| {
                        ClassificationError::InvalidParameter(format!("{:?} has no band", path))
                    })?;
                match raster.as_mut() {
                    None => {
                        let mut first = Raster::new(*file_raster.grid());
                        first.set_properties(file_raster.properties().clone());
                        first.add_band(name, data)?;
                        raster = Some(first);
                    }
                    Some(r) => {
                        if r.grid() != file_raster.grid() {
                            return Err(ClassificationError::InvalidParameter(format!(
                                "band '{}' ({:?}) is not on the grid of the other bands",
                                name, path
                            )));
                        }
                        r.add_band(name, data)?;
                    }
                }
            }
            raster.ok_or_else(|| {
                ClassificationError::BandMismatch("no band requested".to_string())
            })
        }
    }
}

fn write_source(source: &BandSource, dir: &Path, folder: &Path) -> Result<Vec<BandFile>> {
    match source {
        BandSource::Files(files) => Ok(files
            .iter()
            .map(|(name, path)| BandFile {
                name: name.clone(),
                path: path.clone(),
            })
            .collect()),
        BandSource::Memory(raster) => {
            let mut written = Vec::new();
            for band in raster.bands() {
                let relative = folder.join(format!("{}.tif", sanitize(&band.name)));
                geotiff::write_band(&dir.join(&relative), raster, &band.name)?;
                written.push(BandFile {
                    name: band.name.clone(),
                    path: relative,
                });
            }
            Ok(written)
        }
    }
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::GridSpec;
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::TempDir;

    fn scene_raster() -> Raster {
        let grid = GridSpec::new(-123.2, 49.3, 0.01, 0.01, 2, 2, 4326);
        Raster::new(grid)
            .with_band("B1", vec![1.0, 2.0, 3.0, 4.0])
            .unwrap()
            .with_band("B2", vec![5.0, 6.0, 7.0, 8.0])
            .unwrap()
    }

    fn properties(cloud: f64) -> Map<String, Value> {
        let mut p = Map::new();
        p.insert("CLOUD_COVER".to_string(), json!(cloud));
        p
    }

    #[test]
    fn test_list_filters_by_collection() {
        let mut catalog = LocalCatalog::new();
        let t = Utc.with_ymd_and_hms(2020, 6, 1, 0, 0, 0).unwrap();
        catalog
            .insert_scene("A", "a1", t, properties(1.0), scene_raster())
            .unwrap();
        catalog
            .insert_scene("B", "b1", t, properties(2.0), scene_raster())
            .unwrap();
        let listed = catalog.list("A").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "a1");
        assert_eq!(listed[0].property_f64("CLOUD_COVER"), Some(1.0));
        assert_eq!(listed[0].band_names, vec!["B1", "B2"]);
    }

    #[test]
    fn test_load_selects_bands() {
        let mut catalog = LocalCatalog::new();
        let t = Utc.with_ymd_and_hms(2020, 6, 1, 0, 0, 0).unwrap();
        catalog
            .insert_scene("A", "a1", t, properties(1.0), scene_raster())
            .unwrap();
        let meta = &catalog.list("A").unwrap()[0];
        let scene = catalog.load(meta, &["B2".to_string()]).unwrap();
        assert_eq!(scene.band_names(), vec!["B2"]);
        assert!(catalog.load(meta, &["B7".to_string()]).is_err());
    }

    #[test]
    fn test_unknown_reference() {
        let catalog = LocalCatalog::new();
        assert!(matches!(
            catalog.load_image("USGS/NLCD/NLCD2016"),
            Err(ClassificationError::UnknownLayer(_))
        ));
    }

    #[test]
    fn test_save_then_open_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut catalog = LocalCatalog::new();
        let t = Utc.with_ymd_and_hms(2020, 6, 1, 12, 0, 0).unwrap();
        catalog
            .insert_scene("LANDSAT/X", "scene/1", t, properties(3.5), scene_raster())
            .unwrap();
        let mut reference = Raster::new(*scene_raster().grid())
            .with_band("landcover", vec![11.0, 21.0, 41.0, 11.0])
            .unwrap();
        reference.set_property("landcover_class_values", json!([11, 21, 41]));
        catalog.insert_reference("NLCD", reference).unwrap();

        let manifest = catalog.save(dir.path()).unwrap();
        let reopened = LocalCatalog::open(&manifest).unwrap();
        let listed = reopened.list("LANDSAT/X").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].time, t);
        assert_eq!(listed[0].extent, scene_raster().grid().extent());

        let scene = reopened
            .load(&listed[0], &["B1".to_string(), "B2".to_string()])
            .unwrap();
        assert_eq!(scene.raster().bands()[1].data, vec![5.0, 6.0, 7.0, 8.0]);

        let image = reopened.load_image("NLCD").unwrap();
        assert_eq!(
            image.get_property("landcover_class_values"),
            Some(&json!([11, 21, 41]))
        );
    }
}
