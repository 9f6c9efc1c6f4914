//! Deterministic demo data: Landsat-like scenes over Vancouver and an
//! NLCD-like reference layer, for the demo command and end-to-end tests.

use chrono::{TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Map, Value};
use tracing::info;

use crate::collect::catalog::LocalCatalog;
use crate::error::{ClassificationError, Result};
use crate::geo_core::{BoundingBox, EPSG_WGS84};
use crate::raster::{GridSpec, Raster};

pub const DEMO_COLLECTION: &str = "LANDSAT/LC08/C01/T1_RT";
pub const DEMO_REFERENCE: &str = "USGS/NLCD/NLCD2016";
pub const DEMO_LABEL_BAND: &str = "landcover";
/// Least cloudy scene inside the default region and dates
pub const DEMO_BEST_SCENE: &str = "LC08_047026_20200705";
/// Codes painted in the reference layer, one per zone
pub const DEMO_ZONE_CODES: [i32; 8] = [11, 21, 22, 41, 42, 52, 71, 82];

const NLCD_CLASSES: [(i32, &str, &str); 16] = [
    (11, "476ba1", "Open Water - areas of open water with less than 25% vegetation or soil"),
    (12, "d1defa", "Perennial Ice/Snow - areas of year-round ice and snow"),
    (21, "decaca", "Developed, Open Space - mostly lawn grasses, impervious surface below 20%"),
    (22, "d99482", "Developed, Low Intensity - impervious surface from 20% to 49%"),
    (23, "ee0000", "Developed, Medium Intensity - impervious surface from 50% to 79%"),
    (24, "ab0000", "Developed High Intensity - impervious surface from 80% to 100%"),
    (31, "b3aea3", "Barren Land (Rock/Sand/Clay) - vegetation below 15% of total cover"),
    (41, "68ab63", "Deciduous Forest - trees shedding foliage with the seasons"),
    (42, "1c6330", "Evergreen Forest - trees keeping their leaves all year"),
    (43, "b5ca8f", "Mixed Forest - neither deciduous nor evergreen species dominate"),
    (52, "ccba7d", "Shrub/Scrub - shrubs less than 5 meters tall"),
    (71, "e3e3c2", "Grassland/Herbaceous - graminoid or herbaceous vegetation"),
    (81, "dcd93d", "Pasture/Hay - grasses and legumes planted for grazing"),
    (82, "ab7028", "Cultivated Crops - annual crops and perennial woody crops"),
    (90, "bad9eb", "Woody Wetlands - forest or shrubland periodically flooded"),
    (95, "70a3ba", "Emergent Herbaceous Wetlands - perennial herbaceous vegetation, flooded"),
];

/// Scene bands; B10 and BQA must be left out by a `B[1-7]` selection
const SCENE_BANDS: [&str; 9] = ["B1", "B2", "B3", "B4", "B5", "B6", "B7", "B10", "BQA"];

#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticOptions {
    /// Centre of the study area (lon, lat)
    pub center: (f64, f64),
    /// Half size of the square study area in degrees
    pub half_extent: f64,
    /// Pixel size in metres
    pub pixel_size: f64,
    pub seed: u64,
}

impl Default for SyntheticOptions {
    fn default() -> Self {
        SyntheticOptions {
            center: (-123.116226, 49.246292),
            half_extent: 0.03,
            pixel_size: 30.0,
            seed: 42,
        }
    }
}

/// Taxonomy properties of the NLCD 2016 land-cover band
pub fn nlcd_taxonomy_properties(prefix: &str) -> Map<String, Value> {
    let mut properties = Map::new();
    properties.insert(
        format!("{}_class_values", prefix),
        json!(NLCD_CLASSES.iter().map(|c| c.0).collect::<Vec<_>>()),
    );
    properties.insert(
        format!("{}_class_palette", prefix),
        json!(NLCD_CLASSES.iter().map(|c| c.1).collect::<Vec<_>>()),
    );
    properties.insert(
        format!("{}_class_names", prefix),
        json!(NLCD_CLASSES.iter().map(|c| c.2).collect::<Vec<_>>()),
    );
    properties
}

/// Zone index of a pixel: four columns by two rows of equal-sized blocks
fn zone(grid: &GridSpec, row: usize, col: usize) -> usize {
    let zx = (col * 4 / grid.width).min(3);
    let zy = (row * 2 / grid.height).min(1);
    zy * 4 + zx
}

/// Mean reflectance of zone `k` in band `b`; every zone differs in every band
fn signature(k: usize, b: usize) -> f32 {
    8000.0 + 1500.0 * ((k * 7 + b * 3) % 11) as f32
}

fn scene_raster(grid: &GridSpec, rng: &mut StdRng) -> Result<Raster> {
    let border = 2;
    let mut raster = Raster::new(*grid);
    for (b, name) in SCENE_BANDS.iter().enumerate() {
        let mut data = vec![f32::NAN; grid.len()];
        for row in border..grid.height.saturating_sub(border) {
            for col in border..grid.width.saturating_sub(border) {
                let noise: f32 = rng.gen_range(-200.0..=200.0);
                data[grid.index(row, col)] = signature(zone(grid, row, col), b) + noise;
            }
        }
        raster.add_band(name, data)?;
    }
    Ok(raster)
}

/// Catalog with five scenes and the reference layer
///
/// Scenes over the study area: 2020-03-15 (12.5% cloud), 2020-07-05 (3.1%),
/// 2020-10-23 (40%) and 2019-06-12 (0.5%). A fifth 2020 scene (0.1%) lies
/// two degrees east and never intersects the default region.
pub fn demo_catalog(options: &SyntheticOptions) -> Result<LocalCatalog> {
    let (lon, lat) = options.center;
    let h = options.half_extent;
    if !(h.is_finite() && h > 0.0) {
        return Err(ClassificationError::InvalidParameter(format!(
            "half extent must be positive, got {}",
            h
        )));
    }
    let bbox = BoundingBox::new(lon - h, lat - h, lon + h, lat + h);
    let grid = GridSpec::covering(&bbox, options.pixel_size, EPSG_WGS84)?;
    let far_grid = GridSpec {
        origin_x: grid.origin_x + 2.0,
        ..grid
    };

    let mut rng = StdRng::seed_from_u64(options.seed);
    let mut catalog = LocalCatalog::new();
    let scenes = [
        ("LC08_047026_20200315", (2020, 3, 15), 12.5, &grid),
        (DEMO_BEST_SCENE, (2020, 7, 5), 3.1, &grid),
        ("LC08_047026_20201023", (2020, 10, 23), 40.0, &grid),
        ("LC08_047026_20190612", (2019, 6, 12), 0.5, &grid),
        ("LC08_046026_20200801", (2020, 8, 1), 0.1, &far_grid),
    ];
    for (id, (y, m, d), cloud, scene_grid) in scenes {
        let time = Utc
            .with_ymd_and_hms(y, m, d, 19, 0, 0)
            .single()
            .ok_or_else(|| ClassificationError::InvalidParameter(format!("bad date for {}", id)))?;
        let mut properties = Map::new();
        properties.insert("CLOUD_COVER".to_string(), json!(cloud));
        properties.insert("SPACECRAFT_ID".to_string(), json!("LANDSAT_8"));
        let raster = scene_raster(scene_grid, &mut rng)?;
        catalog.insert_scene(DEMO_COLLECTION, id, time, properties, raster)?;
    }

    let mut labels = vec![0.0f32; grid.len()];
    for row in 0..grid.height {
        for col in 0..grid.width {
            labels[grid.index(row, col)] = DEMO_ZONE_CODES[zone(&grid, row, col)] as f32;
        }
    }
    let mut reference = Raster::new(grid).with_band(DEMO_LABEL_BAND, labels)?;
    reference.set_properties(nlcd_taxonomy_properties(DEMO_LABEL_BAND));
    catalog.insert_reference(DEMO_REFERENCE, reference)?;

    info!(
        width = grid.width,
        height = grid.height,
        scenes = catalog.scene_count(),
        "synthetic catalog built"
    );
    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classification::reference::Taxonomy;
    use crate::collect::catalog::{ReferenceStore, SceneCatalog};

    #[test]
    fn test_signatures_separate_zones() {
        for k in 0..8 {
            for k2 in (k + 1)..8 {
                for b in 0..7 {
                    assert!((signature(k, b) - signature(k2, b)).abs() >= 1500.0);
                }
            }
        }
    }

    #[test]
    fn test_nlcd_taxonomy() {
        let taxonomy = Taxonomy::from_properties(&nlcd_taxonomy_properties("landcover"), "landcover")
            .unwrap()
            .with_clean_names();
        assert_eq!(taxonomy.len(), 16);
        assert_eq!(taxonomy.get(11).unwrap().name, "Open Water");
        assert_eq!(taxonomy.get(21).unwrap().name, "Developed, Open Space");
        assert!(DEMO_ZONE_CODES.iter().all(|c| taxonomy.contains(*c)));
    }

    #[test]
    fn test_demo_catalog_contents() {
        let catalog = demo_catalog(&SyntheticOptions::default()).unwrap();
        let scenes = catalog.list(DEMO_COLLECTION).unwrap();
        assert_eq!(scenes.len(), 5);
        assert_eq!(scenes[0].band_names.len(), SCENE_BANDS.len());
        let reference = catalog.load_image(DEMO_REFERENCE).unwrap();
        assert_eq!(reference.valid_count(), reference.grid().len());
    }

    #[test]
    fn test_demo_catalog_is_deterministic() {
        let a = demo_catalog(&SyntheticOptions::default()).unwrap();
        let b = demo_catalog(&SyntheticOptions::default()).unwrap();
        let meta = &a.list(DEMO_COLLECTION).unwrap()[1];
        let bands = vec!["B4".to_string()];
        let bits = |catalog: &LocalCatalog| -> Vec<u32> {
            catalog.load(meta, &bands).unwrap().raster().bands()[0]
                .data
                .iter()
                .map(|v| v.to_bits())
                .collect()
        };
        assert_eq!(bits(&a), bits(&b));
    }
}
