use chrono::{DateTime, Utc};
use geo::Polygon;
use serde_json::{Map, Value};
use tracing::info;

use crate::collect::catalog::SceneCatalog;
use crate::collect::query::SceneQuery;
use crate::error::Result;
use crate::geo_core::{DateRange, Region};
use crate::raster::Raster;

/// Multispectral scene selected for analysis
///
/// The band set is fixed when the scene is loaded; later stages only read it.
#[derive(Debug, Clone, PartialEq)]
pub struct Scene {
    id: String,
    collection: String,
    time: DateTime<Utc>,
    properties: Map<String, Value>,
    raster: Raster,
}

impl Scene {
    pub fn new(
        id: &str,
        collection: &str,
        time: DateTime<Utc>,
        properties: Map<String, Value>,
        raster: Raster,
    ) -> Self {
        Scene {
            id: id.to_string(),
            collection: collection.to_string(),
            time,
            properties,
            raster,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    /// Acquisition date as `YYYY-MM-DD`
    pub fn date_string(&self) -> String {
        self.time.format("%Y-%m-%d").to_string()
    }

    pub fn properties(&self) -> &Map<String, Value> {
        &self.properties
    }

    /// Quality score such as cloud cover, lower is better
    pub fn quality(&self, property: &str) -> Option<f64> {
        self.properties.get(property).and_then(Value::as_f64)
    }

    pub fn raster(&self) -> &Raster {
        &self.raster
    }

    pub fn band_names(&self) -> Vec<String> {
        self.raster.band_names()
    }

    /// Polygon of the valid data extent, the whole grid when no pixel is valid
    pub fn footprint(&self) -> Polygon<f64> {
        self.raster
            .valid_extent()
            .unwrap_or_else(|| self.raster.grid().extent())
            .to_polygon()
    }
}

/// Least-cloudy scene of `collection` over `region` within `dates`
///
/// Only bands whose name fully matches `band_pattern` are kept.
pub fn select_scene(
    catalog: &dyn SceneCatalog,
    collection: &str,
    region: &Region,
    dates: &DateRange,
    quality_property: &str,
    band_pattern: &str,
) -> Result<Scene> {
    let scene = SceneQuery::collection(collection)
        .filter_bounds(*region)
        .filter_date(*dates)
        .sort(quality_property)
        .select(band_pattern)
        .first(catalog)?;
    info!(
        scene = %scene.id(),
        date = %scene.date_string(),
        quality = ?scene.quality(quality_property),
        "scene selected"
    );
    Ok(scene)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::catalog::LocalCatalog;
    use crate::error::ClassificationError;
    use crate::geo_core::BoundingBox;
    use crate::raster::GridSpec;
    use chrono::TimeZone;
    use serde_json::json;

    fn catalog() -> LocalCatalog {
        let grid = GridSpec::new(-124.0, 50.0, 0.25, 0.25, 4, 4, 4326);
        let mut data = vec![1.0f32; 16];
        data[0] = f32::NAN;
        data[3] = f32::NAN;
        data[12] = f32::NAN;
        data[15] = f32::NAN;
        let raster = Raster::new(grid)
            .with_band("B1", data.clone())
            .unwrap()
            .with_band("B2", data)
            .unwrap()
            .with_band("BQA", vec![0.0; 16])
            .unwrap();
        let mut catalog = LocalCatalog::new();
        for (id, cloud, year) in [("s1", 30.0, 2020), ("s2", 2.0, 2020), ("s3", 1.0, 2019)] {
            let mut p = Map::new();
            p.insert("CLOUD_COVER".to_string(), json!(cloud));
            let t = Utc.with_ymd_and_hms(year, 7, 1, 18, 30, 0).unwrap();
            catalog.insert_scene("L8", id, t, p, raster.clone()).unwrap();
        }
        catalog
    }

    #[test]
    fn test_select_scene_picks_lowest_cloud_cover() {
        let dates = DateRange::parse("2020-01-01", "2020-12-31").unwrap();
        let scene = select_scene(
            &catalog(),
            "L8",
            &Region::point(-123.5, 49.5),
            &dates,
            "CLOUD_COVER",
            "B[1-7]",
        )
        .unwrap();
        assert_eq!(scene.id(), "s2");
        assert_eq!(scene.quality("CLOUD_COVER"), Some(2.0));
        assert_eq!(scene.date_string(), "2020-07-01");
        assert_eq!(scene.band_names(), vec!["B1", "B2"]);
    }

    #[test]
    fn test_select_scene_no_candidates() {
        let dates = DateRange::parse("2021-01-01", "2021-12-31").unwrap();
        let err = select_scene(
            &catalog(),
            "L8",
            &Region::point(-123.5, 49.5),
            &dates,
            "CLOUD_COVER",
            "B[1-7]",
        )
        .unwrap_err();
        assert!(matches!(err, ClassificationError::NoScenesFound { .. }));
    }

    #[test]
    fn test_footprint_follows_valid_data() {
        let catalog = catalog();
        let meta = &catalog.list("L8").unwrap()[0];
        let scene = catalog.load(meta, &["B1".to_string()]).unwrap();
        // corners are nodata, but rows and columns still span the whole grid
        let extent = scene.raster().valid_extent().unwrap();
        assert_eq!(extent, BoundingBox::new(-124.0, 49.0, -123.0, 50.0));
        assert_eq!(scene.footprint(), extent.to_polygon());
    }
}
