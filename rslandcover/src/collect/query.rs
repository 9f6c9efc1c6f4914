use regex::Regex;
use std::cmp::Ordering;
use tracing::{debug, info};

use crate::classification::scene::Scene;
use crate::collect::catalog::{SceneCatalog, SceneMetadata};
use crate::error::{ClassificationError, Result};
use crate::geo_core::{DateRange, Region};

/// Explicit request over a scene collection
///
/// Building a query never touches the catalog. It is evaluated only by
/// [`SceneQuery::candidates`], [`SceneQuery::first`] or
/// [`SceneQuery::execute`].
#[derive(Debug, Clone, PartialEq)]
pub struct SceneQuery {
    collection: String,
    bounds: Option<Region>,
    dates: Option<DateRange>,
    sort_property: Option<String>,
    band_pattern: Option<String>,
}

impl SceneQuery {
    pub fn collection(collection: &str) -> Self {
        SceneQuery {
            collection: collection.to_string(),
            bounds: None,
            dates: None,
            sort_property: None,
            band_pattern: None,
        }
    }

    pub fn filter_bounds(mut self, region: Region) -> Self {
        self.bounds = Some(region);
        self
    }

    pub fn filter_date(mut self, dates: DateRange) -> Self {
        self.dates = Some(dates);
        self
    }

    /// Ascending order on a numeric property
    pub fn sort(mut self, property: &str) -> Self {
        self.sort_property = Some(property.to_string());
        self
    }

    /// Regex that band names must match in full
    pub fn select(mut self, pattern: &str) -> Self {
        self.band_pattern = Some(pattern.to_string());
        self
    }

    pub fn collection_id(&self) -> &str {
        &self.collection
    }

    /// Filtered and sorted scene metadata, no pixels loaded
    ///
    /// Sorting is stable: ties keep catalog order and scenes without the
    /// sort property come last.
    pub fn candidates(&self, catalog: &dyn SceneCatalog) -> Result<Vec<SceneMetadata>> {
        let mut scenes: Vec<SceneMetadata> = catalog
            .list(&self.collection)?
            .into_iter()
            .filter(|s| match &self.bounds {
                Some(region) => region.intersects(&s.footprint()),
                None => true,
            })
            .filter(|s| match &self.dates {
                Some(dates) => dates.contains(&s.time),
                None => true,
            })
            .collect();

        if let Some(property) = &self.sort_property {
            scenes.sort_by(|a, b| {
                match (a.property_f64(property), b.property_f64(property)) {
                    (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                }
            });
        }
        debug!(collection = %self.collection, count = scenes.len(), "query candidates");
        Ok(scenes)
    }

    /// Best candidate with the selected bands loaded
    pub fn first(&self, catalog: &dyn SceneCatalog) -> Result<Scene> {
        let pattern = self.compiled_pattern()?;
        let best = self
            .candidates(catalog)?
            .into_iter()
            .next()
            .ok_or_else(|| ClassificationError::NoScenesFound {
                collection: self.collection.clone(),
            })?;
        let bands = self.matching_bands(&best, pattern.as_ref())?;
        info!(scene = %best.id, bands = ?bands, "selected scene");
        catalog.load(&best, &bands)
    }

    /// Every candidate with the selected bands loaded, in sort order
    pub fn execute(&self, catalog: &dyn SceneCatalog) -> Result<Vec<Scene>> {
        let pattern = self.compiled_pattern()?;
        self.candidates(catalog)?
            .iter()
            .map(|meta| {
                let bands = self.matching_bands(meta, pattern.as_ref())?;
                catalog.load(meta, &bands)
            })
            .collect()
    }

    fn compiled_pattern(&self) -> Result<Option<Regex>> {
        self.band_pattern
            .as_ref()
            .map(|pattern| {
                Regex::new(&format!("^(?:{})$", pattern)).map_err(|source| {
                    ClassificationError::InvalidBandPattern {
                        pattern: pattern.clone(),
                        source,
                    }
                })
            })
            .transpose()
    }

    fn matching_bands(&self, meta: &SceneMetadata, pattern: Option<&Regex>) -> Result<Vec<String>> {
        let bands: Vec<String> = match pattern {
            Some(re) => meta
                .band_names
                .iter()
                .filter(|name| re.is_match(name))
                .cloned()
                .collect(),
            None => meta.band_names.clone(),
        };
        if bands.is_empty() {
            return Err(ClassificationError::BandMismatch(format!(
                "no band of scene '{}' matches '{}' (available: {:?})",
                meta.id,
                self.band_pattern.as_deref().unwrap_or(""),
                meta.band_names
            )));
        }
        Ok(bands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::catalog::LocalCatalog;
    use crate::raster::{GridSpec, Raster};
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Map, Value};
    use std::cell::Cell;

    fn raster(origin_x: f64) -> Raster {
        let grid = GridSpec::new(origin_x, 50.0, 0.5, 0.5, 2, 2, 4326);
        let mut raster = Raster::new(grid);
        for name in ["B1", "B2", "B10", "QA"] {
            raster.add_band(name, vec![1.0; 4]).unwrap();
        }
        raster
    }

    fn cloud(value: Option<f64>) -> Map<String, Value> {
        let mut p = Map::new();
        if let Some(v) = value {
            p.insert("CLOUD_COVER".to_string(), json!(v));
        }
        p
    }

    fn catalog() -> LocalCatalog {
        let mut catalog = LocalCatalog::new();
        let june = Utc.with_ymd_and_hms(2020, 6, 1, 0, 0, 0).unwrap();
        let old = Utc.with_ymd_and_hms(2018, 6, 1, 0, 0, 0).unwrap();
        catalog.insert_scene("C", "cloudy", june, cloud(Some(50.0)), raster(-124.0)).unwrap();
        catalog.insert_scene("C", "unknown", june, cloud(None), raster(-124.0)).unwrap();
        catalog.insert_scene("C", "clear", june, cloud(Some(5.0)), raster(-124.0)).unwrap();
        catalog.insert_scene("C", "clear-twin", june, cloud(Some(5.0)), raster(-124.0)).unwrap();
        catalog.insert_scene("C", "old", old, cloud(Some(0.0)), raster(-124.0)).unwrap();
        catalog.insert_scene("C", "far", june, cloud(Some(0.0)), raster(10.0)).unwrap();
        catalog
    }

    fn query() -> SceneQuery {
        SceneQuery::collection("C")
            .filter_bounds(Region::point(-123.5, 49.5))
            .filter_date(DateRange::parse("2020-01-01", "2020-12-31").unwrap())
            .sort("CLOUD_COVER")
    }

    #[test]
    fn test_candidates_filter_and_sort() {
        let ids: Vec<String> = query()
            .candidates(&catalog())
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["clear", "clear-twin", "cloudy", "unknown"]);
    }

    #[test]
    fn test_first_keeps_matching_bands() {
        let scene = query().select("B[1-7]").first(&catalog()).unwrap();
        assert_eq!(scene.id(), "clear");
        // anchored: B10 must not match B[1-7]
        assert_eq!(scene.band_names(), vec!["B1", "B2"]);
    }

    #[test]
    fn test_first_without_matches_is_an_error() {
        let q = SceneQuery::collection("C").filter_bounds(Region::point(0.0, 0.0));
        assert!(matches!(
            q.first(&catalog()),
            Err(ClassificationError::NoScenesFound { .. })
        ));
        assert!(matches!(
            query().select("B[").first(&catalog()),
            Err(ClassificationError::InvalidBandPattern { .. })
        ));
        assert!(matches!(
            query().select("SR_.*").first(&catalog()),
            Err(ClassificationError::BandMismatch(_))
        ));
    }

    struct CountingCatalog {
        inner: LocalCatalog,
        calls: Cell<usize>,
    }

    impl SceneCatalog for CountingCatalog {
        fn list(&self, collection: &str) -> Result<Vec<SceneMetadata>> {
            self.calls.set(self.calls.get() + 1);
            self.inner.list(collection)
        }

        fn load(&self, metadata: &SceneMetadata, bands: &[String]) -> Result<Scene> {
            self.calls.set(self.calls.get() + 1);
            self.inner.load(metadata, bands)
        }
    }

    #[test]
    fn test_query_is_lazy_until_evaluated() {
        let catalog = CountingCatalog {
            inner: catalog(),
            calls: Cell::new(0),
        };
        let q = query().select("B.*");
        assert_eq!(catalog.calls.get(), 0);
        let scenes = q.execute(&catalog).unwrap();
        assert_eq!(scenes.len(), 4);
        // one list plus one load per candidate
        assert_eq!(catalog.calls.get(), 5);
    }
}
