use geo::{BoundingRect, Contains, Point, Polygon};
use geojson::{Feature, FeatureCollection, Geometry, JsonObject};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tracing::info;

use crate::classification::reference::ReferenceLayer;
use crate::error::{ClassificationError, Result};
use crate::geo_core::BoundingBox;
use crate::raster::GridSpec;

/// Labelled sample drawn from the reference layer
#[derive(Debug, Clone, PartialEq)]
pub struct SamplePoint {
    /// Cell of the sampling grid
    pub cell: (usize, usize),
    /// Cell centre, kept only when geometries are requested
    pub location: Option<Point<f64>>,
    pub label: i32,
}

/// Samples plus the grid they were drawn on
#[derive(Debug, Clone, PartialEq)]
pub struct SampleSet {
    pub grid: GridSpec,
    pub label_field: String,
    pub points: Vec<SamplePoint>,
}

impl SampleSet {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn first(&self) -> Option<&SamplePoint> {
        self.points.first()
    }

    pub fn has_geometry(&self) -> bool {
        self.points.iter().all(|p| p.location.is_some())
    }

    /// Features with the label as property and, when kept, the point geometry
    pub fn to_geojson(&self) -> FeatureCollection {
        let features = self
            .points
            .iter()
            .map(|p| {
                let mut properties = JsonObject::new();
                properties.insert(self.label_field.clone(), json!(p.label));
                Feature {
                    bbox: None,
                    geometry: p
                        .location
                        .as_ref()
                        .map(|loc| Geometry::new(geojson::Value::from(loc))),
                    id: None,
                    properties: Some(properties),
                    foreign_members: None,
                }
            })
            .collect();
        FeatureCollection {
            bbox: None,
            features,
            foreign_members: None,
        }
    }
}

/// Up to `count` labelled points, uniformly drawn among the valid cells of a
/// `scale`-metre grid over `footprint`
///
/// A cell is a candidate when its centre lies in the footprint and the
/// reference layer holds a code there. Selection is reservoir sampling on a
/// `StdRng` seeded with `seed`, so identical inputs give identical samples.
/// Points are returned in grid order.
pub fn draw_samples(
    reference: &ReferenceLayer,
    footprint: &Polygon<f64>,
    count: usize,
    scale: f64,
    seed: u64,
    with_geometry: bool,
) -> Result<SampleSet> {
    let epsg = reference.raster.grid().epsg;
    let bounds = footprint.bounding_rect().ok_or_else(|| {
        ClassificationError::InvalidParameter("sampling footprint is empty".to_string())
    })?;
    let grid = GridSpec::covering(&BoundingBox::from_rect(&bounds), scale, epsg)?;
    let band = reference.raster.bands().first().ok_or_else(|| {
        ClassificationError::BandMismatch(format!("reference layer '{}' has no band", reference.id))
    })?;

    let mut rng = StdRng::seed_from_u64(seed);
    let mut reservoir: Vec<(usize, i32)> = Vec::with_capacity(count.min(grid.len()));
    let mut seen = 0usize;
    for row in 0..grid.height {
        for col in 0..grid.width {
            let center = grid.cell_center(row, col);
            if !footprint.contains(&center) {
                continue;
            }
            let Some(value) = reference.raster.value_at(0, &center) else {
                continue;
            };
            let candidate = (grid.index(row, col), value.round() as i32);
            if reservoir.len() < count {
                reservoir.push(candidate);
            } else if count > 0 {
                let j = rng.gen_range(0..=seen);
                if j < count {
                    reservoir[j] = candidate;
                }
            }
            seen += 1;
        }
    }
    reservoir.sort_by_key(|(idx, _)| *idx);

    let points: Vec<SamplePoint> = reservoir
        .into_iter()
        .map(|(idx, label)| {
            let cell = (idx / grid.width, idx % grid.width);
            SamplePoint {
                cell,
                location: with_geometry.then(|| grid.cell_center(cell.0, cell.1)),
                label,
            }
        })
        .collect();

    info!(
        candidates = seen,
        drawn = points.len(),
        requested = count,
        seed,
        "samples drawn"
    );
    Ok(SampleSet {
        grid,
        label_field: band.name.clone(),
        points,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::Raster;

    fn layer(data: Vec<f32>) -> ReferenceLayer {
        let grid = GridSpec::new(0.0, 100.0, 10.0, 10.0, 10, 10, 32610);
        ReferenceLayer {
            id: "ref".to_string(),
            band: "landcover".to_string(),
            raster: Raster::new(grid).with_band("landcover", data).unwrap(),
        }
    }

    fn codes() -> Vec<f32> {
        (0..100).map(|i| if i % 2 == 0 { 11.0 } else { 41.0 }).collect()
    }

    fn footprint() -> Polygon<f64> {
        BoundingBox::new(0.0, 0.0, 100.0, 100.0).to_polygon()
    }

    #[test]
    fn test_draw_samples_is_deterministic() {
        let layer = layer(codes());
        let a = draw_samples(&layer, &footprint(), 20, 10.0, 0, true).unwrap();
        let b = draw_samples(&layer, &footprint(), 20, 10.0, 0, true).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 20);
        let c = draw_samples(&layer, &footprint(), 20, 10.0, 7, true).unwrap();
        assert_ne!(a.points, c.points);
    }

    #[test]
    fn test_draw_samples_bounded_by_count_and_valid_pixels() {
        let mut data = vec![f32::NAN; 100];
        for v in data.iter_mut().take(5) {
            *v = 11.0;
        }
        let layer = layer(data);
        let samples = draw_samples(&layer, &footprint(), 50, 10.0, 0, true).unwrap();
        assert_eq!(samples.len(), 5);
        assert!(samples.points.iter().all(|p| p.label == 11));
        assert_eq!(samples.points[0].cell, (0, 0));
    }

    #[test]
    fn test_draw_samples_empty_footprint_data() {
        let layer = layer(vec![f32::NAN; 100]);
        let samples = draw_samples(&layer, &footprint(), 50, 10.0, 0, true).unwrap();
        assert!(samples.is_empty());
        let none = draw_samples(&layer, &footprint(), 0, 10.0, 0, true).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_labels_match_reference() {
        let layer = layer(codes());
        let samples = draw_samples(&layer, &footprint(), 30, 10.0, 3, true).unwrap();
        for p in &samples.points {
            let (row, col) = p.cell;
            assert_eq!(Some(p.label), layer.code_at(row, col));
            let loc = p.location.unwrap();
            assert_eq!(loc, samples.grid.cell_center(row, col));
        }
        assert_eq!(samples.label_field, "landcover");
    }

    #[test]
    fn test_without_geometry() {
        let layer = layer(codes());
        let samples = draw_samples(&layer, &footprint(), 10, 10.0, 0, false).unwrap();
        assert!(samples.points.iter().all(|p| p.location.is_none()));
        assert!(!samples.has_geometry());
        let fc = samples.to_geojson();
        assert_eq!(fc.features.len(), 10);
        assert!(fc.features[0].geometry.is_none());
    }

    #[test]
    fn test_invalid_scale() {
        let layer = layer(codes());
        assert!(draw_samples(&layer, &footprint(), 10, 0.0, 0, true).is_err());
    }
}
