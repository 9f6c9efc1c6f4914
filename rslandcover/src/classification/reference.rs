use geo::Polygon;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, info};

use crate::collect::catalog::ReferenceStore;
use crate::error::{ClassificationError, Result};
use crate::raster::Raster;

/// Separator between a class name and its description in reference metadata
pub const NAME_SEPARATOR: char = '-';

/// Display colour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    /// Parse `rrggbb`, with or without a leading `#`
    pub fn parse_hex(value: &str) -> Option<Rgb> {
        let hex = value.trim().trim_start_matches('#');
        if hex.len() != 6 || !hex.is_ascii() {
            return None;
        }
        let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
        Some(Rgb(channel(0)?, channel(2)?, channel(4)?))
    }

    /// Lowercase `rrggbb` without `#`
    pub fn to_hex(&self) -> String {
        format!("{:02x}{:02x}{:02x}", self.0, self.1, self.2)
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.to_hex())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxonomyClass {
    pub code: i32,
    pub name: String,
    pub color: Rgb,
}

/// Ordered land-cover classes: code, display name, colour
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Taxonomy {
    classes: Vec<TaxonomyClass>,
}

impl Taxonomy {
    pub fn new(classes: Vec<TaxonomyClass>) -> Result<Self> {
        let mut seen = BTreeSet::new();
        for class in &classes {
            if !seen.insert(class.code) {
                return Err(ClassificationError::InvalidParameter(format!(
                    "duplicate taxonomy code {}",
                    class.code
                )));
            }
        }
        Ok(Taxonomy { classes })
    }

    pub fn classes(&self) -> &[TaxonomyClass] {
        &self.classes
    }

    pub fn codes(&self) -> Vec<i32> {
        self.classes.iter().map(|c| c.code).collect()
    }

    pub fn contains(&self, code: i32) -> bool {
        self.get(code).is_some()
    }

    pub fn get(&self, code: i32) -> Option<&TaxonomyClass> {
        self.classes.iter().find(|c| c.code == code)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Read `<prefix>_class_values`, `<prefix>_class_names` and
    /// `<prefix>_class_palette` from raster properties
    ///
    /// Names are taken as stored; see [`Taxonomy::with_clean_names`].
    pub fn from_properties(properties: &Map<String, Value>, prefix: &str) -> Result<Self> {
        let values_key = format!("{}_class_values", prefix);
        let names_key = format!("{}_class_names", prefix);
        let palette_key = format!("{}_class_palette", prefix);

        let values = property_array(properties, &values_key)?
            .iter()
            .map(|v| v.as_i64().and_then(|v| i32::try_from(v).ok()))
            .collect::<Option<Vec<i32>>>()
            .ok_or_else(|| missing(&values_key))?;
        let names = property_array(properties, &names_key)?
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect::<Option<Vec<String>>>()
            .ok_or_else(|| missing(&names_key))?;
        let palette = property_array(properties, &palette_key)?
            .iter()
            .map(|v| v.as_str().and_then(Rgb::parse_hex))
            .collect::<Option<Vec<Rgb>>>()
            .ok_or_else(|| missing(&palette_key))?;

        if names.len() != values.len() {
            return Err(missing(&names_key));
        }
        if palette.len() != values.len() {
            return Err(missing(&palette_key));
        }

        let classes = values
            .into_iter()
            .zip(names)
            .zip(palette)
            .map(|((code, name), color)| TaxonomyClass { code, name, color })
            .collect();
        Taxonomy::new(classes)
    }

    /// Inverse of [`Taxonomy::from_properties`]
    pub fn to_properties(&self, prefix: &str) -> Map<String, Value> {
        let mut properties = Map::new();
        properties.insert(format!("{}_class_values", prefix), json!(self.codes()));
        properties.insert(
            format!("{}_class_names", prefix),
            json!(self.classes.iter().map(|c| c.name.clone()).collect::<Vec<_>>()),
        );
        properties.insert(
            format!("{}_class_palette", prefix),
            json!(self.classes.iter().map(|c| c.color.to_hex()).collect::<Vec<_>>()),
        );
        properties
    }

    /// Copy with every name reduced by [`clean_name`]
    pub fn with_clean_names(&self) -> Taxonomy {
        Taxonomy {
            classes: self
                .classes
                .iter()
                .map(|c| TaxonomyClass {
                    code: c.code,
                    name: clean_name(&c.name, NAME_SEPARATOR),
                    color: c.color,
                })
                .collect(),
        }
    }
}

fn missing(key: &str) -> ClassificationError {
    ClassificationError::TaxonomyMissing {
        key: key.to_string(),
    }
}

fn property_array<'a>(properties: &'a Map<String, Value>, key: &str) -> Result<&'a Vec<Value>> {
    properties
        .get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| missing(key))
}

/// Text before the first `separator`, trimmed
///
/// A name without the separator is kept whole.
pub fn clean_name(raw: &str, separator: char) -> String {
    match raw.split_once(separator) {
        Some((head, _)) => head.trim().to_string(),
        None => raw.trim().to_string(),
    }
}

/// Categorical reference raster clipped to a scene footprint
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceLayer {
    pub id: String,
    pub band: String,
    pub raster: Raster,
}

impl ReferenceLayer {
    /// Label code at a pixel, `None` on nodata
    pub fn code_at(&self, row: usize, col: usize) -> Option<i32> {
        let grid = self.raster.grid();
        let value = self.raster.bands().first()?.data[grid.index(row, col)];
        value.is_finite().then(|| value.round() as i32)
    }
}

/// Load `band` of reference image `layer_id` clipped to `footprint`
///
/// Every valid pixel must carry a code of the taxonomy.
pub fn load_reference_layer(
    store: &dyn ReferenceStore,
    layer_id: &str,
    band: &str,
    footprint: &Polygon<f64>,
) -> Result<(ReferenceLayer, Taxonomy)> {
    let image = store.load_image(layer_id)?;
    let raster = image.select(&[band.to_string()])?.clip_to(footprint);
    let taxonomy = Taxonomy::from_properties(raster.properties(), band)?.with_clean_names();

    let data = &raster.bands()[0].data;
    let codes: BTreeSet<i32> = data
        .iter()
        .filter(|v| v.is_finite())
        .map(|v| v.round() as i32)
        .collect();
    if let Some(code) = codes.iter().find(|c| !taxonomy.contains(**c)) {
        return Err(ClassificationError::UnknownClassCode { code: *code });
    }
    debug!(layer = layer_id, codes = ?codes, "reference codes present");
    info!(
        layer = layer_id,
        band,
        classes = taxonomy.len(),
        valid_pixels = raster.valid_count(),
        "reference layer loaded"
    );

    Ok((
        ReferenceLayer {
            id: layer_id.to_string(),
            band: band.to_string(),
            raster,
        },
        taxonomy,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::catalog::LocalCatalog;
    use crate::geo_core::BoundingBox;
    use crate::raster::GridSpec;

    fn properties() -> Map<String, Value> {
        let mut p = Map::new();
        p.insert("landcover_class_values".into(), json!([11, 41, 82]));
        p.insert(
            "landcover_class_names".into(),
            json!([
                "Open water - areas of open water",
                "Deciduous forest-trees",
                "Cultivated crops"
            ]),
        );
        p.insert(
            "landcover_class_palette".into(),
            json!(["476ba1", "#68AB63", "ab7028"]),
        );
        p
    }

    fn store(data: Vec<f32>) -> LocalCatalog {
        let grid = GridSpec::new(0.0, 2.0, 1.0, 1.0, 2, 2, 4326);
        let mut raster = Raster::new(grid)
            .with_band("landcover", data)
            .unwrap()
            .with_band("impervious", vec![0.0; 4])
            .unwrap();
        raster.set_properties(properties());
        let mut store = LocalCatalog::new();
        store.insert_reference("NLCD", raster).unwrap();
        store
    }

    #[test]
    fn test_rgb_hex() {
        assert_eq!(Rgb::parse_hex("#476BA1"), Some(Rgb(0x47, 0x6b, 0xa1)));
        assert_eq!(Rgb::parse_hex("476ba1").unwrap().to_hex(), "476ba1");
        assert_eq!(Rgb::parse_hex("47ba1"), None);
        assert_eq!(Rgb::parse_hex("zz6ba1"), None);
    }

    #[test]
    fn test_clean_name() {
        assert_eq!(clean_name("Open water - areas of open water", '-'), "Open water");
        assert_eq!(clean_name("Deciduous forest-trees", '-'), "Deciduous forest");
        // no separator: nothing to strip
        assert_eq!(clean_name("  Cultivated crops ", '-'), "Cultivated crops");
        assert_eq!(clean_name("-leading", '-'), "");
    }

    #[test]
    fn test_taxonomy_from_properties() {
        let taxonomy = Taxonomy::from_properties(&properties(), "landcover")
            .unwrap()
            .with_clean_names();
        assert_eq!(taxonomy.codes(), vec![11, 41, 82]);
        assert_eq!(taxonomy.get(41).unwrap().name, "Deciduous forest");
        assert_eq!(taxonomy.get(41).unwrap().color, Rgb(0x68, 0xab, 0x63));
        assert!(!taxonomy.contains(12));
    }

    #[test]
    fn test_taxonomy_missing_keys() {
        let mut p = properties();
        p.remove("landcover_class_palette");
        match Taxonomy::from_properties(&p, "landcover") {
            Err(ClassificationError::TaxonomyMissing { key }) => {
                assert_eq!(key, "landcover_class_palette")
            }
            other => panic!("unexpected {:?}", other),
        }

        let mut p = properties();
        p.insert("landcover_class_names".into(), json!(["a", "b"]));
        assert!(matches!(
            Taxonomy::from_properties(&p, "landcover"),
            Err(ClassificationError::TaxonomyMissing { .. })
        ));
    }

    #[test]
    fn test_taxonomy_properties_round_trip() {
        let taxonomy = Taxonomy::from_properties(&properties(), "landcover").unwrap();
        let props = taxonomy.to_properties("classification");
        assert_eq!(
            Taxonomy::from_properties(&props, "classification").unwrap(),
            taxonomy
        );
    }

    #[test]
    fn test_load_reference_layer_clips_and_checks_codes() {
        let store = store(vec![11.0, 41.0, 82.0, f32::NAN]);
        let footprint = BoundingBox::new(0.0, 0.0, 1.0, 2.0).to_polygon();
        let (layer, taxonomy) =
            load_reference_layer(&store, "NLCD", "landcover", &footprint).unwrap();
        assert_eq!(taxonomy.len(), 3);
        assert_eq!(layer.raster.band_names(), vec!["landcover"]);
        assert_eq!(layer.code_at(0, 0), Some(11));
        assert_eq!(layer.code_at(0, 1), None);
        assert_eq!(layer.code_at(1, 0), Some(82));
    }

    #[test]
    fn test_load_reference_layer_unknown_code() {
        let store = store(vec![11.0, 41.0, 99.0, 11.0]);
        let footprint = BoundingBox::new(0.0, 0.0, 2.0, 2.0).to_polygon();
        assert!(matches!(
            load_reference_layer(&store, "NLCD", "landcover", &footprint),
            Err(ClassificationError::UnknownClassCode { code: 99 })
        ));
        // code 99 is outside this footprint
        let footprint = BoundingBox::new(0.0, 1.0, 2.0, 2.0).to_polygon();
        assert!(load_reference_layer(&store, "NLCD", "landcover", &footprint).is_ok());
    }
}
