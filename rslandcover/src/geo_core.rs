use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use geo::{coord, Intersects, Point, Polygon, Rect};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::error::{ClassificationError, Result};

/// Metres per degree of latitude (spherical approximation)
pub const METERS_PER_DEGREE_LAT: f64 = 111_320.0;
/// Equatorial circumference in metres
pub const EARTH_CIRCUMFERENCE_M: f64 = 40_075_000.0;

/// EPSG code of WGS84 geographic coordinates
pub const EPSG_WGS84: i32 = 4326;

/// Region of interest in geographic coordinates (longitude, latitude in degrees)
///
/// Immutable once built; every spatial query and the remote export region
/// are derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Region {
    Point {
        lon: f64,
        lat: f64,
    },
    #[serde(rename = "bbox")]
    BBox {
        min_lon: f64,
        min_lat: f64,
        max_lon: f64,
        max_lat: f64,
    },
}

impl Region {
    pub fn point(lon: f64, lat: f64) -> Self {
        Region::Point { lon, lat }
    }

    /// Bounding box region; corners are normalised so min <= max
    pub fn bbox(lon_a: f64, lat_a: f64, lon_b: f64, lat_b: f64) -> Self {
        Region::BBox {
            min_lon: lon_a.min(lon_b),
            min_lat: lat_a.min(lat_b),
            max_lon: lon_a.max(lon_b),
            max_lat: lat_a.max(lat_b),
        }
    }

    pub fn bounding_box(&self) -> BoundingBox {
        match *self {
            Region::Point { lon, lat } => BoundingBox::new(lon, lat, lon, lat),
            Region::BBox {
                min_lon,
                min_lat,
                max_lon,
                max_lat,
            } => BoundingBox::new(min_lon, min_lat, max_lon, max_lat),
        }
    }

    pub fn center(&self) -> Point<f64> {
        self.bounding_box().center()
    }

    /// True when the region touches the footprint (boundary included)
    pub fn intersects(&self, footprint: &Polygon<f64>) -> bool {
        match *self {
            Region::Point { lon, lat } => footprint.intersects(&Point::new(lon, lat)),
            Region::BBox { .. } => footprint.intersects(&self.bounding_box().to_polygon()),
        }
    }

    pub fn to_geojson(&self) -> geojson::Geometry {
        match *self {
            Region::Point { lon, lat } => {
                geojson::Geometry::new(geojson::Value::from(&Point::new(lon, lat)))
            }
            Region::BBox { .. } => {
                geojson::Geometry::new(geojson::Value::from(&self.bounding_box().to_polygon()))
            }
        }
    }
}

/// Bounding box structure
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64, // min longitude
    pub min_y: f64, // min latitude
    pub max_x: f64, // max longitude
    pub max_y: f64, // max latitude
}

impl BoundingBox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        BoundingBox {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    pub fn from_rect(rect: &Rect<f64>) -> Self {
        BoundingBox::new(rect.min().x, rect.min().y, rect.max().x, rect.max().y)
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn center(&self) -> Point<f64> {
        Point::new(
            (self.min_x + self.max_x) / 2.0,
            (self.min_y + self.max_y) / 2.0,
        )
    }

    pub fn to_rect(&self) -> Rect<f64> {
        Rect::new(
            coord! { x: self.min_x, y: self.min_y },
            coord! { x: self.max_x, y: self.max_y },
        )
    }

    pub fn to_polygon(&self) -> Polygon<f64> {
        self.to_rect().to_polygon()
    }

    /// Inclusive containment test
    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }

    /// Overlap of two boxes, `None` when they are disjoint
    pub fn intersection(&self, other: &BoundingBox) -> Option<BoundingBox> {
        let min_x = self.min_x.max(other.min_x);
        let min_y = self.min_y.max(other.min_y);
        let max_x = self.max_x.min(other.max_x);
        let max_y = self.max_y.min(other.max_y);
        if min_x > max_x || min_y > max_y {
            return None;
        }
        Some(BoundingBox::new(min_x, min_y, max_x, max_y))
    }
}

/// Half-open `[start, end)` time window used to filter scenes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start >= end {
            return Err(ClassificationError::InvalidParameter(format!(
                "date range start {} is not before end {}",
                start, end
            )));
        }
        Ok(DateRange { start, end })
    }

    /// Parse two `YYYY-MM-DD` dates; both are taken at midnight UTC and the end is exclusive
    pub fn parse(start: &str, end: &str) -> Result<Self> {
        DateRange::new(parse_date(start)?, parse_date(end)?)
    }

    pub fn contains(&self, time: &DateTime<Utc>) -> bool {
        *time >= self.start && *time < self.end
    }
}

fn parse_date(value: &str) -> Result<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|e| {
        ClassificationError::InvalidParameter(format!("invalid date '{}': {}", value, e))
    })?;
    let midnight = date.and_hms_opt(0, 0, 0).ok_or_else(|| {
        ClassificationError::InvalidParameter(format!("invalid date '{}'", value))
    })?;
    Ok(Utc.from_utc_datetime(&midnight))
}

/// Ground size in degrees (lon, lat) of `meters` at a given latitude
///
/// Equirectangular approximation: 111320 m per degree of latitude and
/// `40075000 * cos(lat) / 360` m per degree of longitude.
pub fn meters_to_degrees(meters: f64, lat: f64) -> (f64, f64) {
    let deg_to_m_lat = METERS_PER_DEGREE_LAT;
    let deg_to_m_lon = (EARTH_CIRCUMFERENCE_M * (lat * PI / 180.0).cos() / 360.0).max(1.0);
    (meters / deg_to_m_lon, meters / deg_to_m_lat)
}

/// Whether an EPSG code denotes a geographic (degree based) CRS
pub fn is_geographic(epsg: i32) -> bool {
    matches!(epsg, 4326 | 4258 | 4269 | 4267 | 4019)
}
