pub mod geotiff;

use geo::{Contains, Point, Polygon};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ClassificationError, Result};
use crate::geo_core::{is_geographic, meters_to_degrees, BoundingBox};

/// North-up raster grid: upper-left origin, positive pixel sizes, CRS
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    pub origin_x: f64,
    pub origin_y: f64,
    pub pixel_width: f64,
    pub pixel_height: f64,
    pub width: usize,
    pub height: usize,
    pub epsg: i32,
}

impl GridSpec {
    pub fn new(
        origin_x: f64,
        origin_y: f64,
        pixel_width: f64,
        pixel_height: f64,
        width: usize,
        height: usize,
        epsg: i32,
    ) -> Self {
        GridSpec {
            origin_x,
            origin_y,
            pixel_width,
            pixel_height,
            width,
            height,
            epsg,
        }
    }

    /// Grid of `scale`-sized cells covering `bbox`, at least one cell wide
    ///
    /// `scale` is in metres; for geographic grids it is converted to degrees
    /// at the latitude of the box centre.
    pub fn covering(bbox: &BoundingBox, scale: f64, epsg: i32) -> Result<Self> {
        if !(scale.is_finite() && scale > 0.0) {
            return Err(ClassificationError::InvalidParameter(format!(
                "scale must be positive, got {}",
                scale
            )));
        }
        let (pixel_width, pixel_height) = if is_geographic(epsg) {
            meters_to_degrees(scale, bbox.center().y())
        } else {
            (scale, scale)
        };
        let width = ((bbox.width() / pixel_width).ceil() as usize).max(1);
        let height = ((bbox.height() / pixel_height).ceil() as usize).max(1);
        Ok(GridSpec::new(
            bbox.min_x,
            bbox.max_y,
            pixel_width,
            pixel_height,
            width,
            height,
            epsg,
        ))
    }

    pub fn len(&self) -> usize {
        self.width * self.height
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn index(&self, row: usize, col: usize) -> usize {
        row * self.width + col
    }

    pub fn extent(&self) -> BoundingBox {
        BoundingBox::new(
            self.origin_x,
            self.origin_y - self.height as f64 * self.pixel_height,
            self.origin_x + self.width as f64 * self.pixel_width,
            self.origin_y,
        )
    }

    pub fn footprint(&self) -> Polygon<f64> {
        self.extent().to_polygon()
    }

    pub fn cell_center(&self, row: usize, col: usize) -> Point<f64> {
        Point::new(
            self.origin_x + (col as f64 + 0.5) * self.pixel_width,
            self.origin_y - (row as f64 + 0.5) * self.pixel_height,
        )
    }

    /// Cell containing a location, `None` outside the grid
    pub fn cell_of(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        let col = ((x - self.origin_x) / self.pixel_width).floor();
        let row = ((self.origin_y - y) / self.pixel_height).floor();
        if !(col.is_finite() && row.is_finite()) || col < 0.0 || row < 0.0 {
            return None;
        }
        let (row, col) = (row as usize, col as usize);
        if row >= self.height || col >= self.width {
            return None;
        }
        Some((row, col))
    }

    /// Pixel size of a grid resampled at `scale` metres
    pub fn pixel_size_at(&self, scale: f64) -> (f64, f64) {
        if is_geographic(self.epsg) {
            meters_to_degrees(scale, self.extent().center().y())
        } else {
            (scale, scale)
        }
    }

    /// Same extent, `scale`-sized cells
    pub fn resampled(&self, scale: f64) -> Result<GridSpec> {
        GridSpec::covering(&self.extent(), scale, self.epsg)
    }

    /// GDAL-style geotransform
    pub fn geo_transform(&self) -> [f64; 6] {
        [
            self.origin_x,
            self.pixel_width,
            0.0,
            self.origin_y,
            0.0,
            -self.pixel_height,
        ]
    }
}

/// One named band, NaN marks nodata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Band {
    pub name: String,
    pub data: Vec<f32>,
}

/// Multi-band raster with raster-level JSON properties
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    grid: GridSpec,
    bands: Vec<Band>,
    properties: Map<String, Value>,
}

impl Raster {
    pub fn new(grid: GridSpec) -> Self {
        Raster {
            grid,
            bands: Vec::new(),
            properties: Map::new(),
        }
    }

    pub fn with_band(mut self, name: &str, data: Vec<f32>) -> Result<Self> {
        self.add_band(name, data)?;
        Ok(self)
    }

    pub fn add_band(&mut self, name: &str, data: Vec<f32>) -> Result<()> {
        if data.len() != self.grid.len() {
            return Err(ClassificationError::InvalidParameter(format!(
                "band '{}' has {} values, grid has {} cells",
                name,
                data.len(),
                self.grid.len()
            )));
        }
        if self.band_index(name).is_some() {
            return Err(ClassificationError::BandMismatch(format!(
                "band '{}' already present",
                name
            )));
        }
        self.bands.push(Band {
            name: name.to_string(),
            data,
        });
        Ok(())
    }

    pub fn grid(&self) -> &GridSpec {
        &self.grid
    }

    pub fn bands(&self) -> &[Band] {
        &self.bands
    }

    pub fn band_names(&self) -> Vec<String> {
        self.bands.iter().map(|b| b.name.clone()).collect()
    }

    pub fn band_index(&self, name: &str) -> Option<usize> {
        self.bands.iter().position(|b| b.name == name)
    }

    pub fn band(&self, name: &str) -> Option<&Band> {
        self.bands.iter().find(|b| b.name == name)
    }

    pub fn properties(&self) -> &Map<String, Value> {
        &self.properties
    }

    pub fn set_property(&mut self, key: &str, value: Value) {
        self.properties.insert(key.to_string(), value);
    }

    pub fn get_property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub fn set_properties(&mut self, properties: Map<String, Value>) {
        self.properties = properties;
    }

    /// Keep only `names`, in that order
    pub fn select(&self, names: &[String]) -> Result<Raster> {
        let mut selected = Raster::new(self.grid);
        selected.properties = self.properties.clone();
        for name in names {
            let band = self.band(name).ok_or_else(|| {
                ClassificationError::BandMismatch(format!(
                    "band '{}' not in raster (available: {:?})",
                    name,
                    self.band_names()
                ))
            })?;
            selected.add_band(name, band.data.clone())?;
        }
        Ok(selected)
    }

    /// Value of the pixel containing the location, `None` outside the grid or on nodata
    pub fn value_at(&self, band: usize, point: &Point<f64>) -> Option<f32> {
        let (row, col) = self.grid.cell_of(point.x(), point.y())?;
        let value = self.bands.get(band)?.data[self.grid.index(row, col)];
        value.is_finite().then_some(value)
    }

    /// Value read at a resolution of `scale` metres
    ///
    /// Nearest pixel when `scale` does not exceed the native pixel size,
    /// otherwise the mean of the valid pixels whose centres fall inside the
    /// `scale`-wide window around the location. The pixel under the location
    /// must be valid in both cases.
    pub fn sample_at(&self, band: usize, point: &Point<f64>, scale: f64) -> Option<f32> {
        let nearest = self.value_at(band, point)?;
        let (win_w, win_h) = self.grid.pixel_size_at(scale);
        if win_w <= self.grid.pixel_width * 1.0001 && win_h <= self.grid.pixel_height * 1.0001 {
            return Some(nearest);
        }
        let g = &self.grid;
        let data = &self.bands[band].data;
        let col_lo = ((point.x() - win_w / 2.0 - g.origin_x) / g.pixel_width - 0.5).ceil();
        let col_hi = ((point.x() + win_w / 2.0 - g.origin_x) / g.pixel_width - 0.5).floor();
        let row_lo = ((g.origin_y - point.y() - win_h / 2.0) / g.pixel_height - 0.5).ceil();
        let row_hi = ((g.origin_y - point.y() + win_h / 2.0) / g.pixel_height - 0.5).floor();
        let col_lo = col_lo.max(0.0) as usize;
        let row_lo = row_lo.max(0.0) as usize;
        let col_hi = col_hi.min(g.width as f64 - 1.0);
        let row_hi = row_hi.min(g.height as f64 - 1.0);
        if col_hi < 0.0 || row_hi < 0.0 {
            return Some(nearest);
        }

        let mut sum = 0.0f64;
        let mut count = 0usize;
        for row in row_lo..=(row_hi as usize) {
            for col in col_lo..=(col_hi as usize) {
                let v = data[g.index(row, col)];
                if v.is_finite() {
                    sum += v as f64;
                    count += 1;
                }
            }
        }
        if count == 0 {
            return Some(nearest);
        }
        Some((sum / count as f64) as f32)
    }

    /// A pixel is valid when every band holds a finite value
    pub fn is_valid(&self, row: usize, col: usize) -> bool {
        let idx = self.grid.index(row, col);
        !self.bands.is_empty() && self.bands.iter().all(|b| b.data[idx].is_finite())
    }

    pub fn valid_count(&self) -> usize {
        (0..self.grid.height)
            .flat_map(|row| (0..self.grid.width).map(move |col| (row, col)))
            .filter(|&(row, col)| self.is_valid(row, col))
            .count()
    }

    /// Bounding box of the valid pixels, `None` when the raster is all nodata
    pub fn valid_extent(&self) -> Option<BoundingBox> {
        let g = &self.grid;
        let mut bounds: Option<(usize, usize, usize, usize)> = None;
        for row in 0..g.height {
            for col in 0..g.width {
                if !self.is_valid(row, col) {
                    continue;
                }
                bounds = Some(match bounds {
                    None => (row, row, col, col),
                    Some((r0, r1, c0, c1)) => (r0.min(row), r1.max(row), c0.min(col), c1.max(col)),
                });
            }
        }
        let (r0, r1, c0, c1) = bounds?;
        Some(BoundingBox::new(
            g.origin_x + c0 as f64 * g.pixel_width,
            g.origin_y - (r1 + 1) as f64 * g.pixel_height,
            g.origin_x + (c1 + 1) as f64 * g.pixel_width,
            g.origin_y - r0 as f64 * g.pixel_height,
        ))
    }

    /// Pixels whose centre lies outside `footprint` become nodata
    pub fn clip_to(&self, footprint: &Polygon<f64>) -> Raster {
        let mut clipped = self.clone();
        let g = self.grid;
        for row in 0..g.height {
            for col in 0..g.width {
                if footprint.contains(&g.cell_center(row, col)) {
                    continue;
                }
                let idx = g.index(row, col);
                for band in clipped.bands.iter_mut() {
                    band.data[idx] = f32::NAN;
                }
            }
        }
        clipped
    }

    /// Nearest-neighbour resampling to `scale`-sized cells over the same extent
    pub fn resample_nearest(&self, scale: f64) -> Result<Raster> {
        let target = self.grid.resampled(scale)?;
        self.warp_nearest(target)
    }

    /// Nearest-neighbour copy onto another grid of the same CRS
    pub fn warp_nearest(&self, target: GridSpec) -> Result<Raster> {
        if target.epsg != self.grid.epsg {
            return Err(ClassificationError::CrsMismatch {
                expected: self.grid.epsg,
                found: target.epsg,
            });
        }
        let mut warped = Raster::new(target);
        warped.properties = self.properties.clone();
        for band in &self.bands {
            let mut data = vec![f32::NAN; target.len()];
            for row in 0..target.height {
                for col in 0..target.width {
                    let center = target.cell_center(row, col);
                    if let Some((r, c)) = self.grid.cell_of(center.x(), center.y()) {
                        data[target.index(row, col)] = band.data[self.grid.index(r, c)];
                    }
                }
            }
            warped.add_band(&band.name, data)?;
        }
        Ok(warped)
    }

    /// Sub-grid of the pixels touching `bbox`, at least one pixel
    pub fn crop(&self, bbox: &BoundingBox) -> Result<Raster> {
        let g = &self.grid;
        let area = g.extent().intersection(bbox).ok_or_else(|| {
            ClassificationError::InvalidParameter(format!(
                "crop box {:?} does not overlap raster extent {:?}",
                bbox,
                g.extent()
            ))
        })?;
        let col0 = (((area.min_x - g.origin_x) / g.pixel_width).floor().max(0.0) as usize)
            .min(g.width - 1);
        let row0 = (((g.origin_y - area.max_y) / g.pixel_height).floor().max(0.0) as usize)
            .min(g.height - 1);
        let col1 = (((area.max_x - g.origin_x) / g.pixel_width).ceil() as usize)
            .clamp(col0 + 1, g.width);
        let row1 = (((g.origin_y - area.min_y) / g.pixel_height).ceil() as usize)
            .clamp(row0 + 1, g.height);

        let target = GridSpec::new(
            g.origin_x + col0 as f64 * g.pixel_width,
            g.origin_y - row0 as f64 * g.pixel_height,
            g.pixel_width,
            g.pixel_height,
            col1 - col0,
            row1 - row0,
            g.epsg,
        );
        let mut cropped = Raster::new(target);
        cropped.properties = self.properties.clone();
        for band in &self.bands {
            let mut data = Vec::with_capacity(target.len());
            for row in row0..row1 {
                let start = g.index(row, col0);
                data.extend_from_slice(&band.data[start..start + target.width]);
            }
            cropped.add_band(&band.name, data)?;
        }
        Ok(cropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_4x3() -> GridSpec {
        GridSpec::new(100.0, 200.0, 10.0, 10.0, 4, 3, 32610)
    }

    #[test]
    fn test_grid_cell_lookup() {
        let grid = grid_4x3();
        assert_eq!(grid.cell_of(100.0, 200.0), Some((0, 0)));
        assert_eq!(grid.cell_of(139.9, 170.1), Some((2, 3)));
        assert_eq!(grid.cell_of(140.0, 190.0), None);
        assert_eq!(grid.cell_of(99.0, 190.0), None);
        let center = grid.cell_center(1, 2);
        assert_eq!((center.x(), center.y()), (125.0, 185.0));
    }

    #[test]
    fn test_grid_extent() {
        let extent = grid_4x3().extent();
        assert_eq!(extent, BoundingBox::new(100.0, 170.0, 140.0, 200.0));
    }

    #[test]
    fn test_grid_covering_projected() {
        let grid = GridSpec::covering(&BoundingBox::new(0.0, 0.0, 95.0, 60.0), 30.0, 32610).unwrap();
        assert_eq!((grid.width, grid.height), (4, 2));
        assert!(GridSpec::covering(&BoundingBox::new(0.0, 0.0, 1.0, 1.0), 0.0, 32610).is_err());
    }

    #[test]
    fn test_add_band_checks_length() {
        let raster = Raster::new(grid_4x3());
        assert!(raster.clone().with_band("B1", vec![0.0; 12]).is_ok());
        assert!(raster.with_band("B1", vec![0.0; 11]).is_err());
    }

    #[test]
    fn test_select_keeps_requested_order() {
        let raster = Raster::new(grid_4x3())
            .with_band("B1", vec![1.0; 12])
            .unwrap()
            .with_band("B2", vec![2.0; 12])
            .unwrap();
        let selected = raster
            .select(&["B2".to_string(), "B1".to_string()])
            .unwrap();
        assert_eq!(selected.band_names(), vec!["B2", "B1"]);
        assert!(raster.select(&["B9".to_string()]).is_err());
    }

    #[test]
    fn test_value_at_skips_nodata() {
        let mut data = vec![1.0; 12];
        data[0] = f32::NAN;
        let raster = Raster::new(grid_4x3()).with_band("B1", data).unwrap();
        assert_eq!(raster.value_at(0, &Point::new(105.0, 195.0)), None);
        assert_eq!(raster.value_at(0, &Point::new(115.0, 195.0)), Some(1.0));
        assert!(!raster.is_valid(0, 0));
        assert_eq!(raster.valid_count(), 11);
    }

    #[test]
    fn test_sample_at_window_mean() {
        let data: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let raster = Raster::new(grid_4x3()).with_band("B1", data).unwrap();
        let p = raster.grid().cell_center(1, 1);
        assert_eq!(raster.sample_at(0, &p, 10.0), Some(5.0));
        // 30 m window around the centre of cell (1,1) covers rows 0..=2, cols 0..=2
        let mean = raster.sample_at(0, &p, 30.0).unwrap();
        assert!((mean - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_valid_extent() {
        let mut data = vec![f32::NAN; 12];
        data[5] = 1.0;
        data[6] = 1.0;
        let raster = Raster::new(grid_4x3()).with_band("B1", data).unwrap();
        assert_eq!(
            raster.valid_extent(),
            Some(BoundingBox::new(110.0, 180.0, 130.0, 190.0))
        );
    }

    #[test]
    fn test_clip_to_footprint() {
        let raster = Raster::new(grid_4x3()).with_band("B1", vec![1.0; 12]).unwrap();
        let footprint = BoundingBox::new(100.0, 170.0, 120.0, 200.0).to_polygon();
        let clipped = raster.clip_to(&footprint);
        assert_eq!(clipped.valid_count(), 6);
    }

    #[test]
    fn test_resample_and_crop() {
        let data: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let raster = Raster::new(grid_4x3()).with_band("B1", data).unwrap();
        let coarse = raster.resample_nearest(20.0).unwrap();
        assert_eq!((coarse.grid().width, coarse.grid().height), (2, 2));
        assert_eq!(coarse.bands()[0].data[0], 5.0);

        let cropped = raster.crop(&BoundingBox::new(111.0, 181.0, 111.0, 181.0)).unwrap();
        assert_eq!((cropped.grid().width, cropped.grid().height), (1, 1));
        assert_eq!(cropped.bands()[0].data, vec![5.0]);
    }
}
