//! Static elevation tiles, with slope and aspect derived on the native grid.
//!
//! Aspect is circular, so it is stored as its `northness` (cosine) and
//! `eastness` (sine) components; both average linearly during regridding and
//! the mean aspect of a cell is `atan2(eastness, northness)`.

use camino::Utf8PathBuf;
use tracing::{info, warn};

use crate::crs::Crs;
use crate::domain::{DateRange, SourceKind, VariableName};
use crate::error::FiregridError;
use crate::grid::Extent;
use crate::raster::NativeRaster;
use crate::sources::geotiff::{read_geotiff, read_geotiff_extent};
use crate::sources::{NativePayload, NativeUnit, SourceAdapter, list_tiffs};

const METERS_PER_DEGREE_LAT: f64 = 110_540.0;
const METERS_PER_DEGREE_LON: f64 = 111_320.0;

/// Gradient magnitude below which a pixel has no meaningful aspect.
const FLAT_GRADIENT: f64 = 1.745e-4;

#[derive(Debug, Clone)]
pub struct StaticRasterSource {
    name: String,
    root: Utf8PathBuf,
    crs: Crs,
    resolution: f64,
    variable: VariableName,
    derive_terrain: bool,
}

impl StaticRasterSource {
    pub fn new(
        name: String,
        root: Utf8PathBuf,
        crs: Crs,
        resolution: f64,
        variable: Option<VariableName>,
    ) -> Self {
        let variable = variable.unwrap_or_else(elevation_variable);
        Self {
            name,
            root,
            crs,
            resolution,
            variable,
            derive_terrain: false,
        }
    }

    pub fn with_derived_terrain(mut self, derive: bool) -> Self {
        self.derive_terrain = derive;
        self
    }

    fn tiles(&self) -> Result<Vec<Utf8PathBuf>, FiregridError> {
        if !self.root.is_dir() {
            return Err(FiregridError::SourceUnavailable {
                source_name: self.name.clone(),
                detail: format!("{} is not a directory", self.root),
            });
        }
        list_tiffs(&self.root)
    }
}

fn elevation_variable() -> VariableName {
    VariableName::builtin("elevation")
}

pub fn slope_variable() -> VariableName {
    VariableName::builtin("slope")
}

pub fn northness_variable() -> VariableName {
    VariableName::builtin("northness")
}

pub fn eastness_variable() -> VariableName {
    VariableName::builtin("eastness")
}

impl SourceAdapter for StaticRasterSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Static
    }

    fn native_crs(&self) -> &Crs {
        &self.crs
    }

    fn native_resolution(&self) -> f64 {
        self.resolution
    }

    fn variables(&self) -> Vec<VariableName> {
        let mut variables = vec![self.variable.clone()];
        if self.derive_terrain {
            variables.push(slope_variable());
            variables.push(northness_variable());
            variables.push(eastness_variable());
        }
        variables
    }

    fn cadence_days(&self) -> u32 {
        0
    }

    fn extent(&self) -> Result<Option<Extent>, FiregridError> {
        let mut extent: Option<Extent> = None;
        for path in self.tiles()? {
            let tile = read_geotiff_extent(&path)?;
            extent = Some(match extent {
                Some(current) => current.union(&tile),
                None => tile,
            });
        }
        Ok(extent)
    }

    /// Static data ignores the range; every tile is returned.
    fn read(&self, _range: &DateRange) -> Result<Vec<NativeUnit>, FiregridError> {
        let tiles = self.tiles()?;
        let mut dems = Vec::with_capacity(tiles.len());
        for path in &tiles {
            match read_geotiff(path, &self.crs) {
                Ok(dem) => dems.push(dem),
                Err(err) => warn!(source = %self.name, %path, "skipping unreadable tile: {err}"),
            }
        }
        if dems.is_empty() {
            return Err(FiregridError::SourceUnavailable {
                source_name: self.name.clone(),
                detail: format!("no readable tiles in {}", self.root),
            });
        }

        let mut units = Vec::with_capacity(dems.len() * 4);
        if self.derive_terrain {
            for (i, dem) in dems.iter().enumerate() {
                let neighbors: Vec<&NativeRaster> = dems
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .map(|(_, other)| other)
                    .collect();
                let (slope, aspect) = horn_slope_aspect(&pad_from_neighbors(dem, &neighbors));
                let (northness, eastness) = aspect_components(&crop_frame(&aspect));
                units.push(static_unit(slope_variable(), crop_frame(&slope)));
                units.push(static_unit(northness_variable(), northness));
                units.push(static_unit(eastness_variable(), eastness));
            }
        }
        info!(source = %self.name, tiles = dems.len(), "read terrain tiles");
        units.extend(
            dems.into_iter()
                .map(|dem| static_unit(self.variable.clone(), dem)),
        );
        Ok(units)
    }
}

fn static_unit(variable: VariableName, raster: NativeRaster) -> NativeUnit {
    NativeUnit {
        date: None,
        variable,
        payload: NativePayload::Raster(raster),
    }
}

/// Pixel size in meters at a given row; geographic rasters shrink with latitude.
fn cell_size_m(dem: &NativeRaster, row: usize) -> (f64, f64) {
    if dem.crs.is_geographic() {
        let (_, lat) = dem.pixel_center(0, row);
        (
            dem.pixel_width * METERS_PER_DEGREE_LON * lat.to_radians().cos(),
            dem.pixel_height * METERS_PER_DEGREE_LAT,
        )
    } else {
        (dem.pixel_width, dem.pixel_height)
    }
}

/// Slope (degrees) and downslope aspect (degrees clockwise from north) with
/// Horn's 3x3 gradient. Edge pixels and pixels with an invalid neighbor are invalid.
pub fn horn_slope_aspect(dem: &NativeRaster) -> (NativeRaster, NativeRaster) {
    let n = dem.width * dem.height;
    let mut slope = vec![f64::NAN; n];
    let mut aspect = vec![f64::NAN; n];

    if dem.width >= 3 && dem.height >= 3 {
        for r in 1..dem.height - 1 {
            let (dx, dy) = cell_size_m(dem, r);
            for c in 1..dem.width - 1 {
                let window = [
                    dem.get(c - 1, r - 1),
                    dem.get(c, r - 1),
                    dem.get(c + 1, r - 1),
                    dem.get(c - 1, r),
                    dem.get(c + 1, r),
                    dem.get(c - 1, r + 1),
                    dem.get(c, r + 1),
                    dem.get(c + 1, r + 1),
                ];
                let Some([nw, north, ne, w, e, sw, south, se]) = collect_window(window) else {
                    continue;
                };
                let dz_dx = ((ne + 2.0 * e + se) - (nw + 2.0 * w + sw)) / (8.0 * dx);
                let dz_dy = ((nw + 2.0 * north + ne) - (sw + 2.0 * south + se)) / (8.0 * dy);
                let magnitude = (dz_dx * dz_dx + dz_dy * dz_dy).sqrt();
                let i = dem.index(c, r);
                slope[i] = magnitude.atan().to_degrees();
                if magnitude >= FLAT_GRADIENT {
                    aspect[i] = (-dz_dx).atan2(-dz_dy).to_degrees().rem_euclid(360.0);
                }
            }
        }
    }

    let derive = |values: Vec<f64>| {
        NativeRaster::new(
            dem.crs.clone(),
            (dem.origin_x, dem.origin_y),
            (dem.pixel_width, dem.pixel_height),
            dem.width,
            dem.height,
            values,
        )
    };
    (derive(slope), derive(aspect))
}

/// Copy of `dem` with a one-pixel frame filled from adjacent tiles, so Horn's
/// window reaches across tile seams. Frame pixels no tile covers stay invalid.
pub fn pad_from_neighbors(dem: &NativeRaster, neighbors: &[&NativeRaster]) -> NativeRaster {
    let (width, height) = (dem.width + 2, dem.height + 2);
    let mut padded = NativeRaster::new(
        dem.crs.clone(),
        (dem.origin_x - dem.pixel_width, dem.origin_y + dem.pixel_height),
        (dem.pixel_width, dem.pixel_height),
        width,
        height,
        vec![f64::NAN; width * height],
    );
    for row in 0..height {
        for col in 0..width {
            let interior = (1..=dem.width).contains(&col) && (1..=dem.height).contains(&row);
            let value = if interior {
                dem.get(col - 1, row - 1)
            } else {
                let (x, y) = padded.pixel_center(col, row);
                neighbors.iter().find_map(|tile| tile.sample_nearest(x, y))
            };
            if let Some(value) = value {
                let i = padded.index(col, row);
                padded.values[i] = value;
                padded.valid[i] = true;
            }
        }
    }
    padded
}

/// Drops the one-pixel frame added by [`pad_from_neighbors`].
fn crop_frame(raster: &NativeRaster) -> NativeRaster {
    let (width, height) = (raster.width - 2, raster.height - 2);
    let values = (1..=height)
        .flat_map(|row| (1..=width).map(move |col| (col, row)))
        .map(|(col, row)| raster.get(col, row).unwrap_or(f64::NAN))
        .collect();
    NativeRaster::new(
        raster.crs.clone(),
        (
            raster.origin_x + raster.pixel_width,
            raster.origin_y - raster.pixel_height,
        ),
        (raster.pixel_width, raster.pixel_height),
        width,
        height,
        values,
    )
}

/// Splits an aspect raster (degrees clockwise from north) into its cosine and
/// sine components.
pub fn aspect_components(aspect: &NativeRaster) -> (NativeRaster, NativeRaster) {
    let component = |f: fn(f64) -> f64| {
        let values = (0..aspect.height)
            .flat_map(|row| (0..aspect.width).map(move |col| (col, row)))
            .map(|(col, row)| {
                aspect
                    .get(col, row)
                    .map_or(f64::NAN, |degrees| f(degrees.to_radians()))
            })
            .collect();
        NativeRaster::new(
            aspect.crs.clone(),
            (aspect.origin_x, aspect.origin_y),
            (aspect.pixel_width, aspect.pixel_height),
            aspect.width,
            aspect.height,
            values,
        )
    };
    (component(f64::cos), component(f64::sin))
}

fn collect_window(window: [Option<f64>; 8]) -> Option<[f64; 8]> {
    let mut out = [0.0; 8];
    for (slot, value) in out.iter_mut().zip(window) {
        *slot = value?;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::raster::StatBundle;

    fn plane(f: impl Fn(usize, usize) -> f64) -> NativeRaster {
        let utm: Crs = "EPSG:32611".parse().unwrap();
        let values = (0..25).map(|i| f(i % 5, i / 5)).collect();
        NativeRaster::new(utm, (0.0, 150.0), (30.0, 30.0), 5, 5, values)
    }

    #[test]
    fn east_rising_plane_faces_west() {
        // Rises 30 m per 30 m pixel eastward: 45 degrees, downslope to the west.
        let dem = plane(|c, _| c as f64 * 30.0);
        let (slope, aspect) = horn_slope_aspect(&dem);
        assert_abs_diff_eq!(slope.get(2, 2).unwrap(), 45.0, epsilon = 1e-9);
        assert_abs_diff_eq!(aspect.get(2, 2).unwrap(), 270.0, epsilon = 1e-9);
        assert!(slope.get(0, 2).is_none());
    }

    #[test]
    fn flat_plane_has_no_aspect() {
        let dem = plane(|_, _| 100.0);
        let (slope, aspect) = horn_slope_aspect(&dem);
        assert_eq!(slope.get(2, 2), Some(0.0));
        assert!(aspect.get(2, 2).is_none());
    }

    #[test]
    fn south_rising_plane_faces_north() {
        // Row index grows southward, so elevation rising with the row rises south.
        let dem = plane(|_, r| r as f64 * 10.0);
        let (_, aspect) = horn_slope_aspect(&dem);
        let value = aspect.get(2, 2).unwrap();
        assert!(value < 1e-9 || (360.0 - value) < 1e-9);
    }

    #[test]
    fn aspect_straddling_north_averages_to_north() {
        let utm: Crs = "EPSG:32611".parse().unwrap();
        let aspect = NativeRaster::new(
            utm,
            (0.0, 30.0),
            (30.0, 30.0),
            4,
            1,
            vec![350.0, 10.0, 355.0, 5.0],
        );
        let (northness, eastness) = aspect_components(&aspect);
        let mut north: Vec<f64> = northness.values.clone();
        let mut east: Vec<f64> = eastness.values.clone();
        let north = StatBundle::from_samples(&mut north).unwrap();
        let east = StatBundle::from_samples(&mut east).unwrap();
        assert!(north.mean > 0.99);
        assert_abs_diff_eq!(east.mean, 0.0, epsilon = 1e-12);
        let mean_aspect = east.mean.atan2(north.mean).to_degrees().rem_euclid(360.0);
        assert!(mean_aspect < 1e-6 || 360.0 - mean_aspect < 1e-6, "{mean_aspect}");
    }

    #[test]
    fn slope_is_continuous_across_tile_seams() {
        let utm: Crs = "EPSG:32611".parse().unwrap();
        // Two 4 x 5 tiles side by side on a plane rising 30 m per 30 m eastward.
        let tile = |first_col: usize| {
            let values = (0..20)
                .map(|i| (first_col + i % 4) as f64 * 30.0)
                .collect();
            NativeRaster::new(
                utm.clone(),
                (first_col as f64 * 30.0, 150.0),
                (30.0, 30.0),
                4,
                5,
                values,
            )
        };
        let (west, east) = (tile(0), tile(4));

        let (slope, aspect) = horn_slope_aspect(&pad_from_neighbors(&west, &[&east]));
        let (slope, aspect) = (crop_frame(&slope), crop_frame(&aspect));
        assert_eq!((slope.width, slope.height), (4, 5));
        assert_abs_diff_eq!(slope.get(3, 2).unwrap(), 45.0, epsilon = 1e-9);
        assert_abs_diff_eq!(aspect.get(3, 2).unwrap(), 270.0, epsilon = 1e-9);
        // The western edge has no neighbor tile.
        assert!(slope.get(0, 2).is_none());

        let (slope, _) = horn_slope_aspect(&pad_from_neighbors(&east, &[&west]));
        assert_abs_diff_eq!(crop_frame(&slope).get(0, 2).unwrap(), 45.0, epsilon = 1e-9);
    }
}
