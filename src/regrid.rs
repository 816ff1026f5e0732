//! Reprojection of native rasters onto the target grid.
//!
//! Fine rasters are aggregated: every valid native pixel center is transformed
//! into the target CRS and pooled into the cell that contains it, and each cell
//! with at least one sample gets a [`StatBundle`]. Rasters coarser than the grid
//! are sampled instead: each target cell center is transformed back into the
//! native CRS and takes the containing pixel's value as a degenerate bundle.

use std::sync::Arc;

use chrono::NaiveDate;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::crs::CrsTransform;
use crate::domain::VariableName;
use crate::error::FiregridError;
use crate::grid::GridSpec;
use crate::raster::{CellValue, NativeRaster, RasterLayer, StatBundle};

/// Per-source choice between full sub-grid statistics and a mean-only value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatisticsMode {
    #[default]
    Bundle,
    Scalar,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegridReport {
    /// Valid native pixels (or target cells, when sampling) that were transformed.
    pub points: usize,
    pub failed_points: usize,
    pub nearest_neighbor: bool,
}

pub struct Regridder {
    grid: Arc<GridSpec>,
    mode: StatisticsMode,
}

impl Regridder {
    pub fn new(grid: Arc<GridSpec>, mode: StatisticsMode) -> Self {
        Self { grid, mode }
    }

    pub fn grid(&self) -> &Arc<GridSpec> {
        &self.grid
    }

    pub fn regrid(
        &self,
        native: &NativeRaster,
        variable: &VariableName,
        date: Option<NaiveDate>,
    ) -> Result<RasterLayer, FiregridError> {
        self.regrid_tiles(&[native], variable, date)
            .map(|(layer, _)| layer)
    }

    /// Regrids several rasters of one (variable, date) into a single layer; their
    /// samples are pooled before statistics are computed.
    pub fn regrid_tiles(
        &self,
        tiles: &[&NativeRaster],
        variable: &VariableName,
        date: Option<NaiveDate>,
    ) -> Result<(RasterLayer, RegridReport), FiregridError> {
        let cells = self.grid.cell_count();
        let mut samples: Vec<Vec<f64>> = vec![Vec::new(); cells];
        let mut nearest: Vec<Option<f64>> = vec![None; cells];
        let mut report = RegridReport::default();

        for tile in tiles {
            let forward = CrsTransform::new(&tile.crs, &self.grid.crs)?;
            let pixel_size = native_pixel_size(tile, &forward)?;
            if pixel_size > self.grid.resolution {
                debug!(%variable, pixel_size, "native pixels coarser than grid; sampling nearest");
                report.nearest_neighbor = true;
                self.sample_nearest(tile, &forward, &mut nearest, &mut report)?;
            } else {
                self.accumulate(tile, &mut samples, &mut report)?;
            }
        }
        if report.failed_points > 0 {
            warn!(
                %variable,
                failed = report.failed_points,
                points = report.points,
                "skipped points that failed to transform"
            );
        }

        let mode = self.mode;
        let values: Vec<Option<CellValue>> = samples
            .into_par_iter()
            .zip(nearest.into_par_iter())
            .map(|(mut pool, sampled)| {
                let bundle = StatBundle::from_samples(&mut pool)
                    .or_else(|| sampled.map(StatBundle::degenerate))?;
                Some(match mode {
                    StatisticsMode::Bundle => CellValue::Stats(bundle),
                    StatisticsMode::Scalar => CellValue::Scalar(bundle.mean),
                })
            })
            .collect();

        Ok((
            RasterLayer {
                variable: variable.clone(),
                date,
                grid: Arc::clone(&self.grid),
                cells: values,
            },
            report,
        ))
    }

    fn accumulate(
        &self,
        tile: &NativeRaster,
        samples: &mut [Vec<f64>],
        report: &mut RegridReport,
    ) -> Result<(), FiregridError> {
        let grid = &self.grid;
        let rows: Vec<(Vec<(usize, f64)>, usize, usize)> = (0..tile.height)
            .into_par_iter()
            .map_init(
                || CrsTransform::new(&tile.crs, &grid.crs).ok(),
                |transform, row| {
                    let mut hits = Vec::new();
                    let mut points = 0;
                    let mut failed = 0;
                    for col in 0..tile.width {
                        let Some(value) = tile.get(col, row) else {
                            continue;
                        };
                        points += 1;
                        let (x, y) = tile.pixel_center(col, row);
                        match transform.as_ref().map(|t| t.transform(x, y)) {
                            Some(Ok((tx, ty))) => {
                                if let Some(cell) = grid.locate(tx, ty) {
                                    hits.push((cell, value));
                                }
                            }
                            _ => failed += 1,
                        }
                    }
                    (hits, points, failed)
                },
            )
            .collect();

        let mut points = 0;
        let mut failed = 0;
        for (hits, row_points, row_failed) in rows {
            points += row_points;
            failed += row_failed;
            for (cell, value) in hits {
                samples[cell].push(value);
            }
        }
        report.points += points;
        report.failed_points += failed;
        if points > 0 && failed == points {
            return Err(FiregridError::Reprojection(format!(
                "no pixel of a {} raster could be transformed into {}",
                tile.crs, grid.crs
            )));
        }
        Ok(())
    }

    fn sample_nearest(
        &self,
        tile: &NativeRaster,
        forward: &CrsTransform,
        nearest: &mut [Option<f64>],
        report: &mut RegridReport,
    ) -> Result<(), FiregridError> {
        let grid = &self.grid;
        CrsTransform::new(&grid.crs, &tile.crs)?;
        let Some(candidates) = covered_cells(grid, tile, forward) else {
            return Ok(());
        };
        let sampled: Vec<(usize, Option<f64>, bool)> = candidates
            .into_par_iter()
            .map_init(
                || CrsTransform::new(&grid.crs, &tile.crs).ok(),
                |inverse, cell| {
                    let (x, y) = grid.cell_center(cell);
                    match inverse.as_ref().map(|t| t.transform(x, y)) {
                        Some(Ok((nx, ny))) => (cell, tile.sample_nearest(nx, ny), false),
                        _ => (cell, None, true),
                    }
                },
            )
            .collect();

        let points = sampled.len();
        let mut failed = 0;
        for (cell, value, did_fail) in sampled {
            if did_fail {
                failed += 1;
            } else if nearest[cell].is_none() {
                nearest[cell] = value;
            }
        }
        report.points += points;
        report.failed_points += failed;
        if points > 0 && failed == points {
            return Err(FiregridError::Reprojection(format!(
                "no cell center could be transformed into {}",
                tile.crs
            )));
        }
        Ok(())
    }
}

/// Side of one native pixel measured in target units at the raster center.
fn native_pixel_size(tile: &NativeRaster, forward: &CrsTransform) -> Result<f64, FiregridError> {
    let (cx, cy) = tile.pixel_center(tile.width / 2, tile.height / 2);
    let origin = forward.transform(cx, cy)?;
    let east = forward.transform(cx + tile.pixel_width, cy)?;
    let south = forward.transform(cx, cy - tile.pixel_height)?;
    let dx = ((east.0 - origin.0).powi(2) + (east.1 - origin.1).powi(2)).sqrt();
    let dy = ((south.0 - origin.0).powi(2) + (south.1 - origin.1).powi(2)).sqrt();
    Ok(dx.max(dy))
}

/// Target cells inside the projected bounds of `tile`, or `None` when the tile
/// misses the grid.
fn covered_cells(
    grid: &GridSpec,
    tile: &NativeRaster,
    forward: &CrsTransform,
) -> Option<Vec<usize>> {
    let bounds = tile.extent().transformed(forward).ok()?;
    let r = grid.resolution;
    let col_min = ((bounds.min_x - grid.origin_x) / r).floor().max(0.0) as i64;
    let col_max = (((bounds.max_x - grid.origin_x) / r).floor() as i64).min(grid.width as i64 - 1);
    let row_min = ((grid.origin_y - bounds.max_y) / r).floor().max(0.0) as i64;
    let row_max =
        (((grid.origin_y - bounds.min_y) / r).floor() as i64).min(grid.height as i64 - 1);
    if col_min > col_max || row_min > row_max {
        return None;
    }
    let mut cells = Vec::with_capacity(((col_max - col_min + 1) * (row_max - row_min + 1)) as usize);
    for row in row_min..=row_max {
        for col in col_min..=col_max {
            cells.push(grid.cell_index(col as usize, row as usize));
        }
    }
    Some(cells)
}

/// Moves a layer onto `grid`. A layer already on that grid comes back unchanged.
pub fn regrid_layer(layer: &RasterLayer, grid: &Arc<GridSpec>) -> Result<RasterLayer, FiregridError> {
    if Arc::ptr_eq(&layer.grid, grid) || *layer.grid == **grid {
        return Ok(RasterLayer {
            grid: Arc::clone(grid),
            ..layer.clone()
        });
    }
    let source = &layer.grid;
    let values = layer
        .cells
        .iter()
        .map(|cell| cell.map(|value| value.mean()).unwrap_or(f64::NAN))
        .collect();
    let native = NativeRaster::new(
        source.crs.clone(),
        (source.origin_x, source.origin_y),
        (source.resolution, source.resolution),
        source.width,
        source.height,
        values,
    );
    let mode = match layer.cells.iter().flatten().next() {
        Some(CellValue::Scalar(_)) => StatisticsMode::Scalar,
        _ => StatisticsMode::Bundle,
    };
    Regridder::new(Arc::clone(grid), mode).regrid(&native, &layer.variable, layer.date)
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::crs::Crs;
    use crate::grid::Extent;

    fn utm() -> Crs {
        "EPSG:32611".parse().unwrap()
    }

    fn grid(resolution: f64, size: f64) -> Arc<GridSpec> {
        Arc::new(GridSpec::new(utm(), resolution, Extent::new(0.0, 0.0, size, size)).unwrap())
    }

    fn var() -> VariableName {
        "elevation".parse().unwrap()
    }

    #[test]
    fn aggregates_fine_pixels_into_bundles() {
        // 4x4 pixels of 10 m onto a 2x2 grid of 20 m cells.
        let values: Vec<f64> = (0..16).map(|i| i as f64).collect();
        let native = NativeRaster::new(utm(), (0.0, 40.0), (10.0, 10.0), 4, 4, values);
        let regridder = Regridder::new(grid(20.0, 40.0), StatisticsMode::Bundle);
        let layer = regridder.regrid(&native, &var(), None).unwrap();
        let Some(CellValue::Stats(bundle)) = layer.get(0) else {
            panic!("expected stats");
        };
        // Top-left cell holds pixels 0, 1, 4, 5.
        assert_eq!(bundle.count, 4);
        assert_eq!(bundle.min, 0.0);
        assert_eq!(bundle.max, 5.0);
        assert_abs_diff_eq!(bundle.mean, 2.5);
        assert_abs_diff_eq!(bundle.median, 2.5);
    }

    #[test]
    fn cells_without_samples_are_invalid() {
        let mut values = vec![1.0; 16];
        for i in [10, 11, 14, 15] {
            values[i] = f64::NAN;
        }
        let native = NativeRaster::new(utm(), (0.0, 40.0), (10.0, 10.0), 4, 4, values);
        let layer = Regridder::new(grid(20.0, 40.0), StatisticsMode::Bundle)
            .regrid(&native, &var(), None)
            .unwrap();
        assert_eq!(layer.valid_count(), 3);
        assert!(!layer.is_valid(3));
    }

    #[test]
    fn coarse_raster_falls_back_to_nearest() {
        let native = NativeRaster::new(utm(), (0.0, 40.0), (40.0, 40.0), 1, 1, vec![9.0]);
        let (layer, report) = Regridder::new(grid(20.0, 40.0), StatisticsMode::Bundle)
            .regrid_tiles(&[&native], &var(), None)
            .unwrap();
        assert!(report.nearest_neighbor);
        assert_eq!(layer.valid_count(), 4);
        let Some(CellValue::Stats(bundle)) = layer.get(3) else {
            panic!("expected stats");
        };
        assert!(bundle.is_degenerate());
        assert_eq!(bundle.count, 1);
    }

    #[test]
    fn scalar_mode_keeps_mean_only() {
        let native = NativeRaster::new(utm(), (0.0, 40.0), (10.0, 10.0), 4, 4, vec![2.0; 16]);
        let layer = Regridder::new(grid(20.0, 40.0), StatisticsMode::Scalar)
            .regrid(&native, &var(), None)
            .unwrap();
        assert_eq!(layer.get(0), Some(&CellValue::Scalar(2.0)));
    }

    #[test]
    fn tiles_are_pooled() {
        let west = NativeRaster::new(utm(), (0.0, 20.0), (10.0, 10.0), 1, 2, vec![1.0, 2.0]);
        let east = NativeRaster::new(utm(), (10.0, 20.0), (10.0, 10.0), 1, 2, vec![3.0, 4.0]);
        let (layer, _) = Regridder::new(grid(20.0, 20.0), StatisticsMode::Bundle)
            .regrid_tiles(&[&west, &east], &var(), None)
            .unwrap();
        let Some(CellValue::Stats(bundle)) = layer.get(0) else {
            panic!("expected stats");
        };
        assert_eq!(bundle.count, 4);
        assert_abs_diff_eq!(bundle.mean, 2.5);
    }

    #[test]
    fn same_grid_is_identity() {
        let values: Vec<f64> = (0..16).map(|i| i as f64 * 0.5).collect();
        let native = NativeRaster::new(utm(), (0.0, 40.0), (10.0, 10.0), 4, 4, values);
        let target = grid(20.0, 40.0);
        let layer = Regridder::new(Arc::clone(&target), StatisticsMode::Bundle)
            .regrid(&native, &var(), None)
            .unwrap();
        let again = regrid_layer(&layer, &target).unwrap();
        assert_eq!(again, layer);
    }
}
