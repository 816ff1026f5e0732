mod common;

use std::sync::Arc;

use approx::assert_abs_diff_eq;

use firegrid::crs::{Crs, HRRR_LCC, MODIS_SINUSOIDAL};
use firegrid::grid::GridSpec;
use firegrid::raster::NativeRaster;
use firegrid::raster::CellValue;
use firegrid::regrid::{Regridder, StatisticsMode, regrid_layer};

use common::*;

fn noisy(col: usize, row: usize) -> f64 {
    ((col * 7919 + row * 104_729) % 97) as f64 / 9.7 - 3.0
}

#[test]
fn every_native_pixel_lands_in_exactly_one_cell() {
    let grid = grid(4, 3);
    let raster = fine_raster(4, 3, noisy);
    let layer = Regridder::new(grid.clone(), StatisticsMode::Bundle)
        .regrid(&raster, &"t2m".parse().unwrap(), Some(doy(1)))
        .unwrap();

    let mut total = 0;
    for cell in &layer.cells {
        let Some(CellValue::Stats(bundle)) = cell else {
            panic!("every cell is covered");
        };
        // (3000 m / 1000 m)^2 native pixels per cell.
        assert_eq!(bundle.count, 9);
        total += bundle.count as usize;
    }
    assert_eq!(total, raster.valid_count());
}

#[test]
fn bundle_fields_are_ordered() {
    let grid = grid(5, 5);
    let raster = fine_raster(5, 5, noisy);
    let layer = Regridder::new(grid, StatisticsMode::Bundle)
        .regrid(&raster, &"vpd".parse().unwrap(), None)
        .unwrap();
    for cell in layer.cells.iter().flatten() {
        let CellValue::Stats(b) = cell else {
            panic!("bundle mode yields bundles");
        };
        assert!(b.min <= b.median && b.median <= b.max, "{b:?}");
        assert!(b.min <= b.mean && b.mean <= b.max, "{b:?}");
        assert!(b.std >= 0.0);
    }
}

#[test]
fn invalid_pixels_do_not_contribute() {
    let grid = grid(2, 1);
    let raster = fine_raster(2, 1, |col, _| if col < 3 { f64::NAN } else { 2.0 });
    let layer = Regridder::new(grid, StatisticsMode::Bundle)
        .regrid(&raster, &"ndvi".parse().unwrap(), None)
        .unwrap();
    assert_eq!(layer.cells[0], None);
    let Some(CellValue::Stats(b)) = layer.cells[1] else {
        panic!("second cell is valid");
    };
    assert_eq!(b.count, 9);
    assert_abs_diff_eq!(b.mean, 2.0);
}

#[test]
fn regridding_onto_the_same_grid_changes_nothing() {
    let grid = grid(3, 3);
    let layer = Regridder::new(grid.clone(), StatisticsMode::Bundle)
        .regrid(&fine_raster(3, 3, noisy), &"t2m".parse().unwrap(), Some(doy(9)))
        .unwrap();
    let again = regrid_layer(&layer, &grid).unwrap();
    assert_eq!(again.cells, layer.cells);

    let copy = Arc::new(GridSpec::clone(&grid));
    let again = regrid_layer(&layer, &copy).unwrap();
    assert_eq!(again.cells, layer.cells);
}

#[test]
fn scalar_mode_matches_bundle_mean() {
    let grid = grid(2, 2);
    let raster = fine_raster(2, 2, noisy);
    let variable = "rh".parse().unwrap();
    let bundles = Regridder::new(grid.clone(), StatisticsMode::Bundle)
        .regrid(&raster, &variable, None)
        .unwrap();
    let scalars = Regridder::new(grid, StatisticsMode::Scalar)
        .regrid(&raster, &variable, None)
        .unwrap();
    for (b, s) in bundles.cells.iter().zip(&scalars.cells) {
        let (Some(b), Some(CellValue::Scalar(s))) = (b, s) else {
            panic!("all cells valid");
        };
        assert_abs_diff_eq!(b.mean(), *s);
    }
}

/// Regrids `raster` onto a 3 x 3 UTM grid and checks that only cell 5
/// (column 2, row 1) receives its pixels.
fn assert_lands_in_cell_five(grid: &Arc<GridSpec>, raster: &NativeRaster) {
    let layer = Regridder::new(grid.clone(), StatisticsMode::Bundle)
        .regrid(raster, &"t2m".parse().unwrap(), Some(doy(200)))
        .unwrap();
    let covered: Vec<usize> = (0..layer.cells.len())
        .filter(|&cell| layer.cells[cell].is_some())
        .collect();
    assert_eq!(covered, vec![5], "{}", raster.crs);
    let Some(CellValue::Stats(bundle)) = layer.cells[5] else {
        panic!("bundle mode yields bundles");
    };
    assert_eq!(bundle.count as usize, raster.valid_count());
    assert_abs_diff_eq!(bundle.mean, 7.0);
}

#[test]
fn geographic_raster_lands_in_the_matching_utm_cell() {
    let grid = grid(3, 3);
    let raster = spot_raster(&grid, 5, Crs::wgs84(), 0.001, 0.004, 7.0);
    assert_eq!(raster.valid_count(), 81);
    assert_lands_in_cell_five(&grid, &raster);
}

#[test]
fn lambert_conformal_raster_lands_in_the_matching_utm_cell() {
    let grid = grid(3, 3);
    let lcc: Crs = HRRR_LCC.parse().unwrap();
    let raster = spot_raster(&grid, 5, lcc, 100.0, 300.0, 7.0);
    assert_eq!(raster.valid_count(), 49);
    assert_lands_in_cell_five(&grid, &raster);
}

#[test]
fn sinusoidal_raster_lands_in_the_matching_utm_cell() {
    let grid = grid(3, 3);
    let sinusoidal: Crs = MODIS_SINUSOIDAL.parse().unwrap();
    let raster = spot_raster(&grid, 5, sinusoidal, 100.0, 300.0, 7.0);
    assert_eq!(raster.valid_count(), 49);
    assert_lands_in_cell_five(&grid, &raster);
}
