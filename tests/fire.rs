mod common;

use assert_matches::assert_matches;

use firegrid::crs::{Crs, HRRR_LCC};
use firegrid::error::FiregridError;
use firegrid::fire::{FireRasterization, FireRasterizer};

use common::*;

fn cell_10_20(width: usize) -> usize {
    20 * width + 10
}

#[test]
fn larger_later_fire_wins_the_contested_cell() {
    let grid = grid(12, 22);
    let a = cell_perimeter("A", 10, 20, ymd(9, 1), ymd(9, 10), 500.0);
    let b = cell_perimeter("B", 10, 20, ymd(9, 2), ymd(9, 10), 1200.0);
    let period = range(ymd(9, 1), ymd(9, 5));

    let forward = FireRasterizer::new(grid.clone())
        .rasterize(vec![a.clone(), b.clone()], &period)
        .unwrap();
    let reversed = FireRasterizer::new(grid.clone())
        .rasterize(vec![b, a], &period)
        .unwrap();

    let cell = cell_10_20(grid.width);
    let day = |r: &FireRasterization, d: u32| {
        r.layers
            .iter()
            .find(|l| l.date == ymd(9, d))
            .unwrap()
            .winner(cell)
            .map(str::to_string)
    };
    assert_eq!(day(&forward, 1).as_deref(), Some("A"));
    assert_eq!(day(&forward, 3).as_deref(), Some("B"));
    for d in 1..=5 {
        assert_eq!(day(&forward, d), day(&reversed, d));
    }
    assert_eq!(forward.layers.len(), 5);
}

#[test]
fn identical_candidates_are_ambiguous() {
    let grid = grid(12, 22);
    let mut a = cell_perimeter("A", 10, 20, ymd(9, 1), ymd(9, 4), 500.0);
    let mut b = a.clone();
    a.agency = "CDF".to_string();
    b.agency = "USF".to_string();

    let err = FireRasterizer::new(grid)
        .rasterize(vec![a, b], &range(ymd(9, 1), ymd(9, 2)))
        .unwrap_err();
    assert_matches!(
        err,
        FiregridError::ConflictResolutionAmbiguity { cell, ref fire_identifier, .. }
            if cell == cell_10_20(12) && fire_identifier.contains('A')
    );
}

#[test]
fn days_outside_any_fire_are_empty_layers() {
    let grid = grid(4, 4);
    let fire = cell_perimeter("C", 2, 2, ymd(8, 10), ymd(8, 12), 30.0);
    let result = FireRasterizer::new(grid)
        .rasterize(vec![fire], &range(ymd(8, 8), ymd(8, 14)))
        .unwrap();
    let burning: Vec<_> = result
        .layers
        .iter()
        .filter(|layer| !layer.cells.is_empty())
        .map(|layer| layer.date)
        .collect();
    assert_eq!(burning, vec![ymd(8, 10), ymd(8, 11), ymd(8, 12)]);
    assert_eq!(result.layers.len(), 7);
    assert_eq!(result.records.len(), 1);
}

#[test]
fn perimeter_outside_the_grid_claims_nothing() {
    let grid = grid(2, 2);
    let fire = cell_perimeter("far", 40, 40, ymd(8, 1), ymd(8, 2), 5.0);
    let result = FireRasterizer::new(grid)
        .rasterize(vec![fire], &range(ymd(8, 1), ymd(8, 2)))
        .unwrap();
    assert!(result.layers.iter().all(|layer| layer.cells.is_empty()));
}

#[test]
fn perimeters_in_other_crs_claim_the_matching_utm_cell() {
    let grid = grid(3, 3);
    let lcc: Crs = HRRR_LCC.parse().unwrap();
    let fires = vec![
        perimeter_in("geo", &grid, 5, Crs::wgs84(), 0.003, ymd(7, 1), ymd(7, 1)),
        perimeter_in("lcc", &grid, 3, lcc, 400.0, ymd(7, 2), ymd(7, 2)),
    ];
    let result = FireRasterizer::new(grid)
        .rasterize(fires, &range(ymd(7, 1), ymd(7, 2)))
        .unwrap();
    assert!(result.skipped.is_empty());

    let claimed = |day: u32| -> Vec<(usize, String)> {
        result
            .layers
            .iter()
            .find(|layer| layer.date == ymd(7, day))
            .unwrap()
            .cells
            .iter()
            .map(|(cell, id)| (*cell, id.clone()))
            .collect()
    };
    assert_eq!(claimed(1), vec![(5, "geo".to_string())]);
    assert_eq!(claimed(2), vec![(3, "lcc".to_string())]);
}
