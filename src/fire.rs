//! Fire-perimeter rasterization with deterministic conflict resolution.
//!
//! Each (cell, day) starts as `NoFire`, becomes `Contested` once a perimeter
//! active that day intersects the cell, and is `Resolved` to a single fire by the
//! total order: largest `acres_burned`, then earliest `alarm_date`, then the
//! lexically smallest `fire_identifier`.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::NaiveDate;
use geo::{BoundingRect, Coord, Intersects, LineString, MultiPolygon, Polygon, Rect};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::crs::{Crs, CrsTransform};
use crate::domain::DateRange;
use crate::error::FiregridError;
use crate::grid::GridSpec;

#[derive(Debug, Clone, PartialEq)]
pub struct FirePolygon {
    pub geometry: MultiPolygon<f64>,
    pub crs: Crs,
    pub alarm_date: NaiveDate,
    pub containment_date: NaiveDate,
    pub acres_burned: f64,
    pub cause_category: String,
    pub agency: String,
    pub fire_identifier: String,
}

impl FirePolygon {
    pub fn active_on(&self, date: NaiveDate) -> bool {
        date >= self.alarm_date && date <= self.containment_date
    }

    pub fn active_range(&self) -> DateRange {
        DateRange {
            start: self.alarm_date,
            end: self.containment_date,
        }
    }

    pub fn record(&self) -> FireRecord {
        FireRecord {
            fire_identifier: self.fire_identifier.clone(),
            agency: self.agency.clone(),
            alarm_date: self.alarm_date,
            containment_date: self.containment_date,
            acres_burned: self.acres_burned,
            cause_category: self.cause_category.clone(),
        }
    }
}

/// Fire attributes kept in the archive; geometry stays with the native extract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FireRecord {
    pub fire_identifier: String,
    pub agency: String,
    pub alarm_date: NaiveDate,
    pub containment_date: NaiveDate,
    pub acres_burned: f64,
    pub cause_category: String,
}

/// Winning fire per cell for one day; cells not in `cells` had no fire.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyFireLayer {
    pub date: NaiveDate,
    pub grid: Arc<GridSpec>,
    pub cells: BTreeMap<usize, String>,
}

impl DailyFireLayer {
    pub fn winner(&self, cell: usize) -> Option<&str> {
        self.cells.get(&cell).map(String::as_str)
    }

    pub fn has_fire(&self, cell: usize) -> bool {
        self.cells.contains_key(&cell)
    }
}

/// Per (cell, day) claim state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CellClaim {
    #[default]
    NoFire,
    Contested(Vec<usize>),
    Resolved(usize),
}

impl CellClaim {
    pub fn claim(&mut self, polygon: usize) {
        match self {
            CellClaim::NoFire => *self = CellClaim::Contested(vec![polygon]),
            CellClaim::Contested(candidates) => candidates.push(polygon),
            CellClaim::Resolved(_) => {}
        }
    }

    /// Picks the winner among the contested candidates of `cell` on `date`.
    pub fn resolve(
        &mut self,
        polygons: &[FirePolygon],
        cell: usize,
        date: NaiveDate,
    ) -> Result<Option<usize>, FiregridError> {
        match self {
            CellClaim::NoFire => Ok(None),
            CellClaim::Resolved(winner) => Ok(Some(*winner)),
            CellClaim::Contested(candidates) => {
                // Fixed starting order so the outcome never depends on arrival order.
                candidates.sort_by(|a, b| {
                    polygons[*a]
                        .fire_identifier
                        .cmp(&polygons[*b].fire_identifier)
                });
                candidates.dedup();
                candidates.sort_by(|a, b| compare_candidates(&polygons[*a], &polygons[*b]));
                let winner = candidates[0];
                if let Some(&runner_up) = candidates.get(1) {
                    if compare_candidates(&polygons[winner], &polygons[runner_up])
                        == Ordering::Equal
                    {
                        return Err(FiregridError::ConflictResolutionAmbiguity {
                            cell,
                            date,
                            fire_identifier: polygons[winner].fire_identifier.clone(),
                        });
                    }
                }
                *self = CellClaim::Resolved(winner);
                Ok(Some(winner))
            }
        }
    }
}

/// Total order on competing fires; `Less` wins.
pub fn compare_candidates(a: &FirePolygon, b: &FirePolygon) -> Ordering {
    b.acres_burned
        .total_cmp(&a.acres_burned)
        .then_with(|| a.alarm_date.cmp(&b.alarm_date))
        .then_with(|| a.fire_identifier.cmp(&b.fire_identifier))
}

/// Keeps the last record per (fire_identifier, agency); later records in an
/// extract are corrections of earlier ones.
pub fn supersede(polygons: Vec<FirePolygon>) -> Vec<FirePolygon> {
    let mut latest: HashMap<(String, String), usize> = HashMap::new();
    for (i, polygon) in polygons.iter().enumerate() {
        latest.insert(
            (polygon.fire_identifier.clone(), polygon.agency.clone()),
            i,
        );
    }
    let mut kept: Vec<FirePolygon> = polygons
        .into_iter()
        .enumerate()
        .filter(|(i, polygon)| {
            latest.get(&(polygon.fire_identifier.clone(), polygon.agency.clone())) == Some(i)
        })
        .map(|(_, polygon)| polygon)
        .collect();
    kept.sort_by(|a, b| {
        a.fire_identifier
            .cmp(&b.fire_identifier)
            .then_with(|| a.agency.cmp(&b.agency))
    });
    kept
}

#[derive(Debug, Clone)]
pub struct FireRasterization {
    pub layers: Vec<DailyFireLayer>,
    pub records: Vec<FireRecord>,
    /// Fires dropped because their geometry could not be projected.
    pub skipped: Vec<String>,
}

pub struct FireRasterizer {
    grid: Arc<GridSpec>,
}

impl FireRasterizer {
    pub fn new(grid: Arc<GridSpec>) -> Self {
        Self { grid }
    }

    /// Produces one layer per day of `period`, including days without fire.
    pub fn rasterize(
        &self,
        polygons: Vec<FirePolygon>,
        period: &DateRange,
    ) -> Result<FireRasterization, FiregridError> {
        let polygons = supersede(polygons);
        let footprints: Vec<Result<Vec<usize>, FiregridError>> = polygons
            .par_iter()
            .map(|polygon| self.footprint(polygon))
            .collect();

        let mut kept = Vec::with_capacity(polygons.len());
        let mut cells = Vec::with_capacity(polygons.len());
        let mut skipped = Vec::new();
        for (polygon, footprint) in polygons.into_iter().zip(footprints) {
            match footprint {
                Ok(footprint) => {
                    debug!(fire = %polygon.fire_identifier, cells = footprint.len(), "rasterized perimeter");
                    kept.push(polygon);
                    cells.push(footprint);
                }
                Err(err) => {
                    warn!(fire = %polygon.fire_identifier, "skipping perimeter: {err}");
                    skipped.push(polygon.fire_identifier.clone());
                }
            }
        }

        let days: Vec<NaiveDate> = period.days().collect();
        let layers = days
            .par_iter()
            .map(|&date| self.resolve_day(date, &kept, &cells))
            .collect::<Result<Vec<_>, FiregridError>>()?;

        let burning = layers.iter().filter(|l| !l.cells.is_empty()).count();
        info!(
            fires = kept.len(),
            skipped = skipped.len(),
            days = layers.len(),
            burning_days = burning,
            "fire rasterization complete"
        );
        Ok(FireRasterization {
            layers,
            records: kept.iter().map(FirePolygon::record).collect(),
            skipped,
        })
    }

    fn resolve_day(
        &self,
        date: NaiveDate,
        polygons: &[FirePolygon],
        footprints: &[Vec<usize>],
    ) -> Result<DailyFireLayer, FiregridError> {
        let mut claims: BTreeMap<usize, CellClaim> = BTreeMap::new();
        for (i, polygon) in polygons.iter().enumerate() {
            if !polygon.active_on(date) {
                continue;
            }
            for &cell in &footprints[i] {
                claims.entry(cell).or_default().claim(i);
            }
        }
        let mut cells = BTreeMap::new();
        for (cell, claim) in claims.iter_mut() {
            if let Some(winner) = claim.resolve(polygons, *cell, date)? {
                cells.insert(*cell, polygons[winner].fire_identifier.clone());
            }
        }
        Ok(DailyFireLayer {
            date,
            grid: Arc::clone(&self.grid),
            cells,
        })
    }

    /// Target cells whose square intersects the projected perimeter.
    fn footprint(&self, polygon: &FirePolygon) -> Result<Vec<usize>, FiregridError> {
        let transform = CrsTransform::new(&polygon.crs, &self.grid.crs)?;
        let projected = project_multipolygon(&polygon.geometry, &transform)?;
        let Some(bounds) = projected.bounding_rect() else {
            return Ok(Vec::new());
        };
        let grid = &self.grid;
        let r = grid.resolution;
        let col_min = ((bounds.min().x - grid.origin_x) / r).floor().max(0.0) as i64;
        let col_max = ((bounds.max().x - grid.origin_x) / r).floor() as i64;
        let row_min = ((grid.origin_y - bounds.max().y) / r).floor().max(0.0) as i64;
        let row_max = ((grid.origin_y - bounds.min().y) / r).floor() as i64;
        let col_max = col_max.min(grid.width as i64 - 1);
        let row_max = row_max.min(grid.height as i64 - 1);

        let mut cells = Vec::new();
        for row in row_min..=row_max {
            for col in col_min..=col_max {
                let index = grid.cell_index(col as usize, row as usize);
                let b = grid.cell_bounds(index);
                let square = Rect::new(
                    Coord { x: b.min_x, y: b.min_y },
                    Coord { x: b.max_x, y: b.max_y },
                )
                .to_polygon();
                if projected.0.iter().any(|part| part.intersects(&square)) {
                    cells.push(index);
                }
            }
        }
        Ok(cells)
    }
}

fn project_ring(
    ring: &LineString<f64>,
    transform: &CrsTransform,
) -> Result<LineString<f64>, FiregridError> {
    ring.coords()
        .map(|c| transform.transform(c.x, c.y).map(|(x, y)| Coord { x, y }))
        .collect::<Result<Vec<_>, _>>()
        .map(LineString::new)
}

pub fn project_multipolygon(
    geometry: &MultiPolygon<f64>,
    transform: &CrsTransform,
) -> Result<MultiPolygon<f64>, FiregridError> {
    if transform.is_identity() {
        return Ok(geometry.clone());
    }
    let parts = geometry
        .0
        .iter()
        .map(|polygon| {
            let exterior = project_ring(polygon.exterior(), transform)?;
            let interiors = polygon
                .interiors()
                .iter()
                .map(|ring| project_ring(ring, transform))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Polygon::new(exterior, interiors))
        })
        .collect::<Result<Vec<_>, FiregridError>>()?;
    Ok(MultiPolygon::new(parts))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fire(id: &str, acres: f64, alarm: NaiveDate) -> FirePolygon {
        FirePolygon {
            geometry: MultiPolygon::new(vec![]),
            crs: Crs::wgs84(),
            alarm_date: alarm,
            containment_date: alarm,
            acres_burned: acres,
            cause_category: "1".to_string(),
            agency: "CDF".to_string(),
            fire_identifier: id.to_string(),
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2020, 9, d).unwrap()
    }

    #[test]
    fn order_prefers_acres_then_alarm_then_id() {
        let big = fire("B", 1200.0, day(2));
        let small = fire("A", 500.0, day(1));
        assert_eq!(compare_candidates(&big, &small), Ordering::Less);

        let early = fire("Z", 500.0, day(1));
        let late = fire("A", 500.0, day(2));
        assert_eq!(compare_candidates(&early, &late), Ordering::Less);

        let a = fire("A", 500.0, day(1));
        let b = fire("B", 500.0, day(1));
        assert_eq!(compare_candidates(&a, &b), Ordering::Less);
    }

    #[test]
    fn claim_moves_through_states() {
        let polygons = vec![fire("A", 500.0, day(1)), fire("B", 1200.0, day(2))];
        let mut claim = CellClaim::default();
        assert_eq!(claim.resolve(&polygons, 0, day(3)).unwrap(), None);
        claim.claim(0);
        assert_eq!(claim, CellClaim::Contested(vec![0]));
        claim.claim(1);
        assert_eq!(claim.resolve(&polygons, 0, day(3)).unwrap(), Some(1));
        assert_eq!(claim, CellClaim::Resolved(1));
    }

    #[test]
    fn full_tie_is_ambiguous() {
        let mut other_agency = fire("A", 500.0, day(1));
        other_agency.agency = "USF".to_string();
        let polygons = vec![fire("A", 500.0, day(1)), other_agency];
        let mut claim = CellClaim::Contested(vec![1, 0]);
        let err = claim.resolve(&polygons, 7, day(1)).unwrap_err();
        assert!(matches!(
            err,
            FiregridError::ConflictResolutionAmbiguity { cell: 7, .. }
        ));
    }

    #[test]
    fn supersede_keeps_last_correction() {
        let first = fire("A", 100.0, day(1));
        let corrected = fire("A", 150.0, day(1));
        let other = fire("B", 10.0, day(1));
        let kept = supersede(vec![first, other, corrected]);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].fire_identifier, "A");
        assert_eq!(kept[0].acres_burned, 150.0);
    }
}
