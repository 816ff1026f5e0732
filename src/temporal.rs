//! Alignment of regridded layers onto the daily study calendar.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::{DateRange, VariableName};
use crate::raster::{CellValue, RasterLayer, StatBundle};

/// How days inside a composite window are filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositeMode {
    #[default]
    ForwardFill,
    Interpolate,
}

/// Provenance of one (variable, date) slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Coverage {
    Computed,
    ForwardFilled,
    Interpolated,
    Static,
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Daily,
    Composite { window_days: u32, mode: CompositeMode },
    Static,
}

/// Exactly one slot per target date, each either a layer or an explicit gap.
#[derive(Debug, Clone)]
pub struct AlignedSeries {
    pub variable: VariableName,
    pub range: DateRange,
    pub slots: Vec<Option<Arc<RasterLayer>>>,
    pub coverage: Vec<Coverage>,
}

impl AlignedSeries {
    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> + use<> {
        self.range.days()
    }

    pub fn get(&self, date: NaiveDate) -> Option<&Arc<RasterLayer>> {
        let offset = (date - self.range.start).num_days();
        if offset < 0 {
            return None;
        }
        self.slots.get(offset as usize).and_then(Option::as_ref)
    }

    pub fn coverage_on(&self, date: NaiveDate) -> Option<Coverage> {
        let offset = (date - self.range.start).num_days();
        if offset < 0 {
            return None;
        }
        self.coverage.get(offset as usize).copied()
    }

    pub fn is_static(&self) -> bool {
        self.coverage.iter().all(|c| *c == Coverage::Static)
    }

    pub fn missing_days(&self) -> usize {
        self.coverage
            .iter()
            .filter(|c| **c == Coverage::Missing)
            .count()
    }

    /// Share of target dates that are not gaps.
    pub fn completeness(&self) -> f64 {
        if self.coverage.is_empty() {
            return 0.0;
        }
        1.0 - self.missing_days() as f64 / self.coverage.len() as f64
    }
}

pub struct TemporalAligner;

impl TemporalAligner {
    pub fn align(
        variable: VariableName,
        layers: Vec<RasterLayer>,
        range: &DateRange,
        cadence: Cadence,
    ) -> AlignedSeries {
        let len = range.len_days();
        let mut series = AlignedSeries {
            variable,
            range: *range,
            slots: vec![None; len],
            coverage: vec![Coverage::Missing; len],
        };
        match cadence {
            Cadence::Static => align_static(&mut series, layers),
            Cadence::Daily => align_daily(&mut series, layers),
            Cadence::Composite { window_days, mode } => {
                align_composite(&mut series, layers, window_days.max(1), mode)
            }
        }
        debug!(
            variable = %series.variable,
            missing = series.missing_days(),
            days = len,
            "aligned series"
        );
        series
    }
}

fn slot_index(range: &DateRange, date: NaiveDate) -> Option<usize> {
    range
        .contains(date)
        .then(|| (date - range.start).num_days() as usize)
}

fn align_static(series: &mut AlignedSeries, layers: Vec<RasterLayer>) {
    if layers.len() > 1 {
        warn!(variable = %series.variable, layers = layers.len(), "several static layers; keeping the first");
    }
    let Some(layer) = layers.into_iter().next() else {
        return;
    };
    let layer = Arc::new(RasterLayer { date: None, ..layer });
    for (slot, coverage) in series.slots.iter_mut().zip(series.coverage.iter_mut()) {
        *slot = Some(Arc::clone(&layer));
        *coverage = Coverage::Static;
    }
}

fn align_daily(series: &mut AlignedSeries, layers: Vec<RasterLayer>) {
    for layer in layers {
        let Some(date) = layer.date else {
            warn!(variable = %series.variable, "undated layer in a daily source; ignored");
            continue;
        };
        let Some(i) = slot_index(&series.range, date) else {
            continue;
        };
        if series.slots[i].is_some() {
            warn!(variable = %series.variable, %date, "duplicate daily layer; keeping the later one");
        }
        series.slots[i] = Some(Arc::new(layer));
        series.coverage[i] = Coverage::Computed;
    }
}

fn align_composite(
    series: &mut AlignedSeries,
    layers: Vec<RasterLayer>,
    window_days: u32,
    mode: CompositeMode,
) {
    let mut composites: BTreeMap<NaiveDate, Arc<RasterLayer>> = BTreeMap::new();
    for layer in layers {
        match layer.date {
            Some(date) => {
                composites.insert(date, Arc::new(layer));
            }
            None => warn!(variable = %series.variable, "undated composite layer; ignored"),
        }
    }
    let window = Duration::days(window_days as i64 - 1);

    // Later composites take over the days they share with earlier ones.
    for (start, layer) in &composites {
        let held = DateRange {
            start: *start,
            end: *start + window,
        };
        for date in held.days() {
            if let Some(i) = slot_index(&series.range, date) {
                series.slots[i] = Some(Arc::clone(layer));
                series.coverage[i] = if date == *start {
                    Coverage::Computed
                } else {
                    Coverage::ForwardFilled
                };
            }
        }
    }

    if mode != CompositeMode::Interpolate {
        return;
    }
    let half = Duration::days((window_days as i64 - 1) / 2);
    let ordered: Vec<(&NaiveDate, &Arc<RasterLayer>)> = composites.iter().collect();
    for pair in ordered.windows(2) {
        let (a_start, a) = pair[0];
        let (b_start, b) = pair[1];
        let a_end = *a_start + window;
        // Only composites whose windows touch or overlap are bridged.
        if *b_start > a_end + Duration::days(1) {
            continue;
        }
        let a_mid = *a_start + half;
        let b_mid = *b_start + half;
        let span = (b_mid - a_mid).num_days();
        if span < 2 {
            continue;
        }
        for offset in 1..span {
            let date = a_mid + Duration::days(offset);
            let Some(i) = slot_index(&series.range, date) else {
                continue;
            };
            let weight = offset as f64 / span as f64;
            let held_a = date <= a_end;
            let held_b = date >= *b_start;
            let cells = a
                .cells
                .iter()
                .zip(b.cells.iter())
                .map(|(va, vb)| match (va, vb) {
                    (Some(va), Some(vb)) => Some(lerp_cell(va, vb, weight)),
                    (Some(va), None) if held_a => Some(*va),
                    (None, Some(vb)) if held_b => Some(*vb),
                    _ => None,
                })
                .collect();
            series.slots[i] = Some(Arc::new(RasterLayer {
                variable: a.variable.clone(),
                date: Some(date),
                grid: Arc::clone(&a.grid),
                cells,
            }));
            series.coverage[i] = Coverage::Interpolated;
        }
    }
}

fn lerp(a: f64, b: f64, t: f64) -> f64 {
    a + (b - a) * t
}

fn lerp_cell(a: &CellValue, b: &CellValue, t: f64) -> CellValue {
    match (a, b) {
        (CellValue::Stats(a), CellValue::Stats(b)) => CellValue::Stats(StatBundle {
            mean: lerp(a.mean, b.mean, t),
            median: lerp(a.median, b.median, t),
            std: lerp(a.std, b.std, t),
            min: lerp(a.min, b.min, t),
            max: lerp(a.max, b.max, t),
            count: a.count.min(b.count),
        }),
        _ => CellValue::Scalar(lerp(a.mean(), b.mean(), t)),
    }
}
