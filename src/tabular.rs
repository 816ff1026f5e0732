//! Stage 2: flattening the archive into per-cell, per-day feature rows.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::{DateRange, Split, StatField, VariableName};
use crate::error::FiregridError;
use crate::fs_util::{ensure_dir, persist_temp, read_json, temp_file_for, write_json_atomic};
use crate::raster::{CellValue, RasterLayer};
use crate::store::{SourceFailure, UnifiedStore, ValueKind};

pub const SCHEMA_FILE: &str = "schema.json";
pub const DATASET_MANIFEST_FILE: &str = "manifest.json";
pub const TARGET_COLUMN: &str = "fire_within_horizon";
const MISSING: &str = "NA";

/// Date boundaries of the time-based split. A date on or before `train_end` is
/// training data, then validation and test; anything later is for prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SplitBoundaries {
    pub train_end: Option<NaiveDate>,
    pub validation_end: Option<NaiveDate>,
    pub test_end: Option<NaiveDate>,
}

impl SplitBoundaries {
    pub fn new(
        train_end: Option<NaiveDate>,
        validation_end: Option<NaiveDate>,
        test_end: Option<NaiveDate>,
    ) -> Result<Self, FiregridError> {
        let set: Vec<NaiveDate> = [train_end, validation_end, test_end]
            .into_iter()
            .flatten()
            .collect();
        if set.windows(2).any(|pair| pair[1] <= pair[0]) {
            return Err(FiregridError::Configuration(
                "split boundaries must be strictly increasing".to_string(),
            ));
        }
        Ok(Self {
            train_end,
            validation_end,
            test_end,
        })
    }

    pub fn split_for(&self, date: NaiveDate) -> Split {
        if self.train_end.is_none() && self.validation_end.is_none() && self.test_end.is_none() {
            return Split::Train;
        }
        let bounds = [
            (self.train_end, Split::Train),
            (self.validation_end, Split::Validation),
            (self.test_end, Split::Test),
        ];
        bounds
            .into_iter()
            .find_map(|(end, split)| end.filter(|end| date <= *end).map(|_| split))
            .unwrap_or(Split::Predict)
    }

    /// Consecutive runs of `range` that fall into one split.
    pub fn segments(&self, range: &DateRange) -> Vec<(Split, DateRange)> {
        let mut out: Vec<(Split, DateRange)> = Vec::new();
        for date in range.days() {
            let split = self.split_for(date);
            match out.last_mut() {
                Some((current, segment)) if *current == split => segment.end = date,
                _ => out.push((split, DateRange::single(date))),
            }
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct TabularOptions {
    pub output_dir: Utf8PathBuf,
    pub neighborhood: bool,
    pub lags: Vec<u32>,
    pub partition_days: usize,
    pub horizon_days: u32,
    pub splits: SplitBoundaries,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum ColumnFeature {
    Stat(StatField),
    Scalar,
    NeighborMean,
    Lag(u32),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub variable: VariableName,
    pub feature: ColumnFeature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub key: Vec<String>,
    pub columns: Vec<ColumnSpec>,
    pub target: String,
    pub missing: String,
}

impl Schema {
    pub fn header(&self) -> Vec<String> {
        self.key
            .iter()
            .cloned()
            .chain(self.columns.iter().map(|c| c.name.clone()))
            .chain(std::iter::once(self.target.clone()))
            .collect()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    pub cell_index: usize,
    pub date: NaiveDate,
    /// One entry per schema column; `None` is an explicit missing value.
    pub values: Vec<Option<f64>>,
    /// `None` when part of the horizon has no fire coverage in the archive.
    pub target: Option<bool>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureOptions<'a> {
    pub neighborhood: bool,
    pub lags: &'a [u32],
}

pub struct Tabularizer<'a> {
    store: &'a UnifiedStore,
    variables: Vec<VariableName>,
    schema: Schema,
}

impl<'a> Tabularizer<'a> {
    pub fn new(store: &'a UnifiedStore, features: FeatureOptions<'_>) -> Self {
        let variables: Vec<VariableName> = store.variables().map(|(name, _)| name.clone()).collect();
        let mut columns = Vec::new();
        for variable in &variables {
            match store.value_kind(variable) {
                Some(ValueKind::Scalar) => columns.push(ColumnSpec {
                    name: variable.to_string(),
                    variable: variable.clone(),
                    feature: ColumnFeature::Scalar,
                }),
                _ => {
                    for field in StatField::ALL {
                        columns.push(ColumnSpec {
                            name: format!("{variable}_{}", field.suffix()),
                            variable: variable.clone(),
                            feature: ColumnFeature::Stat(field),
                        });
                    }
                }
            }
            if features.neighborhood {
                columns.push(ColumnSpec {
                    name: format!("{variable}_nbr_mean"),
                    variable: variable.clone(),
                    feature: ColumnFeature::NeighborMean,
                });
            }
            for lag in features.lags {
                columns.push(ColumnSpec {
                    name: format!("{variable}_lag{lag}"),
                    variable: variable.clone(),
                    feature: ColumnFeature::Lag(*lag),
                });
            }
        }
        Self {
            store,
            variables,
            schema: Schema {
                key: vec!["cell_index".to_string(), "date".to_string()],
                columns,
                target: TARGET_COLUMN.to_string(),
                missing: MISSING.to_string(),
            },
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Lazily yields one row per (cell, date) of `range` where any variable is
    /// valid. The target looks `horizon_days` ahead, the day itself included.
    pub fn rows(
        &self,
        range: &DateRange,
        horizon_days: u32,
    ) -> Result<FeatureRows<'_, 'a>, FiregridError> {
        let range = range.intersect(&self.store.range()).ok_or_else(|| {
            FiregridError::InvalidDateRange(format!(
                "{range} does not overlap archive range {}",
                self.store.range()
            ))
        })?;
        Ok(FeatureRows {
            tabularizer: self,
            dates: range.days().collect(),
            horizon_days,
            date_index: 0,
            cell: 0,
            day: None,
        })
    }

    fn layer_on(&self, variable: &VariableName, date: NaiveDate) -> Option<&Arc<RasterLayer>> {
        self.store.series(variable).and_then(|series| series.get(date))
    }

    fn load_day(&self, date: NaiveDate, horizon_days: u32) -> DayContext<'_> {
        let layers = self
            .variables
            .iter()
            .map(|variable| self.layer_on(variable, date))
            .collect();
        let lagged = self
            .schema
            .columns
            .iter()
            .map(|column| match column.feature {
                ColumnFeature::Lag(days) => {
                    self.layer_on(&column.variable, date - Duration::days(days as i64))
                }
                _ => None,
            })
            .collect();
        let mut burning = HashSet::new();
        let mut target_known = true;
        let window = DateRange {
            start: date,
            end: date + Duration::days(horizon_days as i64),
        };
        for day in window.days() {
            match self.store.fire_on(day) {
                Some(layer) => burning.extend(layer.cells.keys().copied()),
                None => target_known = false,
            }
        }
        DayContext {
            date,
            layers,
            lagged,
            burning,
            target_known,
        }
    }

    fn build_row(&self, day: &DayContext<'_>, cell: usize) -> Option<FeatureRow> {
        let any_valid = day
            .layers
            .iter()
            .any(|layer| layer.is_some_and(|layer| layer.is_valid(cell)));
        if !any_valid {
            return None;
        }
        let grid = self.store.grid();
        let values = self
            .schema
            .columns
            .iter()
            .enumerate()
            .map(|(i, column)| {
                let var_index = self.variables.iter().position(|v| *v == column.variable)?;
                let layer = day.layers[var_index];
                match column.feature {
                    ColumnFeature::Scalar => layer?.get(cell).map(CellValue::mean),
                    ColumnFeature::Stat(field) => match layer?.get(cell)? {
                        CellValue::Stats(bundle) => Some(bundle.field(field)),
                        CellValue::Scalar(v) => (field == StatField::Mean).then_some(*v),
                    },
                    ColumnFeature::NeighborMean => {
                        let layer = layer?;
                        let means: Vec<f64> = grid
                            .neighbors8(cell)
                            .into_iter()
                            .filter_map(|n| layer.get(n).map(CellValue::mean))
                            .collect();
                        (!means.is_empty()).then(|| means.iter().sum::<f64>() / means.len() as f64)
                    }
                    ColumnFeature::Lag(_) => day.lagged[i]?.get(cell).map(CellValue::mean),
                }
            })
            .collect();
        Some(FeatureRow {
            cell_index: cell,
            date: day.date,
            values,
            target: day.target_known.then(|| day.burning.contains(&cell)),
        })
    }
}

struct DayContext<'s> {
    date: NaiveDate,
    layers: Vec<Option<&'s Arc<RasterLayer>>>,
    lagged: Vec<Option<&'s Arc<RasterLayer>>>,
    burning: HashSet<usize>,
    /// Every day of the horizon has a fire layer.
    target_known: bool,
}

/// Iterator over feature rows, ordered by date then cell index.
pub struct FeatureRows<'t, 'a> {
    tabularizer: &'t Tabularizer<'a>,
    dates: Vec<NaiveDate>,
    horizon_days: u32,
    date_index: usize,
    cell: usize,
    day: Option<DayContext<'t>>,
}

impl Iterator for FeatureRows<'_, '_> {
    type Item = FeatureRow;

    fn next(&mut self) -> Option<FeatureRow> {
        let cells = self.tabularizer.store.grid().cell_count();
        loop {
            if self.day.is_none() {
                let date = *self.dates.get(self.date_index)?;
                self.day = Some(self.tabularizer.load_day(date, self.horizon_days));
                self.cell = 0;
            }
            let day = self.day.as_ref()?;
            while self.cell < cells {
                let cell = self.cell;
                self.cell += 1;
                if let Some(row) = self.tabularizer.build_row(day, cell) {
                    return Some(row);
                }
            }
            self.day = None;
            self.date_index += 1;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionReport {
    pub split: Split,
    pub range: DateRange,
    pub path: String,
    pub rows: usize,
    pub positives: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapEntry {
    pub variable: VariableName,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetManifest {
    pub archive_version: String,
    pub created_at: DateTime<Utc>,
    pub range: DateRange,
    pub horizon_days: u32,
    pub partitions: Vec<PartitionReport>,
    pub gaps: Vec<GapEntry>,
    pub failures: Vec<SourceFailure>,
}

impl DatasetManifest {
    pub fn total_rows(&self) -> usize {
        self.partitions.iter().map(|p| p.rows).sum()
    }
}

/// Writes the partitioned CSV dataset for a store.
pub struct TabularWriter {
    options: TabularOptions,
    cancel: Arc<AtomicBool>,
}

impl TabularWriter {
    pub fn new(options: TabularOptions) -> Self {
        Self {
            options,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn write(
        &self,
        store: &UnifiedStore,
        range: &DateRange,
        horizon_days: u32,
    ) -> Result<DatasetManifest, FiregridError> {
        let range = range.intersect(&store.range()).ok_or_else(|| {
            FiregridError::InvalidDateRange(format!(
                "{range} does not overlap archive range {}",
                store.range()
            ))
        })?;
        let tabularizer = Tabularizer::new(
            store,
            FeatureOptions {
                neighborhood: self.options.neighborhood,
                lags: &self.options.lags,
            },
        );
        let output = &self.options.output_dir;
        ensure_dir(output)?;
        self.ensure_schema(output, tabularizer.schema())?;

        let partitions: Vec<(Split, DateRange)> = self
            .options
            .splits
            .segments(&range)
            .into_iter()
            .flat_map(|(split, segment)| {
                segment
                    .chunks(self.options.partition_days)
                    .into_iter()
                    .map(move |chunk| (split, chunk))
            })
            .collect();
        info!(partitions = partitions.len(), %range, "writing tabular dataset");

        let reports = partitions
            .par_iter()
            .map(|(split, chunk)| {
                if self.cancel.load(Ordering::SeqCst) {
                    return Err(FiregridError::Cancelled);
                }
                self.write_partition(&tabularizer, *split, chunk, horizon_days)
            })
            .collect::<Result<Vec<_>, FiregridError>>()?;

        let gaps = store
            .manifest()
            .gaps()
            .into_iter()
            .filter(|(_, date)| range.contains(*date))
            .map(|(variable, date)| GapEntry { variable, date })
            .collect::<Vec<_>>();
        if !gaps.is_empty() {
            warn!(gaps = gaps.len(), "dataset includes gap days written as missing");
        }
        let manifest = DatasetManifest {
            archive_version: store.version().to_string(),
            created_at: Utc::now(),
            range,
            horizon_days,
            partitions: reports,
            gaps,
            failures: store.manifest().failures.clone(),
        };
        write_json_atomic(&output.join(DATASET_MANIFEST_FILE), &manifest)?;
        info!(rows = manifest.total_rows(), "tabular dataset complete");
        Ok(manifest)
    }

    /// Writes `schema.json` on first use; later runs must match it.
    fn ensure_schema(&self, output: &Utf8Path, schema: &Schema) -> Result<(), FiregridError> {
        let path = output.join(SCHEMA_FILE);
        if path.is_file() {
            let existing: Schema = read_json(&path)?;
            if existing != *schema {
                return Err(FiregridError::SchemaConflict(format!(
                    "{path} describes different columns than this archive produces"
                )));
            }
            return Ok(());
        }
        write_json_atomic(&path, schema)
    }

    fn write_partition(
        &self,
        tabularizer: &Tabularizer<'_>,
        split: Split,
        chunk: &DateRange,
        horizon_days: u32,
    ) -> Result<PartitionReport, FiregridError> {
        let relative = format!("{split}/{}_{}.csv", chunk.start, chunk.end);
        let path = self.options.output_dir.join(&relative);
        let csv_err = |err: csv::Error| FiregridError::Filesystem(format!("{path}: {err}"));

        let temp = temp_file_for(&path)?;
        let mut writer = csv::Writer::from_writer(temp);
        writer
            .write_record(tabularizer.schema().header())
            .map_err(csv_err)?;
        let mut rows = 0;
        let mut positives = 0;
        for row in tabularizer.rows(chunk, horizon_days)? {
            let mut record = Vec::with_capacity(row.values.len() + 3);
            record.push(row.cell_index.to_string());
            record.push(row.date.to_string());
            record.extend(row.values.iter().map(|value| match value {
                Some(v) => v.to_string(),
                None => MISSING.to_string(),
            }));
            record.push(match row.target {
                Some(target) => target.to_string(),
                None => MISSING.to_string(),
            });
            writer.write_record(&record).map_err(csv_err)?;
            rows += 1;
            positives += usize::from(row.target == Some(true));
        }
        writer
            .flush()
            .map_err(|err| FiregridError::Filesystem(format!("{path}: {err}")))?;
        let temp = writer
            .into_inner()
            .map_err(|err| FiregridError::Filesystem(format!("{path}: {}", err.error())))?;
        persist_temp(temp, &path)?;
        debug!(%path, rows, positives, "partition written");
        Ok(PartitionReport {
            split,
            range: *chunk,
            path: relative,
            rows,
            positives,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2020, m, d).unwrap()
    }

    #[test]
    fn split_boundaries_assign_in_order() {
        let splits =
            SplitBoundaries::new(Some(date(6, 30)), Some(date(8, 31)), Some(date(10, 31))).unwrap();
        assert_eq!(splits.split_for(date(6, 30)), Split::Train);
        assert_eq!(splits.split_for(date(7, 1)), Split::Validation);
        assert_eq!(splits.split_for(date(10, 31)), Split::Test);
        assert_eq!(splits.split_for(date(11, 1)), Split::Predict);
    }

    #[test]
    fn split_boundaries_must_increase() {
        assert!(SplitBoundaries::new(Some(date(8, 1)), Some(date(7, 1)), None).is_err());
    }

    #[test]
    fn segments_break_at_boundaries() {
        let splits = SplitBoundaries::new(Some(date(1, 10)), None, None).unwrap();
        let range = DateRange::new(date(1, 5), date(1, 20)).unwrap();
        let segments = splits.segments(&range);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0], (Split::Train, DateRange::new(date(1, 5), date(1, 10)).unwrap()));
        assert_eq!(segments[1].0, Split::Predict);
        assert_eq!(segments[1].1.len_days(), 10);
    }

    #[test]
    fn no_boundaries_means_training() {
        assert_eq!(SplitBoundaries::default().split_for(date(3, 3)), Split::Train);
    }
}
