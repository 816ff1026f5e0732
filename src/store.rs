//! The Stage 1 archive: every variable and the daily fire layers on one grid.
//!
//! Layout of one version under the archive root:
//!
//! ```text
//! <root>/LATEST
//! <root>/<YYYYMMDDTHHMMSSZ>/manifest.json
//! <root>/<YYYYMMDDTHHMMSSZ>/fires.json
//! <root>/<YYYYMMDDTHHMMSSZ>/layers/<variable>/<YYYY-MM-DD|interp-YYYY-MM-DD|static>.json.gz
//! <root>/<YYYYMMDDTHHMMSSZ>/fire/<YYYY-MM-DD>.json
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::sync::{Arc, Mutex, MutexGuard};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, NaiveDate, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::domain::{DateRange, SourceKind, VariableName};
use crate::error::FiregridError;
use crate::fire::{DailyFireLayer, FireRasterization, FireRecord};
use crate::fs_util::{
    atomic_rename_dir, ensure_dir, read_json, read_json_gz, write_bytes_atomic, write_json_atomic,
    write_json_gz,
};
use crate::grid::GridSpec;
use crate::raster::{CellValue, RasterLayer};
use crate::temporal::{AlignedSeries, Coverage};

pub const SCHEMA_VERSION: u32 = 1;
pub const MANIFEST_FILE: &str = "manifest.json";
pub const FIRES_FILE: &str = "fires.json";
pub const LATEST_FILE: &str = "LATEST";
const STATIC_KEY: &str = "static";
const INTERPOLATED_PREFIX: &str = "interp-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Stats,
    Scalar,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateEntry {
    pub coverage: Coverage,
    /// File key of the layer serving this date; `None` for a gap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableEntry {
    pub source: String,
    pub kind: SourceKind,
    pub value_kind: ValueKind,
    pub is_static: bool,
    pub dates: BTreeMap<NaiveDate, DateEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FireEntry {
    pub source: String,
    pub fires: usize,
    pub days: usize,
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFailure {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceReport {
    pub source: String,
    pub kind: SourceKind,
    pub variables: Vec<VariableName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_completeness: Option<f64>,
    pub observed_completeness: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: u32,
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub grid: GridSpec,
    pub range: DateRange,
    pub variables: BTreeMap<VariableName, VariableEntry>,
    #[serde(default)]
    pub fire: Option<FireEntry>,
    #[serde(default)]
    pub sources: Vec<SourceReport>,
    #[serde(default)]
    pub failures: Vec<SourceFailure>,
}

impl Manifest {
    /// (variable, date) pairs with no data.
    pub fn gaps(&self) -> Vec<(VariableName, NaiveDate)> {
        self.variables
            .iter()
            .flat_map(|(name, entry)| {
                entry
                    .dates
                    .iter()
                    .filter(|(_, e)| e.coverage == Coverage::Missing)
                    .map(move |(date, _)| (name.clone(), *date))
            })
            .collect()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LayerFile {
    variable: VariableName,
    date: Option<NaiveDate>,
    cells: Vec<Option<CellValue>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FireFile {
    date: NaiveDate,
    cells: BTreeMap<usize, String>,
}

/// A committed, read-only archive.
#[derive(Debug, Clone)]
pub struct UnifiedStore {
    grid: Arc<GridSpec>,
    manifest: Manifest,
    variables: BTreeMap<VariableName, AlignedSeries>,
    fire_layers: Vec<DailyFireLayer>,
    fires: Vec<FireRecord>,
}

impl UnifiedStore {
    pub fn grid(&self) -> &Arc<GridSpec> {
        &self.grid
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn range(&self) -> DateRange {
        self.manifest.range
    }

    pub fn version(&self) -> &str {
        &self.manifest.version
    }

    pub fn variables(&self) -> impl Iterator<Item = (&VariableName, &AlignedSeries)> {
        self.variables.iter()
    }

    pub fn series(&self, variable: &VariableName) -> Option<&AlignedSeries> {
        self.variables.get(variable)
    }

    pub fn value_kind(&self, variable: &VariableName) -> Option<ValueKind> {
        self.manifest.variables.get(variable).map(|e| e.value_kind)
    }

    pub fn fire_layers(&self) -> &[DailyFireLayer] {
        &self.fire_layers
    }

    pub fn fire_on(&self, date: NaiveDate) -> Option<&DailyFireLayer> {
        let offset = (date - self.manifest.range.start).num_days();
        if offset < 0 {
            return None;
        }
        self.fire_layers
            .get(offset as usize)
            .filter(|layer| layer.date == date)
    }

    pub fn fires(&self) -> &[FireRecord] {
        &self.fires
    }

    /// Writes this store as a new version under `root` and points `LATEST` at it.
    pub fn persist(&mut self, root: &Utf8Path) -> Result<Utf8PathBuf, FiregridError> {
        ensure_dir(root)?;
        let mut version = self.manifest.version.clone();
        let mut attempt = 1;
        while root.join(&version).exists() {
            version = format!("{}-{attempt}", self.manifest.version);
            attempt += 1;
        }
        self.manifest.version = version.clone();

        let staging = tempfile::Builder::new()
            .prefix(".firegrid-staging")
            .tempdir_in(root.as_std_path())
            .map_err(|err| FiregridError::Filesystem(format!("{root}: {err}")))?;
        let staging_path = Utf8PathBuf::from_path_buf(staging.path().to_path_buf())
            .map_err(|_| FiregridError::Filesystem("invalid staging path".to_string()))?;

        self.write_contents(&staging_path)?;

        let target = root.join(&version);
        atomic_rename_dir(staging.path(), target.as_std_path())
            .map_err(|err| FiregridError::Filesystem(format!("{target}: {err}")))?;
        write_bytes_atomic(&root.join(LATEST_FILE), version.as_bytes())?;
        info!(%version, path = %target, "archive written");
        Ok(target)
    }

    fn write_contents(&self, dir: &Utf8Path) -> Result<(), FiregridError> {
        let mut jobs: Vec<(Utf8PathBuf, &RasterLayer)> = Vec::new();
        for (name, series) in &self.variables {
            let var_dir = dir.join("layers").join(name.as_str());
            let mut seen = HashSet::new();
            let slots = series.slots.iter().zip(series.coverage.iter());
            for (layer, coverage) in slots.filter_map(|(slot, c)| slot.as_ref().map(|l| (l, *c))) {
                let key = layer_key(layer, coverage);
                if seen.insert(key.clone()) {
                    jobs.push((var_dir.join(format!("{key}.json.gz")), layer.as_ref()));
                }
            }
        }
        jobs.par_iter()
            .map(|(path, layer)| {
                write_json_gz(
                    path,
                    &LayerFile {
                        variable: layer.variable.clone(),
                        date: layer.date,
                        cells: layer.cells.clone(),
                    },
                )
            })
            .collect::<Result<Vec<_>, FiregridError>>()?;
        debug!(files = jobs.len(), "wrote layer files");

        self.fire_layers
            .par_iter()
            .map(|layer| {
                write_json_atomic(
                    &dir.join("fire").join(format!("{}.json", layer.date)),
                    &FireFile {
                        date: layer.date,
                        cells: layer.cells.clone(),
                    },
                )
            })
            .collect::<Result<Vec<_>, FiregridError>>()?;

        write_json_atomic(&dir.join(FIRES_FILE), &self.fires)?;
        write_json_atomic(&dir.join(MANIFEST_FILE), &self.manifest)
    }

    /// Versions under `root`, oldest first.
    pub fn versions(root: &Utf8Path) -> Result<Vec<String>, FiregridError> {
        if !root.is_dir() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(root.as_std_path())
            .map_err(|err| FiregridError::Filesystem(format!("{root}: {err}")))?;
        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| FiregridError::Filesystem(err.to_string()))?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if !name.starts_with('.') && entry.path().join(MANIFEST_FILE).is_file() {
                versions.push(name);
            }
        }
        versions.sort();
        Ok(versions)
    }

    pub fn latest_version(root: &Utf8Path) -> Result<String, FiregridError> {
        let pointer = root.join(LATEST_FILE);
        if let Ok(content) = fs::read_to_string(pointer.as_std_path()) {
            let version = content.trim().to_string();
            if !version.is_empty() && root.join(&version).join(MANIFEST_FILE).is_file() {
                return Ok(version);
            }
        }
        Self::versions(root)?
            .pop()
            .ok_or_else(|| FiregridError::ArchiveNotFound(root.to_string()))
    }

    /// Loads a version (default: latest). All layers share one grid instance.
    pub fn open(root: &Utf8Path, version: Option<&str>) -> Result<Self, FiregridError> {
        let version = match version {
            Some(version) => version.to_string(),
            None => Self::latest_version(root)?,
        };
        let dir = root.join(&version);
        let manifest_path = dir.join(MANIFEST_FILE);
        if !manifest_path.is_file() {
            return Err(FiregridError::ArchiveNotFound(dir.to_string()));
        }
        let manifest: Manifest = read_json(&manifest_path)?;
        if manifest.schema_version != SCHEMA_VERSION {
            return Err(FiregridError::SchemaConflict(format!(
                "archive {version} has schema version {}, expected {SCHEMA_VERSION}",
                manifest.schema_version
            )));
        }
        let grid = Arc::new(manifest.grid.clone());

        let mut variables = BTreeMap::new();
        for (name, entry) in &manifest.variables {
            let series = load_series(&dir, name, entry, &manifest.range, &grid)?;
            variables.insert(name.clone(), series);
        }

        let mut fire_layers = Vec::new();
        if manifest.fire.is_some() {
            for date in manifest.range.days() {
                let file: FireFile = read_json(&dir.join("fire").join(format!("{date}.json")))?;
                fire_layers.push(DailyFireLayer {
                    date: file.date,
                    grid: Arc::clone(&grid),
                    cells: file.cells,
                });
            }
        }
        let fires_path = dir.join(FIRES_FILE);
        let fires = if fires_path.is_file() {
            read_json(&fires_path)?
        } else {
            Vec::new()
        };
        info!(%version, variables = variables.len(), "archive opened");
        Ok(Self {
            grid,
            manifest,
            variables,
            fire_layers,
            fires,
        })
    }
}

/// Interpolated layers are dated like the composite starting that day, so they
/// get their own key.
fn layer_key(layer: &RasterLayer, coverage: Coverage) -> String {
    match (layer.date, coverage) {
        (Some(date), Coverage::Interpolated) => format!("{INTERPOLATED_PREFIX}{date}"),
        (Some(date), _) => date.to_string(),
        (None, _) => STATIC_KEY.to_string(),
    }
}

fn load_series(
    dir: &Utf8Path,
    name: &VariableName,
    entry: &VariableEntry,
    range: &DateRange,
    grid: &Arc<GridSpec>,
) -> Result<AlignedSeries, FiregridError> {
    let var_dir = dir.join("layers").join(name.as_str());
    let mut loaded: HashMap<String, Arc<RasterLayer>> = HashMap::new();
    let len = range.len_days();
    let mut slots = vec![None; len];
    let mut coverage = vec![Coverage::Missing; len];
    for (i, date) in range.days().enumerate() {
        let Some(date_entry) = entry.dates.get(&date) else {
            continue;
        };
        coverage[i] = date_entry.coverage;
        let Some(key) = &date_entry.layer else {
            continue;
        };
        if !loaded.contains_key(key) {
            let file: LayerFile = read_json_gz(&var_dir.join(format!("{key}.json.gz")))?;
            if file.cells.len() != grid.cell_count() {
                return Err(FiregridError::SchemaConflict(format!(
                    "layer {name}/{key} has {} cells, grid has {}",
                    file.cells.len(),
                    grid.cell_count()
                )));
            }
            loaded.insert(
                key.clone(),
                Arc::new(RasterLayer {
                    variable: file.variable,
                    date: file.date,
                    grid: Arc::clone(grid),
                    cells: file.cells,
                }),
            );
        }
        slots[i] = loaded.get(key).cloned();
    }
    Ok(AlignedSeries {
        variable: name.clone(),
        range: *range,
        slots,
        coverage,
    })
}

struct StagedVariable {
    entry: VariableEntry,
    series: AlignedSeries,
}

/// Collects aligned series from concurrently running sources. Each variable is
/// committed under the staging lock and is visible only once committed.
pub struct StoreWriter {
    grid: Arc<GridSpec>,
    range: DateRange,
    staged: Mutex<BTreeMap<VariableName, StagedVariable>>,
    fire: Mutex<Option<(String, FireRasterization)>>,
    sources: Mutex<Vec<SourceReport>>,
    failures: Mutex<Vec<SourceFailure>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panic while holding the lock leaves plain data behind; keep using it.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl StoreWriter {
    pub fn new(grid: Arc<GridSpec>, range: DateRange) -> Self {
        Self {
            grid,
            range,
            staged: Mutex::new(BTreeMap::new()),
            fire: Mutex::new(None),
            sources: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
        }
    }

    pub fn grid(&self) -> &Arc<GridSpec> {
        &self.grid
    }

    pub fn committed_variables(&self) -> Vec<VariableName> {
        lock(&self.staged).keys().cloned().collect()
    }

    fn check_grid(&self, grid: &Arc<GridSpec>, what: &str) -> Result<(), FiregridError> {
        if Arc::ptr_eq(grid, &self.grid) || **grid == *self.grid {
            Ok(())
        } else {
            Err(FiregridError::SchemaConflict(format!(
                "{what} is not on the run grid"
            )))
        }
    }

    pub fn commit(
        &self,
        source: &str,
        kind: SourceKind,
        series: AlignedSeries,
    ) -> Result<(), FiregridError> {
        if series.range != self.range {
            return Err(FiregridError::SchemaConflict(format!(
                "{} covers {}, run covers {}",
                series.variable, series.range, self.range
            )));
        }
        let mut value_kind = ValueKind::Stats;
        for layer in series.slots.iter().flatten() {
            self.check_grid(&layer.grid, &format!("layer {}", series.variable))?;
            if let Some(CellValue::Scalar(_)) = layer.cells.iter().flatten().next() {
                value_kind = ValueKind::Scalar;
            }
        }
        let is_static = series.is_static();
        let dates = series
            .dates()
            .zip(series.slots.iter().zip(series.coverage.iter()))
            .map(|(date, (slot, coverage))| {
                (
                    date,
                    DateEntry {
                        coverage: *coverage,
                        layer: slot.as_deref().map(|layer| layer_key(layer, *coverage)),
                    },
                )
            })
            .collect();
        let entry = VariableEntry {
            source: source.to_string(),
            kind,
            value_kind,
            is_static,
            dates,
        };

        let mut staged = lock(&self.staged);
        if let Some(existing) = staged.get(&series.variable) {
            return Err(FiregridError::SchemaConflict(format!(
                "variable {} is provided by both {} and {source}",
                series.variable, existing.entry.source
            )));
        }
        debug!(variable = %series.variable, %source, "committed variable");
        staged.insert(series.variable.clone(), StagedVariable { entry, series });
        Ok(())
    }

    pub fn commit_fire(
        &self,
        source: &str,
        rasterization: FireRasterization,
    ) -> Result<(), FiregridError> {
        if rasterization.layers.len() != self.range.len_days() {
            return Err(FiregridError::SchemaConflict(format!(
                "fire layers cover {} days, run covers {}",
                rasterization.layers.len(),
                self.range.len_days()
            )));
        }
        for layer in &rasterization.layers {
            self.check_grid(&layer.grid, &format!("fire layer {}", layer.date))?;
        }
        let mut fire = lock(&self.fire);
        if let Some((existing, _)) = fire.as_ref() {
            return Err(FiregridError::SchemaConflict(format!(
                "fire occurrence is provided by both {existing} and {source}"
            )));
        }
        *fire = Some((source.to_string(), rasterization));
        Ok(())
    }

    pub fn record_source(&self, report: SourceReport) {
        lock(&self.sources).push(report);
    }

    pub fn record_failure(&self, source: &str, date: Option<NaiveDate>, error: &FiregridError) {
        lock(&self.failures).push(SourceFailure {
            source: source.to_string(),
            date,
            error: error.to_string(),
        });
    }

    /// Seals the staged data into a store; `created_at` names the version.
    pub fn finish(self, created_at: DateTime<Utc>) -> UnifiedStore {
        let staged = self
            .staged
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let fire = self
            .fire
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut sources = self
            .sources
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut failures = self
            .failures
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sources.sort_by(|a, b| a.source.cmp(&b.source));
        failures.sort_by(|a, b| a.source.cmp(&b.source).then(a.date.cmp(&b.date)));

        let mut entries = BTreeMap::new();
        let mut variables = BTreeMap::new();
        for (name, staged) in staged {
            entries.insert(name.clone(), staged.entry);
            variables.insert(name, staged.series);
        }
        let (fire_entry, fire_layers, fires) = match fire {
            Some((source, rasterization)) => (
                Some(FireEntry {
                    source,
                    fires: rasterization.records.len(),
                    days: rasterization.layers.len(),
                    skipped: rasterization.skipped,
                }),
                rasterization.layers,
                rasterization.records,
            ),
            None => (None, Vec::new(), Vec::new()),
        };

        UnifiedStore {
            manifest: Manifest {
                schema_version: SCHEMA_VERSION,
                version: created_at.format("%Y%m%dT%H%M%SZ").to_string(),
                created_at,
                grid: (*self.grid).clone(),
                range: self.range,
                variables: entries,
                fire: fire_entry,
                sources,
                failures,
            },
            grid: self.grid,
            variables,
            fire_layers,
            fires,
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::crs::Crs;
    use crate::grid::Extent;
    use crate::temporal::{Cadence, TemporalAligner};

    fn grid() -> Arc<GridSpec> {
        let crs: Crs = "EPSG:32611".parse().unwrap();
        Arc::new(GridSpec::new(crs, 10.0, Extent::new(0.0, 0.0, 20.0, 10.0)).unwrap())
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2020, 9, d).unwrap()
    }

    fn series(grid: &Arc<GridSpec>, name: &str, range: &DateRange) -> AlignedSeries {
        let layer = RasterLayer {
            variable: name.parse().unwrap(),
            date: Some(day(1)),
            grid: Arc::clone(grid),
            cells: vec![Some(CellValue::Scalar(1.0)), None],
        };
        TemporalAligner::align(name.parse().unwrap(), vec![layer], range, Cadence::Daily)
    }

    #[test]
    fn same_variable_from_two_sources_conflicts() {
        let grid = grid();
        let range = DateRange::new(day(1), day(2)).unwrap();
        let writer = StoreWriter::new(Arc::clone(&grid), range);
        writer
            .commit("hrrr", SourceKind::Continuous, series(&grid, "t2m", &range))
            .unwrap();
        let err = writer
            .commit("other", SourceKind::Continuous, series(&grid, "t2m", &range))
            .unwrap_err();
        assert_matches!(err, FiregridError::SchemaConflict(_));
    }

    #[test]
    fn foreign_grid_conflicts() {
        let grid = grid();
        let other = Arc::new(GridSpec {
            resolution: 5.0,
            width: 4,
            height: 2,
            ..(*grid).clone()
        });
        let range = DateRange::new(day(1), day(2)).unwrap();
        let writer = StoreWriter::new(grid, range);
        let err = writer
            .commit("hrrr", SourceKind::Continuous, series(&other, "t2m", &range))
            .unwrap_err();
        assert_matches!(err, FiregridError::SchemaConflict(_));
    }

    #[test]
    fn manifest_marks_gaps() {
        let grid = grid();
        let range = DateRange::new(day(1), day(3)).unwrap();
        let writer = StoreWriter::new(Arc::clone(&grid), range);
        writer
            .commit("hrrr", SourceKind::Continuous, series(&grid, "t2m", &range))
            .unwrap();
        let store = writer.finish(Utc::now());
        let gaps = store.manifest().gaps();
        assert_eq!(gaps.len(), 2);
        assert_eq!(store.value_kind(&"t2m".parse().unwrap()), Some(ValueKind::Scalar));
    }
}
