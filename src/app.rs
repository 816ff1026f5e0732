use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, Utc};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{ResolvedConfig, SourceRequest};
use crate::domain::{DateRange, SourceKind, VariableName};
use crate::error::FiregridError;
use crate::fire::FireRasterizer;
use crate::grid::GridSpec;
use crate::raster::{NativeRaster, RasterLayer};
use crate::regrid::{Regridder, StatisticsMode};
use crate::sources::{NativePayload, SourceAdapter, build_adapter};
use crate::store::{SourceFailure, SourceReport, StoreWriter, UnifiedStore};
use crate::tabular::{PartitionReport, TabularWriter};
use crate::temporal::{Cadence, TemporalAligner};

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

/// Receives progress from the pipeline; sources report from worker threads.
pub trait ProgressSink: Sync {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone)]
pub struct UnifyOptions {
    pub range: DateRange,
    /// Restricts the run to these source names.
    pub sources: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GridSummary {
    pub crs: String,
    pub resolution: f64,
    pub width: usize,
    pub height: usize,
}

impl From<&GridSpec> for GridSummary {
    fn from(grid: &GridSpec) -> Self {
        Self {
            crs: grid.crs.to_string(),
            resolution: grid.resolution,
            width: grid.width,
            height: grid.height,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UnifyResult {
    pub version: String,
    pub archive_path: String,
    pub grid: GridSummary,
    pub range: DateRange,
    pub variables: Vec<VariableName>,
    pub sources: Vec<SourceReport>,
    pub failures: Vec<SourceFailure>,
}

impl UnifyResult {
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TabularizeResult {
    pub archive_version: String,
    pub output_dir: String,
    pub rows: usize,
    pub partitions: Vec<PartitionReport>,
    pub gaps: usize,
    pub failures: Vec<SourceFailure>,
}

impl TabularizeResult {
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// One configured source and the per-source settings the pipeline applies.
pub struct PipelineSource {
    pub adapter: Box<dyn SourceAdapter>,
    pub statistics: StatisticsMode,
    pub expected_completeness: Option<f64>,
}

impl PipelineSource {
    pub fn new(adapter: Box<dyn SourceAdapter>) -> Self {
        Self {
            adapter,
            statistics: StatisticsMode::Bundle,
            expected_completeness: None,
        }
    }
}

impl From<&SourceRequest> for PipelineSource {
    fn from(request: &SourceRequest) -> Self {
        Self {
            adapter: build_adapter(request),
            statistics: request.statistics,
            expected_completeness: request.expected_completeness,
        }
    }
}

pub struct Pipeline {
    config: ResolvedConfig,
    sources: Vec<PipelineSource>,
}

impl Pipeline {
    pub fn new(config: ResolvedConfig) -> Self {
        let sources = config.sources.iter().map(PipelineSource::from).collect();
        Self { config, sources }
    }

    pub fn with_sources(config: ResolvedConfig, sources: Vec<PipelineSource>) -> Self {
        Self { config, sources }
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    /// Stage 1: regrids and aligns every source, rasterizes fire perimeters and
    /// writes a new archive version. Source-level failures are collected into the
    /// result; configuration, schema and ambiguity errors abort the run.
    pub fn unify(
        &self,
        options: &UnifyOptions,
        sink: &dyn ProgressSink,
    ) -> Result<UnifyResult, FiregridError> {
        let started = Instant::now();
        let selected = self.select_sources(options.sources.as_deref())?;
        let mut failures: Vec<(String, FiregridError)> = Vec::new();

        sink.event(ProgressEvent {
            message: format!("phase=Grid; {} sources", selected.len()),
            elapsed: None,
        });
        let grid = Arc::new(self.build_grid(&selected, &mut failures)?);
        info!(
            crs = %grid.crs,
            resolution = grid.resolution,
            width = grid.width,
            height = grid.height,
            "target grid"
        );

        let writer = StoreWriter::new(Arc::clone(&grid), options.range);
        for (source, err) in &failures {
            writer.record_failure(source, None, err);
        }
        let failed: Vec<&str> = failures.iter().map(|(name, _)| name.as_str()).collect();

        let outcomes: Vec<(String, Result<(), FiregridError>)> = selected
            .par_iter()
            .filter(|source| !failed.contains(&source.adapter.name()))
            .map(|source| {
                let name = source.adapter.name().to_string();
                let outcome = self.unify_source(source, &grid, &options.range, &writer, sink);
                (name, outcome)
            })
            .collect();

        for (name, outcome) in outcomes {
            match outcome {
                Ok(()) => {}
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(source = %name, "source failed: {err}");
                    writer.record_failure(&name, None, &err);
                }
            }
        }

        sink.event(ProgressEvent {
            message: "phase=Store; writing archive".to_string(),
            elapsed: Some(started.elapsed()),
        });
        let mut store = writer.finish(Utc::now());
        let path = store.persist(&self.config.archive_root)?;
        let manifest = store.manifest();
        sink.event(ProgressEvent {
            message: format!("phase=Done; archive {}", manifest.version),
            elapsed: Some(started.elapsed()),
        });

        Ok(UnifyResult {
            version: manifest.version.clone(),
            archive_path: path.to_string(),
            grid: GridSummary::from(grid.as_ref()),
            range: options.range,
            variables: manifest.variables.keys().cloned().collect(),
            sources: manifest.sources.clone(),
            failures: manifest.failures.clone(),
        })
    }

    /// Stage 2: writes the partitioned tabular dataset from an archive version.
    pub fn tabularize(
        &self,
        range: &DateRange,
        horizon_days: Option<u32>,
        version: Option<&str>,
        cancel: Option<Arc<AtomicBool>>,
        sink: &dyn ProgressSink,
    ) -> Result<TabularizeResult, FiregridError> {
        let started = Instant::now();
        sink.event(ProgressEvent {
            message: format!(
                "phase=Resolve; archive {}",
                version.unwrap_or("latest")
            ),
            elapsed: None,
        });
        let store = UnifiedStore::open(&self.config.archive_root, version)?;
        let horizon_days = horizon_days.unwrap_or(self.config.tabular.horizon_days);

        let mut writer = TabularWriter::new(self.config.tabular.clone());
        if let Some(cancel) = cancel {
            writer = writer.with_cancel_flag(cancel);
        }
        sink.event(ProgressEvent {
            message: format!("phase=Tabularize; {range}, horizon {horizon_days} days"),
            elapsed: Some(started.elapsed()),
        });
        let manifest = writer.write(&store, range, horizon_days)?;
        sink.event(ProgressEvent {
            message: format!("phase=Done; {} rows", manifest.total_rows()),
            elapsed: Some(started.elapsed()),
        });

        Ok(TabularizeResult {
            archive_version: manifest.archive_version.clone(),
            output_dir: self.config.tabular.output_dir.to_string(),
            rows: manifest.total_rows(),
            gaps: manifest.gaps.len(),
            partitions: manifest.partitions,
            failures: manifest.failures,
        })
    }

    fn select_sources(&self, names: Option<&[String]>) -> Result<Vec<&PipelineSource>, FiregridError> {
        let Some(names) = names else {
            return Ok(self.sources.iter().collect());
        };
        for name in names {
            if !self.sources.iter().any(|s| s.adapter.name() == name) {
                return Err(FiregridError::InvalidSource(format!(
                    "no configured source named {name}"
                )));
            }
        }
        Ok(self
            .sources
            .iter()
            .filter(|s| names.iter().any(|name| name == s.adapter.name()))
            .collect())
    }

    /// Uses the configured extent, or the union of every source's extent.
    fn build_grid(
        &self,
        sources: &[&PipelineSource],
        failures: &mut Vec<(String, FiregridError)>,
    ) -> Result<GridSpec, FiregridError> {
        let request = &self.config.grid;
        if let Some(extent) = request.extent {
            return GridSpec::new(request.crs.clone(), request.resolution, extent);
        }
        let mut extents = Vec::new();
        for source in sources {
            match source.adapter.extent() {
                Ok(Some(extent)) => extents.push((source.adapter.native_crs().clone(), extent)),
                Ok(None) => {}
                Err(err) => {
                    warn!(source = %source.adapter.name(), "cannot determine extent: {err}");
                    failures.push((source.adapter.name().to_string(), err));
                }
            }
        }
        GridSpec::from_source_extents(request.crs.clone(), request.resolution, &extents)
    }

    fn unify_source(
        &self,
        source: &PipelineSource,
        grid: &Arc<GridSpec>,
        range: &DateRange,
        writer: &StoreWriter,
        sink: &dyn ProgressSink,
    ) -> Result<(), FiregridError> {
        let started = Instant::now();
        let adapter = source.adapter.as_ref();
        let name = adapter.name();
        sink.event(ProgressEvent {
            message: format!("phase=Read; {name}"),
            elapsed: None,
        });
        let units = adapter.read(range)?;

        if adapter.kind() == SourceKind::Perimeter {
            let polygons = units
                .into_iter()
                .flat_map(|unit| match unit.payload {
                    NativePayload::Perimeters(polygons) => polygons,
                    NativePayload::Raster(_) => Vec::new(),
                })
                .collect();
            let rasterization = FireRasterizer::new(Arc::clone(grid)).rasterize(polygons, range)?;
            let fires = rasterization.records.len();
            writer.commit_fire(name, rasterization)?;
            writer.record_source(SourceReport {
                source: name.to_string(),
                kind: adapter.kind(),
                variables: adapter.variables(),
                expected_completeness: source.expected_completeness,
                observed_completeness: 1.0,
            });
            sink.event(ProgressEvent {
                message: format!("phase=Fire; {name}: {fires} fires"),
                elapsed: Some(started.elapsed()),
            });
            return Ok(());
        }

        let mut groups: BTreeMap<(VariableName, Option<NaiveDate>), Vec<NativeRaster>> =
            BTreeMap::new();
        for unit in units {
            match unit.payload {
                NativePayload::Raster(raster) => groups
                    .entry((unit.variable, unit.date))
                    .or_default()
                    .push(raster),
                NativePayload::Perimeters(_) => {
                    warn!(source = %name, "perimeters from a raster source ignored")
                }
            }
        }

        let regridder = Regridder::new(Arc::clone(grid), source.statistics);
        let regridded: Vec<(Option<NaiveDate>, Result<RasterLayer, FiregridError>)> = groups
            .par_iter()
            .map(|((variable, date), tiles)| {
                let tiles: Vec<&NativeRaster> = tiles.iter().collect();
                let layer = regridder
                    .regrid_tiles(&tiles, variable, *date)
                    .map(|(layer, _)| layer);
                (*date, layer)
            })
            .collect();

        // A failed (variable, date) leaves a gap; the rest of the source is kept.
        let mut layers = Vec::with_capacity(regridded.len());
        for (date, outcome) in regridded {
            match outcome {
                Ok(layer) => layers.push(layer),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(source = %name, date = ?date, "layer failed: {err}");
                    writer.record_failure(name, date, &err);
                }
            }
        }

        let mut by_variable: BTreeMap<VariableName, Vec<RasterLayer>> = adapter
            .variables()
            .into_iter()
            .map(|variable| (variable, Vec::new()))
            .collect();
        for layer in layers {
            by_variable.entry(layer.variable.clone()).or_default().push(layer);
        }

        let cadence = match adapter.kind() {
            SourceKind::Static => Cadence::Static,
            SourceKind::Composite => Cadence::Composite {
                window_days: adapter.cadence_days(),
                mode: self.config.composite_mode,
            },
            SourceKind::Continuous | SourceKind::Perimeter => Cadence::Daily,
        };
        let mut completeness = Vec::new();
        for (variable, layers) in by_variable {
            let series = TemporalAligner::align(variable, layers, range, cadence);
            completeness.push(series.completeness());
            writer.commit(name, adapter.kind(), series)?;
        }
        let observed = if completeness.is_empty() {
            0.0
        } else {
            completeness.iter().sum::<f64>() / completeness.len() as f64
        };
        if let Some(expected) = source.expected_completeness {
            info!(source = %name, expected, observed, "source completeness");
        }
        writer.record_source(SourceReport {
            source: name.to_string(),
            kind: adapter.kind(),
            variables: adapter.variables(),
            expected_completeness: source.expected_completeness,
            observed_completeness: observed,
        });
        sink.event(ProgressEvent {
            message: format!("phase=Regrid; {name}: {} layers", groups.len()),
            elapsed: Some(started.elapsed()),
        });
        Ok(())
    }
}
