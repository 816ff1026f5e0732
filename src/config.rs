use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::crs::{Crs, HRRR_LCC, MODIS_SINUSOIDAL};
use crate::domain::{SourceKind, VariableName};
use crate::error::FiregridError;
use crate::grid::Extent;
use crate::regrid::StatisticsMode;
use crate::sources::composite::{DEFAULT_CADENCE_DAYS, DEFAULT_SCALE_FACTOR};
use crate::tabular::{SplitBoundaries, TabularOptions};
use crate::temporal::CompositeMode;

pub const DEFAULT_CONFIG_FILE: &str = "firegrid.json";
pub const DEFAULT_TARGET_CRS: &str = "EPSG:32611";
pub const DEFAULT_RESOLUTION_M: f64 = 3000.0;
pub const DEFAULT_PARTITION_DAYS: usize = 30;
pub const DEFAULT_HORIZON_DAYS: u32 = 7;

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub grid: Option<GridConfig>,
    #[serde(default)]
    pub sources: Vec<SourceEntry>,
    #[serde(default)]
    pub temporal: Option<TemporalConfig>,
    #[serde(default)]
    pub tabular: Option<TabularConfig>,
    #[serde(default)]
    pub archive_root: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct GridConfig {
    #[serde(default)]
    pub crs: Option<String>,
    #[serde(default)]
    pub resolution: Option<f64>,
    /// `[min_x, min_y, max_x, max_y]` in the target CRS.
    #[serde(default)]
    pub extent: Option<[f64; 4]>,
}

/// `"<kind>:<path>"` or a full object.
#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SourceEntry {
    Shorthand(String),
    Detailed(SourceEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SourceEntryObject {
    #[serde(default)]
    pub name: Option<String>,
    pub kind: SourceKind,
    pub path: String,
    #[serde(default)]
    pub crs: Option<String>,
    #[serde(default)]
    pub resolution: Option<f64>,
    #[serde(default)]
    pub variables: Option<Vec<String>>,
    #[serde(default)]
    pub cadence_days: Option<u32>,
    #[serde(default)]
    pub scale_factor: Option<f64>,
    #[serde(default)]
    pub valid_qa: Option<Vec<i64>>,
    #[serde(default)]
    pub derive_terrain: Option<bool>,
    #[serde(default)]
    pub statistics: Option<StatisticsMode>,
    #[serde(default)]
    pub expected_completeness: Option<f64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct TemporalConfig {
    #[serde(default)]
    pub composite_mode: Option<CompositeMode>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct TabularConfig {
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub neighborhood: Option<bool>,
    #[serde(default)]
    pub lags: Option<Vec<u32>>,
    #[serde(default)]
    pub partition_days: Option<usize>,
    #[serde(default)]
    pub horizon_days: Option<u32>,
    #[serde(default)]
    pub train_end: Option<NaiveDate>,
    #[serde(default)]
    pub validation_end: Option<NaiveDate>,
    #[serde(default)]
    pub test_end: Option<NaiveDate>,
}

#[derive(Debug, Clone)]
pub struct GridRequest {
    pub crs: Crs,
    pub resolution: f64,
    pub extent: Option<Extent>,
}

#[derive(Debug, Clone)]
pub struct SourceRequest {
    pub name: String,
    pub kind: SourceKind,
    pub path: Utf8PathBuf,
    pub crs: Crs,
    pub resolution: f64,
    pub variables: Vec<VariableName>,
    pub cadence_days: u32,
    pub scale_factor: f64,
    pub valid_qa: Vec<i64>,
    pub derive_terrain: bool,
    pub statistics: StatisticsMode,
    pub expected_completeness: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub grid: GridRequest,
    pub sources: Vec<SourceRequest>,
    pub composite_mode: CompositeMode,
    pub tabular: TabularOptions,
    pub archive_root: Utf8PathBuf,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, FiregridError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(FiregridError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| FiregridError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| FiregridError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, FiregridError> {
        let schema_version = config.schema_version.unwrap_or(1);

        let grid = resolve_grid(config.grid.unwrap_or_default())?;

        let sources = config
            .sources
            .into_iter()
            .map(|entry| match entry {
                SourceEntry::Shorthand(value) => resolve_shorthand(&value),
                SourceEntry::Detailed(obj) => resolve_source(obj),
            })
            .collect::<Result<Vec<_>, FiregridError>>()?;
        if sources.is_empty() {
            return Err(FiregridError::Configuration(
                "at least one source is required".to_string(),
            ));
        }
        let mut names = HashSet::new();
        for source in &sources {
            if !names.insert(source.name.as_str()) {
                return Err(FiregridError::Configuration(format!(
                    "duplicate source name: {}",
                    source.name
                )));
            }
        }

        let composite_mode = config
            .temporal
            .and_then(|temporal| temporal.composite_mode)
            .unwrap_or_default();

        let tabular = resolve_tabular(config.tabular.unwrap_or_default())?;

        Ok(ResolvedConfig {
            schema_version,
            grid,
            sources,
            composite_mode,
            tabular,
            archive_root: Utf8PathBuf::from(
                config.archive_root.unwrap_or_else(|| "archive".to_string()),
            ),
        })
    }
}

fn resolve_grid(grid: GridConfig) -> Result<GridRequest, FiregridError> {
    let crs: Crs = grid.crs.as_deref().unwrap_or(DEFAULT_TARGET_CRS).parse()?;
    let resolution = grid.resolution.unwrap_or(DEFAULT_RESOLUTION_M);
    if !resolution.is_finite() || resolution <= 0.0 {
        return Err(FiregridError::Configuration(format!(
            "grid resolution must be positive, got {resolution}"
        )));
    }
    let extent = grid
        .extent
        .map(|[min_x, min_y, max_x, max_y]| Extent::new(min_x, min_y, max_x, max_y));
    if let Some(extent) = &extent {
        if extent.is_degenerate() {
            return Err(FiregridError::Configuration(format!(
                "degenerate grid extent {extent:?}"
            )));
        }
    }
    Ok(GridRequest {
        crs,
        resolution,
        extent,
    })
}

fn resolve_shorthand(value: &str) -> Result<SourceRequest, FiregridError> {
    let (kind, path) = value
        .split_once(':')
        .ok_or_else(|| FiregridError::InvalidSource(value.to_string()))?;
    let kind: SourceKind = kind.parse()?;
    resolve_source(SourceEntryObject {
        name: None,
        kind,
        path: path.to_string(),
        crs: None,
        resolution: None,
        variables: None,
        cadence_days: None,
        scale_factor: None,
        valid_qa: None,
        derive_terrain: None,
        statistics: None,
        expected_completeness: None,
    })
}

fn resolve_source(obj: SourceEntryObject) -> Result<SourceRequest, FiregridError> {
    let kind = obj.kind;
    let name = obj.name.unwrap_or_else(|| kind.to_string());
    let crs: Crs = match &obj.crs {
        Some(crs) => crs.parse()?,
        None => default_crs(kind).parse()?,
    };
    let resolution = obj.resolution.unwrap_or_else(|| default_resolution(kind));
    if !resolution.is_finite() || resolution < 0.0 {
        return Err(FiregridError::Configuration(format!(
            "source {name}: resolution must not be negative"
        )));
    }
    let variables = match obj.variables {
        Some(values) => values
            .iter()
            .map(|value| value.parse())
            .collect::<Result<Vec<VariableName>, _>>()?,
        None => default_variables(kind),
    };
    if variables.is_empty() && kind != SourceKind::Perimeter {
        return Err(FiregridError::Configuration(format!(
            "source {name} lists no variables"
        )));
    }
    if let Some(expected) = obj.expected_completeness {
        if !expected.is_finite() || expected <= 0.0 {
            return Err(FiregridError::Configuration(format!(
                "source {name}: expected_completeness must be positive"
            )));
        }
    }
    let cadence_days = match kind {
        SourceKind::Composite => obj.cadence_days.unwrap_or(DEFAULT_CADENCE_DAYS),
        SourceKind::Continuous => 1,
        SourceKind::Static | SourceKind::Perimeter => 0,
    };
    if kind == SourceKind::Composite && cadence_days == 0 {
        return Err(FiregridError::Configuration(format!(
            "source {name}: cadence_days must be at least 1"
        )));
    }
    Ok(SourceRequest {
        name,
        kind,
        path: Utf8PathBuf::from(obj.path),
        crs,
        resolution,
        variables,
        cadence_days,
        scale_factor: obj.scale_factor.unwrap_or(match kind {
            SourceKind::Composite => DEFAULT_SCALE_FACTOR,
            _ => 1.0,
        }),
        valid_qa: obj.valid_qa.unwrap_or_else(|| vec![0]),
        derive_terrain: obj.derive_terrain.unwrap_or(kind == SourceKind::Static),
        statistics: obj.statistics.unwrap_or_default(),
        expected_completeness: obj.expected_completeness,
    })
}

fn resolve_tabular(tabular: TabularConfig) -> Result<TabularOptions, FiregridError> {
    let splits = SplitBoundaries::new(tabular.train_end, tabular.validation_end, tabular.test_end)?;
    let partition_days = tabular.partition_days.unwrap_or(DEFAULT_PARTITION_DAYS);
    if partition_days == 0 {
        return Err(FiregridError::Configuration(
            "partition_days must be at least 1".to_string(),
        ));
    }
    let mut lags = tabular.lags.unwrap_or_default();
    lags.sort_unstable();
    lags.dedup();
    if lags.contains(&0) {
        return Err(FiregridError::Configuration(
            "lags must be at least 1 day".to_string(),
        ));
    }
    Ok(TabularOptions {
        output_dir: Utf8PathBuf::from(tabular.output.unwrap_or_else(|| "dataset".to_string())),
        neighborhood: tabular.neighborhood.unwrap_or(false),
        lags,
        partition_days,
        horizon_days: tabular.horizon_days.unwrap_or(DEFAULT_HORIZON_DAYS),
        splits,
    })
}

fn default_crs(kind: SourceKind) -> &'static str {
    match kind {
        SourceKind::Continuous => HRRR_LCC,
        SourceKind::Composite => MODIS_SINUSOIDAL,
        SourceKind::Static | SourceKind::Perimeter => "EPSG:4326",
    }
}

fn default_resolution(kind: SourceKind) -> f64 {
    match kind {
        SourceKind::Continuous => 3000.0,
        SourceKind::Composite => 250.0,
        // One arc-second.
        SourceKind::Static => 1.0 / 3600.0,
        SourceKind::Perimeter => 0.0,
    }
}

pub fn default_variables(kind: SourceKind) -> Vec<VariableName> {
    let names: &[&'static str] = match kind {
        SourceKind::Continuous => &["t2m", "r2", "sh2", "d2m", "u10", "v10", "max_10si", "prate"],
        SourceKind::Composite => &["ndvi", "evi"],
        SourceKind::Static => &["elevation"],
        SourceKind::Perimeter => &[],
    };
    names.iter().copied().map(VariableName::builtin).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_config_shorthand() {
        let config = Config {
            schema_version: None,
            grid: None,
            sources: vec![
                SourceEntry::Shorthand("continuous:data/hrrr".to_string()),
                SourceEntry::Shorthand("static:data/srtm".to_string()),
            ],
            temporal: None,
            tabular: None,
            archive_root: None,
        };

        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(resolved.schema_version, 1);
        assert_eq!(resolved.grid.crs.id(), "EPSG:32611");
        assert_eq!(resolved.grid.resolution, 3000.0);
        assert_eq!(resolved.sources.len(), 2);
        assert_eq!(resolved.sources[0].name, "continuous");
        assert_eq!(resolved.sources[0].variables.len(), 8);
        assert!(resolved.sources[1].derive_terrain);
        assert_eq!(resolved.composite_mode, CompositeMode::ForwardFill);
        assert_eq!(resolved.tabular.partition_days, 30);
    }
}
