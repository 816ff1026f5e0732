use std::sync::LazyLock;

use camino::Utf8PathBuf;
use chrono::NaiveDate;
use regex::Regex;
use tracing::{debug, warn};

use crate::crs::Crs;
use crate::domain::{DateRange, SourceKind, VariableName};
use crate::error::FiregridError;
use crate::grid::Extent;
use crate::sources::geotiff::{read_geotiff, read_geotiff_extent};
use crate::sources::{NativePayload, NativeUnit, SourceAdapter};

static DAY_DIR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d{4})(\d{2})(\d{2})$").unwrap());

/// Daily weather-model output laid out as `<root>/YYYYMMDD/<variable>.tif`.
#[derive(Debug, Clone)]
pub struct ContinuousGridSource {
    name: String,
    root: Utf8PathBuf,
    crs: Crs,
    resolution: f64,
    variables: Vec<VariableName>,
}

impl ContinuousGridSource {
    pub fn new(
        name: String,
        root: Utf8PathBuf,
        crs: Crs,
        resolution: f64,
        variables: Vec<VariableName>,
    ) -> Self {
        Self {
            name,
            root,
            crs,
            resolution,
            variables,
        }
    }

    fn day_dirs(&self) -> Result<Vec<(NaiveDate, Utf8PathBuf)>, FiregridError> {
        let entries = std::fs::read_dir(self.root.as_std_path()).map_err(|err| {
            FiregridError::SourceUnavailable {
                source_name: self.name.clone(),
                detail: format!("cannot read {}: {err}", self.root),
            }
        })?;
        let mut dirs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| FiregridError::Filesystem(err.to_string()))?;
            let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
                continue;
            };
            if !path.is_dir() {
                continue;
            }
            if let Some(date) = path.file_name().and_then(parse_day_dir) {
                dirs.push((date, path));
            }
        }
        dirs.sort();
        Ok(dirs)
    }
}

pub fn parse_day_dir(name: &str) -> Option<NaiveDate> {
    let caps = DAY_DIR.captures(name)?;
    NaiveDate::from_ymd_opt(
        caps[1].parse().ok()?,
        caps[2].parse().ok()?,
        caps[3].parse().ok()?,
    )
}

impl SourceAdapter for ContinuousGridSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Continuous
    }

    fn native_crs(&self) -> &Crs {
        &self.crs
    }

    fn native_resolution(&self) -> f64 {
        self.resolution
    }

    fn variables(&self) -> Vec<VariableName> {
        self.variables.clone()
    }

    fn extent(&self) -> Result<Option<Extent>, FiregridError> {
        for (_, dir) in self.day_dirs()? {
            for variable in &self.variables {
                let path = dir.join(format!("{variable}.tif"));
                if path.is_file() {
                    return read_geotiff_extent(&path).map(Some);
                }
            }
        }
        Ok(None)
    }

    fn read(&self, range: &DateRange) -> Result<Vec<NativeUnit>, FiregridError> {
        let mut units = Vec::new();
        for (date, dir) in self.day_dirs()? {
            if !range.contains(date) {
                continue;
            }
            for variable in &self.variables {
                let path = dir.join(format!("{variable}.tif"));
                if !path.is_file() {
                    debug!(source = %self.name, %date, %variable, "variable missing for day");
                    continue;
                }
                match read_geotiff(&path, &self.crs) {
                    Ok(raster) => units.push(NativeUnit {
                        date: Some(date),
                        variable: variable.clone(),
                        payload: NativePayload::Raster(raster),
                    }),
                    Err(err) => warn!(source = %self.name, %path, "skipping unreadable file: {err}"),
                }
            }
        }
        if units.is_empty() {
            return Err(FiregridError::SourceUnavailable {
                source_name: self.name.clone(),
                detail: format!("no daily files in {range}"),
            });
        }
        Ok(units)
    }
}
