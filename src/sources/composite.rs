use std::collections::BTreeMap;
use std::sync::LazyLock;

use camino::Utf8PathBuf;
use chrono::{Duration, NaiveDate};
use regex::Regex;
use tracing::warn;

use crate::crs::Crs;
use crate::domain::{DateRange, SourceKind, VariableName};
use crate::error::FiregridError;
use crate::grid::Extent;
use crate::sources::geotiff::{read_geotiff, read_geotiff_extent};
use crate::sources::{NativePayload, NativeUnit, SourceAdapter, list_tiffs};

static COMPOSITE_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.A(\d{4})(\d{3})\.").unwrap());

pub const DEFAULT_SCALE_FACTOR: f64 = 0.0001;
pub const DEFAULT_CADENCE_DAYS: u32 = 16;
const QA_SUFFIX: &str = "pixel_reliability";

/// Multi-day satellite composites, one GeoTIFF per variable and tile:
/// `MOD13Q1.A2020100.h08v05.061.NDVI.tif` with a matching
/// `MOD13Q1.A2020100.h08v05.061.pixel_reliability.tif` quality band.
#[derive(Debug, Clone)]
pub struct CompositeGridSource {
    name: String,
    root: Utf8PathBuf,
    crs: Crs,
    resolution: f64,
    variables: Vec<VariableName>,
    cadence_days: u32,
    scale_factor: f64,
    valid_qa: Vec<i64>,
}

/// Parses the acquisition date out of a `.AYYYYDDD.` filename.
pub fn parse_composite_date(file_name: &str) -> Option<NaiveDate> {
    let caps = COMPOSITE_DATE.captures(file_name)?;
    let year: i32 = caps[1].parse().ok()?;
    let doy: u32 = caps[2].parse().ok()?;
    NaiveDate::from_yo_opt(year, doy)
}

#[derive(Debug, Default)]
struct TileFiles {
    qa: Option<Utf8PathBuf>,
    bands: BTreeMap<String, Utf8PathBuf>,
}

impl CompositeGridSource {
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
            cadence_days: DEFAULT_CADENCE_DAYS,
            scale_factor: DEFAULT_SCALE_FACTOR,
            valid_qa: vec![0],
        }
    }

    pub fn with_cadence(mut self, cadence_days: u32) -> Self {
        self.cadence_days = cadence_days.max(1);
        self
    }

    pub fn with_quality(mut self, scale_factor: f64, valid_qa: Vec<i64>) -> Self {
        self.scale_factor = scale_factor;
        self.valid_qa = valid_qa;
        self
    }

    /// Groups files by (date, tile stem); duplicate tiles keep distinct stems.
    fn tiles(&self) -> Result<BTreeMap<(NaiveDate, String), TileFiles>, FiregridError> {
        if !self.root.is_dir() {
            return Err(FiregridError::SourceUnavailable {
                source_name: self.name.clone(),
                detail: format!("{} is not a directory", self.root),
            });
        }
        let mut tiles: BTreeMap<(NaiveDate, String), TileFiles> = BTreeMap::new();
        for path in list_tiffs(&self.root)? {
            let Some(file_name) = path.file_name() else {
                continue;
            };
            let Some(date) = parse_composite_date(file_name) else {
                warn!(source = %self.name, %path, "no composite date in file name");
                continue;
            };
            let Some(stem) = path.file_stem() else {
                continue;
            };
            let Some((tile, band)) = stem.rsplit_once('.') else {
                continue;
            };
            let entry = tiles.entry((date, tile.to_string())).or_default();
            if band.eq_ignore_ascii_case(QA_SUFFIX) {
                entry.qa = Some(path.clone());
            } else {
                entry.bands.insert(band.to_lowercase(), path.clone());
            }
        }
        Ok(tiles)
    }

    fn window(&self, start: NaiveDate) -> DateRange {
        DateRange {
            start,
            end: start + Duration::days(self.cadence_days as i64 - 1),
        }
    }
}

impl SourceAdapter for CompositeGridSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Composite
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

    fn cadence_days(&self) -> u32 {
        self.cadence_days
    }

    fn extent(&self) -> Result<Option<Extent>, FiregridError> {
        let mut extent: Option<Extent> = None;
        for files in self.tiles()?.values() {
            if let Some(path) = files.bands.values().next() {
                let tile = read_geotiff_extent(path)?;
                extent = Some(match extent {
                    Some(current) => current.union(&tile),
                    None => tile,
                });
            }
        }
        Ok(extent)
    }

    fn read(&self, range: &DateRange) -> Result<Vec<NativeUnit>, FiregridError> {
        let mut units = Vec::new();
        for ((date, tile), files) in self.tiles()? {
            // A composite whose window reaches into the range still supports it.
            if self.window(date).intersect(range).is_none() {
                continue;
            }
            let Some(qa_path) = &files.qa else {
                warn!(source = %self.name, %tile, "missing pixel reliability band; tile skipped");
                continue;
            };
            let qa = match read_geotiff(qa_path, &self.crs) {
                Ok(qa) => qa,
                Err(err) => {
                    warn!(source = %self.name, %tile, "unreadable quality band: {err}");
                    continue;
                }
            };
            for variable in &self.variables {
                let Some(path) = files.bands.get(variable.as_str()) else {
                    continue;
                };
                let mut raster = match read_geotiff(path, &self.crs) {
                    Ok(raster) => raster,
                    Err(err) => {
                        warn!(source = %self.name, %path, "skipping unreadable band: {err}");
                        continue;
                    }
                };
                if raster.width != qa.width || raster.height != qa.height {
                    warn!(source = %self.name, %path, "band and quality shapes differ; tile skipped");
                    continue;
                }
                raster.mask_where(|i| {
                    qa.valid[i] && self.valid_qa.contains(&(qa.values[i].round() as i64))
                });
                for value in raster.values.iter_mut() {
                    *value *= self.scale_factor;
                }
                units.push(NativeUnit {
                    date: Some(date),
                    variable: variable.clone(),
                    payload: NativePayload::Raster(raster),
                });
            }
        }
        if units.is_empty() {
            return Err(FiregridError::SourceUnavailable {
                source_name: self.name.clone(),
                detail: format!("no composites overlapping {range}"),
            });
        }
        Ok(units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_year_and_day_of_year() {
        let date = parse_composite_date("MOD13Q1.A2020100.h08v05.061.NDVI.tif").unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(2020, 4, 9).unwrap());
    }

    #[test]
    fn rejects_names_without_date() {
        assert!(parse_composite_date("elevation.tif").is_none());
        assert!(parse_composite_date("MOD13Q1.A2021400.h08v05.NDVI.tif").is_none());
    }
}
