#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use camino::Utf8PathBuf;
use chrono::NaiveDate;
use geo::{LineString, MultiPolygon, Polygon};

use firegrid::config::{Config, ConfigLoader, ResolvedConfig};
use firegrid::crs::{Crs, CrsTransform};
use firegrid::domain::{DateRange, SourceKind, VariableName};
use firegrid::error::FiregridError;
use firegrid::fire::FirePolygon;
use firegrid::grid::{Extent, GridSpec};
use firegrid::raster::NativeRaster;
use firegrid::sources::{NativePayload, NativeUnit, SourceAdapter};

pub const ORIGIN_X: f64 = 501_000.0;
pub const ORIGIN_Y: f64 = 4_011_000.0;
pub const CELL: f64 = 3000.0;

pub fn utm() -> Crs {
    "EPSG:32611".parse().unwrap()
}

pub fn doy(day: u32) -> NaiveDate {
    NaiveDate::from_yo_opt(2020, day).unwrap()
}

pub fn ymd(m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, m, d).unwrap()
}

pub fn range(start: NaiveDate, end: NaiveDate) -> DateRange {
    DateRange::new(start, end).unwrap()
}

pub fn grid_extent(width: usize, height: usize) -> Extent {
    Extent::new(
        ORIGIN_X,
        ORIGIN_Y - height as f64 * CELL,
        ORIGIN_X + width as f64 * CELL,
        ORIGIN_Y,
    )
}

pub fn grid(width: usize, height: usize) -> Arc<GridSpec> {
    Arc::new(GridSpec::new(utm(), CELL, grid_extent(width, height)).unwrap())
}

/// A 1 km raster covering a `width` x `height` cell grid; `value(col, row)` is
/// evaluated per native pixel.
pub fn fine_raster(width: usize, height: usize, value: impl Fn(usize, usize) -> f64) -> NativeRaster {
    let (w, h) = (width * 3, height * 3);
    let values = (0..h)
        .flat_map(|row| (0..w).map(move |col| (col, row)))
        .map(|(col, row)| value(col, row))
        .collect();
    NativeRaster::new(utm(), (ORIGIN_X, ORIGIN_Y), (1000.0, 1000.0), w, h, values)
}

/// Square perimeter covering the middle of cell (`col`, `row`).
pub fn cell_perimeter(
    id: &str,
    col: usize,
    row: usize,
    alarm: NaiveDate,
    containment: NaiveDate,
    acres: f64,
) -> FirePolygon {
    let min_x = ORIGIN_X + col as f64 * CELL + 1000.0;
    let max_y = ORIGIN_Y - row as f64 * CELL - 1000.0;
    let ring = LineString::from(vec![
        (min_x, max_y - 1000.0),
        (min_x + 1000.0, max_y - 1000.0),
        (min_x + 1000.0, max_y),
        (min_x, max_y),
        (min_x, max_y - 1000.0),
    ]);
    FirePolygon {
        geometry: MultiPolygon(vec![Polygon::new(ring, Vec::new())]),
        crs: utm(),
        alarm_date: alarm,
        containment_date: containment,
        acres_burned: acres,
        cause_category: "lightning".to_string(),
        agency: "CDF".to_string(),
        fire_identifier: id.to_string(),
    }
}

/// Center of target cell `cell` expressed in `crs`.
pub fn cell_center_in(grid: &GridSpec, cell: usize, crs: &Crs) -> (f64, f64) {
    let (x, y) = grid.cell_center(cell);
    CrsTransform::new(&grid.crs, crs)
        .unwrap()
        .transform(x, y)
        .unwrap()
}

/// A 61 x 61 raster in `crs` centered on target cell `cell`. Pixels within
/// `half` native units of the center hold `value`; the rest are no-data.
pub fn spot_raster(
    grid: &GridSpec,
    cell: usize,
    crs: Crs,
    pixel: f64,
    half: f64,
    value: f64,
) -> NativeRaster {
    let (cx, cy) = cell_center_in(grid, cell, &crs);
    let n = 61;
    let values = (0..n)
        .flat_map(|row| (0..n).map(move |col| (col, row)))
        .map(|(col, row)| {
            let dx = (col as f64 - 30.0) * pixel;
            let dy = (30.0 - row as f64) * pixel;
            if dx.abs() <= half + 1e-9 && dy.abs() <= half + 1e-9 {
                value
            } else {
                f64::NAN
            }
        })
        .collect();
    NativeRaster::new(
        crs,
        (cx - 30.5 * pixel, cy + 30.5 * pixel),
        (pixel, pixel),
        n,
        n,
        values,
    )
}

/// Square perimeter of half-side `half` (native units) in `crs`, centered on
/// target cell `cell`.
pub fn perimeter_in(
    id: &str,
    grid: &GridSpec,
    cell: usize,
    crs: Crs,
    half: f64,
    alarm: NaiveDate,
    containment: NaiveDate,
) -> FirePolygon {
    let (cx, cy) = cell_center_in(grid, cell, &crs);
    let ring = LineString::from(vec![
        (cx - half, cy - half),
        (cx + half, cy - half),
        (cx + half, cy + half),
        (cx - half, cy + half),
        (cx - half, cy - half),
    ]);
    FirePolygon {
        geometry: MultiPolygon(vec![Polygon::new(ring, Vec::new())]),
        crs,
        ..cell_perimeter(id, 0, 0, alarm, containment, 10.0)
    }
}

/// In-memory source; `read` returns the units inside the requested range.
pub struct MockSource {
    pub name: String,
    pub kind: SourceKind,
    pub variables: Vec<VariableName>,
    pub cadence_days: u32,
    pub extent: Option<Extent>,
    pub units: Vec<NativeUnit>,
    pub failure: Option<String>,
    pub reads: Mutex<usize>,
}

impl MockSource {
    pub fn new(name: &str, kind: SourceKind, variables: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            kind,
            variables: variables.iter().map(|v| v.parse().unwrap()).collect(),
            cadence_days: match kind {
                SourceKind::Composite => 16,
                SourceKind::Continuous => 1,
                _ => 0,
            },
            extent: None,
            units: Vec::new(),
            failure: None,
            reads: Mutex::new(0),
        }
    }

    pub fn with_raster(mut self, variable: &str, date: Option<NaiveDate>, raster: NativeRaster) -> Self {
        self.units.push(NativeUnit {
            date,
            variable: variable.parse().unwrap(),
            payload: NativePayload::Raster(raster),
        });
        self
    }

    pub fn with_perimeters(mut self, polygons: Vec<FirePolygon>) -> Self {
        self.units.push(NativeUnit {
            date: None,
            variable: "fire".parse().unwrap(),
            payload: NativePayload::Perimeters(polygons),
        });
        self
    }

    pub fn with_extent(mut self, extent: Extent) -> Self {
        self.extent = Some(extent);
        self
    }

    pub fn failing(mut self, detail: &str) -> Self {
        self.failure = Some(detail.to_string());
        self
    }

    pub fn read_count(&self) -> usize {
        *self.reads.lock().unwrap()
    }
}

impl SourceAdapter for MockSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn native_crs(&self) -> &Crs {
        static UTM: std::sync::LazyLock<Crs> = std::sync::LazyLock::new(utm);
        &UTM
    }

    fn native_resolution(&self) -> f64 {
        1000.0
    }

    fn variables(&self) -> Vec<VariableName> {
        self.variables.clone()
    }

    fn cadence_days(&self) -> u32 {
        self.cadence_days
    }

    fn extent(&self) -> Result<Option<Extent>, FiregridError> {
        Ok(self.extent)
    }

    fn read(&self, range: &DateRange) -> Result<Vec<NativeUnit>, FiregridError> {
        *self.reads.lock().unwrap() += 1;
        if let Some(detail) = &self.failure {
            return Err(FiregridError::SourceUnavailable {
                source_name: self.name.clone(),
                detail: detail.clone(),
            });
        }
        Ok(self
            .units
            .iter()
            .filter(|unit| match unit.date {
                Some(date) => range.contains(date),
                None => true,
            })
            .cloned()
            .collect())
    }
}

/// Resolved config rooted in `root` with a fixed grid; `tabular` is merged over
/// a default output directory.
pub fn config(
    root: &Utf8PathBuf,
    width: usize,
    height: usize,
    tabular: serde_json::Value,
) -> ResolvedConfig {
    let extent = grid_extent(width, height);
    let mut section = serde_json::json!({ "output": root.join("dataset").to_string() });
    if let serde_json::Value::Object(fields) = tabular {
        for (key, value) in fields {
            section[key] = value;
        }
    }
    let value = serde_json::json!({
        "grid": {
            "crs": "EPSG:32611",
            "resolution": CELL,
            "extent": [extent.min_x, extent.min_y, extent.max_x, extent.max_y]
        },
        "sources": ["continuous:unused"],
        "archive_root": root.join("archive").to_string(),
        "tabular": section,
    });
    let config: Config = serde_json::from_value(value).unwrap();
    ConfigLoader::resolve_config(config).unwrap()
}

pub fn temp_root() -> (tempfile::TempDir, Utf8PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    (dir, root)
}
