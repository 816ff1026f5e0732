//! Native source adapters.
//!
//! Every data family is read through [`SourceAdapter`]; the regridder and the
//! tabularizer only ever see [`NativeUnit`]s.

pub mod composite;
pub mod continuous;
pub mod geotiff;
pub mod perimeters;
pub mod terrain;

use camino::Utf8PathBuf;
use chrono::NaiveDate;

use crate::config::SourceRequest;
use crate::crs::Crs;
use crate::domain::{DateRange, SourceKind, VariableName};
use crate::error::FiregridError;
use crate::fire::FirePolygon;
use crate::grid::Extent;
use crate::raster::NativeRaster;

pub use composite::CompositeGridSource;
pub use continuous::ContinuousGridSource;
pub use perimeters::PerimeterSource;
pub use terrain::StaticRasterSource;

#[derive(Debug, Clone)]
pub enum NativePayload {
    Raster(NativeRaster),
    Perimeters(Vec<FirePolygon>),
}

/// One readable unit: a raster for one variable and date (or static), or the
/// perimeter set of a vector source.
#[derive(Debug, Clone)]
pub struct NativeUnit {
    pub date: Option<NaiveDate>,
    pub variable: VariableName,
    pub payload: NativePayload,
}

pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> SourceKind;

    fn native_crs(&self) -> &Crs;

    /// Nominal pixel size in native CRS units.
    fn native_resolution(&self) -> f64;

    /// Variables this source contributes to the store.
    fn variables(&self) -> Vec<VariableName>;

    /// Native temporal cadence in days; static sources report 0.
    fn cadence_days(&self) -> u32 {
        1
    }

    /// Spatial coverage in the native CRS, if it can be determined.
    fn extent(&self) -> Result<Option<Extent>, FiregridError>;

    /// Reads every unit overlapping `range`. Fails with
    /// [`FiregridError::SourceUnavailable`] when no native file matches.
    fn read(&self, range: &DateRange) -> Result<Vec<NativeUnit>, FiregridError>;
}

/// Builds the adapter for a resolved source entry.
pub fn build_adapter(request: &SourceRequest) -> Box<dyn SourceAdapter> {
    match request.kind {
        SourceKind::Continuous => Box::new(ContinuousGridSource::new(
            request.name.clone(),
            request.path.clone(),
            request.crs.clone(),
            request.resolution,
            request.variables.clone(),
        )),
        SourceKind::Composite => Box::new(
            CompositeGridSource::new(
                request.name.clone(),
                request.path.clone(),
                request.crs.clone(),
                request.resolution,
                request.variables.clone(),
            )
            .with_cadence(request.cadence_days)
            .with_quality(request.scale_factor, request.valid_qa.clone()),
        ),
        SourceKind::Static => Box::new(
            StaticRasterSource::new(
                request.name.clone(),
                request.path.clone(),
                request.crs.clone(),
                request.resolution,
                request.variables.first().cloned(),
            )
            .with_derived_terrain(request.derive_terrain),
        ),
        SourceKind::Perimeter => Box::new(PerimeterSource::new(
            request.name.clone(),
            request.path.clone(),
            request.crs.clone(),
        )),
    }
}

/// Sorted `.tif` files directly under `dir`.
pub(crate) fn list_tiffs(dir: &camino::Utf8Path) -> Result<Vec<Utf8PathBuf>, FiregridError> {
    let entries = std::fs::read_dir(dir.as_std_path())
        .map_err(|err| FiregridError::Filesystem(format!("read {dir}: {err}")))?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| FiregridError::Filesystem(err.to_string()))?;
        let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
            continue;
        };
        let is_tiff = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("tif") || ext.eq_ignore_ascii_case("tiff"))
            .unwrap_or(false);
        if path.is_file() && is_tiff {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
