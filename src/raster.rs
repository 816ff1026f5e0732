use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::crs::Crs;
use crate::domain::{StatField, VariableName};
use crate::grid::{Extent, GridSpec};

/// A source raster in its native CRS and resolution, as read by an adapter.
///
/// Row 0 is the northern edge; `origin_x`/`origin_y` is the top-left corner of the
/// top-left pixel.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeRaster {
    pub crs: Crs,
    pub origin_x: f64,
    pub origin_y: f64,
    pub pixel_width: f64,
    pub pixel_height: f64,
    pub width: usize,
    pub height: usize,
    pub values: Vec<f64>,
    pub valid: Vec<bool>,
}

impl NativeRaster {
    /// Builds a raster whose validity is every finite value.
    pub fn new(
        crs: Crs,
        origin: (f64, f64),
        pixel_size: (f64, f64),
        width: usize,
        height: usize,
        values: Vec<f64>,
    ) -> Self {
        let valid = values.iter().map(|v| v.is_finite()).collect();
        Self {
            crs,
            origin_x: origin.0,
            origin_y: origin.1,
            pixel_width: pixel_size.0,
            pixel_height: pixel_size.1,
            width,
            height,
            values,
            valid,
        }
    }

    #[inline]
    pub fn index(&self, col: usize, row: usize) -> usize {
        row * self.width + col
    }

    #[inline]
    pub fn get(&self, col: usize, row: usize) -> Option<f64> {
        let i = self.index(col, row);
        self.valid[i].then(|| self.values[i])
    }

    pub fn pixel_center(&self, col: usize, row: usize) -> (f64, f64) {
        (
            self.origin_x + (col as f64 + 0.5) * self.pixel_width,
            self.origin_y - (row as f64 + 0.5) * self.pixel_height,
        )
    }

    pub fn extent(&self) -> Extent {
        Extent::new(
            self.origin_x,
            self.origin_y - self.height as f64 * self.pixel_height,
            self.origin_x + self.width as f64 * self.pixel_width,
            self.origin_y,
        )
    }

    /// Value of the pixel containing `(x, y)`, if any and valid.
    pub fn sample_nearest(&self, x: f64, y: f64) -> Option<f64> {
        let fx = (x - self.origin_x) / self.pixel_width;
        let fy = (self.origin_y - y) / self.pixel_height;
        if !fx.is_finite() || !fy.is_finite() || fx < 0.0 || fy < 0.0 {
            return None;
        }
        let (col, row) = (fx.floor() as usize, fy.floor() as usize);
        if col >= self.width || row >= self.height {
            return None;
        }
        self.get(col, row)
    }

    /// Invalidates every pixel for which `keep` returns false.
    pub fn mask_where(&mut self, mut keep: impl FnMut(usize) -> bool) {
        for i in 0..self.valid.len() {
            if self.valid[i] && !keep(i) {
                self.valid[i] = false;
            }
        }
    }

    pub fn valid_count(&self) -> usize {
        self.valid.iter().filter(|v| **v).count()
    }
}

/// Five-number summary of the native pixels inside one target cell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatBundle {
    pub mean: f64,
    pub median: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub count: u32,
}

impl StatBundle {
    /// Summarizes the samples; `None` when there are none. Sorts `samples` in place.
    pub fn from_samples(samples: &mut [f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        samples.sort_by(|a, b| a.total_cmp(b));
        let n = samples.len();
        let mean = samples.iter().sum::<f64>() / n as f64;
        let median = if n % 2 == 1 {
            samples[n / 2]
        } else {
            (samples[n / 2 - 1] + samples[n / 2]) / 2.0
        };
        let variance = samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
        // Float summation can push the mean a hair outside [min, max] for flat data.
        let (min, max) = (samples[0], samples[n - 1]);
        Some(Self {
            mean: mean.clamp(min, max),
            median,
            std: variance.sqrt(),
            min,
            max,
            count: n as u32,
        })
    }

    /// Single-value bundle used by the nearest-neighbor fallback.
    pub fn degenerate(value: f64) -> Self {
        Self {
            mean: value,
            median: value,
            std: value,
            min: value,
            max: value,
            count: 1,
        }
    }

    pub fn is_degenerate(&self) -> bool {
        self.count == 1
            && self.mean == self.median
            && self.median == self.std
            && self.std == self.min
            && self.min == self.max
    }

    pub fn field(&self, field: StatField) -> f64 {
        match field {
            StatField::Mean => self.mean,
            StatField::Median => self.median,
            StatField::Std => self.std,
            StatField::Min => self.min,
            StatField::Max => self.max,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellValue {
    Scalar(f64),
    Stats(StatBundle),
}

impl CellValue {
    /// The representative value used for neighborhood and lag features.
    pub fn mean(&self) -> f64 {
        match self {
            CellValue::Scalar(v) => *v,
            CellValue::Stats(bundle) => bundle.mean,
        }
    }
}

/// One variable on the target grid, for one date or for all dates (static).
#[derive(Debug, Clone, PartialEq)]
pub struct RasterLayer {
    pub variable: VariableName,
    pub date: Option<NaiveDate>,
    pub grid: Arc<GridSpec>,
    /// `None` marks an invalid cell.
    pub cells: Vec<Option<CellValue>>,
}

impl RasterLayer {
    pub fn empty(variable: VariableName, date: Option<NaiveDate>, grid: Arc<GridSpec>) -> Self {
        let cells = vec![None; grid.cell_count()];
        Self {
            variable,
            date,
            grid,
            cells,
        }
    }

    pub fn get(&self, index: usize) -> Option<&CellValue> {
        self.cells.get(index).and_then(|c| c.as_ref())
    }

    pub fn is_valid(&self, index: usize) -> bool {
        self.get(index).is_some()
    }

    pub fn valid_count(&self) -> usize {
        self.cells.iter().filter(|c| c.is_some()).count()
    }

    pub fn with_date(&self, date: NaiveDate) -> Self {
        Self {
            date: Some(date),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    #[test]
    fn bundle_of_even_count_averages_middle() {
        let mut samples = vec![4.0, 1.0, 3.0, 2.0];
        let bundle = StatBundle::from_samples(&mut samples).unwrap();
        assert_eq!(bundle.median, 2.5);
        assert_eq!(bundle.min, 1.0);
        assert_eq!(bundle.max, 4.0);
        assert_eq!(bundle.count, 4);
        assert_abs_diff_eq!(bundle.mean, 2.5);
        assert_abs_diff_eq!(bundle.std, 1.25f64.sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn empty_samples_give_no_bundle() {
        assert!(StatBundle::from_samples(&mut []).is_none());
    }

    #[test]
    fn degenerate_bundle_is_flat() {
        let bundle = StatBundle::degenerate(7.0);
        assert!(bundle.is_degenerate());
        let mut samples = vec![7.0, 7.0];
        assert!(!StatBundle::from_samples(&mut samples).unwrap().is_degenerate());
    }

    #[test]
    fn all_zero_samples_are_not_a_fallback() {
        // A dry cell: nine pixels of zero precipitation.
        let mut samples = vec![0.0; 9];
        let bundle = StatBundle::from_samples(&mut samples).unwrap();
        assert_eq!(bundle.count, 9);
        assert!(!bundle.is_degenerate());
        assert!(StatBundle::degenerate(0.0).is_degenerate());
    }

    #[test]
    fn nearest_sample_respects_validity() {
        let mut raster = NativeRaster::new(
            Crs::wgs84(),
            (0.0, 2.0),
            (1.0, 1.0),
            2,
            2,
            vec![1.0, 2.0, f64::NAN, 4.0],
        );
        assert_eq!(raster.sample_nearest(1.5, 1.5), Some(2.0));
        assert_eq!(raster.sample_nearest(0.5, 0.5), None);
        raster.mask_where(|i| i != 3);
        assert_eq!(raster.sample_nearest(1.5, 0.5), None);
        assert_eq!(raster.valid_count(), 2);
    }
}
