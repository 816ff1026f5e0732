use serde::{Deserialize, Serialize};

use crate::crs::{Crs, CrsTransform};
use crate::error::FiregridError;

/// Axis-aligned bounding box in some CRS.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extent {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Extent {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn is_degenerate(&self) -> bool {
        let finite = [self.min_x, self.min_y, self.max_x, self.max_y]
            .iter()
            .all(|v| v.is_finite());
        !finite || self.width() <= 0.0 || self.height() <= 0.0
    }

    pub fn union(&self, other: &Extent) -> Extent {
        Extent {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }

    /// Corners and edge midpoints, enough to bound a projected box.
    fn sample_points(&self) -> [(f64, f64); 8] {
        let mid_x = (self.min_x + self.max_x) / 2.0;
        let mid_y = (self.min_y + self.max_y) / 2.0;
        [
            (self.min_x, self.min_y),
            (self.max_x, self.min_y),
            (self.max_x, self.max_y),
            (self.min_x, self.max_y),
            (mid_x, self.min_y),
            (mid_x, self.max_y),
            (self.min_x, mid_y),
            (self.max_x, mid_y),
        ]
    }

    /// Bounds of this extent after transforming into another CRS.
    pub fn transformed(&self, transform: &CrsTransform) -> Result<Extent, FiregridError> {
        let mut min_x = f64::INFINITY;
        let mut min_y = f64::INFINITY;
        let mut max_x = f64::NEG_INFINITY;
        let mut max_y = f64::NEG_INFINITY;
        for (x, y) in self.sample_points() {
            let (tx, ty) = transform.transform(x, y)?;
            min_x = min_x.min(tx);
            min_y = min_y.min(ty);
            max_x = max_x.max(tx);
            max_y = max_y.max(ty);
        }
        Ok(Extent::new(min_x, min_y, max_x, max_y))
    }
}

/// The common target grid of a pipeline run.
///
/// `origin_x`/`origin_y` is the top-left (north-west) corner. Cells are square with
/// side `resolution` in CRS units; `cell_index = row * width + col` with row 0 at
/// the northern edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    pub crs: Crs,
    pub resolution: f64,
    pub origin_x: f64,
    pub origin_y: f64,
    pub width: usize,
    pub height: usize,
}

impl GridSpec {
    pub fn new(crs: Crs, resolution: f64, extent: Extent) -> Result<Self, FiregridError> {
        if !resolution.is_finite() || resolution <= 0.0 {
            return Err(FiregridError::Configuration(format!(
                "resolution must be positive, got {resolution}"
            )));
        }
        if extent.is_degenerate() {
            return Err(FiregridError::Configuration(format!(
                "degenerate extent {extent:?} in {crs}"
            )));
        }
        let origin_x = (extent.min_x / resolution).floor() * resolution;
        let origin_y = (extent.max_y / resolution).ceil() * resolution;
        let width = ((extent.max_x - origin_x) / resolution).ceil() as usize;
        let height = ((origin_y - extent.min_y) / resolution).ceil() as usize;
        if width == 0 || height == 0 {
            return Err(FiregridError::Configuration(format!(
                "extent {extent:?} yields an empty {width}x{height} grid"
            )));
        }
        Ok(Self {
            crs,
            resolution,
            origin_x,
            origin_y,
            width,
            height,
        })
    }

    /// Builds the grid covering the union of all source extents, each given in its
    /// own native CRS.
    pub fn from_source_extents(
        crs: Crs,
        resolution: f64,
        sources: &[(Crs, Extent)],
    ) -> Result<Self, FiregridError> {
        let mut union: Option<Extent> = None;
        for (native_crs, extent) in sources {
            let transform = CrsTransform::new(native_crs, &crs)
                .map_err(|err| FiregridError::Configuration(err.to_string()))?;
            let projected = extent
                .transformed(&transform)
                .map_err(|err| FiregridError::Configuration(err.to_string()))?;
            if projected.is_degenerate() {
                return Err(FiregridError::Configuration(format!(
                    "extent of {native_crs} source degenerates in {crs}"
                )));
            }
            union = Some(match union {
                Some(current) => current.union(&projected),
                None => projected,
            });
        }
        let extent = union.ok_or_else(|| {
            FiregridError::Configuration("no source extents to derive the grid from".to_string())
        })?;
        Self::new(crs, resolution, extent)
    }

    pub fn cell_count(&self) -> usize {
        self.width * self.height
    }

    pub fn extent(&self) -> Extent {
        Extent::new(
            self.origin_x,
            self.origin_y - self.height as f64 * self.resolution,
            self.origin_x + self.width as f64 * self.resolution,
            self.origin_y,
        )
    }

    pub fn cell_index(&self, col: usize, row: usize) -> usize {
        row * self.width + col
    }

    pub fn col_row(&self, index: usize) -> (usize, usize) {
        (index % self.width, index / self.width)
    }

    pub fn cell_bounds(&self, index: usize) -> Extent {
        let (col, row) = self.col_row(index);
        let min_x = self.origin_x + col as f64 * self.resolution;
        let max_y = self.origin_y - row as f64 * self.resolution;
        Extent::new(min_x, max_y - self.resolution, min_x + self.resolution, max_y)
    }

    pub fn cell_center(&self, index: usize) -> (f64, f64) {
        let (col, row) = self.col_row(index);
        (
            self.origin_x + (col as f64 + 0.5) * self.resolution,
            self.origin_y - (row as f64 + 0.5) * self.resolution,
        )
    }

    /// Cell containing `(x, y)`. A point exactly on a shared cell edge belongs to
    /// the lower-index cell.
    pub fn locate(&self, x: f64, y: f64) -> Option<usize> {
        let fx = (x - self.origin_x) / self.resolution;
        let fy = (self.origin_y - y) / self.resolution;
        let col = axis_index(fx, self.width)?;
        let row = axis_index(fy, self.height)?;
        Some(self.cell_index(col, row))
    }

    /// Valid 8-connected neighbors of a cell.
    pub fn neighbors8(&self, index: usize) -> Vec<usize> {
        let (col, row) = self.col_row(index);
        let mut out = Vec::with_capacity(8);
        for dr in -1i64..=1 {
            for dc in -1i64..=1 {
                if dr == 0 && dc == 0 {
                    continue;
                }
                let c = col as i64 + dc;
                let r = row as i64 + dr;
                if c >= 0 && r >= 0 && (c as usize) < self.width && (r as usize) < self.height {
                    out.push(self.cell_index(c as usize, r as usize));
                }
            }
        }
        out
    }
}

fn axis_index(f: f64, len: usize) -> Option<usize> {
    if !f.is_finite() || f < 0.0 || f > len as f64 {
        return None;
    }
    let floor = f.floor();
    let index = if floor == f && f > 0.0 {
        floor as usize - 1
    } else {
        floor as usize
    };
    Some(index.min(len - 1))
}
