//! Coordinate reference systems and point transforms.
//!
//! A [`Crs`] is either an `EPSG:<code>` identifier from the small table below or a
//! raw PROJ string. Geographic systems take and return degrees; `proj4rs` works
//! in radians for those, so the conversion happens here.

use std::fmt;
use std::str::FromStr;

use proj4rs::proj::Proj;
use proj4rs::transform::transform;
use serde::{Deserialize, Serialize};

use crate::error::FiregridError;

/// HRRR native Lambert Conformal Conic on a sphere.
pub const HRRR_LCC: &str = "+proj=lcc +lat_1=38.5 +lat_2=38.5 +lat_0=38.5 +lon_0=262.5 +x_0=0 +y_0=0 +R=6371229 +units=m +no_defs";

/// MODIS sinusoidal grid.
pub const MODIS_SINUSOIDAL: &str = "+proj=sinu +R=6371007.181 +units=m +no_defs";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Crs {
    id: String,
    proj: String,
}

impl Crs {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn proj_string(&self) -> &str {
        &self.proj
    }

    pub fn is_geographic(&self) -> bool {
        self.proj.contains("+proj=longlat") || self.proj.contains("+proj=latlong")
    }

    pub fn wgs84() -> Self {
        Self {
            id: "EPSG:4326".to_string(),
            proj: "+proj=longlat +datum=WGS84 +no_defs".to_string(),
        }
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl FromStr for Crs {
    type Err = FiregridError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.starts_with('+') {
            return Ok(Self {
                id: trimmed.to_string(),
                proj: trimmed.to_string(),
            });
        }
        let code = trimmed
            .strip_prefix("EPSG:")
            .or_else(|| trimmed.strip_prefix("epsg:"))
            .and_then(|code| code.parse::<u32>().ok())
            .ok_or_else(|| FiregridError::Configuration(format!("unknown CRS: {value}")))?;
        let proj = epsg_proj_string(code)
            .ok_or_else(|| FiregridError::Configuration(format!("unsupported EPSG code: {code}")))?;
        Ok(Self {
            id: format!("EPSG:{code}"),
            proj,
        })
    }
}

impl TryFrom<String> for Crs {
    type Error = FiregridError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Crs> for String {
    fn from(value: Crs) -> Self {
        value.id
    }
}

fn epsg_proj_string(code: u32) -> Option<String> {
    match code {
        4326 => Some("+proj=longlat +datum=WGS84 +no_defs".to_string()),
        4269 => Some("+proj=longlat +datum=NAD83 +no_defs".to_string()),
        3857 => Some(
            "+proj=merc +a=6378137 +b=6378137 +lat_ts=0 +lon_0=0 +x_0=0 +y_0=0 +k=1 +units=m +no_defs"
                .to_string(),
        ),
        3310 => Some(
            "+proj=aea +lat_0=0 +lon_0=-120 +lat_1=34 +lat_2=40.5 +x_0=0 +y_0=-4000000 +datum=NAD83 +units=m +no_defs"
                .to_string(),
        ),
        5070 => Some(
            "+proj=aea +lat_0=23 +lon_0=-96 +lat_1=29.5 +lat_2=45.5 +x_0=0 +y_0=0 +datum=NAD83 +units=m +no_defs"
                .to_string(),
        ),
        32601..=32660 => Some(format!(
            "+proj=utm +zone={} +datum=WGS84 +units=m +no_defs",
            code - 32600
        )),
        32701..=32760 => Some(format!(
            "+proj=utm +zone={} +south +datum=WGS84 +units=m +no_defs",
            code - 32700
        )),
        _ => None,
    }
}

/// Reusable transform between two CRS.
pub struct CrsTransform {
    source: Proj,
    target: Proj,
    source_geographic: bool,
    target_geographic: bool,
    identity: bool,
}

impl fmt::Debug for CrsTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrsTransform")
            .field("source_geographic", &self.source_geographic)
            .field("target_geographic", &self.target_geographic)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl CrsTransform {
    pub fn new(source: &Crs, target: &Crs) -> Result<Self, FiregridError> {
        let source_proj = Proj::from_proj_string(source.proj_string()).map_err(|err| {
            FiregridError::Reprojection(format!("invalid source CRS {source}: {err:?}"))
        })?;
        let target_proj = Proj::from_proj_string(target.proj_string()).map_err(|err| {
            FiregridError::Reprojection(format!("invalid target CRS {target}: {err:?}"))
        })?;
        Ok(Self {
            source: source_proj,
            target: target_proj,
            source_geographic: source.is_geographic(),
            target_geographic: target.is_geographic(),
            identity: source.proj_string() == target.proj_string(),
        })
    }

    pub fn is_identity(&self) -> bool {
        self.identity
    }

    pub fn transform(&self, x: f64, y: f64) -> Result<(f64, f64), FiregridError> {
        if self.identity {
            return Ok((x, y));
        }
        let (in_x, in_y) = if self.source_geographic {
            (x.to_radians(), y.to_radians())
        } else {
            (x, y)
        };
        let mut point = (in_x, in_y, 0.0);
        transform(&self.source, &self.target, &mut point)
            .map_err(|err| FiregridError::Reprojection(format!("({x}, {y}): {err:?}")))?;
        let (out_x, out_y) = if self.target_geographic {
            (point.0.to_degrees(), point.1.to_degrees())
        } else {
            (point.0, point.1)
        };
        if !out_x.is_finite() || !out_y.is_finite() {
            return Err(FiregridError::Reprojection(format!(
                "({x}, {y}) has no finite image"
            )));
        }
        Ok((out_x, out_y))
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parses_utm_codes() {
        let crs: Crs = "EPSG:32611".parse().unwrap();
        assert!(crs.proj_string().contains("+zone=11"));
        assert!(!crs.is_geographic());
    }

    #[test]
    fn rejects_unknown_codes() {
        let err = "EPSG:999999".parse::<Crs>().unwrap_err();
        assert_matches!(err, FiregridError::Configuration(_));
    }

    #[test]
    fn central_meridian_maps_to_false_easting() {
        let utm: Crs = "EPSG:32610".parse().unwrap();
        let transform = CrsTransform::new(&Crs::wgs84(), &utm).unwrap();
        let (x, y) = transform.transform(-123.0, 0.0).unwrap();
        assert_abs_diff_eq!(x, 500_000.0, epsilon = 1e-3);
        assert_abs_diff_eq!(y, 0.0, epsilon = 1e-3);
    }

    #[test]
    fn identical_crs_is_identity() {
        let utm: Crs = "EPSG:32611".parse().unwrap();
        let transform = CrsTransform::new(&utm, &utm).unwrap();
        assert!(transform.is_identity());
        assert_eq!(transform.transform(1.5, 2.5).unwrap(), (1.5, 2.5));
    }
}
