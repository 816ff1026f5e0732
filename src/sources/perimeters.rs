//! Fire perimeters from a GeoJSON FeatureCollection with CAL FIRE attribute names.

use std::fs;

use camino::Utf8PathBuf;
use chrono::{DateTime, NaiveDate};
use geo::{BoundingRect, Coord, LineString, MultiPolygon, Polygon};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::crs::Crs;
use crate::domain::{DateRange, SourceKind, VariableName};
use crate::error::FiregridError;
use crate::fire::{FirePolygon, supersede};
use crate::grid::Extent;
use crate::sources::{NativePayload, NativeUnit, SourceAdapter};

const ID_FIELDS: [&str; 3] = ["INC_NUM", "FIRE_NAME", "OBJECTID"];

#[derive(Debug, Deserialize)]
struct FeatureCollection {
    #[serde(default)]
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    #[serde(default)]
    geometry: Option<RawGeometry>,
    #[serde(default)]
    properties: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct RawGeometry {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    coordinates: Value,
}

pub fn fire_variable() -> VariableName {
    VariableName::builtin("fire")
}

#[derive(Debug, Clone)]
pub struct PerimeterSource {
    name: String,
    path: Utf8PathBuf,
    crs: Crs,
}

impl PerimeterSource {
    pub fn new(name: String, path: Utf8PathBuf, crs: Crs) -> Self {
        Self { name, path, crs }
    }

    /// Every usable perimeter in the file, with superseded records removed.
    pub fn load(&self) -> Result<Vec<FirePolygon>, FiregridError> {
        if !self.path.is_file() {
            return Err(FiregridError::SourceUnavailable {
                source_name: self.name.clone(),
                detail: format!("{} does not exist", self.path),
            });
        }
        let content = fs::read_to_string(self.path.as_std_path())
            .map_err(|err| FiregridError::Filesystem(format!("read {}: {err}", self.path)))?;
        let collection: FeatureCollection =
            serde_json::from_str(&content).map_err(|err| FiregridError::Decode {
                path: self.path.to_string(),
                detail: err.to_string(),
            })?;

        let total = collection.features.len();
        let mut polygons = Vec::with_capacity(total);
        for (index, feature) in collection.features.into_iter().enumerate() {
            match self.parse_feature(index, feature) {
                Some(polygon) => polygons.push(polygon),
                None => debug!(source = %self.name, index, "dropped perimeter record"),
            }
        }
        let polygons = supersede(polygons);
        info!(
            source = %self.name,
            records = total,
            kept = polygons.len(),
            "loaded fire perimeters"
        );
        Ok(polygons)
    }

    fn parse_feature(&self, index: usize, feature: Feature) -> Option<FirePolygon> {
        let properties = feature.properties.unwrap_or_default();
        let geometry = parse_geometry(feature.geometry?)?;
        let alarm_date = properties.get("ALARM_DATE").and_then(parse_record_date)?;
        let containment_date = properties
            .get("CONT_DATE")
            .and_then(parse_record_date)
            .unwrap_or(alarm_date);
        let fire_identifier = ID_FIELDS
            .iter()
            .find_map(|field| properties.get(*field).and_then(value_text))
            .unwrap_or_else(|| format!("feature-{index}"));
        if containment_date < alarm_date {
            warn!(
                source = %self.name,
                fire = %fire_identifier,
                %alarm_date,
                %containment_date,
                "contained before ignition; record dropped"
            );
            return None;
        }
        Some(FirePolygon {
            geometry,
            crs: self.crs.clone(),
            alarm_date,
            containment_date,
            acres_burned: properties
                .get("GIS_ACRES")
                .and_then(value_number)
                .unwrap_or(0.0),
            cause_category: properties
                .get("CAUSE")
                .and_then(value_text)
                .unwrap_or_else(|| "unknown".to_string()),
            agency: properties
                .get("AGENCY")
                .and_then(value_text)
                .unwrap_or_default(),
            fire_identifier,
        })
    }
}

impl SourceAdapter for PerimeterSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Perimeter
    }

    fn native_crs(&self) -> &Crs {
        &self.crs
    }

    fn native_resolution(&self) -> f64 {
        0.0
    }

    fn variables(&self) -> Vec<VariableName> {
        vec![fire_variable()]
    }

    fn cadence_days(&self) -> u32 {
        0
    }

    fn extent(&self) -> Result<Option<Extent>, FiregridError> {
        let polygons = self.load()?;
        let all = MultiPolygon::new(
            polygons
                .into_iter()
                .flat_map(|polygon| polygon.geometry.0)
                .collect(),
        );
        Ok(all
            .bounding_rect()
            .map(|rect| Extent::new(rect.min().x, rect.min().y, rect.max().x, rect.max().y)))
    }

    /// Perimeters whose active period overlaps `range`. An empty result is a
    /// valid fire-free period, not a gap.
    fn read(&self, range: &DateRange) -> Result<Vec<NativeUnit>, FiregridError> {
        let polygons: Vec<FirePolygon> = self
            .load()?
            .into_iter()
            .filter(|polygon| polygon.active_range().intersect(range).is_some())
            .collect();
        Ok(vec![NativeUnit {
            date: None,
            variable: fire_variable(),
            payload: NativePayload::Perimeters(polygons),
        }])
    }
}

/// Accepts `YYYY-MM-DD`, `YYYY/MM/DD`, RFC 3339 timestamps and epoch milliseconds.
pub fn parse_record_date(value: &Value) -> Option<NaiveDate> {
    match value {
        Value::Number(number) => {
            let millis = number.as_i64().or_else(|| number.as_f64().map(|v| v as i64))?;
            DateTime::from_timestamp_millis(millis).map(|dt| dt.date_naive())
        }
        Value::String(text) => {
            let text = text.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
                return Some(dt.date_naive());
            }
            let day = text.get(..10).unwrap_or(text);
            NaiveDate::parse_from_str(day, "%Y-%m-%d")
                .or_else(|_| NaiveDate::parse_from_str(day, "%Y/%m/%d"))
                .ok()
        }
        _ => None,
    }
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn value_number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    };
    number.filter(|v| v.is_finite())
}

type Rings = Vec<Vec<Vec<f64>>>;

fn parse_geometry(raw: RawGeometry) -> Option<MultiPolygon<f64>> {
    let parts: Vec<Rings> = match raw.kind.as_str() {
        "Polygon" => vec![serde_json::from_value(raw.coordinates).ok()?],
        "MultiPolygon" => serde_json::from_value(raw.coordinates).ok()?,
        _ => return None,
    };
    let polygons: Vec<Polygon<f64>> = parts.into_iter().filter_map(rings_to_polygon).collect();
    (!polygons.is_empty()).then(|| MultiPolygon::new(polygons))
}

fn rings_to_polygon(rings: Rings) -> Option<Polygon<f64>> {
    let mut rings = rings.into_iter().map(|ring| {
        LineString::new(
            ring.into_iter()
                .filter(|position| position.len() >= 2)
                .map(|position| Coord {
                    x: position[0],
                    y: position[1],
                })
                .collect(),
        )
    });
    let exterior = rings.next()?;
    if exterior.0.len() < 3 {
        return None;
    }
    Some(Polygon::new(exterior, rings.collect()))
}
