use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use firegrid::config::{Config, ConfigLoader, ResolvedConfig};
use firegrid::domain::SourceKind;
use firegrid::error::FiregridError;
use firegrid::regrid::StatisticsMode;
use firegrid::temporal::CompositeMode;

fn resolve(value: serde_json::Value) -> Result<ResolvedConfig, FiregridError> {
    let config: Config = serde_json::from_value(value).unwrap();
    ConfigLoader::resolve_config(config)
}

#[test]
fn file_config_resolves_detailed_sources() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("firegrid.json");
    std::fs::write(
        &path,
        r#"{
            "grid": { "crs": "EPSG:32611", "resolution": 3000, "extent": [300000, 3600000, 900000, 4650000] },
            "sources": [
                "continuous:data/hrrr",
                {
                    "name": "modis",
                    "kind": "composite",
                    "path": "data/mod13",
                    "cadence_days": 16,
                    "statistics": "scalar",
                    "expected_completeness": 0.9
                },
                { "kind": "perimeter", "path": "data/fire_perimeters.geojson" }
            ],
            "temporal": { "composite_mode": "interpolate" },
            "tabular": { "neighborhood": true, "lags": [3, 1, 1], "horizon_days": 5 }
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(path.to_str()).unwrap();
    assert_eq!(resolved.sources.len(), 3);
    assert_eq!(resolved.sources[0].name, "continuous");
    assert_eq!(resolved.sources[0].cadence_days, 1);
    let modis = &resolved.sources[1];
    assert_eq!(modis.kind, SourceKind::Composite);
    assert_eq!(modis.statistics, StatisticsMode::Scalar);
    assert_eq!(modis.expected_completeness, Some(0.9));
    assert_eq!(modis.variables.len(), 2);
    assert_eq!(resolved.sources[2].crs.id(), "EPSG:4326");
    assert_eq!(resolved.composite_mode, CompositeMode::Interpolate);
    assert_eq!(resolved.tabular.lags, vec![1, 3]);
    assert!(resolved.tabular.neighborhood);
    assert_eq!(resolved.tabular.horizon_days, 5);
    assert_eq!(resolved.archive_root, Utf8PathBuf::from("archive"));
    assert!(resolved.grid.extent.is_some());
}

#[test]
fn missing_explicit_config_is_a_read_error() {
    let err = ConfigLoader::resolve(Some("does/not/exist/firegrid.json")).unwrap_err();
    assert_matches!(err, FiregridError::ConfigRead(_));
}

#[test]
fn malformed_json_is_a_parse_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("firegrid.json");
    std::fs::write(&path, "{ \"sources\": [").unwrap();
    let err = ConfigLoader::resolve(path.to_str()).unwrap_err();
    assert_matches!(err, FiregridError::ConfigParse(_));
}

#[test]
fn unknown_shorthand_kind_is_rejected() {
    let err = resolve(serde_json::json!({ "sources": ["satellite:data/x"] })).unwrap_err();
    assert_matches!(err, FiregridError::InvalidSource(_));
}

#[test]
fn duplicate_source_names_are_rejected() {
    let err = resolve(serde_json::json!({
        "sources": ["static:data/srtm", "static:data/srtm_v2"]
    }))
    .unwrap_err();
    assert_matches!(err, FiregridError::Configuration(message) if message.contains("static"));
}

#[test]
fn empty_source_list_is_rejected() {
    let err = resolve(serde_json::json!({ "sources": [] })).unwrap_err();
    assert_matches!(err, FiregridError::Configuration(_));
}

#[test]
fn zero_lag_is_rejected() {
    let err = resolve(serde_json::json!({
        "sources": ["static:data/srtm"],
        "tabular": { "lags": [0, 1] }
    }))
    .unwrap_err();
    assert_matches!(err, FiregridError::Configuration(_));
}

#[test]
fn split_boundaries_must_increase() {
    let err = resolve(serde_json::json!({
        "sources": ["static:data/srtm"],
        "tabular": { "train_end": "2020-08-31", "validation_end": "2020-06-30" }
    }))
    .unwrap_err();
    assert_matches!(err, FiregridError::Configuration(_));
}

#[test]
fn unknown_crs_is_rejected() {
    let err = resolve(serde_json::json!({
        "grid": { "crs": "EPSG:999999" },
        "sources": ["static:data/srtm"]
    }))
    .unwrap_err();
    assert_matches!(err, FiregridError::Configuration(_));
}

#[test]
fn degenerate_grid_extent_is_rejected() {
    let err = resolve(serde_json::json!({
        "grid": { "extent": [10.0, 10.0, 10.0, 20.0] },
        "sources": ["static:data/srtm"]
    }))
    .unwrap_err();
    assert_matches!(err, FiregridError::Configuration(_));
}
