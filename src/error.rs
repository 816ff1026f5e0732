use std::path::PathBuf;

use chrono::NaiveDate;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum FiregridError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("missing config file firegrid.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("source {source_name} has no data: {detail}")]
    SourceUnavailable { source_name: String, detail: String },

    #[error("reprojection failed: {0}")]
    Reprojection(String),

    #[error("schema conflict: {0}")]
    SchemaConflict(String),

    #[error(
        "cannot resolve fire conflict for cell {cell} on {date}: candidates tie on every key ({fire_identifier})"
    )]
    ConflictResolutionAmbiguity {
        cell: usize,
        date: NaiveDate,
        fire_identifier: String,
    },

    #[error("failed to decode {path}: {detail}")]
    Decode { path: String, detail: String },

    #[error("archive not found: {0}")]
    ArchiveNotFound(String),

    #[error("invalid date range: {0}")]
    InvalidDateRange(String),

    #[error("invalid source specifier: {0}")]
    InvalidSource(String),

    #[error("{0} source failure(s); output was written with gaps")]
    PartialFailure(usize),

    #[error("run cancelled")]
    Cancelled,

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl FiregridError {
    /// Errors that stop the whole pipeline rather than a single source or date.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FiregridError::Configuration(_)
                | FiregridError::MissingConfig
                | FiregridError::ConfigRead(_)
                | FiregridError::ConfigParse(_)
                | FiregridError::SchemaConflict(_)
                | FiregridError::ConflictResolutionAmbiguity { .. }
                | FiregridError::Cancelled
        )
    }
}
