use std::fmt;
use std::str::FromStr;

use chrono::{Duration, NaiveDate};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::FiregridError;

/// Native data family of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Continuous,
    Composite,
    Static,
    Perimeter,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Continuous => write!(f, "continuous"),
            SourceKind::Composite => write!(f, "composite"),
            SourceKind::Static => write!(f, "static"),
            SourceKind::Perimeter => write!(f, "perimeter"),
        }
    }
}

impl FromStr for SourceKind {
    type Err = FiregridError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "continuous" => Ok(SourceKind::Continuous),
            "composite" => Ok(SourceKind::Composite),
            "static" => Ok(SourceKind::Static),
            "perimeter" => Ok(SourceKind::Perimeter),
            _ => Err(FiregridError::InvalidSource(format!(
                "unknown source kind: {value}"
            ))),
        }
    }
}

/// Name of a variable in the unified store, e.g. `t2m` or `ndvi`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VariableName(String);

impl VariableName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Names hard-coded in this crate; already lowercase and valid.
    pub(crate) fn builtin(name: &'static str) -> Self {
        Self(name.to_string())
    }
}

impl fmt::Display for VariableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for VariableName {
    type Err = FiregridError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase();
        let is_valid = !normalized.is_empty()
            && normalized
                .chars()
                .next()
                .map(|ch| ch.is_ascii_alphabetic())
                .unwrap_or(false)
            && normalized
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_');
        if !is_valid {
            return Err(FiregridError::Configuration(format!(
                "invalid variable name: {value}"
            )));
        }
        Ok(Self(normalized))
    }
}

/// Inclusive calendar range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, FiregridError> {
        if end < start {
            return Err(FiregridError::InvalidDateRange(format!(
                "end {end} is before start {start}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn single(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date,
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }

    pub fn len_days(&self) -> usize {
        (self.end - self.start).num_days() as usize + 1
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + use<> {
        let start = self.start;
        (0..self.len_days() as i64).map(move |offset| start + Duration::days(offset))
    }

    pub fn intersect(&self, other: &DateRange) -> Option<DateRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start <= end).then_some(DateRange { start, end })
    }

    /// Splits the range into consecutive chunks of at most `days` days.
    pub fn chunks(&self, days: usize) -> Vec<DateRange> {
        let days = days.max(1) as i64;
        let mut out = Vec::new();
        let mut start = self.start;
        while start <= self.end {
            let end = (start + Duration::days(days - 1)).min(self.end);
            out.push(DateRange { start, end });
            start = end + Duration::days(1);
        }
        out
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

impl FromStr for DateRange {
    type Err = FiregridError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (start, end) = value
            .trim()
            .split_once("..")
            .ok_or_else(|| FiregridError::InvalidDateRange(value.to_string()))?;
        let start = parse_date(start)?;
        let end = parse_date(end)?;
        DateRange::new(start, end)
    }
}

pub fn parse_date(value: &str) -> Result<NaiveDate, FiregridError> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| FiregridError::InvalidDateRange(format!("invalid date: {value}")))
}

/// One of the five sub-grid statistics carried per cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatField {
    Mean,
    Median,
    Std,
    Min,
    Max,
}

impl StatField {
    pub const ALL: [StatField; 5] = [
        StatField::Mean,
        StatField::Median,
        StatField::Std,
        StatField::Min,
        StatField::Max,
    ];

    pub fn suffix(self) -> &'static str {
        match self {
            StatField::Mean => "mean",
            StatField::Median => "median",
            StatField::Std => "std",
            StatField::Min => "min",
            StatField::Max => "max",
        }
    }
}

/// Time-based dataset split of the tabular output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Validation,
    Test,
    Predict,
}

impl Split {
    pub fn as_str(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Validation => "validation",
            Split::Test => "test",
            Split::Predict => "predict",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
