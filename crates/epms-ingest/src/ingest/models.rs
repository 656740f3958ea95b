//! Core types for the CSV ingestion pipeline

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::registry::{ColumnSpec, TableMapping};
use crate::error::IngestError;

/// Semantic role of a configured directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchedFolder {
    Unprocessed,
    Underprocessed,
    Processed,
}

impl WatchedFolder {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchedFolder::Unprocessed => "unprocessed",
            WatchedFolder::Underprocessed => "underprocessed",
            WatchedFolder::Processed => "processed",
        }
    }

    /// Folders that are swept and watched for arrivals
    pub fn inbound() -> [WatchedFolder; 2] {
        [WatchedFolder::Unprocessed, WatchedFolder::Underprocessed]
    }
}

impl std::fmt::Display for WatchedFolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logical category of an incoming CSV, inferred from its file name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalFileType {
    EmployeeMaster,
    ExitReport,
    WorkProfile,
    ExperienceReport,
    Timesheet,
    DailyAttendance,
}

impl LogicalFileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogicalFileType::EmployeeMaster => "employee_master",
            LogicalFileType::ExitReport => "exit_report",
            LogicalFileType::WorkProfile => "work_profile",
            LogicalFileType::ExperienceReport => "experience_report",
            LogicalFileType::Timesheet => "timesheet",
            LogicalFileType::DailyAttendance => "daily_attendance",
        }
    }
}

impl std::fmt::Display for LogicalFileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A CSV file found in one of the inbound folders
#[derive(Debug, Clone)]
pub struct IngestionFile {
    pub path: PathBuf,
    pub origin: WatchedFolder,
    /// `None` when no registered token matched; such files are never ingested
    pub file_type: Option<LogicalFileType>,
    pub detected_at: DateTime<Utc>,
}

impl IngestionFile {
    pub fn new(path: impl Into<PathBuf>, origin: WatchedFolder) -> Self {
        Self {
            path: path.into(),
            origin,
            file_type: None,
            detected_at: Utc::now(),
        }
    }

    pub fn file_name(&self) -> String {
        file_name_of(&self.path)
    }
}

pub(crate) fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Whether the path carries a `.csv` suffix, in any case
pub fn is_csv(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("csv"))
        .unwrap_or(false)
}

/// A single cell after normalization
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Text(String),
    Number(f64),
    Date(NaiveDate),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Text form handed to the store, `None` for null
    pub fn to_text(&self) -> Option<String> {
        match self {
            FieldValue::Null => None,
            FieldValue::Text(s) => Some(s.clone()),
            FieldValue::Number(n) => Some(n.to_string()),
            FieldValue::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            FieldValue::Date(d) => Some(*d),
            _ => None,
        }
    }
}

/// One input row keyed by canonical column name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedRecord {
    values: HashMap<&'static str, FieldValue>,
}

impl NormalizedRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, column: &'static str, value: FieldValue) {
        self.values.insert(column, value);
    }

    /// Value for a column, `Null` when the column is absent
    pub fn get(&self, column: &str) -> &FieldValue {
        self.values.get(column).unwrap_or(&FieldValue::Null)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Identity of the row under the given natural key
    pub fn key(&self, natural_key: &[&str]) -> Vec<Option<String>> {
        natural_key.iter().map(|c| self.get(c).to_text()).collect()
    }
}

/// All records from one file, bound for one table
#[derive(Debug, Clone)]
pub struct UpsertBatch {
    pub mapping: &'static TableMapping,
    /// Mapped columns present in the source header, in mapping order
    pub columns: Vec<&'static ColumnSpec>,
    pub records: Vec<NormalizedRecord>,
    pub source: PathBuf,
}

impl UpsertBatch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

/// Terminal state of a single processing attempt
#[derive(Debug)]
pub enum FileOutcome {
    /// Persisted and moved into the processed folder
    Processed { destination: PathBuf, rows: usize },
    /// Unrecognized name; left untouched
    Skipped { reason: String },
    /// Left in its origin folder for inspection or a later sweep
    Failed { error: IngestError },
}

impl FileOutcome {
    pub fn is_processed(&self) -> bool {
        matches!(self, FileOutcome::Processed { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, FileOutcome::Failed { .. })
    }
}

/// Counts from a one-shot scan of a folder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub folder: WatchedFolder,
    pub processed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Files left in place because shutdown was requested mid-sweep
    pub remaining: usize,
}

impl SweepReport {
    pub fn new(folder: WatchedFolder) -> Self {
        Self {
            folder,
            processed: 0,
            failed: 0,
            skipped: 0,
            remaining: 0,
        }
    }

    pub fn record(&mut self, outcome: &FileOutcome) {
        match outcome {
            FileOutcome::Processed { .. } => self.processed += 1,
            FileOutcome::Skipped { .. } => self.skipped += 1,
            FileOutcome::Failed { .. } => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.processed + self.failed + self.skipped
    }
}
