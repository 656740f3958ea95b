//! Record normalizer
//!
//! Parses a delimited file with a header row into an [`UpsertBatch`]:
//!
//! - header names are lower-cased with spaces and hyphens folded into `_`
//! - headers outside the mapping are dropped, natural-key headers are required
//! - date columns are coerced to [`NaiveDate`], unparseable dates become null
//! - decimal and time cells are kept as text for the store to cast
//!
//! Reading is blocking; callers on the async runtime go through
//! `spawn_blocking`.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use csv::{ReaderBuilder, StringRecord, Trim};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::{debug, warn};

use super::models::{FieldValue, NormalizedRecord, UpsertBatch};
use super::registry::{ColumnSpec, SqlType, TableMapping};
use crate::error::{IngestError, IngestResult};

/// Cell spellings treated as missing values
const NULL_MARKERS: &[&str] = &["", "nan", "null", "none", "n/a", "na", "#n/a"];

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    // Month-first before day-first for ambiguous slashed dates
    "%m/%d/%Y",
    "%d/%m/%Y",
    "%d-%m-%Y",
    "%d.%m.%Y",
    "%d-%b-%Y",
    "%d %b %Y",
    "%b %d, %Y",
    "%d %B %Y",
    "%B %d, %Y",
];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

/// Canonical form of a header: lower case, spaces and hyphens as a single `_`
pub fn normalize_column_name(raw: &str) -> String {
    let lowered = raw.trim_start_matches('\u{feff}').trim().to_lowercase();
    let mut out = String::with_capacity(lowered.len());

    for ch in lowered.chars() {
        let ch = if ch == ' ' || ch == '-' { '_' } else { ch };
        if ch == '_' && out.ends_with('_') {
            continue;
        }
        out.push(ch);
    }

    out.trim_matches('_').to_string()
}

/// Best-effort date parsing; `None` when no known layout matches
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();

    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            DATETIME_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
                .map(|dt| dt.date())
        })
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.date_naive()))
}

fn is_null_marker(raw: &str) -> bool {
    let lowered = raw.trim().to_lowercase();
    NULL_MARKERS.contains(&lowered.as_str())
}

/// Converts parsed CSV content into normalized records for one mapping
#[derive(Debug, Clone, Copy)]
pub struct RecordNormalizer {
    mapping: &'static TableMapping,
}

impl RecordNormalizer {
    pub fn new(mapping: &'static TableMapping) -> Self {
        Self { mapping }
    }

    /// Read and normalize a file on disk
    pub fn normalize_file(&self, path: &Path) -> IngestResult<UpsertBatch> {
        let file = File::open(path).map_err(|e| IngestError::io(path, e))?;
        self.normalize_reader(file, path)
    }

    /// Normalize delimited content from any reader; `source` names it in errors
    pub fn normalize_reader<R: Read>(&self, reader: R, source: &Path) -> IngestResult<UpsertBatch> {
        let mut csv_reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(Trim::All)
            .from_reader(reader);

        let headers = csv_reader
            .headers()
            .map_err(|e| IngestError::parse(source, format!("unreadable header: {}", e)))?
            .clone();

        if headers.iter().all(|h| h.trim().is_empty()) {
            return Err(IngestError::parse(source, "no header row"));
        }

        let layout = self.resolve_columns(&headers, source)?;

        let mut records = Vec::new();
        let mut nulled_dates = 0usize;

        for (idx, row) in csv_reader.records().enumerate() {
            let row = row.map_err(|e| {
                IngestError::parse(source, format!("row {}: {}", idx + 1, e))
            })?;

            if row.iter().all(|cell| cell.is_empty()) {
                continue;
            }

            let (record, nulled) = self.normalize_row(&row, &layout);
            nulled_dates += nulled;
            records.push(record);
        }

        if nulled_dates > 0 {
            warn!(
                file = %source.display(),
                table = self.mapping.table,
                count = nulled_dates,
                "Unparseable dates stored as null"
            );
        }

        debug!(
            file = %source.display(),
            rows = records.len(),
            columns = layout.len(),
            "Normalized file"
        );

        Ok(UpsertBatch {
            mapping: self.mapping,
            columns: layout.iter().map(|(_, spec)| *spec).collect(),
            records,
            source: source.to_path_buf(),
        })
    }

    /// Header positions of the mapped columns, in mapping order
    fn resolve_columns(
        &self,
        headers: &StringRecord,
        source: &Path,
    ) -> IngestResult<Vec<(usize, &'static ColumnSpec)>> {
        let canonical: Vec<String> = headers.iter().map(normalize_column_name).collect();

        let mut unmapped = Vec::new();
        for (idx, name) in canonical.iter().enumerate() {
            if self.mapping.column(name).is_none() {
                unmapped.push(name.as_str());
            } else if canonical[..idx].contains(name) {
                warn!(
                    file = %source.display(),
                    column = %name,
                    "Duplicate column after normalization, keeping the first"
                );
            }
        }
        if !unmapped.is_empty() {
            warn!(
                file = %source.display(),
                table = self.mapping.table,
                columns = ?unmapped,
                "Ignoring columns not in the table mapping"
            );
        }

        let missing: Vec<String> = self
            .mapping
            .natural_key
            .iter()
            .filter(|key| !canonical.iter().any(|c| c.as_str() == **key))
            .map(|key| key.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(IngestError::MissingColumns {
                file: source.to_path_buf(),
                file_type: self.mapping.file_type,
                missing,
            });
        }

        Ok(self
            .mapping
            .columns
            .iter()
            .filter_map(|spec| {
                canonical
                    .iter()
                    .position(|c| c == spec.name)
                    .map(|idx| (idx, spec))
            })
            .collect())
    }

    /// Returns the record and how many date cells were nulled
    fn normalize_row(
        &self,
        row: &StringRecord,
        layout: &[(usize, &'static ColumnSpec)],
    ) -> (NormalizedRecord, usize) {
        let mut record = NormalizedRecord::new();
        let mut nulled = 0;

        for (idx, spec) in layout {
            let raw = row.get(*idx).unwrap_or("");

            let value = if is_null_marker(raw) {
                FieldValue::Null
            } else {
                match spec.sql_type {
                    SqlType::Date => match parse_date(raw) {
                        Some(date) => FieldValue::Date(date),
                        None => {
                            nulled += 1;
                            FieldValue::Null
                        },
                    },
                    SqlType::Decimal => match raw.parse::<f64>() {
                        Ok(n) if n.is_finite() => FieldValue::Number(n),
                        _ => FieldValue::Text(raw.to_string()),
                    },
                    SqlType::Time | SqlType::Text => FieldValue::Text(raw.to_string()),
                }
            };

            record.insert(spec.name, value);
        }

        (record, nulled)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::ingest::models::LogicalFileType;
    use crate::ingest::registry::SchemaRegistry;

    fn normalizer(file_type: LogicalFileType) -> RecordNormalizer {
        RecordNormalizer::new(SchemaRegistry::standard().get(file_type).unwrap())
    }

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_normalize_column_name() {
        assert_eq!(normalize_column_name("Employee Code"), "employee_code");
        assert_eq!(normalize_column_name("Clock-In Time"), "clock_in_time");
        assert_eq!(normalize_column_name("  Date Of Joining "), "date_of_joining");
        assert_eq!(normalize_column_name("Project - ID"), "project_id");
        assert_eq!(normalize_column_name("\u{feff}Date"), "date");
    }

    #[test]
    fn test_parse_date_layouts() {
        assert_eq!(parse_date("2025-06-01"), Some(ymd(2025, 6, 1)));
        assert_eq!(parse_date("2025/06/01"), Some(ymd(2025, 6, 1)));
        assert_eq!(parse_date("06/01/2025"), Some(ymd(2025, 6, 1)));
        assert_eq!(parse_date("25/12/2024"), Some(ymd(2024, 12, 25)));
        assert_eq!(parse_date("01-Jun-2025"), Some(ymd(2025, 6, 1)));
        assert_eq!(parse_date("2025-06-01 09:30:00"), Some(ymd(2025, 6, 1)));
        assert_eq!(parse_date("2025-06-01T09:30:00+05:30"), Some(ymd(2025, 6, 1)));
        assert_eq!(parse_date("not a date"), None);
        assert_eq!(parse_date("2025-13-45"), None);
    }

    #[test]
    fn test_timesheet_rows() {
        let csv = "Date,Employee Code,Project ID,Project Name,Hours Worked\n\
                   2025-06-01,EMP0001,PRJ001,Alpha,4.0\n\
                   2025-06-02,EMP0002,PRJ002,Beta,7.5\n";

        let batch = normalizer(LogicalFileType::Timesheet)
            .normalize_reader(csv.as_bytes(), Path::new("timesheet_report.csv"))
            .unwrap();

        assert_eq!(batch.mapping.table, "timesheets");
        assert_eq!(batch.len(), 2);
        assert_eq!(
            batch.columns.iter().map(|c| c.name).collect::<Vec<_>>(),
            vec!["date", "employee_code", "project_id", "project_name", "hours_worked"]
        );

        let first = &batch.records[0];
        assert_eq!(first.get("date"), &FieldValue::Date(ymd(2025, 6, 1)));
        assert_eq!(first.get("employee_code"), &FieldValue::Text("EMP0001".into()));
        assert_eq!(first.get("hours_worked"), &FieldValue::Number(4.0));
    }

    #[test]
    fn test_bad_date_becomes_null_and_row_is_kept() {
        let csv = "Employee Code,Employee Name,Date Of Joining,Exit Date\n\
                   EMP0001,Ada,2020-01-15,someday\n\
                   EMP0002,Grace,,2024-03-01\n";

        let batch = normalizer(LogicalFileType::ExitReport)
            .normalize_reader(csv.as_bytes(), Path::new("employee_exit_report.csv"))
            .unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.records[0].get("exit_date"), &FieldValue::Null);
        assert_eq!(batch.records[0].get("date_of_joining"), &FieldValue::Date(ymd(2020, 1, 15)));
        assert_eq!(batch.records[1].get("date_of_joining"), &FieldValue::Null);
        assert_eq!(batch.records[1].get("exit_date"), &FieldValue::Date(ymd(2024, 3, 1)));
    }

    #[test]
    fn test_missing_key_column_fails_whole_file() {
        let csv = "Date,Employee Code,Project Name,Hours Worked\n2025-06-01,EMP0001,Alpha,4\n";

        let err = normalizer(LogicalFileType::Timesheet)
            .normalize_reader(csv.as_bytes(), Path::new("timesheet.csv"))
            .unwrap_err();

        match err {
            IngestError::MissingColumns { missing, file_type, .. } => {
                assert_eq!(missing, vec!["project_id".to_string()]);
                assert_eq!(file_type, LogicalFileType::Timesheet);
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unknown_columns_dropped_and_missing_optional_omitted() {
        let csv = "Employee Code,Employee Name,Favourite Colour\nEMP0001,Ada,green\n";

        let batch = normalizer(LogicalFileType::WorkProfile)
            .normalize_reader(csv.as_bytes(), Path::new("work_profile.csv"))
            .unwrap();

        assert_eq!(
            batch.columns.iter().map(|c| c.name).collect::<Vec<_>>(),
            vec!["employee_code", "employee_name"]
        );
        assert_eq!(batch.records[0].len(), 2);
    }

    #[test]
    fn test_header_only_file_is_empty_batch() {
        let csv = "Date,Employee Code,Employee Name,Clock-In Time,Clock-Out Time,Total Hours\n";

        let batch = normalizer(LogicalFileType::DailyAttendance)
            .normalize_reader(csv.as_bytes(), Path::new("daily_attendance.csv"))
            .unwrap();

        assert!(batch.is_empty());
        assert_eq!(batch.columns.len(), 6);
    }

    #[test]
    fn test_zero_byte_file_is_parse_failure() {
        let err = normalizer(LogicalFileType::Timesheet)
            .normalize_reader("".as_bytes(), Path::new("timesheet.csv"))
            .unwrap_err();

        assert!(matches!(err, IngestError::Parse { .. }));
    }

    #[test]
    fn test_null_markers_and_blank_lines() {
        let csv = "Date,Employee Code,Employee Name,Clock-In Time,Clock-Out Time,Total Hours\n\
                   2025-06-01,EMP0001,NaN,09:00:00,,N/A\n\
                   ,,,,,\n";

        let batch = normalizer(LogicalFileType::DailyAttendance)
            .normalize_reader(csv.as_bytes(), Path::new("daily_attendance.csv"))
            .unwrap();

        assert_eq!(batch.len(), 1);
        let row = &batch.records[0];
        assert_eq!(row.get("employee_name"), &FieldValue::Null);
        assert_eq!(row.get("clock_in_time"), &FieldValue::Text("09:00:00".into()));
        assert_eq!(row.get("clock_out_time"), &FieldValue::Null);
        assert_eq!(row.get("total_hours"), &FieldValue::Null);
    }

    #[test]
    fn test_malformed_decimal_left_for_store() {
        let csv = "Date,Employee Code,Project ID,Hours Worked\n2025-06-01,EMP0001,PRJ001,four\n";

        let batch = normalizer(LogicalFileType::Timesheet)
            .normalize_reader(csv.as_bytes(), Path::new("timesheet.csv"))
            .unwrap();

        assert_eq!(batch.records[0].get("hours_worked"), &FieldValue::Text("four".into()));
    }

    #[test]
    fn test_short_rows_pad_with_null() {
        let csv = "Date,Employee Code,Project ID,Project Name,Hours Worked\n2025-06-01,EMP0001,PRJ001\n";

        let batch = normalizer(LogicalFileType::Timesheet)
            .normalize_reader(csv.as_bytes(), Path::new("timesheet.csv"))
            .unwrap();

        assert_eq!(batch.records[0].get("project_name"), &FieldValue::Null);
        assert_eq!(batch.records[0].get("hours_worked"), &FieldValue::Null);
    }
}
