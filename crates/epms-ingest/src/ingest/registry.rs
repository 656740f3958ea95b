//! Schema registry
//!
//! Static mapping from logical file type to target table, expected columns and
//! the natural key used for conflict resolution. Built once at startup and
//! shared read-only by every watch context.

use super::models::LogicalFileType;
use crate::error::{IngestError, IngestResult};

/// Storage type of a mapped column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Text,
    /// Coerced by the normalizer; unparseable values become null
    Date,
    /// Passed through as text and cast by the store
    Time,
    /// Passed through as text and cast by the store
    Decimal,
}

impl SqlType {
    pub fn ddl(&self) -> &'static str {
        match self {
            SqlType::Text => "TEXT",
            SqlType::Date => "DATE",
            SqlType::Time => "TIME",
            SqlType::Decimal => "NUMERIC(7,2)",
        }
    }

    /// Cast appended to a bound text parameter, if any
    pub fn cast(&self) -> Option<&'static str> {
        match self {
            SqlType::Time => Some("::time"),
            SqlType::Decimal => Some("::numeric"),
            SqlType::Text | SqlType::Date => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub sql_type: SqlType,
}

const fn text(name: &'static str) -> ColumnSpec {
    ColumnSpec { name, sql_type: SqlType::Text }
}

const fn date(name: &'static str) -> ColumnSpec {
    ColumnSpec { name, sql_type: SqlType::Date }
}

const fn time(name: &'static str) -> ColumnSpec {
    ColumnSpec { name, sql_type: SqlType::Time }
}

const fn decimal(name: &'static str) -> ColumnSpec {
    ColumnSpec { name, sql_type: SqlType::Decimal }
}

/// Target table description for one logical file type
#[derive(Debug, Clone, Copy)]
pub struct TableMapping {
    pub file_type: LogicalFileType,
    pub table: &'static str,
    /// Lower-case filename tokens that identify this type
    pub tokens: &'static [&'static str],
    pub columns: &'static [ColumnSpec],
    /// Columns whose values identify a row; always a subset of `columns`
    pub natural_key: &'static [&'static str],
}

impl TableMapping {
    pub fn column(&self, name: &str) -> Option<&'static ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn is_key_column(&self, name: &str) -> bool {
        self.natural_key.contains(&name)
    }

    pub fn date_columns(&self) -> impl Iterator<Item = &'static ColumnSpec> {
        self.columns.iter().filter(|c| c.sql_type == SqlType::Date)
    }

    /// `CREATE TABLE IF NOT EXISTS` statement for this mapping.
    ///
    /// Adds a surrogate id, a unique constraint over the natural key and the
    /// created/updated audit columns maintained by the store.
    pub fn create_table_sql(&self) -> String {
        let mut sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    id SERIAL PRIMARY KEY",
            self.table
        );

        for column in self.columns {
            sql.push_str(",\n    ");
            sql.push_str(column.name);
            sql.push(' ');
            sql.push_str(column.sql_type.ddl());
            if self.is_key_column(column.name) {
                sql.push_str(" NOT NULL");
            }
        }

        sql.push_str(",\n    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP");
        sql.push_str(",\n    updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP");
        sql.push_str(&format!(",\n    UNIQUE ({})\n)", self.natural_key.join(", ")));
        sql
    }
}

// ============================================================================
// Built-in mappings
// ============================================================================

const EMPLOYEE_MASTER_COLUMNS: &[ColumnSpec] = &[
    text("employee_code"),
    text("employee_name"),
    text("email"),
    text("additional_email"),
    text("mobile_number"),
    text("secondary_mobile_number"),
    text("gender"),
    date("date_of_joining"),
    date("date_of_birth"),
    text("fax"),
    text("marital_status"),
    text("self_service"),
    text("employee_type"),
    text("office_location"),
    text("business_unit"),
    text("designation"),
    text("department"),
    text("grade"),
    text("parent_department"),
    text("primary_manager"),
    text("primary_manager_email"),
    text("bank_name"),
    text("branch_name"),
    text("account_holder_name"),
    text("account_number"),
    text("account_type"),
    text("ifsc_code"),
    text("swift_code"),
    text("pan_number"),
    text("aadhaar_enrollment_number"),
    text("aadhaar_number"),
    text("present_address"),
    text("present_state"),
    text("present_city"),
    text("present_pincode"),
    text("present_country"),
    text("permanent_address"),
    text("permanent_state"),
    text("permanent_city"),
    text("permanent_pincode"),
    text("permanent_country"),
    text("status"),
];

const EXIT_REPORT_COLUMNS: &[ColumnSpec] = &[
    text("employee_code"),
    text("employee_name"),
    text("business_unit"),
    text("designation"),
    date("date_of_joining"),
    date("exit_date"),
    date("expected_resignation_date"),
];

const WORK_PROFILE_COLUMNS: &[ColumnSpec] = &[
    text("employee_code"),
    text("employee_name"),
    text("business_unit"),
    text("parent_designation"),
    text("assigned_department"),
    text("designation"),
    text("office_location_name"),
];

const EXPERIENCE_REPORT_COLUMNS: &[ColumnSpec] = &[
    text("employee_code"),
    text("employee_name"),
    text("business_unit"),
    text("department"),
    text("designation"),
    date("date_of_joining"),
    text("current_experience"),
    text("past_experience"),
    text("total_experience"),
];

const TIMESHEET_COLUMNS: &[ColumnSpec] = &[
    date("date"),
    text("employee_code"),
    text("project_id"),
    text("project_name"),
    decimal("hours_worked"),
];

const DAILY_ATTENDANCE_COLUMNS: &[ColumnSpec] = &[
    date("date"),
    text("employee_code"),
    text("employee_name"),
    time("clock_in_time"),
    time("clock_out_time"),
    decimal("total_hours"),
];

const EMPLOYEE_MASTER: TableMapping = TableMapping {
    file_type: LogicalFileType::EmployeeMaster,
    table: "employee_master",
    tokens: &["employee_master"],
    columns: EMPLOYEE_MASTER_COLUMNS,
    natural_key: &["employee_code"],
};

const EXIT_REPORT: TableMapping = TableMapping {
    file_type: LogicalFileType::ExitReport,
    table: "employee_exit_report",
    tokens: &["employee_exit_report", "exit_report"],
    columns: EXIT_REPORT_COLUMNS,
    natural_key: &["employee_code"],
};

const WORK_PROFILE: TableMapping = TableMapping {
    file_type: LogicalFileType::WorkProfile,
    table: "employee_work_profile",
    tokens: &["employee_work_profile", "work_profile"],
    columns: WORK_PROFILE_COLUMNS,
    natural_key: &["employee_code"],
};

const EXPERIENCE_REPORT: TableMapping = TableMapping {
    file_type: LogicalFileType::ExperienceReport,
    table: "employee_experience_report",
    tokens: &["experience_report"],
    columns: EXPERIENCE_REPORT_COLUMNS,
    natural_key: &["employee_code"],
};

const TIMESHEET: TableMapping = TableMapping {
    file_type: LogicalFileType::Timesheet,
    table: "timesheets",
    tokens: &["timesheet"],
    columns: TIMESHEET_COLUMNS,
    natural_key: &["date", "employee_code", "project_id"],
};

const DAILY_ATTENDANCE: TableMapping = TableMapping {
    file_type: LogicalFileType::DailyAttendance,
    table: "daily_attendance",
    tokens: &["attendance_report_daily", "daily_attendance"],
    columns: DAILY_ATTENDANCE_COLUMNS,
    natural_key: &["date", "employee_code"],
};

/// Mappings for the six HR export types
pub static STANDARD_MAPPINGS: [TableMapping; 6] = [
    EMPLOYEE_MASTER,
    EXIT_REPORT,
    WORK_PROFILE,
    EXPERIENCE_REPORT,
    TIMESHEET,
    DAILY_ATTENDANCE,
];

/// Read-only set of table mappings, cheap to copy into each watch context
#[derive(Debug, Clone, Copy)]
pub struct SchemaRegistry {
    mappings: &'static [TableMapping],
}

impl SchemaRegistry {
    /// Build a registry, rejecting inconsistent mappings
    pub fn new(mappings: &'static [TableMapping]) -> IngestResult<Self> {
        for (idx, mapping) in mappings.iter().enumerate() {
            if mappings[..idx].iter().any(|m| m.file_type == mapping.file_type) {
                return Err(IngestError::Config(format!(
                    "Duplicate mapping for file type {}",
                    mapping.file_type
                )));
            }
            if mapping.natural_key.is_empty() {
                return Err(IngestError::Config(format!(
                    "Mapping for {} has no natural key",
                    mapping.table
                )));
            }
            if let Some(missing) = mapping
                .natural_key
                .iter()
                .find(|k| mapping.column(k).is_none())
            {
                return Err(IngestError::Config(format!(
                    "Natural key column {} is not a column of {}",
                    missing, mapping.table
                )));
            }
            if mapping.tokens.is_empty()
                || mapping.tokens.iter().any(|t| t.is_empty() || *t != t.to_lowercase())
            {
                return Err(IngestError::Config(format!(
                    "Mapping for {} needs non-empty lower-case tokens",
                    mapping.table
                )));
            }
        }

        Ok(Self { mappings })
    }

    /// Registry of the built-in HR export mappings
    pub fn standard() -> Self {
        Self {
            mappings: &STANDARD_MAPPINGS,
        }
    }

    pub fn get(&self, file_type: LogicalFileType) -> Option<&'static TableMapping> {
        self.mappings.iter().find(|m| m.file_type == file_type)
    }

    /// Like [`get`](Self::get) but an absent type is an error
    pub fn lookup(&self, file_type: LogicalFileType) -> IngestResult<&'static TableMapping> {
        self.get(file_type)
            .ok_or_else(|| IngestError::UnknownFileType(file_type.to_string()))
    }

    /// Mappings in declaration order
    pub fn mappings(&self) -> &'static [TableMapping] {
        self.mappings
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_registry_is_valid() {
        let registry = SchemaRegistry::new(&STANDARD_MAPPINGS);
        assert!(registry.is_ok());
        assert_eq!(SchemaRegistry::standard().mappings().len(), 6);
    }

    #[test]
    fn test_natural_keys() {
        let registry = SchemaRegistry::standard();

        let timesheet = registry.get(LogicalFileType::Timesheet);
        assert_eq!(
            timesheet.map(|m| m.natural_key),
            Some(&["date", "employee_code", "project_id"][..])
        );

        let attendance = registry.get(LogicalFileType::DailyAttendance);
        assert_eq!(attendance.map(|m| m.natural_key), Some(&["date", "employee_code"][..]));

        for file_type in [
            LogicalFileType::EmployeeMaster,
            LogicalFileType::ExitReport,
            LogicalFileType::WorkProfile,
            LogicalFileType::ExperienceReport,
        ] {
            assert_eq!(
                registry.get(file_type).map(|m| m.natural_key),
                Some(&["employee_code"][..]),
                "{file_type} should be keyed by employee_code"
            );
        }
    }

    #[test]
    fn test_lookup_missing_type_is_error() {
        static ONLY_TIMESHEETS: [TableMapping; 1] = [TIMESHEET];
        let registry = SchemaRegistry::new(&ONLY_TIMESHEETS).unwrap();

        assert!(registry.lookup(LogicalFileType::Timesheet).is_ok());
        assert!(matches!(
            registry.lookup(LogicalFileType::EmployeeMaster),
            Err(IngestError::UnknownFileType(_))
        ));
    }

    #[test]
    fn test_rejects_key_outside_columns() {
        static BROKEN: [TableMapping; 1] = [TableMapping {
            file_type: LogicalFileType::Timesheet,
            table: "timesheets",
            tokens: &["timesheet"],
            columns: &[text("employee_code")],
            natural_key: &["date"],
        }];

        assert!(matches!(SchemaRegistry::new(&BROKEN), Err(IngestError::Config(_))));
    }

    #[test]
    fn test_create_table_sql() {
        let sql = TIMESHEET.create_table_sql();

        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS timesheets ("));
        assert!(sql.contains("date DATE NOT NULL"));
        assert!(sql.contains("project_name TEXT,"));
        assert!(sql.contains("hours_worked NUMERIC(7,2)"));
        assert!(sql.contains("updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP"));
        assert!(sql.contains("UNIQUE (date, employee_code, project_id)"));
    }
}
