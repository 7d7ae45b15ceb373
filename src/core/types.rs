use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Result, TdmError, Value};

pub const ROW_ID: &str = "ROW_ID";
pub const SELECTED: &str = "SELECTED";
pub const CREATED_WHEN: &str = "CREATED_WHEN";
pub const OCCUPIED_BY: &str = "OCCUPIED_BY";
pub const OCCUPIED_DATE: &str = "OCCUPIED_DATE";

/// System columns every data table carries, in declaration order.
pub const SYSTEM_COLUMNS: [&str; 5] = [ROW_ID, SELECTED, CREATED_WHEN, OCCUPIED_BY, OCCUPIED_DATE];

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

pub type Row = Vec<Value>;

/// A single imported or returned row keyed by column name.
pub type Record = BTreeMap<String, Value>;

pub fn is_system_column(name: &str) -> bool {
    SYSTEM_COLUMNS.iter().any(|c| c.eq_ignore_ascii_case(name))
}

/// UTC timestamp in the text form stored by `CREATED_WHEN`/`OCCUPIED_DATE`.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(text: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S"))
        .map(|naive| naive.and_utc())
        .map_err(|e| TdmError::Validation(format!("invalid timestamp '{}': {}", text, e)))
}

/// Normalized import payload produced by upstream converters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportData {
    pub columns: Vec<String>,
    pub rows: Vec<Record>,
}

impl ImportData {
    pub fn new(columns: Vec<String>, rows: Vec<Record>) -> Self {
        Self { columns, rows }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// User columns in declared order, system columns removed.
    pub fn user_columns(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| !is_system_column(c))
            .cloned()
            .collect()
    }
}

/// Catalog record mapping a logical table to its physical name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub table_name: String,
    pub project_id: Uuid,
    pub system_id: Option<Uuid>,
    pub environment_id: Option<Uuid>,
    pub table_title: String,
    pub last_usage: Option<NaiveDate>,
    pub refresh_config_id: Option<Uuid>,
    pub cleanup_config_id: Option<Uuid>,
}

/// Recorded source query of a table imported from SQL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportInfo {
    pub table_name: String,
    pub table_query: String,
    pub query_timeout_secs: u64,
    pub update_by_query: Option<String>,
}

impl ImportInfo {
    /// False for tables that only carry an update-by-query record.
    pub fn has_source_query(&self) -> bool {
        !self.table_query.trim().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CleanupKind {
    Date,
    Sql,
    Class,
}

impl fmt::Display for CleanupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Date => write!(f, "DATE"),
            Self::Sql => write!(f, "SQL"),
            Self::Class => write!(f, "CLASS"),
        }
    }
}

/// Removal criteria of a cleanup configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum CleanupCriteria {
    /// Rows whose `CREATED_WHEN` is older than reference minus `offset_days`.
    Date { offset_days: u32 },
    /// Predicate run against the source system.
    Sql { query: String, query_timeout_secs: u64 },
    /// Registered in-process strategy.
    Class { name: String },
}

impl CleanupCriteria {
    pub fn kind(&self) -> CleanupKind {
        match self {
            Self::Date { .. } => CleanupKind::Date,
            Self::Sql { .. } => CleanupKind::Sql,
            Self::Class { .. } => CleanupKind::Class,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupConfig {
    pub id: Uuid,
    pub schedule: String,
    pub enabled: bool,
    /// Fan out to every table of the project with the same title.
    pub shared: bool,
    pub criteria: CleanupCriteria,
}

impl CleanupConfig {
    pub fn new(schedule: impl Into<String>, criteria: CleanupCriteria) -> Self {
        Self {
            id: Uuid::new_v4(),
            schedule: schedule.into(),
            enabled: true,
            shared: false,
            criteria,
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn shared(mut self, shared: bool) -> Self {
        self.shared = shared;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshConfig {
    pub id: Uuid,
    pub schedule: String,
    pub enabled: bool,
    /// Overrides the timeout recorded in the table's import info.
    pub query_timeout_secs: Option<u64>,
    /// Fan out to same-titled tables that share the identical source query.
    pub all_environments: bool,
    pub save_occupied_data: bool,
}

impl RefreshConfig {
    pub fn new(schedule: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            schedule: schedule.into(),
            enabled: true,
            query_timeout_secs: None,
            all_environments: false,
            save_occupied_data: false,
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn query_timeout_secs(mut self, secs: u64) -> Self {
        self.query_timeout_secs = Some(secs);
        self
    }

    pub fn all_environments(mut self, all: bool) -> Self {
        self.all_environments = all;
        self
    }

    pub fn save_occupied_data(mut self, save: bool) -> Self {
        self.save_occupied_data = save;
        self
    }
}

/// Outcome of one item of a batch request; a failing item never aborts its siblings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItemResult<T> {
    pub table_name: String,
    pub result: std::result::Result<T, String>,
}

impl<T> BatchItemResult<T> {
    pub fn from_result(table_name: impl Into<String>, result: Result<T>) -> Self {
        Self {
            table_name: table_name.into(),
            result: result.map_err(|e| e.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}
