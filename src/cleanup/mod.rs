//! Cleanup engine.
//!
//! A run walks the tables a cleanup configuration applies to. For each one
//! it snapshots the rows, computes the removal set from the criteria and
//! deletes those rows by id. Every table yields its own [`CleanupResult`];
//! a failing table never stops the others.

mod registry;

use std::collections::{HashSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub use registry::{
    CleanerRegistry, DuplicateRowsCleaner, OccupiedRowsCleaner, TableCleaner,
};

use crate::connection::ConnectionPool;
use crate::core::types::{parse_timestamp, CREATED_WHEN};
use crate::core::{CatalogEntry, CleanupCriteria, Result, TdmError};
use crate::interface::{SourceExecutor, SourceResolver};
use crate::lock::{table_key, DistributedLock};
use crate::result::QueryResult;
use crate::source::{check_read_only, SourceRunner};
use crate::sql::TableQuery;
use crate::storage::table;

/// Upper bound for `CleanupCriteria::Date::offset_days` (one hundred years).
pub const MAX_OFFSET_DAYS: u32 = 36_500;

/// Outcome of cleaning one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupResult {
    pub table_name: String,
    pub records_total: u64,
    pub records_removed: u64,
    pub error: Option<String>,
}

impl CleanupResult {
    pub fn failed(table_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            records_total: 0,
            records_removed: 0,
            error: Some(error.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Rows created strictly before `reference - offset_days`.
///
/// A row stamped exactly at the threshold is kept.
pub fn date_removals(
    snapshot: &QueryResult,
    reference: DateTime<Utc>,
    offset_days: u32,
) -> Result<Vec<String>> {
    let threshold = ChronoDuration::try_days(i64::from(offset_days))
        .and_then(|offset| reference.checked_sub_signed(offset))
        .ok_or_else(|| {
            TdmError::Validation(format!("date offset of {} days is out of range", offset_days))
        })?;
    let mut removals = Vec::new();
    for i in 0..snapshot.row_count() {
        let Some(created) = snapshot.value(i, CREATED_WHEN).and_then(|v| v.to_storage_text()) else {
            continue;
        };
        if parse_timestamp(&created)? < threshold {
            removals.push(registry::row_id(snapshot, i)?);
        }
    }
    Ok(removals)
}

/// Rows whose values in the columns shared with `matches` equal some row of
/// `matches`. Values are compared as text; a NULL never matches.
pub fn sql_removals(snapshot: &QueryResult, matches: &QueryResult) -> Result<Vec<String>> {
    let shared: Vec<(usize, usize)> = matches
        .columns
        .iter()
        .enumerate()
        .filter_map(|(m, name)| snapshot.column_index(name).map(|s| (s, m)))
        .collect();
    if shared.is_empty() {
        return Err(TdmError::Validation(format!(
            "cleanup query returns no column of the table (got {})",
            matches.columns.join(", ")
        )));
    }

    let wanted: HashSet<Vec<String>> = matches
        .rows
        .iter()
        .filter_map(|row| {
            shared
                .iter()
                .map(|&(_, m)| row[m].to_storage_text())
                .collect::<Option<Vec<_>>>()
        })
        .collect();

    let mut removals = Vec::new();
    for (i, row) in snapshot.rows.iter().enumerate() {
        let key = shared
            .iter()
            .map(|&(s, _)| row[s].to_storage_text())
            .collect::<Option<Vec<_>>>();
        if key.is_some_and(|k| wanted.contains(&k)) {
            removals.push(registry::row_id(snapshot, i)?);
        }
    }
    Ok(removals)
}

pub struct CleanupEngine {
    pool: Arc<ConnectionPool>,
    lock: Arc<DistributedLock>,
    resolver: Arc<dyn SourceResolver>,
    runner: SourceRunner,
    cleaners: Arc<CleanerRegistry>,
}

impl CleanupEngine {
    pub fn new(
        pool: Arc<ConnectionPool>,
        lock: Arc<DistributedLock>,
        resolver: Arc<dyn SourceResolver>,
        runner: SourceRunner,
        cleaners: Arc<CleanerRegistry>,
    ) -> Self {
        Self {
            pool,
            lock,
            resolver,
            runner,
            cleaners,
        }
    }

    pub fn cleaners(&self) -> &CleanerRegistry {
        &self.cleaners
    }

    /// Check criteria before they are saved or run.
    pub fn validate(&self, criteria: &CleanupCriteria) -> Result<()> {
        match criteria {
            CleanupCriteria::Date { offset_days } if *offset_days > MAX_OFFSET_DAYS => {
                Err(TdmError::Validation(format!(
                    "date offset must be at most {} days, got {}",
                    MAX_OFFSET_DAYS, offset_days
                )))
            }
            CleanupCriteria::Date { .. } => Ok(()),
            CleanupCriteria::Sql { query, .. } => check_read_only(query),
            CleanupCriteria::Class { name } => self.cleaners.get(name).map(|_| ()),
        }
    }

    /// Clean every table in `entries`.
    ///
    /// Once a source connection fails, later tables using the same
    /// connection are reported as skipped for the rest of this run.
    pub async fn run(
        &self,
        entries: &[CatalogEntry],
        criteria: &CleanupCriteria,
        reference: DateTime<Utc>,
    ) -> Vec<CleanupResult> {
        let mut failed_sources: HashMap<String, String> = HashMap::new();
        let mut results = Vec::with_capacity(entries.len());

        for entry in entries {
            let table = entry.table_name.as_str();

            let source = match criteria {
                CleanupCriteria::Sql { .. } => {
                    match self.resolver.resolve(entry.environment_id, entry.system_id) {
                        Ok(source) => Some(source),
                        Err(err) => {
                            warn!(table, error = %err, "cleanup source not resolved");
                            results.push(CleanupResult::failed(table, err.to_string()));
                            continue;
                        }
                    }
                }
                _ => None,
            };
            let source_key = source.as_ref().map(|s| s.connection_key());

            if let Some(reason) = source_key.as_ref().and_then(|k| failed_sources.get(k)) {
                results.push(CleanupResult::failed(
                    table,
                    format!("skipped, source connection failed earlier in this run: {}", reason),
                ));
                continue;
            }

            let outcome = self
                .lock
                .with_lock(&table_key(table), move || {
                    self.clean_table(table, criteria, reference, source)
                })
                .await;

            match outcome {
                Ok(result) => {
                    info!(
                        table,
                        total = result.records_total,
                        removed = result.records_removed,
                        "table cleaned"
                    );
                    results.push(result);
                }
                Err(err) => {
                    warn!(table, error = %err, "cleanup failed");
                    if let (TdmError::ExternalExecution(_), Some(key)) = (&err, source_key) {
                        failed_sources.insert(key, err.to_string());
                    }
                    results.push(CleanupResult::failed(table, err.to_string()));
                }
            }
        }

        results
    }

    async fn clean_table(
        &self,
        table: &str,
        criteria: &CleanupCriteria,
        reference: DateTime<Utc>,
        source: Option<Arc<dyn SourceExecutor>>,
    ) -> Result<CleanupResult> {
        let snapshot = {
            let conn = self.pool.get_connection().await?;
            table::query(&conn, &TableQuery::new(table).select()?)?
        };

        let removals = match criteria {
            CleanupCriteria::Date { offset_days } => date_removals(&snapshot, reference, *offset_days)?,
            CleanupCriteria::Sql {
                query,
                query_timeout_secs,
            } => {
                check_read_only(query)?;
                let source = source.ok_or_else(|| {
                    TdmError::ExternalExecution(format!("no source system for '{}'", table))
                })?;
                let matches = self
                    .runner
                    .query(source, query, self.runner.timeout_for(*query_timeout_secs))
                    .await?;
                sql_removals(&snapshot, &matches)?
            }
            CleanupCriteria::Class { name } => self.cleaners.get(name)?.select_removals(&snapshot)?,
        };

        let removed = if removals.is_empty() {
            0
        } else {
            let mut conn = self.pool.get_connection().await?;
            table::delete_by_ids(&mut conn, table, &removals)?
        };

        Ok(CleanupResult {
            table_name: table.to_string(),
            records_total: snapshot.row_count() as u64,
            records_removed: removed as u64,
            error: None,
        })
    }
}
