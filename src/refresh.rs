//! Refresh engine: re-populate a table from its recorded source query.
//!
//! Existing rows (all of them, or only unleased ones when occupied data is
//! saved) are deleted first, then the query runs and its rows are inserted.
//! If the query fails or returns nothing the deletion is not undone; the
//! error says how many rows were already removed.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::connection::ConnectionPool;
use crate::core::{CatalogEntry, ImportData, ImportInfo, Result, TdmError};
use crate::interface::{SourceExecutor, SourceResolver};
use crate::lock::{table_key, DistributedLock};
use crate::schema::SchemaManager;
use crate::source::{check_read_only, SourceRunner};
use crate::storage::{catalog, table};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshResult {
    pub table_name: String,
    pub records_removed: u64,
    pub records_inserted: u64,
    pub error: Option<String>,
}

impl RefreshResult {
    pub fn failed(table_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            records_removed: 0,
            records_inserted: 0,
            error: Some(error.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

pub struct RefreshEngine {
    pool: Arc<ConnectionPool>,
    lock: Arc<DistributedLock>,
    resolver: Arc<dyn SourceResolver>,
    runner: SourceRunner,
    schema: Arc<SchemaManager>,
    batch_size: usize,
}

impl RefreshEngine {
    pub fn new(
        pool: Arc<ConnectionPool>,
        lock: Arc<DistributedLock>,
        resolver: Arc<dyn SourceResolver>,
        runner: SourceRunner,
        schema: Arc<SchemaManager>,
        batch_size: usize,
    ) -> Self {
        Self {
            pool,
            lock,
            resolver,
            runner,
            schema,
            batch_size,
        }
    }

    /// Refresh one table. `timeout_secs` overrides the recorded timeout.
    pub async fn refresh_table(
        &self,
        entry: &CatalogEntry,
        save_occupied: bool,
        timeout_secs: Option<u64>,
    ) -> Result<RefreshResult> {
        let info = {
            let conn = self.pool.get_connection().await?;
            catalog::find_import_info(&conn, &entry.table_name)?
        }
        .filter(ImportInfo::has_source_query)
        .ok_or_else(|| {
            TdmError::NotFound(format!(
                "table '{}' has no recorded source query",
                entry.table_name
            ))
        })?;
        check_read_only(&info.table_query)?;
        let source = self.resolver.resolve(entry.environment_id, entry.system_id)?;

        let table = entry.table_name.as_str();
        self.lock
            .with_lock(&table_key(table), move || {
                self.reload(table, info, source, save_occupied, timeout_secs)
            })
            .await
    }

    async fn reload(
        &self,
        table: &str,
        info: ImportInfo,
        source: Arc<dyn SourceExecutor>,
        save_occupied: bool,
        timeout_secs: Option<u64>,
    ) -> Result<RefreshResult> {
        let removed = {
            let conn = self.pool.get_connection().await?;
            table::delete_rows(&conn, table, save_occupied)?
        };

        let timeout = self
            .runner
            .timeout_for(timeout_secs.unwrap_or(info.query_timeout_secs));
        let fetched = self
            .runner
            .query(source, &info.table_query, timeout)
            .await
            .map_err(|err| {
                TdmError::ExternalExecution(format!(
                    "refresh of '{}' failed after removing {} rows: {}",
                    table, removed, err
                ))
            })?;

        if fetched.is_empty() {
            return Err(TdmError::ExternalExecution(format!(
                "refresh of '{}' returned no rows; {} rows were already removed",
                table, removed
            )));
        }

        let data = ImportData::new(fetched.columns.clone(), fetched.records());
        let inserted = {
            let mut conn = self.pool.get_connection().await?;
            table::load(&mut conn, &self.schema, table, &data, true, self.batch_size)?.1
        };

        info!(table, removed, inserted, save_occupied, "table refreshed");
        Ok(RefreshResult {
            table_name: table.to_string(),
            records_removed: removed as u64,
            records_inserted: inserted as u64,
            error: None,
        })
    }

    /// Refresh every entry; failures are reported per table.
    pub async fn refresh_all(
        &self,
        entries: &[CatalogEntry],
        save_occupied: bool,
        timeout_secs: Option<u64>,
    ) -> Vec<RefreshResult> {
        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            match self.refresh_table(entry, save_occupied, timeout_secs).await {
                Ok(result) => results.push(result),
                Err(err) => {
                    warn!(table = entry.table_name.as_str(), error = %err, "refresh failed");
                    results.push(RefreshResult::failed(&entry.table_name, err.to_string()));
                }
            }
        }
        results
    }

    /// Same-titled tables of the project whose recorded source query is
    /// identical to the one of `entry`, `entry` included.
    pub async fn environment_targets(&self, entry: &CatalogEntry) -> Result<Vec<CatalogEntry>> {
        let conn = self.pool.get_connection().await?;
        let Some(info) = catalog::find_import_info(&conn, &entry.table_name)?
            .filter(ImportInfo::has_source_query)
        else {
            return Ok(vec![entry.clone()]);
        };

        let mut targets = Vec::new();
        for candidate in catalog::entries_by_title(&conn, entry.project_id, &entry.table_title)? {
            let same_query = candidate.table_name == entry.table_name
                || catalog::find_import_info(&conn, &candidate.table_name)?
                    .is_some_and(|other| other.has_source_query() && other.table_query == info.table_query);
            if same_query {
                targets.push(candidate);
            }
        }
        Ok(targets)
    }
}
