use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use rusqlite::Connection;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::requests::{
    FindAndOccupyRequest, ImportOutcome, ImportRequest, OccupyRequest, ReleaseRequest, RowPage,
    RowQuery, RowsRequest, SqlImportRequest, TableTarget,
};
use crate::cleanup::{CleanerRegistry, CleanupEngine, CleanupResult, TableCleaner};
use crate::connection::{ConnectionPool, LockMode, StoreConfig};
use crate::core::types::{is_system_column, ROW_ID};
use crate::core::{
    BatchItemResult, CatalogEntry, CleanupConfig, ImportData, ImportInfo, Record, RefreshConfig,
    Result, TdmError, Value,
};
use crate::interface::SourceResolver;
use crate::lease;
use crate::lock::{
    table_key, title_key, DatabaseLockProvider, DistributedLock, LocalLockProvider, LockProvider,
};
use crate::refresh::{RefreshEngine, RefreshResult};
use crate::result::QueryResult;
use crate::scheduler::{
    validate_cron, JobGroup, JobHandler, ScheduleState, SchedulerAdapter, TokioScheduler,
};
use crate::schema::{self, SchemaChange, SchemaManager};
use crate::source::{check_read_only, SourceRunner, StaticSourceResolver};
use crate::sql::{encode_literal, Filter, Scope, TableQuery};
use crate::storage::{self, catalog, table};
use crate::usage::{LruUsageTracker, UsageTracker};

lazy_static! {
    static ref PLACEHOLDER: Regex = Regex::new(r"\$\{([A-Za-z0-9_]+)\}").expect("static regex");
}

/// Collects the pluggable parts of a store before opening it.
pub struct StoreBuilder {
    config: StoreConfig,
    resolver: Option<Arc<dyn SourceResolver>>,
    cleaners: CleanerRegistry,
    usage: Option<Box<dyn UsageTracker>>,
}

impl StoreBuilder {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            resolver: None,
            cleaners: CleanerRegistry::with_default_cleaners(),
            usage: None,
        }
    }

    pub fn resolver(mut self, resolver: Arc<dyn SourceResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Register an extra cleanup class, selectable by its name.
    pub fn cleaner(mut self, cleaner: Box<dyn TableCleaner>) -> Self {
        self.cleaners.register(cleaner);
        self
    }

    pub fn usage_tracker(mut self, tracker: Box<dyn UsageTracker>) -> Self {
        self.usage = Some(tracker);
        self
    }

    pub async fn open(self) -> Result<Arc<TestDataStore>> {
        let config = self.config;
        let pool = Arc::new(ConnectionPool::new(config.clone()).await?);
        {
            let conn = pool.get_connection().await?;
            storage::migrate(&conn)?;
        }

        let provider: Arc<dyn LockProvider> = match config.lock_mode {
            LockMode::Database => Arc::new(DatabaseLockProvider::new(pool.clone())),
            LockMode::Local => Arc::new(LocalLockProvider::new()),
        };
        let lock = Arc::new(DistributedLock::new(
            provider,
            config.lock_ttl,
            config.lock_acquire_timeout,
        ));

        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(StaticSourceResolver::new()));
        let runner = SourceRunner::new(config.default_query_timeout);
        let schema = Arc::new(SchemaManager::new(config.alter_strategy));
        let usage = self
            .usage
            .unwrap_or_else(|| Box::new(LruUsageTracker::new(config.usage_cache_capacity)));

        let scheduler = Arc::new(if config.scheduler_enabled {
            TokioScheduler::new()
        } else {
            TokioScheduler::paused()
        });

        let store = Arc::new(TestDataStore {
            cleanup: CleanupEngine::new(
                pool.clone(),
                lock.clone(),
                resolver.clone(),
                runner.clone(),
                Arc::new(self.cleaners),
            ),
            refresh: RefreshEngine::new(
                pool.clone(),
                lock.clone(),
                resolver.clone(),
                runner.clone(),
                schema.clone(),
                config.insert_batch_size,
            ),
            adapter: SchedulerAdapter::new(scheduler.clone()),
            scheduler,
            config,
            pool,
            schema,
            lock,
            usage,
            resolver,
            runner,
        });

        let handler: Arc<dyn JobHandler> = store.clone();
        store.scheduler.set_handler(Arc::downgrade(&handler))?;

        let (cleanups, refreshes) = {
            let conn = store.pool.get_connection().await?;
            (
                catalog::all_cleanup_configs(&conn)?,
                catalog::all_refresh_configs(&conn)?,
            )
        };
        store.adapter.restore(&cleanups, &refreshes);

        info!(
            path = %store.config.database_path.display(),
            strategy = ?store.config.alter_strategy,
            scheduler = store.scheduler.is_running(),
            "test data store opened"
        );
        Ok(store)
    }
}

/// Entry point of the store: imports, reads, leases, table administration,
/// cleanup and refresh.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use tdmdb::{StoreConfig, TestDataStore, StaticSourceResolver};
///
/// # async fn demo() -> tdmdb::Result<()> {
/// let store = TestDataStore::open(
///     StoreConfig::new("/tmp/tdm.db"),
///     Arc::new(StaticSourceResolver::new()),
/// )
/// .await?;
/// for entry in store.list_tables(None).await? {
///     println!("{} -> {}", entry.table_title, entry.table_name);
/// }
/// store.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct TestDataStore {
    config: StoreConfig,
    pool: Arc<ConnectionPool>,
    schema: Arc<SchemaManager>,
    lock: Arc<DistributedLock>,
    usage: Box<dyn UsageTracker>,
    resolver: Arc<dyn SourceResolver>,
    runner: SourceRunner,
    cleanup: CleanupEngine,
    refresh: RefreshEngine,
    scheduler: Arc<TokioScheduler>,
    adapter: SchedulerAdapter,
}

impl TestDataStore {
    pub async fn open(
        config: StoreConfig,
        resolver: Arc<dyn SourceResolver>,
    ) -> Result<Arc<Self>> {
        StoreBuilder::new(config).resolver(resolver).open().await
    }

    pub fn builder(config: StoreConfig) -> StoreBuilder {
        StoreBuilder::new(config)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Stop all triggers, waiting for jobs already running.
    pub async fn shutdown(&self) -> Result<()> {
        self.scheduler.shutdown().await?;
        info!("test data store shut down");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Import
    // ------------------------------------------------------------------

    /// Import normalized rows into the table registered under `target`,
    /// creating it on first import and adding new columns later.
    pub async fn import_rows(&self, request: ImportRequest) -> Result<ImportOutcome> {
        self.import(&request.target, &request.data, None).await
    }

    /// Run a query on the target's source system and import the result.
    /// The query is recorded as the table's source for later refreshes.
    pub async fn import_from_sql(&self, request: SqlImportRequest) -> Result<ImportOutcome> {
        check_read_only(&request.query)?;
        let target = &request.target;
        let source = self.resolver.resolve(target.environment_id, target.system_id)?;
        let timeout = self.runner.timeout_for(request.query_timeout_secs);
        let fetched = self.runner.query(source, &request.query, timeout).await?;

        let data = ImportData::new(fetched.columns.clone(), fetched.records());
        let info = ImportInfo {
            table_name: String::new(),
            table_query: request.query.clone(),
            query_timeout_secs: request.query_timeout_secs,
            update_by_query: None,
        };
        self.import(target, &data, Some(info)).await
    }

    async fn import(
        &self,
        target: &TableTarget,
        data: &ImportData,
        info: Option<ImportInfo>,
    ) -> Result<ImportOutcome> {
        if target.table_title.trim().is_empty() {
            return Err(TdmError::Validation("table title must not be empty".into()));
        }
        schema::normalize_columns(&data.user_columns())?;

        let key = title_key(target.project_id, &target.table_title);
        self.lock
            .with_lock(&key, move || self.import_under_title(target, data, info))
            .await
    }

    async fn import_under_title(
        &self,
        target: &TableTarget,
        data: &ImportData,
        info: Option<ImportInfo>,
    ) -> Result<ImportOutcome> {
        let existing = {
            let conn = self.pool.get_connection().await?;
            catalog::find_by_title(&conn, target.project_id, target.system_id, &target.table_title)?
        };
        let table_name = match &existing {
            Some(entry) => entry.table_name.clone(),
            None => format!("t_{}", Uuid::new_v4().simple()),
        };
        let exists = existing.is_some();
        let name = table_name.as_str();

        let outcome = self
            .lock
            .with_lock(&table_key(name), move || {
                self.write_import(target, name, exists, data, info)
            })
            .await?;
        self.touch(&outcome.table_name).await;
        Ok(outcome)
    }

    async fn write_import(
        &self,
        target: &TableTarget,
        table_name: &str,
        exists: bool,
        data: &ImportData,
        info: Option<ImportInfo>,
    ) -> Result<ImportOutcome> {
        let schema = self.schema.clone();
        let batch_size = self.config.insert_batch_size;
        let (target_owned, name, data_owned) = (target.clone(), table_name.to_string(), data.clone());
        let (schema_change, rows_inserted) = self
            .pool
            .run_blocking(move |conn| {
                store_import(conn, &schema, &target_owned, &name, exists, &data_owned, info, batch_size)
            })
            .await?;

        info!(
            table = table_name,
            title = target.table_title.as_str(),
            rows = rows_inserted,
            change = ?schema_change,
            "rows imported"
        );
        Ok(ImportOutcome {
            table_name: table_name.to_string(),
            schema_change,
            rows_inserted,
        })
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub async fn get_rows(&self, table_name: &str, query: &RowQuery) -> Result<RowPage> {
        let built = TableQuery::new(table_name)
            .scope(query.scope)
            .filters(query.filters.iter().cloned())
            .order(query.order.clone())
            .offset(query.offset)
            .limit(query.limit)
            .columns(query.columns.clone());
        let select = built.select()?;
        let count = built.count()?;

        let name = table_name.to_string();
        let page = self
            .pool
            .run_blocking(move |conn| {
                catalog::get_entry(conn, &name)?;
                Ok(RowPage {
                    rows: table::query(conn, &select)?,
                    records_total: table::count(conn, &count)?,
                })
            })
            .await?;
        self.touch(table_name).await;
        Ok(page)
    }

    pub async fn get_rows_batch(&self, requests: Vec<RowsRequest>) -> Vec<BatchItemResult<RowPage>> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            let result = self.get_rows(&request.table_name, &request.query).await;
            results.push(BatchItemResult::from_result(request.table_name, result));
        }
        results
    }

    /// Distinct values of one column under a scope and filters, ascending.
    pub async fn distinct_values(
        &self,
        table_name: &str,
        column: &str,
        scope: Scope,
        filters: &[Filter],
    ) -> Result<Vec<Value>> {
        let built = TableQuery::new(table_name)
            .scope(scope)
            .filters(filters.iter().cloned())
            .distinct(column)?;

        let values = {
            let conn = self.pool.get_connection().await?;
            catalog::get_entry(&conn, table_name)?;
            table::query(&conn, &built)?
                .rows
                .into_iter()
                .filter_map(|row| row.into_iter().next())
                .collect()
        };
        self.touch(table_name).await;
        Ok(values)
    }

    /// All columns of the table, system columns first.
    pub async fn columns(&self, table_name: &str) -> Result<Vec<String>> {
        let conn = self.pool.get_connection().await?;
        catalog::get_entry(&conn, table_name)?;
        schema::table_columns(&conn, table_name)
    }

    // ------------------------------------------------------------------
    // Leases
    // ------------------------------------------------------------------

    /// Lease rows to `actor`. Fails with `Conflict` only when none of the
    /// rows could be taken; a partially free set is taken silently.
    pub async fn occupy(&self, table_name: &str, actor: &str, row_ids: &[String]) -> Result<usize> {
        self.require_entry(table_name).await?;
        let taken = self
            .lock
            .with_lock(&table_key(table_name), || {
                let (name, actor, row_ids) = (table_name.to_string(), actor.to_string(), row_ids.to_vec());
                self.pool.run_blocking(move |conn| {
                    lease::occupy(conn, &name, &actor, &row_ids, Utc::now())
                })
            })
            .await?;
        self.touch(table_name).await;
        Ok(taken)
    }

    pub async fn release(&self, table_name: &str, row_ids: &[String]) -> Result<usize> {
        self.require_entry(table_name).await?;
        self.lock
            .with_lock(&table_key(table_name), || {
                let (name, row_ids) = (table_name.to_string(), row_ids.to_vec());
                self.pool
                    .run_blocking(move |conn| lease::release(conn, &name, &row_ids))
            })
            .await
    }

    pub async fn occupy_first_matching(&self, request: &FindAndOccupyRequest) -> Result<Record> {
        let table_name = request.table_name.as_str();
        self.require_entry(table_name).await?;
        let record = self
            .lock
            .with_lock(&table_key(table_name), || {
                let request = request.clone();
                self.pool.run_blocking(move |conn| {
                    lease::occupy_first_matching(
                        conn,
                        &request.table_name,
                        &request.filters,
                        request.order,
                        &request.actor,
                        &request.response_columns,
                        Utc::now(),
                    )
                })
            })
            .await?;
        self.touch(table_name).await;
        Ok(record)
    }

    pub async fn occupy_batch(&self, requests: Vec<OccupyRequest>) -> Vec<BatchItemResult<usize>> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            let result = self
                .occupy(&request.table_name, &request.actor, &request.row_ids)
                .await;
            results.push(BatchItemResult::from_result(request.table_name, result));
        }
        results
    }

    pub async fn release_batch(&self, requests: Vec<ReleaseRequest>) -> Vec<BatchItemResult<usize>> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            let result = self.release(&request.table_name, &request.row_ids).await;
            results.push(BatchItemResult::from_result(request.table_name, result));
        }
        results
    }

    pub async fn occupy_first_matching_batch(
        &self,
        requests: Vec<FindAndOccupyRequest>,
    ) -> Vec<BatchItemResult<Record>> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            let result = self.occupy_first_matching(&request).await;
            results.push(BatchItemResult::from_result(request.table_name, result));
        }
        results
    }

    // ------------------------------------------------------------------
    // Updates
    // ------------------------------------------------------------------

    /// Set `values` on every row matching `scope` and `filters`. Columns the
    /// table lacks are added first.
    pub async fn update_rows(
        &self,
        table_name: &str,
        scope: Scope,
        filters: &[Filter],
        values: &Record,
    ) -> Result<usize> {
        if let Some(column) = values.keys().find(|c| is_system_column(c)) {
            return Err(TdmError::Validation(format!(
                "system column '{}' cannot be updated",
                column
            )));
        }
        let columns: Vec<String> = values.keys().cloned().collect();
        let assignments: Vec<(String, Value)> =
            values.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let sql = TableQuery::new(table_name)
            .scope(scope)
            .filters(filters.iter().cloned())
            .update(&assignments)?;

        self.require_entry(table_name).await?;
        self.lock
            .with_lock(&table_key(table_name), || {
                let (schema, name) = (self.schema.clone(), table_name.to_string());
                self.pool.run_blocking(move |conn| {
                    schema.ensure_table(conn, &name, &columns, true)?;
                    let updated = table::execute_update(conn, &sql)?;
                    debug!(table = name.as_str(), updated, "rows updated");
                    Ok(updated)
                })
            })
            .await
    }

    /// For every row, fill the `${COLUMN}` placeholders of `query` with the
    /// row's values, run it on the table's source system and write the
    /// columns of a single-row result back into the row.
    ///
    /// Rows whose query returns zero or several rows are left unchanged. A
    /// source failure stops the run; rows updated before it stay updated.
    pub async fn update_by_query(
        &self,
        table_name: &str,
        query: &str,
        query_timeout_secs: u64,
    ) -> Result<usize> {
        let entry = self.require_entry(table_name).await?;
        let placeholders: Vec<String> = PLACEHOLDER
            .captures_iter(query)
            .map(|c| c[1].to_string())
            .collect();
        if placeholders.is_empty() {
            return Err(TdmError::Validation(
                "update query has no ${COLUMN} placeholder".into(),
            ));
        }
        let source = self.resolver.resolve(entry.environment_id, entry.system_id)?;
        let timeout = self.runner.timeout_for(query_timeout_secs);

        self.lock
            .with_lock(&table_key(table_name), || async {
                let snapshot = {
                    let conn = self.pool.get_connection().await?;
                    let existing = catalog::find_import_info(&conn, table_name)?;
                    catalog::upsert_import_info(
                        &conn,
                        &ImportInfo {
                            table_name: table_name.to_string(),
                            table_query: existing
                                .as_ref()
                                .map(|i| i.table_query.clone())
                                .unwrap_or_default(),
                            query_timeout_secs: existing
                                .as_ref()
                                .map(|i| i.query_timeout_secs)
                                .unwrap_or(query_timeout_secs),
                            update_by_query: Some(query.to_string()),
                        },
                    )?;
                    table::query(&conn, &TableQuery::new(table_name).select()?)?
                };

                if let Some(missing) = placeholders.iter().find(|p| snapshot.column_index(p).is_none()) {
                    return Err(TdmError::Validation(format!(
                        "placeholder '{}' is not a column of '{}'",
                        missing, table_name
                    )));
                }

                let mut updated = 0usize;
                for i in 0..snapshot.row_count() {
                    let sql = substitute_placeholders(query, &snapshot, i)?;
                    check_read_only(&sql)?;
                    let result = self.runner.query(source.clone(), &sql, timeout).await?;
                    if result.row_count() != 1 {
                        debug!(table = table_name, row = i, rows = result.row_count(), "update query skipped");
                        continue;
                    }
                    let Some(row_id) = snapshot.value(i, ROW_ID).and_then(|v| v.to_storage_text()) else {
                        continue;
                    };
                    let Some(values) = result.record(0) else {
                        continue;
                    };
                    let values: Record = values
                        .into_iter()
                        .filter(|(column, _)| !is_system_column(column))
                        .collect();
                    let columns: Vec<String> = values.keys().cloned().collect();

                    let mut conn = self.pool.get_connection().await?;
                    self.schema.ensure_table(&mut conn, table_name, &columns, true)?;
                    updated += table::update_row(&conn, table_name, &row_id, &values)?;
                }

                info!(table = table_name, rows = snapshot.row_count(), updated, "update by query finished");
                Ok(updated)
            })
            .await
    }

    // ------------------------------------------------------------------
    // Table administration
    // ------------------------------------------------------------------

    /// Drop the table with its catalog entry and import info, then remove
    /// configurations nothing refers to any more.
    pub async fn delete_table(&self, table_name: &str) -> Result<()> {
        let entry = self.require_entry(table_name).await?;
        let key = title_key(entry.project_id, &entry.table_title);

        self.lock
            .with_lock(&key, || async {
                self.lock
                    .with_lock(&table_key(table_name), || async {
                        let conn = self.pool.get_connection().await?;
                        schema::drop_table(&conn, table_name)?;
                        catalog::delete_import_info(&conn, table_name)?;
                        catalog::delete_entry(&conn, table_name)?;
                        Ok::<_, TdmError>(())
                    })
                    .await
            })
            .await?;

        self.usage.forget(table_name);
        self.remove_unused_configs().await?;
        info!(table = table_name, title = entry.table_title.as_str(), "table deleted");
        Ok(())
    }

    /// Remove every row, leased or not. Returns the number removed.
    pub async fn truncate_table(&self, table_name: &str) -> Result<usize> {
        self.require_entry(table_name).await?;
        self.lock
            .with_lock(&table_key(table_name), || async {
                let conn = self.pool.get_connection().await?;
                table::delete_rows(&conn, table_name, false)
            })
            .await
    }

    pub async fn rename_table_title(&self, table_name: &str, title: &str) -> Result<()> {
        if title.trim().is_empty() {
            return Err(TdmError::Validation("table title must not be empty".into()));
        }
        let entry = self.require_entry(table_name).await?;
        self.lock
            .with_lock(&title_key(entry.project_id, title), || async {
                let conn = self.pool.get_connection().await?;
                catalog::rename_title(&conn, table_name, title)
            })
            .await
    }

    pub async fn list_tables(&self, project_id: Option<Uuid>) -> Result<Vec<CatalogEntry>> {
        let conn = self.pool.get_connection().await?;
        catalog::list_entries(&conn, project_id)
    }

    pub async fn catalog_entry(&self, table_name: &str) -> Result<CatalogEntry> {
        self.require_entry(table_name).await
    }

    pub async fn import_info(&self, table_name: &str) -> Result<ImportInfo> {
        let conn = self.pool.get_connection().await?;
        catalog::find_import_info(&conn, table_name)?
            .ok_or_else(|| TdmError::NotFound(format!("table '{}' has no import info", table_name)))
    }

    // ------------------------------------------------------------------
    // Cleanup
    // ------------------------------------------------------------------

    /// Store `config` and link it to the table, or to every same-titled
    /// table of the project when it is shared. The target set is fixed
    /// here; tables created later are not picked up.
    pub async fn save_cleanup_config(&self, table_name: &str, config: CleanupConfig) -> Result<CleanupConfig> {
        validate_cron(&config.schedule)?;
        self.cleanup.validate(&config.criteria)?;
        let entry = self.require_entry(table_name).await?;

        let targets = self
            .lock
            .with_lock(&title_key(entry.project_id, &entry.table_title), || async {
                let conn = self.pool.get_connection().await?;
                let targets: Vec<String> = if config.shared {
                    catalog::entries_by_title(&conn, entry.project_id, &entry.table_title)?
                        .into_iter()
                        .map(|e| e.table_name)
                        .collect()
                } else {
                    vec![entry.table_name.clone()]
                };
                catalog::save_cleanup_config(&conn, &config)?;
                catalog::set_cleanup_config(&conn, &targets, Some(config.id))?;
                Ok::<_, TdmError>(targets)
            })
            .await?;

        self.adapter
            .reschedule(JobGroup::Cleanup, config.id, &config.schedule, config.enabled)?;
        self.remove_unused_configs().await?;
        info!(config_id = %config.id, tables = targets.len(), "cleanup config saved");
        Ok(config)
    }

    pub async fn cleanup_config(&self, id: Uuid) -> Result<CleanupConfig> {
        let conn = self.pool.get_connection().await?;
        catalog::find_cleanup_config(&conn, id)?
            .ok_or_else(|| TdmError::NotFound(format!("cleanup config {} not found", id)))
    }

    /// Run a stored cleanup config over every table linked to it.
    pub async fn run_cleanup(&self, config_id: Uuid) -> Result<Vec<CleanupResult>> {
        let config = self.cleanup_config(config_id).await?;
        let entries = {
            let conn = self.pool.get_connection().await?;
            catalog::entries_by_cleanup_config(&conn, config_id)?
        };
        Ok(self.cleanup.run(&entries, &config.criteria, Utc::now()).await)
    }

    /// Run a config that is not stored, over the table or, when shared,
    /// its same-titled siblings.
    pub async fn run_cleanup_for_table(
        &self,
        table_name: &str,
        config: &CleanupConfig,
    ) -> Result<Vec<CleanupResult>> {
        self.cleanup.validate(&config.criteria)?;
        let entry = self.require_entry(table_name).await?;
        let entries = if config.shared {
            let conn = self.pool.get_connection().await?;
            catalog::entries_by_title(&conn, entry.project_id, &entry.table_title)?
        } else {
            vec![entry]
        };
        Ok(self.cleanup.run(&entries, &config.criteria, Utc::now()).await)
    }

    // ------------------------------------------------------------------
    // Refresh
    // ------------------------------------------------------------------

    /// Store `config` and link it to the table, or with `all_environments`
    /// to every same-titled table sharing its source query.
    pub async fn save_refresh_config(&self, table_name: &str, config: RefreshConfig) -> Result<RefreshConfig> {
        validate_cron(&config.schedule)?;
        let entry = self.require_entry(table_name).await?;

        let targets = if config.all_environments {
            self.refresh.environment_targets(&entry).await?
        } else {
            vec![entry.clone()]
        };
        let names: Vec<String> = targets.iter().map(|e| e.table_name.clone()).collect();

        self.lock
            .with_lock(&title_key(entry.project_id, &entry.table_title), || async {
                let conn = self.pool.get_connection().await?;
                let info = catalog::find_import_info(&conn, table_name)?
                    .filter(ImportInfo::has_source_query)
                    .ok_or_else(|| {
                        TdmError::NotFound(format!(
                            "table '{}' was not imported from SQL and cannot be refreshed",
                            table_name
                        ))
                    })?;
                if let Some(secs) = config.query_timeout_secs {
                    catalog::upsert_import_info(
                        &conn,
                        &ImportInfo {
                            query_timeout_secs: secs,
                            ..info
                        },
                    )?;
                }
                catalog::save_refresh_config(&conn, &config)?;
                catalog::set_refresh_config(&conn, &names, Some(config.id))?;
                Ok::<_, TdmError>(())
            })
            .await?;

        self.adapter
            .reschedule(JobGroup::Refresh, config.id, &config.schedule, config.enabled)?;
        self.remove_unused_configs().await?;
        info!(config_id = %config.id, tables = names.len(), "refresh config saved");
        Ok(config)
    }

    pub async fn refresh_config(&self, id: Uuid) -> Result<RefreshConfig> {
        let conn = self.pool.get_connection().await?;
        catalog::find_refresh_config(&conn, id)?
            .ok_or_else(|| TdmError::NotFound(format!("refresh config {} not found", id)))
    }

    /// Refresh one table from its recorded query. A query returning no
    /// rows fails with `ExternalExecution` after the old rows were deleted.
    pub async fn run_refresh(
        &self,
        table_name: &str,
        save_occupied: bool,
        timeout_secs: Option<u64>,
    ) -> Result<RefreshResult> {
        let entry = self.require_entry(table_name).await?;
        self.refresh.refresh_table(&entry, save_occupied, timeout_secs).await
    }

    pub async fn run_refresh_config(&self, config_id: Uuid) -> Result<Vec<RefreshResult>> {
        let config = self.refresh_config(config_id).await?;
        let entries = {
            let conn = self.pool.get_connection().await?;
            catalog::entries_by_refresh_config(&conn, config_id)?
        };
        Ok(self
            .refresh
            .refresh_all(&entries, config.save_occupied_data, config.query_timeout_secs)
            .await)
    }

    /// Refresh the table and every same-titled table with the identical
    /// source query.
    pub async fn refresh_all_environments(
        &self,
        table_name: &str,
        save_occupied: bool,
        timeout_secs: Option<u64>,
    ) -> Result<Vec<RefreshResult>> {
        let entry = self.require_entry(table_name).await?;
        let targets = self.refresh.environment_targets(&entry).await?;
        Ok(self.refresh.refresh_all(&targets, save_occupied, timeout_secs).await)
    }

    // ------------------------------------------------------------------
    // Configurations and schedules
    // ------------------------------------------------------------------

    /// Delete configs no table refers to and drop their jobs. Returns the
    /// removed config ids.
    pub async fn remove_unused_configs(&self) -> Result<Vec<Uuid>> {
        let (cleanups, refreshes) = {
            let conn = self.pool.get_connection().await?;
            let cleanups = catalog::unused_cleanup_config_ids(&conn)?;
            for id in &cleanups {
                catalog::delete_cleanup_config(&conn, *id)?;
            }
            let refreshes = catalog::unused_refresh_config_ids(&conn)?;
            for id in &refreshes {
                catalog::delete_refresh_config(&conn, *id)?;
            }
            (cleanups, refreshes)
        };

        for id in &cleanups {
            self.adapter.delete_job(JobGroup::Cleanup, *id)?;
        }
        for id in &refreshes {
            self.adapter.delete_job(JobGroup::Refresh, *id)?;
        }

        let removed: Vec<Uuid> = cleanups.into_iter().chain(refreshes).collect();
        if !removed.is_empty() {
            info!(count = removed.len(), "unused configs removed");
        }
        Ok(removed)
    }

    pub fn job_state(&self, group: JobGroup, config_id: Uuid) -> ScheduleState {
        self.adapter.state(group, config_id)
    }

    pub fn scheduler_standby(&self) -> bool {
        self.adapter.is_standby()
    }

    pub fn cleaner_names(&self) -> Vec<String> {
        self.cleanup
            .cleaners()
            .list_cleaners()
            .into_iter()
            .map(String::from)
            .collect()
    }

    // ------------------------------------------------------------------

    async fn require_entry(&self, table_name: &str) -> Result<CatalogEntry> {
        let conn = self.pool.get_connection().await?;
        catalog::get_entry(&conn, table_name)
    }

    /// Record today's usage of the table, at most once per day.
    async fn touch(&self, table_name: &str) {
        let today = Utc::now().date_naive();
        if !self.usage.should_record(table_name, today) {
            return;
        }
        let recorded = match self.pool.get_connection().await {
            Ok(conn) => catalog::update_last_usage(&conn, table_name, today),
            Err(err) => Err(err),
        };
        if let Err(err) = recorded {
            self.usage.forget(table_name);
            warn!(table = table_name, error = %err, "last usage not recorded");
        }
    }
}

/// Load rows, then register the table and its import info on first use.
/// A table created here is dropped again when it cannot be registered.
#[allow(clippy::too_many_arguments)]
fn store_import(
    conn: &mut Connection,
    manager: &SchemaManager,
    target: &TableTarget,
    table_name: &str,
    exists: bool,
    data: &ImportData,
    info: Option<ImportInfo>,
    batch_size: usize,
) -> Result<(SchemaChange, usize)> {
    let loaded = table::load(conn, manager, table_name, data, exists, batch_size)?;

    if !exists {
        let entry = CatalogEntry {
            table_name: table_name.to_string(),
            project_id: target.project_id,
            system_id: target.system_id,
            environment_id: target.environment_id,
            table_title: target.table_title.clone(),
            last_usage: None,
            refresh_config_id: None,
            cleanup_config_id: None,
        };
        if let Err(err) = catalog::insert_entry(conn, &entry) {
            schema::drop_table(conn, table_name)?;
            return Err(err);
        }
    }

    if let Some(mut info) = info {
        if info.update_by_query.is_none() {
            info.update_by_query = catalog::find_import_info(conn, table_name)?
                .and_then(|existing| existing.update_by_query);
        }
        catalog::upsert_import_info(
            conn,
            &ImportInfo {
                table_name: table_name.to_string(),
                ..info
            },
        )?;
    }
    Ok(loaded)
}

fn substitute_placeholders(query: &str, snapshot: &QueryResult, row: usize) -> Result<String> {
    let mut failure = None;
    let sql = PLACEHOLDER.replace_all(query, |caps: &Captures<'_>| {
        match snapshot.value(row, &caps[1]).and_then(|v| v.to_storage_text()) {
            Some(text) => encode_literal(&text).unwrap_or_else(|err| {
                failure = Some(err);
                String::new()
            }),
            None => "NULL".to_string(),
        }
    });
    match failure {
        Some(err) => Err(err),
        None => Ok(sql.into_owned()),
    }
}

#[async_trait]
impl JobHandler for TestDataStore {
    async fn run_job(&self, group: JobGroup, config_id: Uuid) {
        match group {
            JobGroup::Cleanup => match self.run_cleanup(config_id).await {
                Ok(results) => {
                    for result in results.iter().filter(|r| !r.is_ok()) {
                        warn!(
                            %group,
                            %config_id,
                            table = result.table_name.as_str(),
                            error = result.error.as_deref().unwrap_or_default(),
                            "scheduled cleanup failed for table"
                        );
                    }
                }
                Err(err) => error!(%group, %config_id, error = %err, "scheduled cleanup failed"),
            },
            JobGroup::Refresh => match self.run_refresh_config(config_id).await {
                Ok(results) => {
                    for result in results.iter().filter(|r| !r.is_ok()) {
                        warn!(
                            %group,
                            %config_id,
                            table = result.table_name.as_str(),
                            error = result.error.as_deref().unwrap_or_default(),
                            "scheduled refresh failed for table"
                        );
                    }
                }
                Err(err) => error!(%group, %config_id, error = %err, "scheduled refresh failed"),
            },
        }
    }
}
