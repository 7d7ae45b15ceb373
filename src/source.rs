//! Access to external source systems: a timeout-bounded runner, a SQLite
//! executor and a static resolver.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};
use sqlparser::ast::Statement;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::{Result, TdmError};
use crate::interface::{SourceExecutor, SourceResolver};
use crate::result::QueryResult;
use crate::sql::BuiltQuery;
use crate::storage::table;

/// Reject statements that are clearly not a single read query.
///
/// Text the generic dialect cannot parse (vendor syntax, `${COLUMN}`
/// templates) is let through and left to the source system.
pub fn check_read_only(sql: &str) -> Result<()> {
    if sql.trim().is_empty() {
        return Err(TdmError::Validation("source query is empty".into()));
    }

    match Parser::parse_sql(&GenericDialect {}, sql) {
        Ok(statements) => match statements.as_slice() {
            [Statement::Query(_)] => Ok(()),
            [_] => Err(TdmError::Validation(
                "source query must be a read-only SELECT".into(),
            )),
            _ => Err(TdmError::Validation(
                "source query must be a single statement".into(),
            )),
        },
        Err(err) => {
            debug!(error = %err, "source query not parsed by generic dialect, accepted as is");
            Ok(())
        }
    }
}

/// Runs source queries on the blocking pool, bounded by a timeout.
#[derive(Debug, Clone)]
pub struct SourceRunner {
    default_timeout: Duration,
}

impl SourceRunner {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    /// Timeout for a stored value in seconds; zero means the default.
    pub fn timeout_for(&self, secs: u64) -> Duration {
        if secs == 0 {
            self.default_timeout
        } else {
            Duration::from_secs(secs)
        }
    }

    /// Execute `sql` on `executor`.
    ///
    /// When the timeout elapses the remote outcome is unknown; the call
    /// fails with `ExternalExecution` and must be treated as not applied.
    pub async fn query(
        &self,
        executor: Arc<dyn SourceExecutor>,
        sql: &str,
        timeout: Duration,
    ) -> Result<QueryResult> {
        let key = executor.connection_key();
        let sql_owned = sql.to_string();
        let task = tokio::task::spawn_blocking(move || executor.query(&sql_owned));

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(Ok(result))) => {
                debug!(source = %key, rows = result.row_count(), "source query finished");
                Ok(result)
            }
            Ok(Ok(Err(err))) => Err(match err {
                TdmError::ExternalExecution(_) => err,
                other => TdmError::ExternalExecution(format!("source '{}': {}", key, other)),
            }),
            Ok(Err(join_err)) => Err(TdmError::ExternalExecution(format!(
                "source '{}' task failed: {}",
                key, join_err
            ))),
            Err(_) => {
                warn!(source = %key, ?timeout, "source query timed out, outcome unknown");
                Err(TdmError::ExternalExecution(format!(
                    "source '{}' query timed out after {:?}; treated as not applied",
                    key, timeout
                )))
            }
        }
    }
}

/// Source system backed by a SQLite file, opened read-only per query.
pub struct SqliteSourceExecutor {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteSourceExecutor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout: Duration::from_secs(5),
        }
    }

    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }
}

impl SourceExecutor for SqliteSourceExecutor {
    fn connection_key(&self) -> String {
        format!("sqlite:{}", self.path.display())
    }

    fn query(&self, sql: &str) -> Result<QueryResult> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(self.busy_timeout)?;
        table::query(
            &conn,
            &BuiltQuery {
                sql: sql.to_string(),
                params: Vec::new(),
            },
        )
    }
}

/// Fixed mapping from `(environment, system)` to executors.
///
/// Lookup tries the exact pair, then the system alone, then the default.
#[derive(Default)]
pub struct StaticSourceResolver {
    sources: HashMap<(Option<Uuid>, Option<Uuid>), Arc<dyn SourceExecutor>>,
    fallback: Option<Arc<dyn SourceExecutor>>,
}

impl StaticSourceResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(
        mut self,
        environment_id: Option<Uuid>,
        system_id: Option<Uuid>,
        executor: Arc<dyn SourceExecutor>,
    ) -> Self {
        self.sources.insert((environment_id, system_id), executor);
        self
    }

    pub fn with_default(mut self, executor: Arc<dyn SourceExecutor>) -> Self {
        self.fallback = Some(executor);
        self
    }
}

impl SourceResolver for StaticSourceResolver {
    fn resolve(
        &self,
        environment_id: Option<Uuid>,
        system_id: Option<Uuid>,
    ) -> Result<Arc<dyn SourceExecutor>> {
        self.sources
            .get(&(environment_id, system_id))
            .or_else(|| self.sources.get(&(None, system_id)))
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| {
                TdmError::NotFound(format!(
                    "no source system for environment {:?}, system {:?}",
                    environment_id, system_id
                ))
            })
    }
}
