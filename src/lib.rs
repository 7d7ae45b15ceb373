// ============================================================================
// tdmdb Library
// ============================================================================

pub mod core;
pub mod connection;
pub mod result;
pub mod sql;
pub mod schema;
pub mod storage;
pub mod usage;
pub mod lock;
pub mod interface;
pub mod source;
pub mod lease;
pub mod cleanup;
pub mod refresh;
pub mod scheduler;
pub mod facade;

// Re-export main types for convenience
pub use crate::core::{
    BatchItemResult, CatalogEntry, CleanupConfig, CleanupCriteria, CleanupKind, ImportData,
    ImportInfo, Record, RefreshConfig, Result, TdmError, Value,
};
pub use result::QueryResult;
pub use sql::{Direction, Filter, FilterKind, Order, Scope};
pub use schema::SchemaChange;

pub use connection::{
    config::{AlterStrategy, LockMode, StoreConfig},
    pool::{ConnectionPool, PoolGuard, PoolStats},
};

pub use facade::{
    FindAndOccupyRequest, ImportOutcome, ImportRequest, OccupyRequest, ReleaseRequest, RowPage,
    RowQuery, RowsRequest, SqlImportRequest, StoreBuilder, TableTarget, TestDataStore,
};

pub use cleanup::{CleanupResult, TableCleaner};
pub use refresh::RefreshResult;
pub use scheduler::{JobGroup, ScheduleState};
pub use interface::{SourceExecutor, SourceResolver};
pub use source::{SqliteSourceExecutor, StaticSourceResolver};
pub use usage::{LruUsageTracker, UsageTracker};

// ============================================================================
// Connection string entry point
// ============================================================================

use std::sync::Arc;

/// Open a store from a connection string with no source systems attached.
///
/// Format: `tdmdb:///path/to/store.db?alter=hard&lock=local`
///
/// # Examples
///
/// ```no_run
/// # async fn demo() -> tdmdb::Result<()> {
/// let store = tdmdb::connect_url("tdmdb:///tmp/tdm.db?scheduler=off").await?;
/// println!("{} tables", store.list_tables(None).await?.len());
/// # Ok(())
/// # }
/// ```
pub async fn connect_url(url: &str) -> Result<Arc<TestDataStore>> {
    let config = StoreConfig::from_url(url).map_err(TdmError::Validation)?;
    TestDataStore::open(config, Arc::new(StaticSourceResolver::new())).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_url() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!(
            "tdmdb://{}?scheduler=off&lock=local",
            dir.path().join("store.db").display()
        );

        let store = connect_url(&url).await.unwrap();
        assert!(store.list_tables(None).await.unwrap().is_empty());
        assert!(store.scheduler_standby());
        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_url_rejects_garbage() {
        let err = connect_url("postgres://localhost/db").await.err().unwrap();
        assert!(matches!(err, TdmError::Validation(_)));
    }
}
