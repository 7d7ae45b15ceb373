use std::sync::Arc;

use uuid::Uuid;

use crate::core::Result;
use crate::result::QueryResult;

/// A ready-to-use connection to an external source system.
///
/// Calls block; the store never invokes them on an async worker thread
/// directly but through [`crate::source::SourceRunner`], which bounds them
/// with a timeout.
pub trait SourceExecutor: Send + Sync {
    /// Identity of the underlying connection. Tables whose executors share a
    /// key share a connection, and a failure of one skips the rest in a
    /// cleanup run.
    fn connection_key(&self) -> String;

    /// Run a read query and return its rows.
    fn query(&self, sql: &str) -> Result<QueryResult>;
}

/// Maps a catalog entry's environment/system pair to a source executor.
pub trait SourceResolver: Send + Sync {
    fn resolve(
        &self,
        environment_id: Option<Uuid>,
        system_id: Option<Uuid>,
    ) -> Result<Arc<dyn SourceExecutor>>;
}
