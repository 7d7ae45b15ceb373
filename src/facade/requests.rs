use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::ImportData;
use crate::result::QueryResult;
use crate::schema::SchemaChange;
use crate::sql::{Filter, Order, Scope};

/// Logical identity of a table: project, optional system and environment, title.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableTarget {
    pub project_id: Uuid,
    pub system_id: Option<Uuid>,
    pub environment_id: Option<Uuid>,
    pub table_title: String,
}

impl TableTarget {
    pub fn new(project_id: Uuid, table_title: impl Into<String>) -> Self {
        Self {
            project_id,
            system_id: None,
            environment_id: None,
            table_title: table_title.into(),
        }
    }

    pub fn system(mut self, system_id: Uuid) -> Self {
        self.system_id = Some(system_id);
        self
    }

    pub fn environment(mut self, environment_id: Uuid) -> Self {
        self.environment_id = Some(environment_id);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportRequest {
    pub target: TableTarget,
    pub data: ImportData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlImportRequest {
    pub target: TableTarget,
    pub query: String,
    /// Zero means the store default.
    #[serde(default)]
    pub query_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportOutcome {
    pub table_name: String,
    pub schema_change: SchemaChange,
    pub rows_inserted: usize,
}

/// Read request for one table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RowQuery {
    #[serde(default)]
    pub scope: Scope,
    #[serde(default)]
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
    /// Projection; every column when empty.
    #[serde(default)]
    pub columns: Vec<String>,
}

impl RowQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order(mut self, order: Order) -> Self {
        self.order = Some(order);
        self
    }

    pub fn page(mut self, offset: u64, limit: u64) -> Self {
        self.offset = Some(offset);
        self.limit = Some(limit);
        self
    }

    pub fn columns(mut self, columns: Vec<String>) -> Self {
        self.columns = columns;
        self
    }
}

/// One page of rows plus the number of rows matching without paging.
#[derive(Debug, Clone, PartialEq)]
pub struct RowPage {
    pub rows: QueryResult,
    pub records_total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowsRequest {
    pub table_name: String,
    #[serde(default)]
    pub query: RowQuery,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OccupyRequest {
    pub table_name: String,
    pub actor: String,
    pub row_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseRequest {
    pub table_name: String,
    pub row_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindAndOccupyRequest {
    pub table_name: String,
    pub actor: String,
    #[serde(default)]
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
    /// Columns returned for the leased row; every column when empty.
    #[serde(default)]
    pub response_columns: Vec<String>,
}
