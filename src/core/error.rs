use thiserror::Error;

#[derive(Error, Debug)]
pub enum TdmError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("External execution error: {0}")]
    ExternalExecution(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

pub type Result<T> = std::result::Result<T, TdmError>;

impl TdmError {
    pub fn table_not_found(table: &str) -> Self {
        Self::NotFound(format!("table '{}' is not registered in the catalog", table))
    }

    /// Short machine-friendly kind, used in batch and job results.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Conflict(_) => "conflict",
            Self::NotFound(_) => "not_found",
            Self::ExternalExecution(_) => "external_execution",
            Self::Schema(_) => "schema",
            Self::Persistence(_) => "persistence",
            Self::Lock(_) => "lock",
            Self::Scheduler(_) => "scheduler",
        }
    }
}

impl From<rusqlite::Error> for TdmError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for TdmError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Lock(err.to_string())
    }
}

impl From<serde_json::Error> for TdmError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(format!("invalid json: {}", err))
    }
}
