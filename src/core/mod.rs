pub mod error;
pub mod types;
pub mod value;

pub use error::{Result, TdmError};
pub use types::{
    BatchItemResult, CatalogEntry, CleanupConfig, CleanupCriteria, CleanupKind, ImportData,
    ImportInfo, Record, RefreshConfig, Row,
};
pub use value::Value;
