pub mod catalog;
pub mod table;

pub use catalog::{migrate, CATALOG_SCHEMA_VERSION};
