//! Safe dynamic SQL for data tables.

pub mod builder;
pub mod filter;
pub mod ident;

pub use builder::{BuiltQuery, TableQuery};
pub use filter::{Direction, Filter, FilterKind, Order, Scope};
pub use ident::{encode_literal, quote_identifier, validate_identifier};
