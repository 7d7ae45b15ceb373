//! Creation and evolution of data tables.
//!
//! A data table always carries the system columns (`ROW_ID`, `SELECTED`,
//! `CREATED_WHEN`, `OCCUPIED_BY`, `OCCUPIED_DATE`); every other column is a
//! nullable `TEXT` column. New columns are added by the [`ColumnAlterer`]
//! chosen at construction time.

pub mod alter;

use std::collections::HashSet;

use rusqlite::{Connection, OptionalExtension};
use tracing::info;

pub use alter::{ColumnAlterer, HardAlter, SoftAlter};

use crate::connection::AlterStrategy;
use crate::core::types::{
    is_system_column, CREATED_WHEN, OCCUPIED_BY, OCCUPIED_DATE, ROW_ID, SELECTED,
};
use crate::core::{Result, TdmError};
use crate::sql::{quote_identifier, validate_identifier};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaChange {
    Created,
    Altered { added: Vec<String> },
    Unchanged,
}

pub struct SchemaManager {
    alterer: Box<dyn ColumnAlterer>,
}

impl SchemaManager {
    pub fn new(strategy: AlterStrategy) -> Self {
        Self {
            alterer: alter::alterer_for(strategy),
        }
    }

    pub fn with_alterer(alterer: Box<dyn ColumnAlterer>) -> Self {
        Self { alterer }
    }

    pub fn strategy(&self) -> AlterStrategy {
        self.alterer.strategy()
    }

    /// Create the table if `exists` is false, otherwise add the desired
    /// columns it lacks. Columns are never removed.
    pub fn ensure_table(
        &self,
        conn: &mut Connection,
        table: &str,
        desired: &[String],
        exists: bool,
    ) -> Result<SchemaChange> {
        validate_identifier(table)?;
        let desired = normalize_columns(desired)?;

        if !exists {
            create_table(conn, table, &desired)?;
            return Ok(SchemaChange::Created);
        }

        let existing: HashSet<String> = user_columns(conn, table)?
            .into_iter()
            .map(|c| c.to_ascii_uppercase())
            .collect();
        if existing.is_empty() && !table_exists(conn, table)? {
            return Err(TdmError::NotFound(format!("data table '{}' does not exist", table)));
        }

        let missing: Vec<String> = desired
            .into_iter()
            .filter(|c| !existing.contains(&c.to_ascii_uppercase()))
            .collect();

        if missing.is_empty() {
            return Ok(SchemaChange::Unchanged);
        }

        info!(
            table,
            strategy = self.alterer.name(),
            columns = ?missing,
            "evolving table schema"
        );
        self.alterer.add_columns(conn, table, &missing)?;
        Ok(SchemaChange::Altered { added: missing })
    }
}

/// Validate user column names, drop system columns and case-insensitive duplicates.
pub fn normalize_columns(columns: &[String]) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    let mut result = Vec::with_capacity(columns.len());
    for column in columns {
        validate_identifier(column)?;
        if is_system_column(column) {
            continue;
        }
        if seen.insert(column.to_ascii_uppercase()) {
            result.push(column.clone());
        }
    }
    Ok(result)
}

pub(crate) fn create_table_sql(table: &str, user_columns: &[String]) -> Result<String> {
    let mut defs = vec![
        format!(
            "{} TEXT PRIMARY KEY NOT NULL DEFAULT (lower(hex(randomblob(16))))",
            quote_identifier(ROW_ID)?
        ),
        format!("{} INTEGER NOT NULL DEFAULT 0", quote_identifier(SELECTED)?),
        format!(
            "{} TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now'))",
            quote_identifier(CREATED_WHEN)?
        ),
        format!("{} TEXT", quote_identifier(OCCUPIED_BY)?),
        format!("{} TEXT", quote_identifier(OCCUPIED_DATE)?),
    ];
    for column in user_columns {
        defs.push(format!("{} TEXT", quote_identifier(column)?));
    }
    defs.push(format!(
        "CHECK (({} IS NULL) = ({} IS NULL))",
        quote_identifier(OCCUPIED_BY)?,
        quote_identifier(OCCUPIED_DATE)?
    ));

    Ok(format!(
        "CREATE TABLE {} (\n    {}\n)",
        quote_identifier(table)?,
        defs.join(",\n    ")
    ))
}

pub fn create_table(conn: &Connection, table: &str, user_columns: &[String]) -> Result<()> {
    let sql = create_table_sql(table, user_columns)?;
    conn.execute(&sql, [])
        .map_err(|e| TdmError::Schema(format!("create table '{}': {}", table, e)))?;
    info!(table, columns = user_columns.len(), "data table created");
    Ok(())
}

pub fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// All columns in declaration order.
pub fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    validate_identifier(table)?;
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1) ORDER BY cid")?;
    let columns = stmt
        .query_map([table], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(columns)
}

pub fn user_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    Ok(table_columns(conn, table)?
        .into_iter()
        .filter(|c| !is_system_column(c))
        .collect())
}

pub fn drop_table(conn: &Connection, table: &str) -> Result<()> {
    conn.execute(&format!("DROP TABLE IF EXISTS {}", quote_identifier(table)?), [])
        .map_err(|e| TdmError::Schema(format!("drop table '{}': {}", table, e)))?;
    info!(table, "data table dropped");
    Ok(())
}
