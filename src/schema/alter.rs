use rusqlite::{Connection, TransactionBehavior};
use tracing::{debug, info};
use uuid::Uuid;

use super::{create_table_sql, user_columns};
use crate::connection::AlterStrategy;
use crate::core::types::SYSTEM_COLUMNS;
use crate::core::{Result, TdmError};
use crate::sql::quote_identifier;

/// Adds missing user columns to an existing table.
pub trait ColumnAlterer: Send + Sync {
    fn name(&self) -> &'static str;

    fn strategy(&self) -> AlterStrategy;

    fn add_columns(&self, conn: &mut Connection, table: &str, missing: &[String]) -> Result<()>;
}

pub fn alterer_for(strategy: AlterStrategy) -> Box<dyn ColumnAlterer> {
    match strategy {
        AlterStrategy::Soft => Box::new(SoftAlter),
        AlterStrategy::Hard => Box::new(HardAlter),
    }
}

/// One `ALTER TABLE ADD COLUMN` per missing column. Existing rows read the
/// new columns as NULL.
pub struct SoftAlter;

impl ColumnAlterer for SoftAlter {
    fn name(&self) -> &'static str {
        "SOFT_ALTER"
    }

    fn strategy(&self) -> AlterStrategy {
        AlterStrategy::Soft
    }

    fn add_columns(&self, conn: &mut Connection, table: &str, missing: &[String]) -> Result<()> {
        let quoted_table = quote_identifier(table)?;
        for column in missing {
            let sql = format!(
                "ALTER TABLE {} ADD COLUMN {} TEXT",
                quoted_table,
                quote_identifier(column)?
            );
            debug!(table, column = column.as_str(), "adding column");
            conn.execute(&sql, [])
                .map_err(|e| TdmError::Schema(format!("add column '{}' to '{}': {}", column, table, e)))?;
        }
        Ok(())
    }
}

/// Recreates the table with the column superset: exclusive transaction,
/// shadow table, copy of the common projection, drop, rename.
pub struct HardAlter;

impl ColumnAlterer for HardAlter {
    fn name(&self) -> &'static str {
        "HARD_ALTER"
    }

    fn strategy(&self) -> AlterStrategy {
        AlterStrategy::Hard
    }

    fn add_columns(&self, conn: &mut Connection, table: &str, missing: &[String]) -> Result<()> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;

        let existing = user_columns(&tx, table)?;
        let mut superset = existing.clone();
        superset.extend(missing.iter().cloned());

        let shadow = format!("tdm_shadow_{}", Uuid::new_v4().simple());
        tx.execute(&create_table_sql(&shadow, &superset)?, [])
            .map_err(|e| TdmError::Schema(format!("create shadow of '{}': {}", table, e)))?;

        let common = SYSTEM_COLUMNS
            .iter()
            .map(|c| c.to_string())
            .chain(existing)
            .map(|c| quote_identifier(&c))
            .collect::<Result<Vec<_>>>()?
            .join(", ");

        let copied = tx
            .execute(
                &format!(
                    "INSERT INTO {shadow} ({common}) SELECT {common} FROM {table} ORDER BY rowid",
                    shadow = quote_identifier(&shadow)?,
                    common = common,
                    table = quote_identifier(table)?,
                ),
                [],
            )
            .map_err(|e| TdmError::Schema(format!("copy rows of '{}': {}", table, e)))?;

        tx.execute(&format!("DROP TABLE {}", quote_identifier(table)?), [])
            .map_err(|e| TdmError::Schema(format!("drop '{}': {}", table, e)))?;
        tx.execute(
            &format!(
                "ALTER TABLE {} RENAME TO {}",
                quote_identifier(&shadow)?,
                quote_identifier(table)?
            ),
            [],
        )
        .map_err(|e| TdmError::Schema(format!("rename shadow to '{}': {}", table, e)))?;

        tx.commit()?;
        info!(table, copied, added = missing.len(), "table recreated with new columns");
        Ok(())
    }
}
