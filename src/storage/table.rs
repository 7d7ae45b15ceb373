//! Row-level operations on data tables.

use chrono::{DateTime, Utc};
use rusqlite::{params_from_iter, Connection, ToSql};
use tracing::debug;
use uuid::Uuid;

use crate::core::types::{format_timestamp, CREATED_WHEN, OCCUPIED_BY, ROW_ID};
use crate::core::{ImportData, Record, Result, TdmError, Value};
use crate::result::QueryResult;
use crate::schema::{normalize_columns, SchemaChange, SchemaManager};
use crate::sql::{quote_identifier, BuiltQuery};

/// Bring the table's schema up to `data.columns` and append its rows.
/// System columns in the payload are ignored.
pub fn load(
    conn: &mut Connection,
    schema: &SchemaManager,
    table: &str,
    data: &ImportData,
    exists: bool,
    batch_size: usize,
) -> Result<(SchemaChange, usize)> {
    let columns = normalize_columns(&data.user_columns())?;
    let change = schema.ensure_table(conn, table, &columns, exists)?;
    let inserted = insert_rows(conn, table, &columns, &data.rows, batch_size, Utc::now())?;
    Ok((change, inserted))
}

/// Insert rows in transactions of `batch_size`. A failing batch rolls back
/// alone; batches committed before it stay.
pub fn insert_rows(
    conn: &mut Connection,
    table: &str,
    columns: &[String],
    rows: &[Record],
    batch_size: usize,
    created_when: DateTime<Utc>,
) -> Result<usize> {
    if rows.is_empty() {
        return Ok(0);
    }

    let mut names = vec![quote_identifier(ROW_ID)?, quote_identifier(CREATED_WHEN)?];
    for column in columns {
        names.push(quote_identifier(column)?);
    }
    let placeholders = vec!["?"; names.len()].join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_identifier(table)?,
        names.join(", "),
        placeholders
    );
    let created = format_timestamp(created_when);
    let null = Value::Null;

    let mut inserted = 0usize;
    for batch in rows.chunks(batch_size.max(1)) {
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(&sql)?;
            for row in batch {
                let row_id = Uuid::new_v4().to_string();
                let mut values: Vec<&dyn ToSql> = Vec::with_capacity(names.len());
                values.push(&row_id);
                values.push(&created);
                for column in columns {
                    values.push(row.get(column).unwrap_or(&null));
                }
                stmt.execute(values.as_slice())?;
            }
        }
        tx.commit()?;
        inserted += batch.len();
        debug!(table, inserted, "row batch committed");
    }

    Ok(inserted)
}

pub fn query(conn: &Connection, query: &BuiltQuery) -> Result<QueryResult> {
    let mut stmt = conn.prepare(&query.sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let width = columns.len();

    let mut rows = Vec::new();
    let mut cursor = stmt.query(params_from_iter(query.params.iter()))?;
    while let Some(row) = cursor.next()? {
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(Value::from_sql_ref(row.get_ref(i)?));
        }
        rows.push(values);
    }

    Ok(QueryResult::new(columns, rows))
}

pub fn count(conn: &Connection, query: &BuiltQuery) -> Result<u64> {
    let total: i64 = conn.query_row(&query.sql, params_from_iter(query.params.iter()), |row| {
        row.get(0)
    })?;
    Ok(total.max(0) as u64)
}

pub fn count_all(conn: &Connection, table: &str) -> Result<u64> {
    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", quote_identifier(table)?),
        [],
        |row| row.get(0),
    )?;
    Ok(total.max(0) as u64)
}

/// Delete the given row ids; unknown ids are ignored.
pub fn delete_by_ids(conn: &mut Connection, table: &str, row_ids: &[String]) -> Result<usize> {
    if row_ids.is_empty() {
        return Ok(0);
    }

    let sql_prefix = format!(
        "DELETE FROM {} WHERE {} IN ",
        quote_identifier(table)?,
        quote_identifier(ROW_ID)?
    );

    let tx = conn.transaction()?;
    let mut removed = 0usize;
    // SQLite caps host parameters per statement.
    for chunk in row_ids.chunks(500) {
        let sql = format!("{}({})", sql_prefix, vec!["?"; chunk.len()].join(", "));
        removed += tx.execute(&sql, params_from_iter(chunk.iter()))?;
    }
    tx.commit()?;
    Ok(removed)
}

/// Remove every row, or only rows without a lease when `keep_occupied`.
pub fn delete_rows(conn: &Connection, table: &str, keep_occupied: bool) -> Result<usize> {
    let mut sql = format!("DELETE FROM {}", quote_identifier(table)?);
    if keep_occupied {
        sql.push_str(&format!(" WHERE {} IS NULL", quote_identifier(OCCUPIED_BY)?));
    }
    Ok(conn.execute(&sql, [])?)
}

/// Run a generated UPDATE statement.
pub fn execute_update(conn: &Connection, sql: &str) -> Result<usize> {
    if !sql.trim_start().to_ascii_uppercase().starts_with("UPDATE ") {
        return Err(TdmError::Validation("only UPDATE statements may be executed here".into()));
    }
    Ok(conn.execute(sql, [])?)
}

/// Overwrite columns of one row.
pub fn update_row(conn: &Connection, table: &str, row_id: &str, values: &Record) -> Result<usize> {
    if values.is_empty() {
        return Ok(0);
    }
    let assignments = values
        .keys()
        .map(|column| Ok(format!("{} = ?", quote_identifier(column)?)))
        .collect::<Result<Vec<_>>>()?;
    let sql = format!(
        "UPDATE {} SET {} WHERE {} = ?",
        quote_identifier(table)?,
        assignments.join(", "),
        quote_identifier(ROW_ID)?
    );

    let mut params: Vec<&dyn ToSql> = values.values().map(|v| v as &dyn ToSql).collect();
    params.push(&row_id);
    Ok(conn.execute(&sql, params.as_slice())?)
}
