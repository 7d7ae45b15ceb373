//! Row leases.
//!
//! A row is available iff `OCCUPIED_BY IS NULL`. Occupying sets both
//! occupancy columns, releasing clears both; the table's CHECK constraint
//! forbids any other combination.
//!
//! `occupy` is a compare-and-swap over the whole id batch: it fails only
//! when no requested row could be taken. When some ids are already leased
//! the free subset is taken and the call still succeeds.

use chrono::{DateTime, Utc};
use rusqlite::types::ToSql;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use tracing::debug;

use crate::core::types::{format_timestamp, OCCUPIED_BY, OCCUPIED_DATE, ROW_ID};
use crate::core::{Record, Result, TdmError, Value};
use crate::sql::{quote_identifier, Filter, Order, Scope, TableQuery};

const ID_CHUNK: usize = 500;

fn require_ids(row_ids: &[String]) -> Result<()> {
    if row_ids.is_empty() {
        return Err(TdmError::Validation("no row ids given".into()));
    }
    Ok(())
}

fn require_actor(actor: &str) -> Result<()> {
    if actor.trim().is_empty() {
        return Err(TdmError::Validation("actor must not be empty".into()));
    }
    Ok(())
}

/// Lease the given rows to `actor`. Returns the number of rows taken.
pub fn occupy(
    conn: &mut Connection,
    table: &str,
    actor: &str,
    row_ids: &[String],
    now: DateTime<Utc>,
) -> Result<usize> {
    require_ids(row_ids)?;
    require_actor(actor)?;

    let prefix = format!(
        "UPDATE {} SET {} = ?, {} = ? WHERE {} IS NULL AND {} IN ",
        quote_identifier(table)?,
        quote_identifier(OCCUPIED_BY)?,
        quote_identifier(OCCUPIED_DATE)?,
        quote_identifier(OCCUPIED_BY)?,
        quote_identifier(ROW_ID)?
    );
    let stamp = format_timestamp(now);

    let tx = conn.transaction()?;
    let mut taken = 0usize;
    for chunk in row_ids.chunks(ID_CHUNK) {
        let sql = format!("{}({})", prefix, vec!["?"; chunk.len()].join(", "));
        let mut params: Vec<&dyn ToSql> = Vec::with_capacity(chunk.len() + 2);
        params.push(&actor);
        params.push(&stamp);
        params.extend(chunk.iter().map(|id| id as &dyn ToSql));
        taken += tx.execute(&sql, params.as_slice())?;
    }

    if taken == 0 {
        // nothing changed, the transaction is dropped
        return Err(TdmError::Conflict(format!(
            "none of the {} requested rows of '{}' is available",
            row_ids.len(),
            table
        )));
    }
    tx.commit()?;

    if taken < row_ids.len() {
        debug!(table, requested = row_ids.len(), taken, "partial occupy");
    }
    Ok(taken)
}

/// Clear the lease of the given rows. Releasing free or unknown rows is a no-op.
pub fn release(conn: &mut Connection, table: &str, row_ids: &[String]) -> Result<usize> {
    require_ids(row_ids)?;

    let prefix = format!(
        "UPDATE {} SET {} = NULL, {} = NULL WHERE {} IN ",
        quote_identifier(table)?,
        quote_identifier(OCCUPIED_BY)?,
        quote_identifier(OCCUPIED_DATE)?,
        quote_identifier(ROW_ID)?
    );

    let tx = conn.transaction()?;
    let mut released = 0usize;
    for chunk in row_ids.chunks(ID_CHUNK) {
        let sql = format!("{}({})", prefix, vec!["?"; chunk.len()].join(", "));
        released += tx.execute(&sql, params_from_iter(chunk.iter()))?;
    }
    tx.commit()?;
    Ok(released)
}

/// Lease the first available row matching `filters` and return
/// `response_columns` of it (every column when empty).
///
/// Selection and update are one statement, so two callers can never
/// receive the same row.
pub fn occupy_first_matching(
    conn: &Connection,
    table: &str,
    filters: &[Filter],
    order: Option<Order>,
    actor: &str,
    response_columns: &[String],
    now: DateTime<Utc>,
) -> Result<Record> {
    require_actor(actor)?;

    let candidate = TableQuery::new(table)
        .scope(Scope::Available)
        .filters(filters.iter().cloned())
        .order(order)
        .columns(vec![ROW_ID.to_string()])
        .limit(Some(1))
        .select()?;

    let returning = if response_columns.is_empty() {
        "*".to_string()
    } else {
        response_columns
            .iter()
            .map(|c| quote_identifier(c))
            .collect::<Result<Vec<_>>>()?
            .join(", ")
    };

    let sql = format!(
        "UPDATE {table} SET {by} = ?, {date} = ? \
         WHERE {id} = ({candidate}) AND {by} IS NULL \
         RETURNING {returning}",
        table = quote_identifier(table)?,
        by = quote_identifier(OCCUPIED_BY)?,
        date = quote_identifier(OCCUPIED_DATE)?,
        id = quote_identifier(ROW_ID)?,
        candidate = candidate.sql,
        returning = returning,
    );

    let stamp = format_timestamp(now);
    let mut params: Vec<&dyn ToSql> = Vec::with_capacity(candidate.params.len() + 2);
    params.push(&actor);
    params.push(&stamp);
    params.extend(candidate.params.iter().map(|p| p as &dyn ToSql));

    let mut stmt = conn.prepare(&sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let record = stmt
        .query_row(params.as_slice(), |row| {
            let mut record = Record::new();
            for (i, column) in columns.iter().enumerate() {
                record.insert(column.clone(), Value::from_sql_ref(row.get_ref(i)?));
            }
            Ok(record)
        })
        .optional()?;

    record.ok_or_else(|| {
        TdmError::NotFound(format!("no available row of '{}' matches the filters", table))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::AlterStrategy;
    use crate::schema::SchemaManager;
    use crate::storage::table;

    fn setup(values: &[&str]) -> (Connection, Vec<String>) {
        let mut conn = Connection::open_in_memory().unwrap();
        SchemaManager::new(AlterStrategy::Soft)
            .ensure_table(&mut conn, "t_lease", &["ICCID".into()], false)
            .unwrap();
        let rows: Vec<Record> = values
            .iter()
            .map(|v| Record::from([("ICCID".to_string(), Value::from(*v))]))
            .collect();
        table::insert_rows(&mut conn, "t_lease", &["ICCID".into()], &rows, 100, Utc::now()).unwrap();

        let ids = table::query(
            &conn,
            &TableQuery::new("t_lease")
                .columns(vec![ROW_ID.to_string()])
                .select()
                .unwrap(),
        )
        .unwrap()
        .rows
        .into_iter()
        .map(|r| r[0].to_string())
        .collect();
        (conn, ids)
    }

    #[test]
    fn test_occupy_conflict_and_partial_success() {
        let (mut conn, ids) = setup(&["1", "2", "3"]);

        assert_eq!(occupy(&mut conn, "t_lease", "bot-a", &ids[..1], Utc::now()).unwrap(), 1);
        let again = occupy(&mut conn, "t_lease", "bot-b", &ids[..1], Utc::now());
        assert!(matches!(again, Err(TdmError::Conflict(_))));

        // ids[0] is taken, ids[1] is free: only the free one moves
        assert_eq!(occupy(&mut conn, "t_lease", "bot-b", &ids[..2], Utc::now()).unwrap(), 1);
        let owner: String = conn
            .query_row(
                "SELECT OCCUPIED_BY FROM t_lease WHERE ROW_ID = ?1",
                [&ids[0]],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(owner, "bot-a");
    }

    #[test]
    fn test_release_is_idempotent() {
        let (mut conn, ids) = setup(&["1", "2"]);
        occupy(&mut conn, "t_lease", "bot", &ids, Utc::now()).unwrap();

        assert_eq!(release(&mut conn, "t_lease", &ids).unwrap(), 2);
        let first = table::query(&conn, &TableQuery::new("t_lease").select().unwrap()).unwrap();
        release(&mut conn, "t_lease", &ids).unwrap();
        let second = table::query(&conn, &TableQuery::new("t_lease").select().unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_occupy_first_matching_takes_each_row_once() {
        let (conn, _) = setup(&["8901", "8902", "7700"]);
        let filters = vec![Filter::start_with("ICCID", "890")];

        let a = occupy_first_matching(&conn, "t_lease", &filters, None, "x", &["ICCID".into()], Utc::now())
            .unwrap();
        let b = occupy_first_matching(&conn, "t_lease", &filters, None, "y", &["ICCID".into()], Utc::now())
            .unwrap();
        assert_eq!(a.get("ICCID"), Some(&Value::from("8901")));
        assert_eq!(b.get("ICCID"), Some(&Value::from("8902")));

        let none = occupy_first_matching(&conn, "t_lease", &filters, None, "z", &[], Utc::now());
        assert!(matches!(none, Err(TdmError::NotFound(_))));
    }
}
