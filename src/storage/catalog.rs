//! Metadata registry: catalog entries, import info and cleanup/refresh
//! configurations, kept in the same database as the data tables.

use chrono::NaiveDate;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::core::{
    CatalogEntry, CleanupConfig, CleanupCriteria, ImportInfo, RefreshConfig, Result, TdmError,
};

pub const CATALOG_SCHEMA_VERSION: i64 = 1;

pub fn schema_version(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

pub fn migrate(conn: &Connection) -> Result<()> {
    let current = schema_version(conn)?;
    if current > CATALOG_SCHEMA_VERSION {
        return Err(TdmError::Persistence(format!(
            "unsupported catalog schema version {}, max supported {}",
            current, CATALOG_SCHEMA_VERSION
        )));
    }

    if current < 1 {
        conn.execute_batch(include_str!("../../migrations/0001_catalog.sql"))?;
        conn.pragma_update(None, "user_version", 1)?;
    }

    Ok(())
}

fn uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let text: String = row.get(idx)?;
    Uuid::parse_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn opt_uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(text) => Uuid::parse_str(&text)
            .map(Some)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
        None => Ok(None),
    }
}

fn opt_date_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<NaiveDate>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(text) => NaiveDate::parse_from_str(&text, "%Y-%m-%d")
            .map(Some)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
        None => Ok(None),
    }
}

const ENTRY_COLUMNS: &str = "table_name, project_id, system_id, environment_id, table_title, \
     last_usage, refresh_config_id, cleanup_config_id";

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<CatalogEntry> {
    Ok(CatalogEntry {
        table_name: row.get(0)?,
        project_id: uuid_at(row, 1)?,
        system_id: opt_uuid_at(row, 2)?,
        environment_id: opt_uuid_at(row, 3)?,
        table_title: row.get(4)?,
        last_usage: opt_date_at(row, 5)?,
        refresh_config_id: opt_uuid_at(row, 6)?,
        cleanup_config_id: opt_uuid_at(row, 7)?,
    })
}

fn query_entries(
    conn: &Connection,
    filter: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<CatalogEntry>> {
    let sql = format!(
        "SELECT {} FROM tdm_catalog {} ORDER BY table_title, table_name",
        ENTRY_COLUMNS, filter
    );
    let mut stmt = conn.prepare(&sql)?;
    let entries = stmt
        .query_map(params, entry_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entries)
}

pub fn insert_entry(conn: &Connection, entry: &CatalogEntry) -> Result<()> {
    let result = conn.execute(
        "INSERT INTO tdm_catalog (
            table_name, project_id, system_id, environment_id, table_title,
            last_usage, refresh_config_id, cleanup_config_id
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            entry.table_name,
            entry.project_id.to_string(),
            entry.system_id.map(|id| id.to_string()),
            entry.environment_id.map(|id| id.to_string()),
            entry.table_title,
            entry.last_usage.map(|d| d.format("%Y-%m-%d").to_string()),
            entry.refresh_config_id.map(|id| id.to_string()),
            entry.cleanup_config_id.map(|id| id.to_string()),
        ],
    );

    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(TdmError::Conflict(format!(
                "table '{}' with title '{}' is already registered",
                entry.table_name, entry.table_title
            )))
        }
        Err(other) => Err(other.into()),
    }
}

pub fn find_entry(conn: &Connection, table_name: &str) -> Result<Option<CatalogEntry>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM tdm_catalog WHERE table_name = ?1", ENTRY_COLUMNS),
            [table_name],
            entry_from_row,
        )
        .optional()?)
}

pub fn get_entry(conn: &Connection, table_name: &str) -> Result<CatalogEntry> {
    find_entry(conn, table_name)?.ok_or_else(|| TdmError::table_not_found(table_name))
}

pub fn find_by_title(
    conn: &Connection,
    project_id: Uuid,
    system_id: Option<Uuid>,
    title: &str,
) -> Result<Option<CatalogEntry>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {} FROM tdm_catalog
                 WHERE project_id = ?1 AND IFNULL(system_id, '') = IFNULL(?2, '') AND table_title = ?3",
                ENTRY_COLUMNS
            ),
            params![
                project_id.to_string(),
                system_id.map(|id| id.to_string()),
                title
            ],
            entry_from_row,
        )
        .optional()?)
}

/// Every table of the project with the given title, across systems and environments.
pub fn entries_by_title(conn: &Connection, project_id: Uuid, title: &str) -> Result<Vec<CatalogEntry>> {
    query_entries(
        conn,
        "WHERE project_id = ?1 AND table_title = ?2",
        params![project_id.to_string(), title],
    )
}

pub fn list_entries(conn: &Connection, project_id: Option<Uuid>) -> Result<Vec<CatalogEntry>> {
    match project_id {
        Some(project) => query_entries(conn, "WHERE project_id = ?1", [project.to_string()]),
        None => query_entries(conn, "", []),
    }
}

pub fn entries_by_cleanup_config(conn: &Connection, config_id: Uuid) -> Result<Vec<CatalogEntry>> {
    query_entries(conn, "WHERE cleanup_config_id = ?1", [config_id.to_string()])
}

pub fn entries_by_refresh_config(conn: &Connection, config_id: Uuid) -> Result<Vec<CatalogEntry>> {
    query_entries(conn, "WHERE refresh_config_id = ?1", [config_id.to_string()])
}

pub fn update_last_usage(conn: &Connection, table_name: &str, date: NaiveDate) -> Result<()> {
    conn.execute(
        "UPDATE tdm_catalog SET last_usage = ?1 WHERE table_name = ?2",
        params![date.format("%Y-%m-%d").to_string(), table_name],
    )?;
    Ok(())
}

pub fn set_cleanup_config(conn: &Connection, tables: &[String], config_id: Option<Uuid>) -> Result<()> {
    let id = config_id.map(|id| id.to_string());
    for table in tables {
        conn.execute(
            "UPDATE tdm_catalog SET cleanup_config_id = ?1 WHERE table_name = ?2",
            params![id, table],
        )?;
    }
    Ok(())
}

pub fn set_refresh_config(conn: &Connection, tables: &[String], config_id: Option<Uuid>) -> Result<()> {
    let id = config_id.map(|id| id.to_string());
    for table in tables {
        conn.execute(
            "UPDATE tdm_catalog SET refresh_config_id = ?1 WHERE table_name = ?2",
            params![id, table],
        )?;
    }
    Ok(())
}

pub fn rename_title(conn: &Connection, table_name: &str, title: &str) -> Result<()> {
    let result = conn.execute(
        "UPDATE tdm_catalog SET table_title = ?1 WHERE table_name = ?2",
        params![title, table_name],
    );
    match result {
        Ok(0) => Err(TdmError::table_not_found(table_name)),
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(TdmError::Conflict(format!("title '{}' is already in use", title)))
        }
        Err(other) => Err(other.into()),
    }
}

pub fn delete_entry(conn: &Connection, table_name: &str) -> Result<bool> {
    Ok(conn.execute("DELETE FROM tdm_catalog WHERE table_name = ?1", [table_name])? > 0)
}

pub fn upsert_import_info(conn: &Connection, info: &ImportInfo) -> Result<()> {
    conn.execute(
        "INSERT INTO tdm_import_info (table_name, table_query, query_timeout_secs, update_by_query)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(table_name) DO UPDATE SET
            table_query = excluded.table_query,
            query_timeout_secs = excluded.query_timeout_secs,
            update_by_query = excluded.update_by_query",
        params![
            info.table_name,
            info.table_query,
            info.query_timeout_secs as i64,
            info.update_by_query
        ],
    )?;
    Ok(())
}

pub fn find_import_info(conn: &Connection, table_name: &str) -> Result<Option<ImportInfo>> {
    Ok(conn
        .query_row(
            "SELECT table_name, table_query, query_timeout_secs, update_by_query
             FROM tdm_import_info WHERE table_name = ?1",
            [table_name],
            |row| {
                Ok(ImportInfo {
                    table_name: row.get(0)?,
                    table_query: row.get(1)?,
                    query_timeout_secs: row.get::<_, i64>(2)?.max(0) as u64,
                    update_by_query: row.get(3)?,
                })
            },
        )
        .optional()?)
}

pub fn delete_import_info(conn: &Connection, table_name: &str) -> Result<()> {
    conn.execute("DELETE FROM tdm_import_info WHERE table_name = ?1", [table_name])?;
    Ok(())
}

pub fn save_cleanup_config(conn: &Connection, config: &CleanupConfig) -> Result<()> {
    let criteria_json = serde_json::to_string(&config.criteria)
        .map_err(|e| TdmError::Persistence(format!("serialize cleanup criteria: {}", e)))?;
    conn.execute(
        "INSERT INTO tdm_cleanup_config (id, schedule, enabled, shared, kind, criteria_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET
            schedule = excluded.schedule,
            enabled = excluded.enabled,
            shared = excluded.shared,
            kind = excluded.kind,
            criteria_json = excluded.criteria_json",
        params![
            config.id.to_string(),
            config.schedule,
            config.enabled,
            config.shared,
            config.criteria.kind().to_string(),
            criteria_json
        ],
    )?;
    Ok(())
}

fn cleanup_from_row(row: &Row<'_>) -> rusqlite::Result<CleanupConfig> {
    let criteria_json: String = row.get(4)?;
    let criteria: CleanupCriteria = serde_json::from_str(&criteria_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;
    Ok(CleanupConfig {
        id: uuid_at(row, 0)?,
        schedule: row.get(1)?,
        enabled: row.get(2)?,
        shared: row.get(3)?,
        criteria,
    })
}

pub fn find_cleanup_config(conn: &Connection, id: Uuid) -> Result<Option<CleanupConfig>> {
    Ok(conn
        .query_row(
            "SELECT id, schedule, enabled, shared, criteria_json FROM tdm_cleanup_config WHERE id = ?1",
            [id.to_string()],
            cleanup_from_row,
        )
        .optional()?)
}

pub fn all_cleanup_configs(conn: &Connection) -> Result<Vec<CleanupConfig>> {
    let mut stmt = conn
        .prepare("SELECT id, schedule, enabled, shared, criteria_json FROM tdm_cleanup_config")?;
    let configs = stmt
        .query_map([], cleanup_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(configs)
}

pub fn delete_cleanup_config(conn: &Connection, id: Uuid) -> Result<bool> {
    Ok(conn.execute("DELETE FROM tdm_cleanup_config WHERE id = ?1", [id.to_string()])? > 0)
}

/// Cleanup configs no catalog entry points at.
pub fn unused_cleanup_config_ids(conn: &Connection) -> Result<Vec<Uuid>> {
    let mut stmt = conn.prepare(
        "SELECT c.id FROM tdm_cleanup_config c
         WHERE NOT EXISTS (SELECT 1 FROM tdm_catalog e WHERE e.cleanup_config_id = c.id)",
    )?;
    let ids = stmt
        .query_map([], |row| uuid_at(row, 0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ids)
}

pub fn save_refresh_config(conn: &Connection, config: &RefreshConfig) -> Result<()> {
    conn.execute(
        "INSERT INTO tdm_refresh_config
            (id, schedule, enabled, query_timeout_secs, all_environments, save_occupied_data)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET
            schedule = excluded.schedule,
            enabled = excluded.enabled,
            query_timeout_secs = excluded.query_timeout_secs,
            all_environments = excluded.all_environments,
            save_occupied_data = excluded.save_occupied_data",
        params![
            config.id.to_string(),
            config.schedule,
            config.enabled,
            config.query_timeout_secs.map(|s| s as i64),
            config.all_environments,
            config.save_occupied_data
        ],
    )?;
    Ok(())
}

fn refresh_from_row(row: &Row<'_>) -> rusqlite::Result<RefreshConfig> {
    Ok(RefreshConfig {
        id: uuid_at(row, 0)?,
        schedule: row.get(1)?,
        enabled: row.get(2)?,
        query_timeout_secs: row.get::<_, Option<i64>>(3)?.map(|s| s.max(0) as u64),
        all_environments: row.get(4)?,
        save_occupied_data: row.get(5)?,
    })
}

const REFRESH_COLUMNS: &str =
    "id, schedule, enabled, query_timeout_secs, all_environments, save_occupied_data";

pub fn find_refresh_config(conn: &Connection, id: Uuid) -> Result<Option<RefreshConfig>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM tdm_refresh_config WHERE id = ?1", REFRESH_COLUMNS),
            [id.to_string()],
            refresh_from_row,
        )
        .optional()?)
}

pub fn all_refresh_configs(conn: &Connection) -> Result<Vec<RefreshConfig>> {
    let mut stmt = conn.prepare(&format!("SELECT {} FROM tdm_refresh_config", REFRESH_COLUMNS))?;
    let configs = stmt
        .query_map([], refresh_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(configs)
}

pub fn delete_refresh_config(conn: &Connection, id: Uuid) -> Result<bool> {
    Ok(conn.execute("DELETE FROM tdm_refresh_config WHERE id = ?1", [id.to_string()])? > 0)
}

pub fn unused_refresh_config_ids(conn: &Connection) -> Result<Vec<Uuid>> {
    let mut stmt = conn.prepare(
        "SELECT c.id FROM tdm_refresh_config c
         WHERE NOT EXISTS (SELECT 1 FROM tdm_catalog e WHERE e.refresh_config_id = c.id)",
    )?;
    let ids = stmt
        .query_map([], |row| uuid_at(row, 0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ids)
}
