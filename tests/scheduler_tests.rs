use std::sync::Arc;

use chrono::Utc;
use tdmdb::{
    CleanupConfig, CleanupCriteria, ImportData, ImportRequest, JobGroup, LockMode, RefreshConfig,
    ScheduleState, SqlImportRequest, SqliteSourceExecutor, StaticSourceResolver, StoreConfig,
    TableTarget, TdmError, TestDataStore, Value,
};
use tempfile::TempDir;
use uuid::Uuid;

async fn open_store(dir: &TempDir) -> Arc<TestDataStore> {
    let source = dir.path().join("source.db");
    let config = StoreConfig::new(dir.path().join("store.db")).lock_mode(LockMode::Local);
    let resolver =
        StaticSourceResolver::new().with_default(Arc::new(SqliteSourceExecutor::new(source)));
    TestDataStore::open(config, Arc::new(resolver)).await.unwrap()
}

fn seed_source(dir: &TempDir) {
    let conn = rusqlite::Connection::open(dir.path().join("source.db")).unwrap();
    conn.execute_batch(
        "CREATE TABLE sims (iccid TEXT);
         INSERT INTO sims VALUES ('8901'), ('8902');",
    )
    .unwrap();
}

async fn import_rows(store: &TestDataStore, target: TableTarget) -> String {
    let data = ImportData::new(
        vec!["ICCID".into()],
        vec![[("ICCID".to_string(), Value::from("8901"))].into_iter().collect()],
    );
    store
        .import_rows(ImportRequest { target, data })
        .await
        .unwrap()
        .table_name
}

#[tokio::test]
async fn test_cleanup_schedule_follows_enabled_flag() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    let table = import_rows(&store, TableTarget::new(Uuid::new_v4(), "sims")).await;

    let config = CleanupConfig::new("0 30 2 * * *", CleanupCriteria::Date { offset_days: 3 })
        .enabled(false);
    let id = config.id;
    store.save_cleanup_config(&table, config.clone()).await.unwrap();
    assert_eq!(store.job_state(JobGroup::Cleanup, id), ScheduleState::Unscheduled);
    assert_eq!(store.catalog_entry(&table).await.unwrap().cleanup_config_id, Some(id));

    store
        .save_cleanup_config(&table, config.enabled(true))
        .await
        .unwrap();
    match store.job_state(JobGroup::Cleanup, id) {
        ScheduleState::Scheduled { next_fire_time } => assert!(next_fire_time > Utc::now()),
        other => panic!("expected a scheduled job, got {:?}", other),
    }
    assert!(!store.scheduler_standby());

    // deleting the only table that uses the config removes config and job
    store.delete_table(&table).await.unwrap();
    assert_eq!(store.job_state(JobGroup::Cleanup, id), ScheduleState::Unscheduled);
    assert!(matches!(
        store.cleanup_config(id).await.unwrap_err(),
        TdmError::NotFound(_)
    ));

    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_invalid_cron_is_rejected_even_when_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    let table = import_rows(&store, TableTarget::new(Uuid::new_v4(), "sims")).await;

    for cron in ["* * * * *", "* 0 3 * * *", "not a cron"] {
        let config =
            CleanupConfig::new(cron, CleanupCriteria::Date { offset_days: 1 }).enabled(false);
        let err = store.save_cleanup_config(&table, config).await.unwrap_err();
        assert!(matches!(err, TdmError::Validation(_)), "{}", cron);
    }
    assert_eq!(store.catalog_entry(&table).await.unwrap().cleanup_config_id, None);

    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_date_offset_beyond_bound_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    let table = import_rows(&store, TableTarget::new(Uuid::new_v4(), "sims")).await;

    let criteria = CleanupCriteria::Date { offset_days: 200_000_000 };
    let err = store
        .save_cleanup_config(&table, CleanupConfig::new("0 0 3 * * *", criteria.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, TdmError::Validation(_)));

    let err = store
        .run_cleanup_for_table(&table, &CleanupConfig::new("0 0 3 * * *", criteria))
        .await
        .unwrap_err();
    assert!(matches!(err, TdmError::Validation(_)));

    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shared_cleanup_links_same_titled_tables() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    let project = Uuid::new_v4();

    let first = import_rows(&store, TableTarget::new(project, "sims")).await;
    let second = import_rows(&store, TableTarget::new(project, "sims").system(Uuid::new_v4())).await;
    let other = import_rows(&store, TableTarget::new(project, "cards")).await;

    let config =
        CleanupConfig::new("0 0 4 * * *", CleanupCriteria::Date { offset_days: 30 }).shared(true);
    let id = config.id;
    store.save_cleanup_config(&first, config).await.unwrap();

    assert_eq!(store.catalog_entry(&first).await.unwrap().cleanup_config_id, Some(id));
    assert_eq!(store.catalog_entry(&second).await.unwrap().cleanup_config_id, Some(id));
    assert_eq!(store.catalog_entry(&other).await.unwrap().cleanup_config_id, None);

    let results = store.run_cleanup(id).await.unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.is_ok()));

    // replacing the link leaves the old config unused
    let replacement = CleanupConfig::new("0 0 5 * * *", CleanupCriteria::Date { offset_days: 1 });
    store.save_cleanup_config(&first, replacement).await.unwrap();
    store.save_cleanup_config(
        &second,
        CleanupConfig::new("0 0 5 * * *", CleanupCriteria::Date { offset_days: 1 }),
    )
    .await
    .unwrap();
    assert!(store.cleanup_config(id).await.is_err());
    assert_eq!(store.job_state(JobGroup::Cleanup, id), ScheduleState::Unscheduled);

    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_refresh_config_requires_sql_import() {
    let dir = tempfile::tempdir().unwrap();
    seed_source(&dir);
    let store = open_store(&dir).await;
    let table = import_rows(&store, TableTarget::new(Uuid::new_v4(), "manual")).await;

    let err = store
        .save_refresh_config(&table, RefreshConfig::new("0 0 1 * * *"))
        .await
        .unwrap_err();
    assert!(matches!(err, TdmError::NotFound(_)));

    // an update-by-query record is not a source query
    let updated = store
        .update_by_query(&table, "SELECT iccid AS SOURCE_ICCID FROM sims WHERE iccid = ${ICCID}", 0)
        .await
        .unwrap();
    assert_eq!(updated, 1);
    let err = store
        .save_refresh_config(&table, RefreshConfig::new("0 0 1 * * *"))
        .await
        .unwrap_err();
    assert!(matches!(err, TdmError::NotFound(_)));
    assert!(matches!(
        store.run_refresh(&table, false, None).await.unwrap_err(),
        TdmError::NotFound(_)
    ));
    assert_eq!(store.catalog_entry(&table).await.unwrap().refresh_config_id, None);

    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_refresh_config_fans_out_and_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    seed_source(&dir);
    let project = Uuid::new_v4();
    let query = "SELECT iccid AS ICCID FROM sims";

    let (first, id) = {
        let store = open_store(&dir).await;
        let mut tables = Vec::new();
        for _ in 0..2 {
            let outcome = store
                .import_from_sql(SqlImportRequest {
                    target: TableTarget::new(project, "sims").system(Uuid::new_v4()),
                    query: query.into(),
                    query_timeout_secs: 0,
                })
                .await
                .unwrap();
            tables.push(outcome.table_name);
        }
        // same title, different query: not an environment of the others
        let unrelated = store
            .import_from_sql(SqlImportRequest {
                target: TableTarget::new(project, "sims").system(Uuid::new_v4()),
                query: "SELECT iccid AS ICCID FROM sims WHERE iccid = '8901'".into(),
                query_timeout_secs: 0,
            })
            .await
            .unwrap()
            .table_name;

        let config = RefreshConfig::new("0 15 1 * * *")
            .all_environments(true)
            .save_occupied_data(true)
            .query_timeout_secs(30);
        let id = config.id;
        store.save_refresh_config(&tables[0], config).await.unwrap();

        assert_eq!(store.catalog_entry(&tables[1]).await.unwrap().refresh_config_id, Some(id));
        assert_eq!(store.catalog_entry(&unrelated).await.unwrap().refresh_config_id, None);

        let results = store.run_refresh_config(id).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.is_ok() && r.records_inserted == 2));

        store.shutdown().await.unwrap();
        (tables[0].clone(), id)
    };

    let store = open_store(&dir).await;
    assert!(matches!(
        store.job_state(JobGroup::Refresh, id),
        ScheduleState::Scheduled { .. }
    ));
    let saved = store.refresh_config(id).await.unwrap();
    assert!(saved.all_environments);
    assert_eq!(saved.query_timeout_secs, Some(30));
    assert_eq!(store.catalog_entry(&first).await.unwrap().refresh_config_id, Some(id));

    store.shutdown().await.unwrap();
}
