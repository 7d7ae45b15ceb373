use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tdmdb::{
    FindAndOccupyRequest, Filter, ImportData, ImportRequest, LockMode, OccupyRequest, Order,
    Record, RowQuery, RowsRequest, SchemaChange, Scope, StaticSourceResolver, StoreConfig,
    TableTarget, TdmError, TestDataStore, Value,
};
use tempfile::TempDir;
use uuid::Uuid;

async fn open_store(dir: &TempDir) -> Arc<TestDataStore> {
    let config = StoreConfig::new(dir.path().join("store.db"))
        .lock_mode(LockMode::Local)
        .scheduler_enabled(false);
    TestDataStore::open(config, Arc::new(StaticSourceResolver::new()))
        .await
        .unwrap()
}

fn record(pairs: &[(&str, &str)]) -> Record {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), Value::from(*v)))
        .collect()
}

fn sims(rows: &[(&str, &str)]) -> ImportData {
    ImportData::new(
        vec!["ICCID".into(), "MSISDN".into()],
        rows.iter()
            .map(|(iccid, msisdn)| record(&[("ICCID", iccid), ("MSISDN", msisdn)]))
            .collect(),
    )
}

async fn import(store: &TestDataStore, project: Uuid, title: &str, data: ImportData) -> String {
    store
        .import_rows(ImportRequest {
            target: TableTarget::new(project, title),
            data,
        })
        .await
        .unwrap()
        .table_name
}

fn row_ids(store_rows: &tdmdb::QueryResult) -> Vec<String> {
    (0..store_rows.row_count())
        .map(|i| store_rows.value(i, "ROW_ID").unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_import_then_read_in_insertion_order() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    let project = Uuid::new_v4();

    let table = import(
        &store,
        project,
        "sims",
        sims(&[("8901", "7901"), ("8902", "7902"), ("8903", "7903")]),
    )
    .await;

    let page = store.get_rows(&table, &RowQuery::new()).await.unwrap();
    assert_eq!(page.records_total, 3);
    assert_eq!(page.rows.row_count(), 3);
    for (i, iccid) in ["8901", "8902", "8903"].iter().enumerate() {
        assert_eq!(page.rows.value(i, "ICCID").unwrap().to_string(), *iccid);
        assert!(page.rows.value(i, "OCCUPIED_BY").unwrap().is_null());
    }

    let ids = row_ids(&page.rows);
    let unique: std::collections::HashSet<_> = ids.iter().collect();
    assert_eq!(unique.len(), 3);

    let entries = store.list_tables(Some(project)).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].table_name, table);
    assert_eq!(entries[0].last_usage, Some(Utc::now().date_naive()));
}

#[tokio::test]
async fn test_reimport_adds_columns_and_keeps_rows() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    let project = Uuid::new_v4();

    let table = import(&store, project, "sims", sims(&[("8901", "7901")])).await;

    let extended = ImportData::new(
        vec!["ICCID".into(), "MSISDN".into(), "IMSI".into()],
        vec![record(&[("ICCID", "8902"), ("MSISDN", "7902"), ("IMSI", "2500")])],
    );
    let outcome = store
        .import_rows(ImportRequest {
            target: TableTarget::new(project, "sims"),
            data: extended,
        })
        .await
        .unwrap();

    assert_eq!(outcome.table_name, table);
    assert_eq!(
        outcome.schema_change,
        SchemaChange::Altered {
            added: vec!["IMSI".to_string()]
        }
    );

    let page = store.get_rows(&table, &RowQuery::new()).await.unwrap();
    assert_eq!(page.records_total, 2);
    assert!(page.rows.value(0, "IMSI").unwrap().is_null());
    assert_eq!(page.rows.value(1, "IMSI").unwrap().to_string(), "2500");

    let columns = store.columns(&table).await.unwrap();
    assert_eq!(&columns[..5], ["ROW_ID", "SELECTED", "CREATED_WHEN", "OCCUPIED_BY", "OCCUPIED_DATE"]);
    assert!(columns.iter().any(|c| c == "IMSI"));
}

#[tokio::test]
async fn test_import_rejects_bad_column_names() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;

    let data = ImportData::new(
        vec!["ICCID; DROP TABLE x".into()],
        vec![record(&[("ICCID; DROP TABLE x", "1")])],
    );
    let err = store
        .import_rows(ImportRequest {
            target: TableTarget::new(Uuid::new_v4(), "bad"),
            data,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, TdmError::Validation(_)));
    assert!(store.list_tables(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_contains_and_start_with_filters() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    let table = import(
        &store,
        Uuid::new_v4(),
        "sims",
        sims(&[("8901260720040140822", "79001"), ("8970000000000000001", "79002")]),
    )
    .await;

    let contains = RowQuery::new().filter(Filter::contains("ICCID", "026072").case_insensitive());
    let page = store.get_rows(&table, &contains).await.unwrap();
    assert_eq!(page.records_total, 1);
    assert_eq!(page.rows.value(0, "ICCID").unwrap().to_string(), "8901260720040140822");

    let start = RowQuery::new().filter(Filter::start_with("ICCID", "890126").case_insensitive());
    assert_eq!(store.get_rows(&table, &start).await.unwrap().records_total, 1);

    let wildcard = RowQuery::new().filter(Filter::contains("ICCID", "%"));
    assert_eq!(store.get_rows(&table, &wildcard).await.unwrap().records_total, 0);
}

#[tokio::test]
async fn test_case_sensitivity_of_equals() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    let data = ImportData::new(
        vec!["PLAN".into()],
        vec![record(&[("PLAN", "Gold")]), record(&[("PLAN", "gold")])],
    );
    let table = import(&store, Uuid::new_v4(), "plans", data).await;

    let exact = RowQuery::new().filter(Filter::equals("PLAN", "GOLD"));
    assert_eq!(store.get_rows(&table, &exact).await.unwrap().records_total, 0);

    let folded = RowQuery::new().filter(Filter::equals("PLAN", "GOLD").case_insensitive());
    assert_eq!(store.get_rows(&table, &folded).await.unwrap().records_total, 2);
}

#[tokio::test]
async fn test_date_range_on_created_when() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    let table = import(&store, Uuid::new_v4(), "sims", sims(&[("8901", "7901")])).await;

    let today = Utc::now().date_naive();
    let tomorrow = today + Duration::days(1);

    let from_today = RowQuery::new().filter(Filter::date_from("CREATED_WHEN", today));
    assert_eq!(store.get_rows(&table, &from_today).await.unwrap().records_total, 1);

    let to_today = RowQuery::new().filter(Filter::date_to("CREATED_WHEN", today));
    assert_eq!(store.get_rows(&table, &to_today).await.unwrap().records_total, 1);

    let from_tomorrow = RowQuery::new().filter(Filter::date_from("CREATED_WHEN", tomorrow));
    assert_eq!(store.get_rows(&table, &from_tomorrow).await.unwrap().records_total, 0);
}

#[tokio::test]
async fn test_paging_and_order() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    let table = import(
        &store,
        Uuid::new_v4(),
        "sims",
        sims(&[("3", "a"), ("1", "b"), ("2", "c"), ("5", "d"), ("4", "e")]),
    )
    .await;

    let query = RowQuery::new().order(Order::desc("ICCID")).page(1, 2);
    let page = store.get_rows(&table, &query).await.unwrap();
    assert_eq!(page.records_total, 5);
    assert_eq!(page.rows.row_count(), 2);
    assert_eq!(page.rows.value(0, "ICCID").unwrap().to_string(), "4");
    assert_eq!(page.rows.value(1, "ICCID").unwrap().to_string(), "3");

    let projected = RowQuery::new().columns(vec!["MSISDN".into()]);
    let page = store.get_rows(&table, &projected).await.unwrap();
    assert_eq!(page.rows.columns, vec!["MSISDN".to_string()]);

    let values = store
        .distinct_values(&table, "ICCID", Scope::All, &[])
        .await
        .unwrap();
    let values: Vec<String> = values.iter().map(|v| v.to_string()).collect();
    assert_eq!(values, ["1", "2", "3", "4", "5"]);
}

#[tokio::test]
async fn test_occupy_partial_success_and_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    let table = import(
        &store,
        Uuid::new_v4(),
        "sims",
        sims(&[("8901", "7901"), ("8902", "7902"), ("8903", "7903")]),
    )
    .await;
    let ids = row_ids(&store.get_rows(&table, &RowQuery::new()).await.unwrap().rows);

    assert_eq!(store.occupy(&table, "alice", &ids[..1]).await.unwrap(), 1);

    // one of two rows is already leased
    assert_eq!(store.occupy(&table, "bob", &ids[..2]).await.unwrap(), 1);

    let err = store.occupy(&table, "carol", &ids[..2]).await.unwrap_err();
    assert!(matches!(err, TdmError::Conflict(_)));

    let occupied = store
        .get_rows(&table, &RowQuery::new().scope(Scope::Occupied))
        .await
        .unwrap();
    assert_eq!(occupied.records_total, 2);
    assert_eq!(occupied.rows.value(0, "OCCUPIED_BY").unwrap().to_string(), "alice");
    assert_eq!(occupied.rows.value(1, "OCCUPIED_BY").unwrap().to_string(), "bob");
    assert!(!occupied.rows.value(0, "OCCUPIED_DATE").unwrap().is_null());

    let available = store
        .get_rows(&table, &RowQuery::new().scope(Scope::Available))
        .await
        .unwrap();
    assert_eq!(available.records_total, 1);
}

#[tokio::test]
async fn test_release_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    let table = import(&store, Uuid::new_v4(), "sims", sims(&[("8901", "7901")])).await;
    let ids = row_ids(&store.get_rows(&table, &RowQuery::new()).await.unwrap().rows);

    store.occupy(&table, "alice", &ids).await.unwrap();
    store.release(&table, &ids).await.unwrap();
    store.release(&table, &ids).await.unwrap();

    let page = store.get_rows(&table, &RowQuery::new()).await.unwrap();
    assert!(page.rows.value(0, "OCCUPIED_BY").unwrap().is_null());
    assert!(page.rows.value(0, "OCCUPIED_DATE").unwrap().is_null());

    assert_eq!(store.occupy(&table, "bob", &ids).await.unwrap(), 1);
}

#[tokio::test]
async fn test_concurrent_first_matching_never_shares_a_row() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    let table = import(
        &store,
        Uuid::new_v4(),
        "sims",
        sims(&[("8901", "a"), ("8902", "b"), ("8903", "c"), ("8904", "d")]),
    )
    .await;

    let mut handles = Vec::new();
    for i in 0..6 {
        let store = store.clone();
        let table = table.clone();
        handles.push(tokio::spawn(async move {
            store
                .occupy_first_matching(&FindAndOccupyRequest {
                    table_name: table,
                    actor: format!("worker-{}", i),
                    filters: vec![Filter::start_with("ICCID", "890")],
                    order: None,
                    response_columns: vec!["ICCID".into()],
                })
                .await
        }));
    }

    let mut taken = Vec::new();
    let mut not_found = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(row) => taken.push(row["ICCID"].to_string()),
            Err(TdmError::NotFound(_)) => not_found += 1,
            Err(other) => panic!("unexpected error: {}", other),
        }
    }
    taken.sort();
    assert_eq!(taken, ["8901", "8902", "8903", "8904"]);
    assert_eq!(not_found, 2);
}

#[tokio::test]
async fn test_batch_items_fail_independently() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    let table = import(&store, Uuid::new_v4(), "sims", sims(&[("8901", "7901")])).await;
    let ids = row_ids(&store.get_rows(&table, &RowQuery::new()).await.unwrap().rows);

    let results = store
        .occupy_batch(vec![
            OccupyRequest {
                table_name: "t_missing".into(),
                actor: "alice".into(),
                row_ids: ids.clone(),
            },
            OccupyRequest {
                table_name: table.clone(),
                actor: "alice".into(),
                row_ids: ids.clone(),
            },
        ])
        .await;
    assert!(!results[0].is_ok());
    assert_eq!(results[1].result, Ok(1));

    let pages = store
        .get_rows_batch(vec![
            RowsRequest {
                table_name: table.clone(),
                query: RowQuery::new(),
            },
            RowsRequest {
                table_name: "t_missing".into(),
                query: RowQuery::new(),
            },
        ])
        .await;
    assert!(pages[0].is_ok());
    assert!(!pages[1].is_ok());
}

#[tokio::test]
async fn test_update_rows_adds_columns_and_protects_system_columns() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    let table = import(&store, Uuid::new_v4(), "sims", sims(&[("8901", "7901"), ("8902", "7902")])).await;

    let mut values = BTreeMap::new();
    values.insert("STATUS".to_string(), Value::from("blocked"));
    let updated = store
        .update_rows(&table, Scope::All, &[Filter::equals("ICCID", "8902")], &values)
        .await
        .unwrap();
    assert_eq!(updated, 1);

    let page = store.get_rows(&table, &RowQuery::new()).await.unwrap();
    assert!(page.rows.value(0, "STATUS").unwrap().is_null());
    assert_eq!(page.rows.value(1, "STATUS").unwrap().to_string(), "blocked");

    let mut forbidden = BTreeMap::new();
    forbidden.insert("OCCUPIED_BY".to_string(), Value::from("mallory"));
    let err = store
        .update_rows(&table, Scope::All, &[], &forbidden)
        .await
        .unwrap_err();
    assert!(matches!(err, TdmError::Validation(_)));
}

#[tokio::test]
async fn test_truncate_rename_and_delete() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    let project = Uuid::new_v4();
    let table = import(&store, project, "sims", sims(&[("8901", "7901"), ("8902", "7902")])).await;

    assert_eq!(store.truncate_table(&table).await.unwrap(), 2);
    assert_eq!(store.get_rows(&table, &RowQuery::new()).await.unwrap().records_total, 0);

    store.rename_table_title(&table, "retired sims").await.unwrap();
    assert_eq!(store.catalog_entry(&table).await.unwrap().table_title, "retired sims");

    store.delete_table(&table).await.unwrap();
    assert!(store.list_tables(Some(project)).await.unwrap().is_empty());
    let err = store.get_rows(&table, &RowQuery::new()).await.unwrap_err();
    assert!(matches!(err, TdmError::NotFound(_)));

    // the title is free again and maps to a new table
    let again = import(&store, project, "retired sims", sims(&[("8903", "7903")])).await;
    assert_ne!(again, table);
}

#[tokio::test]
async fn test_same_title_in_other_system_is_separate_table() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    let project = Uuid::new_v4();

    let first = import(&store, project, "sims", sims(&[("8901", "7901")])).await;
    let second = store
        .import_rows(ImportRequest {
            target: TableTarget::new(project, "sims").system(Uuid::new_v4()),
            data: sims(&[("8902", "7902")]),
        })
        .await
        .unwrap();

    assert_ne!(first, second.table_name);
    assert_eq!(second.schema_change, SchemaChange::Created);
    assert_eq!(store.list_tables(Some(project)).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_reopen_keeps_catalog() {
    let dir = tempfile::tempdir().unwrap();
    let project = Uuid::new_v4();
    let table = {
        let store = open_store(&dir).await;
        let table = import(&store, project, "sims", sims(&[("8901", "7901")])).await;
        store.shutdown().await.unwrap();
        table
    };

    let store = open_store(&dir).await;
    let page = store.get_rows(&table, &RowQuery::new()).await.unwrap();
    assert_eq!(page.records_total, 1);
}
