// ABOUTME: Change iterator tests against the in-memory recording store
// ABOUTME: Covers snapshot tokens, page bounds, embedded documents and failure states

mod common;

use common::*;
use mysql_datalayer::layer::token::{decode_token, encode_token};
use mysql_datalayer::store::{ColumnMeta, SqlValue};
use mysql_datalayer::{Datalayer, ErrorKind, Value};
use chrono::NaiveDate;
use std::sync::Arc;

fn layer(store: &RecordingStore, source: serde_json::Value) -> Datalayer {
    Datalayer::with_store(Arc::new(store.clone()), vec![product_definition(source)])
}

fn max_since() -> chrono::NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 7, 1)
        .unwrap()
        .and_hms_micro_opt(9, 15, 0, 120_000)
        .unwrap()
}

#[tokio::test]
async fn test_first_page_returns_rows_and_snapshot_token() {
    let store = RecordingStore::with_rows(
        product_columns(),
        vec![
            product_row(1, "Widget", "10.00"),
            product_row(2, "Gadget", "12.75"),
        ],
    );
    store.set_max_since(Some(SqlValue::DateTime(max_since())));
    let layer = layer(
        &store,
        serde_json::json!({"table_name": "product", "since_column": "updated"}),
    );

    let mut iter = layer.dataset("products").unwrap().changes("", 0, false).await.unwrap();

    let first = iter.next().await.unwrap().unwrap();
    assert_eq!(first.id, format!("{}1", BASE_URI));
    assert_eq!(
        first.properties.get(&format!("{}price", BASE_URI)),
        Some(&Value::Int(10))
    );
    let second = iter.next().await.unwrap().unwrap();
    assert_eq!(
        second.properties.get(&format!("{}price", BASE_URI)),
        Some(&Value::Float(12.75))
    );
    assert!(iter.next().await.unwrap().is_none());
    // exhausted stays exhausted
    assert!(iter.next().await.unwrap().is_none());

    let token = iter.token();
    assert_eq!(decode_token(&token.token).unwrap(), max_since());
    iter.close().await.unwrap();

    let queries = store.queries();
    assert_eq!(queries[0], "SELECT MAX(updated) AS _max_since FROM product");
    assert_eq!(
        queries[1],
        "SELECT id, name, price FROM product WHERE product.updated <= '2024-07-01 09:15:00.120000'"
    );
}

#[tokio::test]
async fn test_next_page_is_bounded_by_previous_token() {
    let mut columns = product_columns();
    columns.push(ColumnMeta::new("updated", "DATETIME"));
    let store = RecordingStore::with_rows(columns, vec![]);
    store.set_max_since(Some(SqlValue::text("2024-07-01 09:15:00.120000")));
    let layer = layer(
        &store,
        serde_json::json!({"table_name": "product", "since_column": "updated"}),
    );

    let previous = NaiveDate::from_ymd_opt(2024, 6, 30)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap();
    let mut iter = layer
        .dataset("products")
        .unwrap()
        .changes(&encode_token(&previous), 50, false)
        .await
        .unwrap();
    assert!(iter.next().await.unwrap().is_none());
    assert_eq!(decode_token(&iter.token().token).unwrap(), max_since());
    iter.close().await.unwrap();

    assert_eq!(
        store.queries()[1],
        "SELECT id, name, price, updated FROM product WHERE product.updated > '2024-06-30 00:00:00.000000' \
         AND product.updated <= '2024-07-01 09:15:00.120000' ORDER BY product.updated LIMIT 50"
    );
}

#[tokio::test]
async fn test_full_limited_page_resumes_after_last_row() {
    let mut columns = product_columns();
    columns.push(ColumnMeta::new("updated", "DATETIME"));
    let row = |id: i64, updated: &str| {
        let mut row = product_row(id, "item", "1");
        row.push(text(updated));
        row
    };
    let store = RecordingStore::with_rows(
        columns,
        vec![
            row(1, "2024-07-01 08:00:00.000001"),
            row(2, "2024-07-01 08:00:00.000002"),
        ],
    );
    store.set_max_since(Some(SqlValue::DateTime(max_since())));
    let layer = layer(
        &store,
        serde_json::json!({"table_name": "product", "since_column": "updated"}),
    );

    let mut iter = layer.dataset("products").unwrap().changes("", 2, false).await.unwrap();
    while iter.next().await.unwrap().is_some() {}
    let resumed = decode_token(&iter.token().token).unwrap();
    assert_eq!(resumed.to_string(), "2024-07-01 08:00:00.000002");
}

#[tokio::test]
async fn test_limited_read_with_coarse_since_precision_still_pages() {
    let mut columns = product_columns();
    columns.push(ColumnMeta::new("updated", "DATETIME"));
    let mut row = product_row(1, "item", "1");
    row.push(text("2024-07-01 08:00:00"));
    let store = RecordingStore::with_rows(columns, vec![row]);
    store.set_max_since(Some(SqlValue::DateTime(max_since())));
    let layer = layer(
        &store,
        serde_json::json!({"table_name": "product", "since_column": "updated", "since_precision": "0"}),
    );

    let mut iter = layer.dataset("products").unwrap().changes("", 1, false).await.unwrap();
    assert!(iter.next().await.unwrap().is_some());
    assert!(iter.next().await.unwrap().is_none());
    let resumed = decode_token(&iter.token().token).unwrap();
    assert_eq!(resumed.to_string(), "2024-07-01 08:00:00");
}

#[tokio::test]
async fn test_limited_data_query_must_project_since_column() {
    let store = RecordingStore::with_rows(
        product_columns(),
        vec![product_row(1, "Widget", "10"), product_row(2, "Gadget", "12")],
    );
    store.set_max_since(Some(SqlValue::DateTime(max_since())));
    let layer = layer(
        &store,
        serde_json::json!({
            "data_query": "SELECT p.id, p.name, p.price FROM product p JOIN changes c ON c.id = p.id",
            "since_table": "c",
            "since_column": "changed_at"
        }),
    );

    let err = layer
        .dataset("products")
        .unwrap()
        .changes("", 2, false)
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(err.to_string().contains("changed_at"));
    assert_eq!(store.log.lock().unwrap().cursors_closed, 1);

    // unlimited reads resume from the snapshot bound and need no projection
    let mut iter = layer.dataset("products").unwrap().changes("", 0, false).await.unwrap();
    assert!(iter.next().await.unwrap().is_some());
    iter.close().await.unwrap();
}

#[tokio::test]
async fn test_empty_since_table_keeps_caller_token() {
    let store = RecordingStore::with_rows(product_columns(), vec![]);
    store.set_max_since(Some(SqlValue::Null));
    let layer = layer(
        &store,
        serde_json::json!({"table_name": "product", "since_column": "updated"}),
    );

    let since = encode_token(&max_since());
    let iter = layer.dataset("products").unwrap().changes(&since, 0, false).await.unwrap();
    assert_eq!(iter.token().token, since);
    // no bound known, so no range predicate
    assert_eq!(store.queries()[1], "SELECT id, name, price FROM product");
}

#[tokio::test]
async fn test_probe_without_row_is_internal_error() {
    let store = RecordingStore::with_rows(product_columns(), vec![]);
    store.set_max_since(None);
    let layer = layer(
        &store,
        serde_json::json!({"table_name": "product", "since_column": "updated"}),
    );

    let err = layer
        .dataset("products")
        .unwrap()
        .changes("", 0, false)
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::Internal);
}

#[tokio::test]
async fn test_without_since_column_token_is_empty() {
    let store = RecordingStore::with_rows(product_columns(), vec![product_row(3, "Bolt", "1")]);
    let layer = layer(&store, serde_json::json!({"table_name": "product"}));

    let mut iter = layer.dataset("products").unwrap().entities("", 0).await.unwrap();
    assert!(iter.next().await.unwrap().is_some());
    assert!(iter.next().await.unwrap().is_none());
    assert_eq!(iter.token().token, "");
    assert_eq!(store.queries(), vec!["SELECT id, name, price FROM product".to_string()]);
}

#[tokio::test]
async fn test_latest_only_is_not_supported() {
    let store = RecordingStore::new();
    let layer = layer(&store, serde_json::json!({"table_name": "product"}));
    let err = layer
        .dataset("products")
        .unwrap()
        .changes("", 0, true)
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::NotSupported);
    assert!(store.queries().is_empty());
}

#[tokio::test]
async fn test_malformed_token_is_decode_error() {
    let store = RecordingStore::with_rows(product_columns(), vec![]);
    store.set_max_since(Some(SqlValue::DateTime(max_since())));
    let layer = layer(
        &store,
        serde_json::json!({"table_name": "product", "since_column": "updated"}),
    );
    let err = layer
        .dataset("products")
        .unwrap()
        .changes("not//a*token", 0, false)
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::Decode);
}

#[tokio::test]
async fn test_mapping_failure_aborts_iteration() {
    // second row has no identity value
    let store = RecordingStore::with_rows(
        product_columns(),
        vec![
            product_row(1, "Widget", "10"),
            vec![SqlValue::Null, text("Ghost"), text("0")],
            product_row(3, "Bolt", "1"),
        ],
    );
    let layer = layer(&store, serde_json::json!({"table_name": "product"}));

    let mut iter = layer.dataset("products").unwrap().changes("", 0, false).await.unwrap();
    assert!(iter.next().await.unwrap().is_some());
    let err = iter.next().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
    // no skipping past the bad row
    assert!(iter.next().await.is_err());
    iter.close().await.unwrap();
}

#[tokio::test]
async fn test_cursor_error_is_internal() {
    let store = RecordingStore::with_rows(product_columns(), vec![product_row(1, "Widget", "10")]);
    store.log.lock().unwrap().fail_row_at = Some(1);
    let layer = layer(&store, serde_json::json!({"table_name": "product"}));

    let mut iter = layer.dataset("products").unwrap().changes("", 0, false).await.unwrap();
    assert!(iter.next().await.unwrap().is_some());
    assert_eq!(iter.next().await.unwrap_err().kind(), ErrorKind::Internal);
}

#[tokio::test]
async fn test_undescribed_column_fails_before_first_row() {
    let store = RecordingStore::with_rows(
        vec![ColumnMeta::new("id", "INT"), ColumnMeta::new("shape", "")],
        vec![vec![SqlValue::Int(1), SqlValue::Null]],
    );
    let layer = layer(&store, serde_json::json!({"table_name": "product"}));

    let err = layer
        .dataset("products")
        .unwrap()
        .changes("", 0, false)
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert_eq!(store.log.lock().unwrap().cursors_closed, 1);
}

#[tokio::test]
async fn test_embedded_entity_column() {
    let document = r#"{"id": "http://data.example.io/product/9", "deleted": true, "recorded": 44,
                       "props": {"http://data.example.io/product/name": "Nut"},
                       "refs": {"http://data.example.io/product/maker": "http://data.example.io/maker/1"}}"#;
    let store = RecordingStore::with_rows(
        vec![ColumnMeta::new("id", "INT"), ColumnMeta::new("Entity", "JSON")],
        vec![vec![SqlValue::Int(9), text(document)]],
    );
    let mut definition = product_definition(serde_json::json!({
        "table_name": "product_docs",
        "entity_column": "entity"
    }));
    definition.outgoing_mapping_config = None;
    let layer = Datalayer::with_store(Arc::new(store.clone()), vec![definition]);

    let mut iter = layer.dataset("products").unwrap().changes("", 0, false).await.unwrap();
    let entity = iter.next().await.unwrap().unwrap();
    assert_eq!(entity.id, "http://data.example.io/product/9");
    assert!(entity.deleted);
    assert_eq!(entity.recorded, 44);
    assert_eq!(
        entity.references.get("http://data.example.io/product/maker").map(String::as_str),
        Some("http://data.example.io/maker/1")
    );
    assert!(iter.next().await.unwrap().is_none());
    assert_eq!(store.queries()[0], "SELECT * FROM product_docs");
}

#[tokio::test]
async fn test_embedded_entity_parse_failure() {
    let store = RecordingStore::with_rows(
        vec![ColumnMeta::new("entity", "JSON")],
        vec![vec![text("{broken")]],
    );
    let layer = layer(
        &store,
        serde_json::json!({"table_name": "product_docs", "entity_column": "entity"}),
    );

    let mut iter = layer.dataset("products").unwrap().changes("", 0, false).await.unwrap();
    assert_eq!(iter.next().await.unwrap_err().kind(), ErrorKind::Internal);
}

#[tokio::test]
async fn test_unknown_dataset() {
    let store = RecordingStore::new();
    let layer = layer(&store, serde_json::json!({"table_name": "product"}));
    assert_eq!(
        layer.dataset("people").err().unwrap().kind(),
        ErrorKind::Configuration
    );
    let names: Vec<String> = layer
        .dataset_descriptions()
        .into_iter()
        .map(|d| d.name)
        .collect();
    assert_eq!(names, vec!["products".to_string()]);
}
