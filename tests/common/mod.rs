// ABOUTME: In-memory recording store shared by the integration tests
// ABOUTME: Scripted result sets for reads, a statement log and injectable failures for writes

#![allow(dead_code)]

use async_trait::async_trait;
use mysql_datalayer::config::{
    DatasetDefinition, EntityToItemPropertyMapping, IncomingMappingConfig,
    ItemToEntityPropertyMapping, OutgoingMappingConfig, SourceConfig,
};
use mysql_datalayer::error::{LayerError, Result};
use mysql_datalayer::store::{ColumnMeta, RowCursor, SqlValue, Store, StoreTransaction};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

pub const BASE_URI: &str = "http://data.example.io/product/";

#[derive(Debug, Default)]
pub struct StoreLog {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<Vec<SqlValue>>,
    /// First-row answer to `query_first`; `None` means no row at all
    pub max_since: Option<SqlValue>,
    /// Cursor fails instead of returning this row index
    pub fail_row_at: Option<usize>,
    /// `execute` fails for statements containing this text
    pub fail_statement: Option<String>,
    pub fail_rollback: bool,
    pub queries: Vec<String>,
    pub statements: Vec<String>,
    pub begun: usize,
    pub commits: usize,
    pub rollbacks: usize,
    pub cursors_closed: usize,
}

#[derive(Clone, Default)]
pub struct RecordingStore {
    pub log: Arc<Mutex<StoreLog>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(columns: Vec<ColumnMeta>, rows: Vec<Vec<SqlValue>>) -> Self {
        let store = Self::new();
        {
            let mut log = store.log.lock().unwrap();
            log.columns = columns;
            log.rows = rows;
        }
        store
    }

    pub fn set_max_since(&self, value: Option<SqlValue>) {
        self.log.lock().unwrap().max_since = value;
    }

    pub fn queries(&self) -> Vec<String> {
        self.log.lock().unwrap().queries.clone()
    }

    pub fn statements(&self) -> Vec<String> {
        self.log.lock().unwrap().statements.clone()
    }
}

#[async_trait]
impl Store for RecordingStore {
    async fn query_first(&self, sql: &str) -> Result<Option<Vec<SqlValue>>> {
        let mut log = self.log.lock().unwrap();
        log.queries.push(sql.to_string());
        Ok(log.max_since.clone().map(|v| vec![v]))
    }

    async fn open_cursor(&self, sql: &str) -> Result<Box<dyn RowCursor>> {
        let mut log = self.log.lock().unwrap();
        log.queries.push(sql.to_string());
        Ok(Box::new(MemoryCursor {
            columns: log.columns.clone(),
            rows: log.rows.clone().into_iter().collect(),
            served: 0,
            fail_row_at: log.fail_row_at,
            log: Arc::clone(&self.log),
        }))
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        self.log.lock().unwrap().begun += 1;
        Ok(Box::new(RecordingTransaction {
            log: Arc::clone(&self.log),
        }))
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

struct MemoryCursor {
    columns: Vec<ColumnMeta>,
    rows: VecDeque<Vec<SqlValue>>,
    served: usize,
    fail_row_at: Option<usize>,
    log: Arc<Mutex<StoreLog>>,
}

#[async_trait]
impl RowCursor for MemoryCursor {
    fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }

    async fn next_row(&mut self) -> Result<Option<Vec<SqlValue>>> {
        if self.fail_row_at == Some(self.served) {
            return Err(LayerError::internal("connection lost while reading rows"));
        }
        self.served += 1;
        Ok(self.rows.pop_front())
    }

    async fn close(&mut self) -> Result<()> {
        self.log.lock().unwrap().cursors_closed += 1;
        Ok(())
    }
}

struct RecordingTransaction {
    log: Arc<Mutex<StoreLog>>,
}

#[async_trait]
impl StoreTransaction for RecordingTransaction {
    async fn execute(&mut self, sql: &str) -> Result<u64> {
        let mut log = self.log.lock().unwrap();
        if let Some(needle) = &log.fail_statement {
            if sql.contains(needle.as_str()) {
                return Err(LayerError::internal(format!(
                    "Duplicate entry for statement containing {}",
                    needle
                )));
            }
        }
        log.statements.push(sql.to_string());
        Ok(1)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.log.lock().unwrap().commits += 1;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let mut log = self.log.lock().unwrap();
        log.rollbacks += 1;
        if log.fail_rollback {
            return Err(LayerError::internal("connection reset during rollback"));
        }
        Ok(())
    }
}

pub fn text(s: &str) -> SqlValue {
    SqlValue::text(s)
}

/// Product dataset: `id` identity, `name`, `price`, optional since column
pub fn product_definition(source: serde_json::Value) -> DatasetDefinition {
    DatasetDefinition {
        name: "products".into(),
        source_config: serde_json::from_value::<SourceConfig>(source).unwrap(),
        incoming_mapping_config: Some(IncomingMappingConfig {
            map_all: false,
            property_mappings: vec![
                EntityToItemPropertyMapping {
                    property: "id".into(),
                    is_identity: true,
                    uri_value_pattern: Some(format!("{}{{value}}", BASE_URI)),
                    ..Default::default()
                },
                EntityToItemPropertyMapping {
                    entity_property: "name".into(),
                    property: "name".into(),
                    ..Default::default()
                },
                EntityToItemPropertyMapping {
                    entity_property: "price".into(),
                    property: "price".into(),
                    ..Default::default()
                },
            ],
        }),
        outgoing_mapping_config: Some(OutgoingMappingConfig {
            base_uri: BASE_URI.into(),
            map_all: false,
            property_mappings: vec![
                ItemToEntityPropertyMapping {
                    property: "id".into(),
                    is_identity: true,
                    ..Default::default()
                },
                ItemToEntityPropertyMapping {
                    property: "name".into(),
                    entity_property: "name".into(),
                    ..Default::default()
                },
                ItemToEntityPropertyMapping {
                    property: "price".into(),
                    entity_property: "price".into(),
                    ..Default::default()
                },
            ],
        }),
    }
}

pub fn product_columns() -> Vec<ColumnMeta> {
    vec![
        ColumnMeta::new("ID", "INT"),
        ColumnMeta::new("Name", "VARCHAR"),
        ColumnMeta::new("Price", "DECIMAL"),
    ]
}

pub fn product_row(id: i64, name: &str, price: &str) -> Vec<SqlValue> {
    vec![SqlValue::Int(id), text(name), text(price)]
}
