// ABOUTME: Batch writer - stages entity mutations and flushes them as delete+insert blocks
// ABOUTME: Newest recorded version wins within a flush window; one transaction per writer

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};

use crate::config::DatasetDefinition;
use crate::entity::{Entity, Value};
use crate::error::{LayerError, Result};
use crate::mapping::{Mapper, RowItem};
use crate::store::{Store, StoreTransaction};
use crate::utils::{quote_literal, validate_mysql_identifier};

const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%z";
const TIMESTAMP_VALUE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Begun,
    Closed,
    Aborted,
}

/// Latest staged version of one identity in the current flush window
#[derive(Debug, Clone)]
struct PendingInsert {
    recorded: u64,
    statement: String,
}

/// Writes entities into one table through a single transaction.
///
/// Every identity touched in a flush window is deleted first, then the
/// surviving versions are inserted. In append mode nothing is deleted and
/// every version is inserted.
pub struct BatchWriter {
    dataset: String,
    mapper: Mapper,
    table: String,
    id_column: String,
    since_column: Option<String>,
    since_precision: u8,
    datatypes: HashMap<String, String>,
    flush_threshold: usize,
    append_mode: bool,
    tx: Option<Box<dyn StoreTransaction>>,
    state: WriterState,
    deletes: Vec<String>,
    deleted_ids: HashSet<String>,
    pending: Vec<PendingInsert>,
    pending_index: HashMap<String, usize>,
    batch_size: usize,
    flushes: usize,
    written: usize,
}

impl BatchWriter {
    /// Validate the dataset's write configuration and open the transaction.
    pub async fn begin(store: &dyn Store, definition: &DatasetDefinition) -> Result<Self> {
        let source = &definition.source_config;
        let table = source.table_name().ok_or_else(|| {
            LayerError::config(format!(
                "table name not found in source config for dataset {}",
                definition.name
            ))
        })?;
        validate_mysql_identifier(table)?;

        let incoming = definition.incoming_mapping_config.as_ref().ok_or_else(|| {
            LayerError::config(format!(
                "incoming mapping config is missing for dataset {}",
                definition.name
            ))
        })?;

        let id_column = incoming
            .property_mappings
            .iter()
            .find(|pm| pm.is_identity)
            .map(|pm| pm.property.to_lowercase())
            .unwrap_or_else(|| "id".to_string());
        validate_mysql_identifier(&id_column)?;

        let since_column = source.since_column().map(str::to_lowercase);
        if let Some(col) = &since_column {
            validate_mysql_identifier(col)?;
        }

        let datatypes = incoming
            .property_mappings
            .iter()
            .filter_map(|pm| {
                pm.datatype
                    .as_ref()
                    .map(|d| (pm.property.to_lowercase(), d.to_lowercase()))
            })
            .collect();

        let flush_threshold = source.flush_threshold()?;
        let since_precision = source.since_precision()?;

        let tx = store.begin().await.map_err(|e| {
            tracing::error!(dataset = %definition.name, "Failed to begin transaction: {}", e);
            e
        })?;
        tracing::debug!(dataset = %definition.name, "Transaction started");

        Ok(Self {
            dataset: definition.name.clone(),
            mapper: Mapper::new(
                definition.incoming_mapping_config.clone(),
                definition.outgoing_mapping_config.clone(),
            ),
            table: table.to_string(),
            id_column,
            since_column,
            since_precision,
            datatypes,
            flush_threshold,
            append_mode: source.append_mode(),
            tx: Some(tx),
            state: WriterState::Begun,
            deletes: Vec::new(),
            deleted_ids: HashSet::new(),
            pending: Vec::new(),
            pending_index: HashMap::new(),
            batch_size: 0,
            flushes: 0,
            written: 0,
        })
    }

    /// Stage one entity; flushes once the window reaches the threshold.
    pub async fn write(&mut self, entity: Entity) -> Result<()> {
        self.ensure_open()?;

        let item = self.mapper.map_entity_to_item(&entity).map_err(|e| {
            LayerError::internal_with_source(format!("failed to map entity {}", entity.id), e)
        })?;

        let id = match item.value(&self.id_column) {
            Some(value) if !value.is_null() => value.to_string(),
            _ => {
                return Err(LayerError::internal(format!(
                    "entity {} has no value for identity column {}",
                    entity.id, self.id_column
                )))
            }
        };

        // render first so a rejected value stages nothing
        let statement = if entity.deleted {
            None
        } else {
            Some(self.insert_statement(&item)?)
        };

        if !self.append_mode && self.deleted_ids.insert(id.clone()) {
            self.deletes.push(quote_literal(&id));
        }

        let recorded = entity.recorded;
        match statement {
            None => self.batch_size += 1,
            Some(statement) if self.append_mode => {
                self.pending.push(PendingInsert {
                    recorded,
                    statement,
                });
                self.batch_size += 1;
            }
            Some(statement) => match self.pending_index.get(&id).copied() {
                Some(index) if recorded >= self.pending[index].recorded => {
                    self.pending[index] = PendingInsert {
                        recorded,
                        statement,
                    };
                    self.batch_size += 1;
                }
                // older than the staged version
                Some(_) => {}
                None => {
                    self.pending_index.insert(id, self.pending.len());
                    self.pending.push(PendingInsert {
                        recorded,
                        statement,
                    });
                    self.batch_size += 1;
                }
            },
        }

        if self.batch_size >= self.flush_threshold {
            self.flush().await?;
        }
        Ok(())
    }

    /// Execute the staged deletes, then the staged inserts. No-op when nothing is staged.
    pub async fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.batch_size == 0 && self.deletes.is_empty() && self.pending.is_empty() {
            return Ok(());
        }

        if !self.deletes.is_empty() {
            let statement = format!(
                "BEGIN;\n\nDELETE FROM {} WHERE {} IN ({});\nCOMMIT;",
                self.table,
                self.id_column,
                self.deletes.join(", ")
            );
            tracing::debug!(dataset = %self.dataset, "{}", statement);
            self.execute(&statement).await?;
        }

        if !self.pending.is_empty() {
            let inserts = self
                .pending
                .iter()
                .map(|p| p.statement.as_str())
                .collect::<Vec<_>>()
                .join(";\n");
            let statement = format!("BEGIN;\n\n{};\nCOMMIT;", inserts);
            tracing::debug!(dataset = %self.dataset, "{}", statement);
            self.execute(&statement).await?;
        }

        self.flushes += 1;
        self.written += self.pending.len();
        tracing::debug!(
            dataset = %self.dataset,
            "Flushed {} deletes and {} inserts",
            self.deletes.len(),
            self.pending.len()
        );

        self.deletes.clear();
        self.deleted_ids.clear();
        self.pending.clear();
        self.pending_index.clear();
        self.batch_size = 0;
        Ok(())
    }

    /// Final flush, then commit. A failed flush is returned without committing.
    pub async fn close(&mut self) -> Result<()> {
        if self.state == WriterState::Closed {
            return Ok(());
        }
        self.flush().await?;

        let tx = self
            .tx
            .take()
            .ok_or_else(|| LayerError::internal("writer has no open transaction"))?;
        if let Err(e) = tx.commit().await {
            tracing::error!(dataset = %self.dataset, "Failed to commit transaction: {}", e);
            self.state = WriterState::Aborted;
            return Err(e);
        }
        self.state = WriterState::Closed;
        tracing::debug!(dataset = %self.dataset, "Transaction committed");
        tracing::info!(
            dataset = %self.dataset,
            "Wrote {} rows in {} flushes",
            self.written,
            self.flushes
        );
        Ok(())
    }

    /// Number of flushes that reached the store
    pub fn flush_count(&self) -> usize {
        self.flushes
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            WriterState::Begun => Ok(()),
            WriterState::Closed => Err(LayerError::internal(format!(
                "writer for dataset {} is already closed",
                self.dataset
            ))),
            WriterState::Aborted => Err(LayerError::internal(format!(
                "writer for dataset {} was rolled back after an earlier failure",
                self.dataset
            ))),
        }
    }

    async fn execute(&mut self, statement: &str) -> Result<()> {
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| LayerError::internal("writer has no open transaction"))?;
        let result = tx.execute(statement).await;
        match result {
            Ok(_) => Ok(()),
            Err(e) => Err(self.abort(e).await),
        }
    }

    /// Roll back after a failed statement, chaining any rollback failure.
    async fn abort(&mut self, err: LayerError) -> LayerError {
        self.state = WriterState::Aborted;
        let tx = match self.tx.take() {
            Some(tx) => tx,
            None => return err,
        };
        match tx.rollback().await {
            Ok(()) => {
                tracing::debug!(dataset = %self.dataset, "Transaction rolled back");
                err
            }
            Err(rollback) => {
                tracing::error!(dataset = %self.dataset, "Failed to rollback transaction: {}", rollback);
                err.with_rollback_failure(rollback)
            }
        }
    }

    fn insert_statement(&self, item: &RowItem) -> Result<String> {
        let mut columns = Vec::with_capacity(item.columns().len() + 1);
        let mut values = Vec::with_capacity(item.columns().len() + 1);

        for (column, value) in item.iter() {
            if self.since_column.as_deref() == Some(column) {
                continue;
            }
            validate_mysql_identifier(column)?;
            columns.push(column.to_string());
            values.push(sql_literal(
                value,
                self.datatypes.get(column).map(String::as_str),
            )?);
        }

        if let Some(since) = &self.since_column {
            columns.push(since.clone());
            values.push(format!("NOW({})", self.since_precision));
        }

        Ok(format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table,
            columns.join(", "),
            values.join(", ")
        ))
    }
}

/// Render a value as a MySQL literal.
///
/// Columns declared `datetime` or `timestamp` take RFC 3339 input and are
/// rewritten to `YYYY-MM-DD HH:MM:SS`, with a `+hhmm` offset for `timestamp`.
pub fn sql_literal(value: &Value, datatype: Option<&str>) -> Result<String> {
    let format = match datatype {
        Some("datetime") => Some(DATETIME_FORMAT),
        Some("timestamp") => Some(TIMESTAMP_FORMAT),
        _ => None,
    };

    match (value, format) {
        (Value::Null, _) => Ok("NULL".to_string()),
        (Value::String(s), Some(format)) => {
            let parsed = DateTime::parse_from_rfc3339(s.trim()).map_err(|e| {
                LayerError::internal_with_source(format!("cannot parse '{}' as RFC 3339", s), e)
            })?;
            Ok(format!("'{}'", parsed.format(format)))
        }
        (Value::Timestamp(t), Some(format)) => Ok(format!("'{}'", t.format(format))),
        (Value::String(s), None) => Ok(quote_literal(s)),
        (Value::Bool(b), _) => Ok(format!("'{}'", b)),
        (Value::Int(i), _) => Ok(i.to_string()),
        (Value::Float(f), _) if f.is_finite() => Ok(f.to_string()),
        (Value::Float(f), _) => Err(LayerError::internal(format!(
            "cannot write non-finite number {}",
            f
        ))),
        (Value::Timestamp(t), None) => Ok(format!("'{}'", render_timestamp(t))),
    }
}

fn render_timestamp(t: &DateTime<Utc>) -> String {
    t.format(TIMESTAMP_VALUE_FORMAT).to_string()
}
