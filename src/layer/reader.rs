// ABOUTME: Change iterator - probes the since-column snapshot bound and streams changed rows
// ABOUTME: Rows become entities through column mapping or by parsing an embedded entity document

use chrono::{NaiveDate, NaiveDateTime};

use super::decoder::{ColumnFamily, RowDecoder};
use super::query::{build_query, max_since_query};
use super::token::{decode_token, encode_token};
use crate::config::DatasetDefinition;
use crate::entity::{Continuation, Entity, EntityParser, Value};
use crate::error::{LayerError, Result};
use crate::mapping::Mapper;
use crate::store::{RowCursor, SqlValue, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IteratorState {
    Ready,
    Exhausted,
    Errored,
}

enum ReadMode {
    /// One column per property, mapped through the outgoing mapping
    Mapped(Mapper),
    /// One column holds a complete entity document
    Embedded { column: String, position: usize },
}

/// Lazily decoded sequence of changed entities for one page.
///
/// The sequence is not restartable: a later page is a new iterator opened
/// with the token this one reports.
pub struct ChangeIterator {
    dataset: String,
    cursor: Option<Box<dyn RowCursor>>,
    decoder: RowDecoder,
    mode: ReadMode,
    token: Option<String>,
    state: IteratorState,
    limit: usize,
    delivered: usize,
    /// Since column position when the page is limited and ordered
    since_position: Option<usize>,
    last_since: Option<NaiveDateTime>,
}

impl ChangeIterator {
    /// Compute the snapshot bound, start the change query and plan decoding.
    ///
    /// `since` is the token from a previous page, empty for the first page.
    /// `limit == 0` means unlimited.
    pub async fn open(
        store: &dyn Store,
        definition: &DatasetDefinition,
        since: &str,
        limit: usize,
    ) -> Result<Self> {
        let dataset = definition.name.clone();

        let (max_since, token) = match max_since_query(definition)? {
            Some(probe) => {
                tracing::debug!(dataset = %dataset, "max since query: {}", probe);
                let max_since = probe_max_since(store, &probe).await.map_err(|e| {
                    tracing::error!(dataset = %dataset, "Failed to get max since: {}", e);
                    e
                })?;
                let token = next_token(since, max_since.as_ref())?;
                (max_since, Some(token))
            }
            None => (None, None),
        };

        if limit > 0 && max_since.is_some() {
            if let Ok(precision) = definition.source_config.since_precision() {
                if precision < 6 {
                    tracing::warn!(
                        dataset = %dataset,
                        "Limited read with since precision {}: rows sharing a since value across a page boundary are skipped",
                        precision
                    );
                }
            }
        }

        let query = build_query(definition, since, max_since.as_ref(), limit)?;
        tracing::debug!(dataset = %dataset, "changes query: {}", query);

        let mut cursor = store.open_cursor(&query).await.map_err(|e| {
            tracing::error!(dataset = %dataset, "Failed to execute changes query: {}", e);
            e
        })?;

        let planned = RowDecoder::plan(cursor.columns()).and_then(|decoder| {
            let mode = match definition.source_config.entity_column() {
                Some(column) => {
                    let position = decoder.position(column).ok_or_else(|| {
                        LayerError::config(format!(
                            "entity column {} is not in the result of dataset {}",
                            column, dataset
                        ))
                    })?;
                    ReadMode::Embedded {
                        column: column.to_lowercase(),
                        position,
                    }
                }
                None => ReadMode::Mapped(Mapper::new(
                    definition.incoming_mapping_config.clone(),
                    definition.outgoing_mapping_config.clone(),
                )),
            };
            let since_column = definition.source_config.since_column();
            let since_position = match (max_since.as_ref(), since_column) {
                (Some(_), Some(column)) if limit > 0 => {
                    // a limited page resumes from its last row's since value
                    let position = decoder.position(column).ok_or_else(|| {
                        LayerError::config(format!(
                            "data_query must project {} for limited reads of dataset {}",
                            column, dataset
                        ))
                    })?;
                    Some(position)
                }
                _ => None,
            };
            Ok((decoder, mode, since_position))
        });

        let (decoder, mode, since_position) = match planned {
            Ok(planned) => planned,
            Err(e) => {
                tracing::error!(dataset = %dataset, "Failed to plan row decoding: {}", e);
                if let Err(close_err) = cursor.close().await {
                    tracing::warn!(dataset = %dataset, "Failed to close cursor: {}", close_err);
                }
                return Err(e);
            }
        };

        Ok(Self {
            dataset,
            cursor: Some(cursor),
            decoder,
            mode,
            token,
            state: IteratorState::Ready,
            limit,
            delivered: 0,
            since_position,
            last_since: None,
        })
    }

    /// Next entity, or `Ok(None)` at the end of the page.
    ///
    /// Any failure moves the iterator to a terminal error state; the page
    /// must be re-read with the previous token.
    pub async fn next(&mut self) -> Result<Option<Entity>> {
        match self.state {
            IteratorState::Exhausted => return Ok(None),
            IteratorState::Errored => {
                return Err(LayerError::internal(format!(
                    "change iterator for dataset {} has already failed",
                    self.dataset
                )))
            }
            IteratorState::Ready => {}
        }

        let cursor = match self.cursor.as_mut() {
            Some(cursor) => cursor,
            None => {
                self.state = IteratorState::Exhausted;
                return Ok(None);
            }
        };

        let row = match cursor.next_row().await {
            Ok(Some(row)) => row,
            Ok(None) => {
                self.state = IteratorState::Exhausted;
                return Ok(None);
            }
            Err(e) => {
                tracing::error!(dataset = %self.dataset, "Failed to read rows: {}", e);
                self.state = IteratorState::Errored;
                return Err(e);
            }
        };

        if let Some(position) = self.since_position {
            if let Some(Ok(Value::Timestamp(t))) = row
                .get(position)
                .map(|raw| ColumnFamily::DateTime.decode(raw.clone()))
            {
                self.last_since = Some(t.naive_utc());
            }
        }

        match self.materialize(row) {
            Ok(entity) => {
                self.delivered += 1;
                Ok(Some(entity))
            }
            Err(e) => {
                tracing::error!(dataset = %self.dataset, "Failed to decode row: {}", e);
                self.state = IteratorState::Errored;
                Err(e)
            }
        }
    }

    fn materialize(&self, row: Vec<SqlValue>) -> Result<Entity> {
        match &self.mode {
            ReadMode::Mapped(mapper) => {
                let item = self.decoder.decode_row(row)?;
                mapper.map_item_to_entity(&item).map_err(|e| {
                    LayerError::internal_with_source(
                        format!("failed to map row {:?}", item.columns()),
                        e,
                    )
                })
            }
            ReadMode::Embedded { column, position } => {
                let raw = row.into_iter().nth(*position).unwrap_or(SqlValue::Null);
                let family = self
                    .decoder
                    .families()
                    .get(*position)
                    .copied()
                    .unwrap_or(ColumnFamily::Text);
                let document = match family.decode(raw) {
                    Ok(Value::String(text)) => text,
                    Ok(Value::Null) => {
                        return Err(LayerError::internal(format!(
                            "entity column {} is null",
                            column
                        )))
                    }
                    Ok(other) => other.to_string(),
                    Err(msg) => {
                        return Err(LayerError::internal(format!(
                            "failed to scan entity column {}: {}",
                            column, msg
                        )))
                    }
                };
                parse_embedded_entity(&document)
            }
        }
    }

    /// Continuation for the next page; empty when the dataset has no since column.
    ///
    /// A full limited page resumes after its last row; anything else resumes
    /// after the snapshot bound.
    pub fn token(&self) -> Continuation {
        if self.limit > 0 && self.delivered >= self.limit {
            if let Some(last) = &self.last_since {
                return Continuation::new(encode_token(last));
            }
        }
        Continuation::new(self.token.clone().unwrap_or_default())
    }

    /// Release the cursor. Safe to call more than once.
    pub async fn close(&mut self) -> Result<()> {
        match self.cursor.take() {
            Some(mut cursor) => cursor.close().await,
            None => Ok(()),
        }
    }
}

/// Wrap a bare entity object in a document with an empty namespace context.
pub(crate) fn parse_embedded_entity(document: &str) -> Result<Entity> {
    let wrapped = format!(
        "[{{\"id\": \"@context\", \"namespaces\": {{}}}}, {}]",
        document
    );
    let parsed = EntityParser::new()
        .with_expand_uris()
        .parse_str(&wrapped)
        .map_err(|e| LayerError::internal_with_source("failed to parse entity", e))?;
    parsed
        .entities
        .into_iter()
        .next()
        .ok_or_else(|| LayerError::internal("failed to parse entity: no entity"))
}

async fn probe_max_since(store: &dyn Store, probe: &str) -> Result<Option<NaiveDateTime>> {
    let row = store
        .query_first(probe)
        .await?
        .ok_or_else(|| LayerError::internal("failed to get max since: no data"))?;

    match row.into_iter().next() {
        None | Some(SqlValue::Null) => Ok(None),
        Some(SqlValue::DateTime(dt)) => Ok(Some(dt)),
        Some(SqlValue::Bytes(b)) => {
            let text = String::from_utf8_lossy(&b);
            NaiveDateTime::parse_from_str(text.trim(), "%Y-%m-%d %H:%M:%S%.f")
                .map(Some)
                .map_err(|e| {
                    LayerError::internal_with_source(
                        format!(
                            "failed to scan max since '{}'; ensure the since column is a DATETIME or TIMESTAMP",
                            text
                        ),
                        e,
                    )
                })
        }
        Some(other) => Err(LayerError::internal(format!(
            "failed to scan max since {:?}; ensure the since column is a DATETIME or TIMESTAMP",
            other
        ))),
    }
}

/// Token for the page after this one. Never moves behind the caller's token.
fn next_token(since: &str, max_since: Option<&NaiveDateTime>) -> Result<String> {
    let lower = if since.is_empty() {
        None
    } else {
        Some(decode_token(since)?)
    };

    let bound = match (lower, max_since) {
        (Some(lower), Some(max)) => lower.max(*max),
        (Some(lower), None) => lower,
        (None, Some(max)) => *max,
        (None, None) => zero_instant(),
    };
    Ok(encode_token(&bound))
}

fn zero_instant() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or(NaiveDateTime::MIN)
}
