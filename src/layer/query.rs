// ABOUTME: Builds the bounded change query and the MAX(since) snapshot probe
// ABOUTME: Configured names are validated before they are spliced into SQL

use chrono::NaiveDateTime;

use super::token::{decode_token, since_literal};
use crate::config::DatasetDefinition;
use crate::error::{LayerError, Result};
use crate::utils::validate_mysql_identifier;

/// Column list for the generated `SELECT`; `extra` is appended to an
/// explicit list when missing from it.
fn select_columns(definition: &DatasetDefinition, extra: Option<&str>) -> Result<String> {
    let entity_column = definition.source_config.entity_column();
    let outgoing = match &definition.outgoing_mapping_config {
        Some(outgoing) => outgoing,
        None if entity_column.is_some() => return Ok("*".to_string()),
        None => return Err(LayerError::config("outgoing mapping config is missing")),
    };

    if outgoing.map_all || entity_column.is_some() {
        return Ok("*".to_string());
    }

    if outgoing.property_mappings.is_empty() {
        return Err(LayerError::config(format!(
            "dataset {} maps specific columns but declares none",
            definition.name
        )));
    }

    let mut columns = Vec::with_capacity(outgoing.property_mappings.len());
    for pm in &outgoing.property_mappings {
        validate_mysql_identifier(&pm.property)?;
        columns.push(pm.property.as_str());
    }
    if let Some(extra) = extra {
        if !columns.iter().any(|c| c.eq_ignore_ascii_case(extra)) {
            columns.push(extra);
        }
    }
    Ok(columns.join(", "))
}

/// Table the snapshot probe and the range predicate refer to.
fn since_qualifier(definition: &DatasetDefinition) -> Option<&str> {
    let source = &definition.source_config;
    source.since_table().or_else(|| source.table_name())
}

/// Query returning `MAX(since_column)`, or `None` when no since column is set.
pub fn max_since_query(definition: &DatasetDefinition) -> Result<Option<String>> {
    let since_column = match definition.source_config.since_column() {
        Some(col) => col,
        None => return Ok(None),
    };
    validate_mysql_identifier(since_column)?;

    let table = since_qualifier(definition).ok_or_else(|| {
        LayerError::config(format!(
            "dataset {} has a since column but no table_name or since_table",
            definition.name
        ))
    })?;
    validate_mysql_identifier(table)?;

    Ok(Some(format!(
        "SELECT MAX({}) AS _max_since FROM {}",
        since_column, table
    )))
}

/// Build the change query for one page.
///
/// `since` is the caller's continuation token (empty on the first page).
/// The range predicate is only applied when `max_since` is known; without a
/// since column the whole table is returned on every call. A limited page
/// with a range predicate is ordered by the since column and projects it,
/// so the iterator can resume after the last row it delivered.
pub fn build_query(
    definition: &DatasetDefinition,
    since: &str,
    max_since: Option<&NaiveDateTime>,
    limit: usize,
) -> Result<String> {
    let source = &definition.source_config;

    let range = match (max_since, source.since_column()) {
        (Some(max_since), Some(since_column)) => {
            validate_mysql_identifier(since_column)?;
            let column = match since_qualifier(definition) {
                Some(table) => {
                    validate_mysql_identifier(table)?;
                    format!("{}.{}", table, since_column)
                }
                None => since_column.to_string(),
            };
            Some((column, max_since))
        }
        _ => None,
    };
    let paged = limit > 0 && range.is_some();

    let extra = if paged { source.since_column() } else { None };
    let columns = select_columns(definition, extra)?;

    let mut query = match (source.data_query(), source.table_name()) {
        (Some(data_query), _) => data_query.trim().trim_end_matches(';').to_string(),
        (None, Some(table)) => {
            validate_mysql_identifier(table)?;
            format!("SELECT {} FROM {}", columns, table)
        }
        (None, None) => {
            return Err(LayerError::config(format!(
                "dataset {} needs a table_name or a data_query",
                definition.name
            )))
        }
    };

    if let Some((column, max_since)) = &range {
        let connective = if query.to_uppercase().contains("WHERE") {
            "AND"
        } else {
            "WHERE"
        };

        if since.is_empty() {
            query.push_str(&format!(
                " {} {} <= {}",
                connective,
                column,
                since_literal(max_since)
            ));
        } else {
            let lower = decode_token(since)?;
            query.push_str(&format!(
                " {} {} > {} AND {} <= {}",
                connective,
                column,
                since_literal(&lower),
                column,
                since_literal(max_since)
            ));
        }

        if paged {
            query.push_str(&format!(" ORDER BY {}", column));
        }
    }

    if limit > 0 {
        query.push_str(&format!(" LIMIT {}", limit));
    }

    Ok(query)
}
