// ABOUTME: Row decoder: plans one nullable scan target per result column
// ABOUTME: Converts raw driver cells into entity values by column type family

use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};

use crate::entity::Value;
use crate::error::{LayerError, Result};
use crate::mapping::RowItem;
use crate::store::{ColumnMeta, SqlValue};

/// Scan target families, keyed by normalized database type name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnFamily {
    Boolean,
    Integer,
    /// Floating point and decimal; whole numbers collapse to integers
    Float,
    DateTime,
    /// Raw document text, parsed by the embedded-document path
    Json,
    Text,
}

impl ColumnFamily {
    /// Pick the family for a column. An empty type name means the driver
    /// could not describe the column, which fails the whole query.
    pub fn for_column(column: &ColumnMeta) -> Result<Self> {
        let normalized = column.type_name.trim().to_uppercase();
        let base = normalized
            .split(|c: char| c == '(' || c.is_whitespace())
            .next()
            .unwrap_or_default();

        let family = match base {
            "" => {
                return Err(LayerError::internal(format!(
                    "no scan type for column {}",
                    column.name
                )))
            }
            "BOOLEAN" | "BOOL" | "BIT" => ColumnFamily::Boolean,
            "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "INTEGER" | "BIGINT" | "YEAR" => {
                ColumnFamily::Integer
            }
            "DECIMAL" | "NUMERIC" | "FLOAT" | "DOUBLE" | "REAL" => ColumnFamily::Float,
            "DATE" | "DATETIME" | "TIMESTAMP" => ColumnFamily::DateTime,
            "JSON" | "JSONB" => ColumnFamily::Json,
            _ => ColumnFamily::Text,
        };
        Ok(family)
    }

    pub fn decode(self, value: SqlValue) -> std::result::Result<Value, String> {
        if value == SqlValue::Null {
            return Ok(Value::Null);
        }
        match self {
            ColumnFamily::Boolean => decode_bool(value),
            ColumnFamily::Integer => decode_int(value),
            ColumnFamily::Float => decode_float(value),
            ColumnFamily::DateTime => decode_datetime(value),
            ColumnFamily::Json | ColumnFamily::Text => Ok(Value::String(text_of(value))),
        }
    }
}

/// Column plan for one result set
#[derive(Debug, Clone)]
pub struct RowDecoder {
    names: Vec<String>,
    families: Vec<ColumnFamily>,
}

impl RowDecoder {
    pub fn plan(columns: &[ColumnMeta]) -> Result<Self> {
        let families = columns
            .iter()
            .map(ColumnFamily::for_column)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            names: columns.iter().map(|c| c.name.to_lowercase()).collect(),
            families,
        })
    }

    pub fn families(&self) -> &[ColumnFamily] {
        &self.families
    }

    pub fn position(&self, column: &str) -> Option<usize> {
        let column = column.to_lowercase();
        self.names.iter().position(|n| *n == column)
    }

    pub fn decode_row(&self, row: Vec<SqlValue>) -> Result<RowItem> {
        if row.len() != self.names.len() {
            return Err(LayerError::internal(format!(
                "row has {} values but the result set has {} columns",
                row.len(),
                self.names.len()
            )));
        }

        let mut item = RowItem::new();
        for ((name, family), raw) in self.names.iter().zip(&self.families).zip(row) {
            let value = family.decode(raw).map_err(|msg| {
                LayerError::internal(format!("failed to scan column {}: {}", name, msg))
            })?;
            item.set_value(name, value);
        }
        Ok(item)
    }
}

fn text_of(value: SqlValue) -> String {
    match value {
        SqlValue::Null => String::new(),
        SqlValue::Bytes(b) => match String::from_utf8(b) {
            Ok(s) => s,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        },
        SqlValue::Int(i) => i.to_string(),
        SqlValue::UInt(u) => u.to_string(),
        SqlValue::Float(f) => f.to_string(),
        SqlValue::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
    }
}

fn decode_bool(value: SqlValue) -> std::result::Result<Value, String> {
    match value {
        SqlValue::Int(i) => Ok(Value::Bool(i != 0)),
        SqlValue::UInt(u) => Ok(Value::Bool(u != 0)),
        // BIT(1) arrives as a single raw byte
        SqlValue::Bytes(ref b) if b.len() == 1 && b[0] <= 1 => Ok(Value::Bool(b[0] == 1)),
        other => {
            let text = text_of(other);
            let trimmed = text.trim();
            // TINYINT(1) holds any value in -128..=127
            if let Ok(i) = trimmed.parse::<i64>() {
                return Ok(Value::Bool(i != 0));
            }
            match trimmed.to_lowercase().as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(format!("'{}' is not a boolean", text)),
            }
        }
    }
}

fn decode_int(value: SqlValue) -> std::result::Result<Value, String> {
    match value {
        SqlValue::Int(i) => Ok(Value::Int(i)),
        SqlValue::UInt(u) => i64::try_from(u)
            .map(Value::Int)
            .map_err(|_| format!("{} overflows a 64-bit integer", u)),
        SqlValue::Float(f) => collapse_float(f),
        other => {
            let text = text_of(other);
            text.trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|e| format!("'{}' is not an integer: {}", text, e))
        }
    }
}

fn decode_float(value: SqlValue) -> std::result::Result<Value, String> {
    match value {
        SqlValue::Int(i) => Ok(Value::Int(i)),
        SqlValue::UInt(u) => collapse_float(u as f64),
        SqlValue::Float(f) => collapse_float(f),
        other => {
            let text = text_of(other);
            let f = text
                .trim()
                .parse::<f64>()
                .map_err(|e| format!("'{}' is not a number: {}", text, e))?;
            collapse_float(f)
        }
    }
}

/// Whole-number floats and decimals become integers.
fn collapse_float(f: f64) -> std::result::Result<Value, String> {
    if f.is_finite() && f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        Ok(Value::Int(f as i64))
    } else {
        Ok(Value::Float(f))
    }
}

fn decode_datetime(value: SqlValue) -> std::result::Result<Value, String> {
    let naive = match value {
        SqlValue::DateTime(dt) => dt,
        other => {
            let text = text_of(other);
            let text = text.trim();
            // MySQL zero dates have no instant
            if text.starts_with("0000-00-00") {
                return Ok(Value::Null);
            }
            match NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f") {
                Ok(dt) => dt,
                Err(_) => NaiveDate::parse_from_str(text, "%Y-%m-%d")
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .ok_or_else(|| format!("'{}' is not a date or datetime", text))?,
            }
        }
    };
    Ok(Value::Timestamp(Utc.from_utc_datetime(&naive)))
}
