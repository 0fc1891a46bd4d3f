// ABOUTME: Row items and the mapper between table rows and entities
// ABOUTME: Outgoing config maps rows to entities, incoming config maps entities to rows

use std::collections::{HashMap, HashSet};

use crate::config::{IncomingMappingConfig, ItemToEntityPropertyMapping, OutgoingMappingConfig};
use crate::entity::{local_name, Entity, Value};
use crate::error::{LayerError, Result};

const VALUE_PLACEHOLDER: &str = "{value}";

/// One table row keyed by lower-cased column name, in column order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowItem {
    columns: Vec<String>,
    values: HashMap<String, Value>,
}

impl RowItem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_value(&mut self, column: &str, value: Value) {
        let column = column.to_lowercase();
        if !self.values.contains_key(&column) {
            self.columns.push(column.clone());
        }
        self.values.insert(column, value);
    }

    pub fn value(&self, column: &str) -> Option<&Value> {
        self.values.get(&column.to_lowercase())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Columns paired with their values, in column order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .iter()
            .filter_map(|c| self.values.get(c).map(|v| (c.as_str(), v)))
    }
}

/// Maps rows to entities and back using the dataset's mapping configs
#[derive(Debug, Clone, Default)]
pub struct Mapper {
    incoming: Option<IncomingMappingConfig>,
    outgoing: Option<OutgoingMappingConfig>,
}

impl Mapper {
    pub fn new(
        incoming: Option<IncomingMappingConfig>,
        outgoing: Option<OutgoingMappingConfig>,
    ) -> Self {
        Self { incoming, outgoing }
    }

    pub fn map_item_to_entity(&self, item: &RowItem) -> Result<Entity> {
        let cfg = self
            .outgoing
            .as_ref()
            .ok_or_else(|| LayerError::config("outgoing mapping config is missing"))?;

        let mut entity = Entity::default();
        let mut mapped: HashSet<String> = HashSet::new();

        for pm in &cfg.property_mappings {
            let column = pm.property.to_lowercase();
            let value = item.value(&column).cloned().unwrap_or(Value::Null);
            mapped.insert(column);

            if pm.is_identity {
                if !value.is_null() {
                    entity.id = make_uri(pm.uri_value_pattern.as_deref(), &cfg.base_uri, &value);
                }
            } else if pm.is_reference {
                if !value.is_null() {
                    let target = make_uri(pm.uri_value_pattern.as_deref(), &cfg.base_uri, &value);
                    entity
                        .references
                        .insert(entity_property_name(pm, &cfg.base_uri), target);
                }
            } else if pm.is_deleted {
                entity.deleted = is_truthy(&value);
            } else {
                entity
                    .properties
                    .insert(entity_property_name(pm, &cfg.base_uri), value);
            }
        }

        if cfg.map_all {
            for (column, value) in item.iter() {
                if !mapped.contains(column) {
                    entity
                        .properties
                        .insert(format!("{}{}", cfg.base_uri, column), value.clone());
                }
            }
        }

        if entity.id.is_empty() {
            return Err(LayerError::internal(
                "row has no identity value; configure an identity property mapping",
            ));
        }

        Ok(entity)
    }

    pub fn map_entity_to_item(&self, entity: &Entity) -> Result<RowItem> {
        let cfg = self
            .incoming
            .as_ref()
            .ok_or_else(|| LayerError::config("incoming mapping config is missing"))?;

        let mut item = RowItem::new();
        let mut used: HashSet<&str> = HashSet::new();

        if !cfg.property_mappings.iter().any(|pm| pm.is_identity) {
            item.set_value("id", Value::String(entity.id.clone()));
        }

        for pm in &cfg.property_mappings {
            if pm.is_identity {
                let id = strip_uri(pm.uri_value_pattern.as_deref(), &entity.id);
                item.set_value(&pm.property, Value::String(id));
                continue;
            }

            let wanted = if pm.entity_property.is_empty() {
                pm.property.as_str()
            } else {
                pm.entity_property.as_str()
            };

            if pm.is_reference {
                let value = match lookup(&entity.references, wanted) {
                    Some((key, target)) => {
                        used.insert(key);
                        Value::String(strip_uri(pm.uri_value_pattern.as_deref(), target))
                    }
                    None => default_value(pm.default_value.as_ref()),
                };
                item.set_value(&pm.property, value);
                continue;
            }

            let value = match lookup(&entity.properties, wanted) {
                Some((key, value)) => {
                    used.insert(key);
                    value.clone()
                }
                None => default_value(pm.default_value.as_ref()),
            };
            let value = convert_datatype(value, pm.datatype.as_deref()).map_err(|msg| {
                LayerError::internal(format!(
                    "failed to map property {} of entity {}: {}",
                    pm.property, entity.id, msg
                ))
            })?;
            item.set_value(&pm.property, value);
        }

        if cfg.map_all {
            for (name, value) in &entity.properties {
                if !used.contains(name.as_str()) {
                    let column = local_name(name);
                    if item.value(column).is_none() {
                        item.set_value(column, value.clone());
                    }
                }
            }
        }

        Ok(item)
    }
}

fn entity_property_name(pm: &ItemToEntityPropertyMapping, base_uri: &str) -> String {
    let name = if pm.entity_property.is_empty() {
        pm.property.to_lowercase()
    } else {
        pm.entity_property.clone()
    };
    if name.contains("://") {
        name
    } else {
        format!("{}{}", base_uri, name)
    }
}

fn make_uri(pattern: Option<&str>, base_uri: &str, value: &Value) -> String {
    let value = value.to_string();
    match pattern {
        Some(p) if p.contains(VALUE_PLACEHOLDER) => p.replace(VALUE_PLACEHOLDER, &value),
        _ if value.contains("://") || base_uri.is_empty() => value,
        _ => format!("{}{}", base_uri, value),
    }
}

/// Inverse of `make_uri` for a `{value}` pattern; other inputs pass through.
fn strip_uri(pattern: Option<&str>, uri: &str) -> String {
    if let Some((prefix, suffix)) = pattern.and_then(|p| p.split_once(VALUE_PLACEHOLDER)) {
        if uri.len() >= prefix.len() + suffix.len() && uri.starts_with(prefix) && uri.ends_with(suffix)
        {
            return uri[prefix.len()..uri.len() - suffix.len()].to_string();
        }
    }
    uri.to_string()
}

/// Find by full name first, then by local name.
fn lookup<'a, V>(
    map: &'a std::collections::BTreeMap<String, V>,
    wanted: &str,
) -> Option<(&'a str, &'a V)> {
    if let Some((k, v)) = map.get_key_value(wanted) {
        return Some((k.as_str(), v));
    }
    let wanted_local = local_name(wanted);
    map.iter()
        .find(|(k, _)| local_name(k) == wanted_local)
        .map(|(k, v)| (k.as_str(), v))
}

fn default_value(default: Option<&serde_json::Value>) -> Value {
    default.map(Value::from_json).unwrap_or(Value::Null)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Int(i) => *i != 0,
        Value::String(s) => s.eq_ignore_ascii_case("true") || s == "1",
        _ => false,
    }
}

fn convert_datatype(value: Value, datatype: Option<&str>) -> std::result::Result<Value, String> {
    let datatype = match datatype {
        Some(d) => d.to_lowercase(),
        None => return Ok(value),
    };
    if value.is_null() {
        return Ok(value);
    }
    match datatype.as_str() {
        "int" | "integer" | "long" => match value {
            Value::Int(_) => Ok(value),
            Value::Float(f) if f.fract() == 0.0 => Ok(Value::Int(f as i64)),
            Value::String(ref s) => s
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| format!("'{}' is not an integer", s)),
            Value::Bool(b) => Ok(Value::Int(b as i64)),
            other => Err(format!("cannot convert {} to integer", other)),
        },
        "float" | "double" | "decimal" => match value {
            Value::Float(_) => Ok(value),
            Value::Int(i) => Ok(Value::Float(i as f64)),
            Value::String(ref s) => s
                .trim()
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| format!("'{}' is not a number", s)),
            other => Err(format!("cannot convert {} to float", other)),
        },
        "bool" | "boolean" => match value {
            Value::Bool(_) => Ok(value),
            other => Ok(Value::Bool(is_truthy(&other))),
        },
        "string" => match value {
            Value::String(_) => Ok(value),
            other => Ok(Value::String(other.to_string())),
        },
        // datetime/timestamp stay as-is; the writer renders them as literals
        _ => Ok(value),
    }
}
