// ABOUTME: Entity document codec (JSON array with @context, entities and @continuation)
// ABOUTME: Parses with optional namespace-prefix expansion and renders documents back out

use std::collections::BTreeMap;
use std::io::Read;

use super::{Continuation, Entity, Value};
use crate::error::{LayerError, Result};

const CONTEXT_ID: &str = "@context";
const CONTINUATION_ID: &str = "@continuation";

/// Result of parsing one entity document
#[derive(Debug, Clone, Default)]
pub struct ParsedDocument {
    pub namespaces: BTreeMap<String, String>,
    pub entities: Vec<Entity>,
    pub continuation: Option<Continuation>,
}

/// Parser for entity documents.
///
/// The document is a JSON array whose first element is the namespace
/// context. With URI expansion on, `prefix:local` identifiers, property
/// names and reference names/targets are rewritten to full URIs using the
/// context's namespaces.
#[derive(Debug, Clone, Default)]
pub struct EntityParser {
    namespaces: BTreeMap<String, String>,
    expand_uris: bool,
}

impl EntityParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_namespaces(mut self, namespaces: BTreeMap<String, String>) -> Self {
        self.namespaces = namespaces;
        self
    }

    pub fn with_expand_uris(mut self) -> Self {
        self.expand_uris = true;
        self
    }

    pub fn parse_reader<R: Read>(&self, reader: R) -> Result<ParsedDocument> {
        let doc: serde_json::Value = serde_json::from_reader(reader)
            .map_err(|e| LayerError::internal_with_source("failed to read entity document", e))?;
        self.parse_value(doc)
    }

    pub fn parse_str(&self, data: &str) -> Result<ParsedDocument> {
        let doc: serde_json::Value = serde_json::from_str(data)
            .map_err(|e| LayerError::internal_with_source("failed to read entity document", e))?;
        self.parse_value(doc)
    }

    fn parse_value(&self, doc: serde_json::Value) -> Result<ParsedDocument> {
        let items = match doc {
            serde_json::Value::Array(items) => items,
            _ => {
                return Err(LayerError::internal(
                    "entity document must be a JSON array",
                ))
            }
        };

        let mut parsed = ParsedDocument {
            namespaces: self.namespaces.clone(),
            ..Default::default()
        };

        for (idx, item) in items.into_iter().enumerate() {
            let obj = match item {
                serde_json::Value::Object(obj) => obj,
                _ => {
                    return Err(LayerError::internal(format!(
                        "document element {} is not an object",
                        idx
                    )))
                }
            };
            let id = obj
                .get("id")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    LayerError::internal(format!("document element {} has no string id", idx))
                })?
                .to_string();

            match id.as_str() {
                CONTEXT_ID => {
                    if let Some(serde_json::Value::Object(ns)) = obj.get("namespaces") {
                        for (prefix, uri) in ns {
                            if let Some(uri) = uri.as_str() {
                                parsed.namespaces.insert(prefix.clone(), uri.to_string());
                            }
                        }
                    }
                }
                CONTINUATION_ID => {
                    let token = obj.get("token").and_then(|v| v.as_str()).unwrap_or("");
                    parsed.continuation = Some(Continuation::new(token));
                }
                _ => {
                    let entity = self.parse_entity(&parsed.namespaces, id, &obj)?;
                    parsed.entities.push(entity);
                }
            }
        }

        Ok(parsed)
    }

    fn parse_entity(
        &self,
        namespaces: &BTreeMap<String, String>,
        id: String,
        obj: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Entity> {
        let mut entity = Entity::new(self.expand(namespaces, &id));
        entity.deleted = obj.get("deleted").and_then(|v| v.as_bool()).unwrap_or(false);
        entity.recorded = obj.get("recorded").and_then(|v| v.as_u64()).unwrap_or(0);

        if let Some(props) = obj.get("props") {
            let props = props.as_object().ok_or_else(|| {
                LayerError::internal(format!("props of entity {} is not an object", id))
            })?;
            for (name, value) in props {
                entity
                    .properties
                    .insert(self.expand(namespaces, name), Value::from_json(value));
            }
        }

        if let Some(refs) = obj.get("refs") {
            let refs = refs.as_object().ok_or_else(|| {
                LayerError::internal(format!("refs of entity {} is not an object", id))
            })?;
            for (name, target) in refs {
                let target = target.as_str().ok_or_else(|| {
                    LayerError::internal(format!(
                        "reference {} of entity {} must be a single string",
                        name, id
                    ))
                })?;
                entity.references.insert(
                    self.expand(namespaces, name),
                    self.expand(namespaces, target),
                );
            }
        }

        Ok(entity)
    }

    fn expand(&self, namespaces: &BTreeMap<String, String>, name: &str) -> String {
        if !self.expand_uris {
            return name.to_string();
        }
        if let Some((prefix, local)) = name.split_once(':') {
            if let Some(base) = namespaces.get(prefix) {
                return format!("{}{}", base, local);
            }
        }
        name.to_string()
    }
}

/// Render entities as a document array: context first, continuation last.
pub fn write_document(
    namespaces: &BTreeMap<String, String>,
    entities: &[Entity],
    continuation: Option<&Continuation>,
) -> serde_json::Value {
    let mut items = Vec::with_capacity(entities.len() + 2);
    items.push(serde_json::json!({
        "id": CONTEXT_ID,
        "namespaces": namespaces,
    }));

    for entity in entities {
        items.push(entity_to_json(entity));
    }

    if let Some(cont) = continuation {
        items.push(serde_json::json!({
            "id": CONTINUATION_ID,
            "token": cont.token,
        }));
    }

    serde_json::Value::Array(items)
}

pub fn entity_to_json(entity: &Entity) -> serde_json::Value {
    let props: serde_json::Map<String, serde_json::Value> = entity
        .properties
        .iter()
        .map(|(k, v)| (k.clone(), v.to_json()))
        .collect();
    let refs: serde_json::Map<String, serde_json::Value> = entity
        .references
        .iter()
        .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
        .collect();

    serde_json::json!({
        "id": entity.id,
        "deleted": entity.deleted,
        "recorded": entity.recorded,
        "props": props,
        "refs": refs,
    })
}
