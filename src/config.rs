// ABOUTME: Layer configuration: MySQL connection settings, dataset definitions and mappings
// ABOUTME: Typed accessors for per-dataset source options plus environment overrides

use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;

use crate::error::{LayerError, Result};

// Source config keys
pub const TABLE_NAME: &str = "table_name";
pub const FLUSH_THRESHOLD: &str = "flush_threshold";
pub const APPEND_MODE: &str = "append_mode";
pub const SINCE_COLUMN: &str = "since_column";
pub const SINCE_PRECISION: &str = "since_precision";
pub const ENTITY_COLUMN: &str = "entity_column";
pub const SINCE_TABLE: &str = "since_table";
pub const DATA_QUERY: &str = "data_query";

pub const DEFAULT_FLUSH_THRESHOLD: usize = 1000;
pub const DEFAULT_SINCE_PRECISION: u8 = 6;

/// Top-level configuration for one data layer process
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LayerConfig {
    #[serde(default)]
    pub native_system_config: MysqlConf,
    #[serde(default)]
    pub dataset_definitions: Vec<DatasetDefinition>,
}

impl LayerConfig {
    /// Load a JSON configuration file and apply `MYSQL_*` environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            LayerError::config(format!("failed to read config {}: {}", path.display(), e))
        })?;
        let mut config: LayerConfig = serde_json::from_str(&contents).map_err(|e| {
            LayerError::config(format!("failed to parse config {}: {}", path.display(), e))
        })?;
        config.enrich_from_env();
        Ok(config)
    }

    pub fn enrich_from_env(&mut self) {
        self.enrich_with(|key| std::env::var(key).ok());
    }

    /// Override connection settings from a variable lookup; empty values are ignored.
    pub fn enrich_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let conf = &mut self.native_system_config;
        let targets: [(&str, &mut String); 5] = [
            ("MYSQL_USER", &mut conf.user),
            ("MYSQL_PASSWORD", &mut conf.password),
            ("MYSQL_DATABASE", &mut conf.database),
            ("MYSQL_HOST", &mut conf.host),
            ("MYSQL_PORT", &mut conf.port),
        ];
        for (key, slot) in targets {
            if let Some(value) = lookup(key).filter(|v| !v.is_empty()) {
                *slot = value;
            }
        }
    }
}

/// MySQL connection settings
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct MysqlConf {
    #[serde(default)]
    pub host: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub port: String,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

impl std::fmt::Debug for MysqlConf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MysqlConf")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

impl MysqlConf {
    pub fn port_number(&self) -> Result<u16> {
        if self.port.is_empty() {
            return Ok(3306);
        }
        self.port
            .parse()
            .map_err(|_| LayerError::config(format!("invalid MySQL port '{}'", self.port)))
    }
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetDefinition {
    pub name: String,
    #[serde(default)]
    pub source_config: SourceConfig,
    #[serde(default)]
    pub incoming_mapping_config: Option<IncomingMappingConfig>,
    #[serde(default)]
    pub outgoing_mapping_config: Option<OutgoingMappingConfig>,
}

/// Free-form per-dataset source options, read through typed accessors
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceConfig(pub serde_json::Map<String, serde_json::Value>);

impl SourceConfig {
    pub fn set(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    /// String option; missing, empty or non-string values read as `None`.
    pub fn string(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }

    pub fn table_name(&self) -> Option<&str> {
        self.string(TABLE_NAME)
    }

    pub fn since_column(&self) -> Option<&str> {
        self.string(SINCE_COLUMN)
    }

    pub fn since_table(&self) -> Option<&str> {
        self.string(SINCE_TABLE)
    }

    pub fn entity_column(&self) -> Option<&str> {
        self.string(ENTITY_COLUMN)
    }

    pub fn data_query(&self) -> Option<&str> {
        self.string(DATA_QUERY)
    }

    pub fn append_mode(&self) -> bool {
        matches!(self.0.get(APPEND_MODE), Some(serde_json::Value::Bool(true)))
    }

    pub fn flush_threshold(&self) -> Result<usize> {
        let value = match self.0.get(FLUSH_THRESHOLD) {
            None | Some(serde_json::Value::Null) => return Ok(DEFAULT_FLUSH_THRESHOLD),
            Some(v) => v,
        };
        let threshold = match value {
            serde_json::Value::Number(n) => match n.as_u64() {
                Some(i) => Some(i),
                None => n
                    .as_f64()
                    .filter(|f| f.fract() == 0.0 && *f >= 0.0)
                    .map(|f| f as u64),
            },
            _ => None,
        };
        match threshold {
            Some(t) if t > 0 => Ok(t as usize),
            _ => Err(LayerError::config(format!(
                "flush threshold must be a positive integer, got {}",
                value
            ))),
        }
    }

    /// Fractional-second precision passed to `NOW(p)` when stamping the since column.
    ///
    /// Below 6, rows written by one flush tend to share a since value. A limited
    /// read resumes after its last row's value, so ties straddling a page
    /// boundary are skipped; keep 6 for datasets read with a limit.
    pub fn since_precision(&self) -> Result<u8> {
        let raw = match self.0.get(SINCE_PRECISION) {
            None | Some(serde_json::Value::Null) => return Ok(DEFAULT_SINCE_PRECISION),
            Some(serde_json::Value::String(s)) if s.is_empty() => {
                return Ok(DEFAULT_SINCE_PRECISION)
            }
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            Some(other) => other.to_string(),
        };
        match raw.parse::<u8>() {
            Ok(p) if p <= 6 => Ok(p),
            _ => Err(LayerError::config(format!(
                "since precision must be a number between 0 and 6, got {}",
                raw
            ))),
        }
    }
}

/// Mapping used by the write path (entity -> row)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IncomingMappingConfig {
    #[serde(default)]
    pub map_all: bool,
    #[serde(default)]
    pub property_mappings: Vec<EntityToItemPropertyMapping>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityToItemPropertyMapping {
    #[serde(default)]
    pub entity_property: String,
    pub property: String,
    /// Semantic type; `datetime` and `timestamp` change literal rendering
    #[serde(default)]
    pub datatype: Option<String>,
    #[serde(default)]
    pub is_identity: bool,
    #[serde(default)]
    pub is_reference: bool,
    #[serde(default)]
    pub uri_value_pattern: Option<String>,
    #[serde(default)]
    pub default_value: Option<serde_json::Value>,
}

/// Mapping used by the read path (row -> entity)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutgoingMappingConfig {
    #[serde(default)]
    pub base_uri: String,
    #[serde(default)]
    pub map_all: bool,
    #[serde(default)]
    pub property_mappings: Vec<ItemToEntityPropertyMapping>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemToEntityPropertyMapping {
    pub property: String,
    #[serde(default)]
    pub entity_property: String,
    #[serde(default)]
    pub is_identity: bool,
    #[serde(default)]
    pub is_reference: bool,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub uri_value_pattern: Option<String>,
}
