// ABOUTME: Data layer service - owns the MySQL store and the configured datasets
// ABOUTME: Datasets hand out change iterators for reads and batch writers for writes

pub mod decoder;
pub mod query;
pub mod reader;
pub mod token;
pub mod writer;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{DatasetDefinition, LayerConfig, SourceConfig};
use crate::error::{LayerError, Result};
use crate::store::{MysqlStore, Store};

pub use reader::ChangeIterator;
pub use writer::BatchWriter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetDescription {
    pub name: String,
}

/// One configured dataset bound to the shared store
#[derive(Clone)]
pub struct Dataset {
    definition: DatasetDefinition,
    store: Arc<dyn Store>,
}

impl Dataset {
    pub fn new(definition: DatasetDefinition, store: Arc<dyn Store>) -> Self {
        Self { definition, store }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn metadata(&self) -> &SourceConfig {
        &self.definition.source_config
    }

    pub fn definition(&self) -> &DatasetDefinition {
        &self.definition
    }

    /// Rows changed after `since`, up to the snapshot taken at call time.
    ///
    /// `latest_only` is refused: a table's metadata does not say whether it
    /// keeps change history or current state only.
    pub async fn changes(
        &self,
        since: &str,
        limit: usize,
        latest_only: bool,
    ) -> Result<ChangeIterator> {
        if latest_only {
            return Err(LayerError::not_supported(
                "latest only operation not supported",
            ));
        }
        ChangeIterator::open(self.store.as_ref(), &self.definition, since, limit).await
    }

    /// Same as `changes`; a table cannot be told apart from a change table.
    pub async fn entities(&self, from: &str, limit: usize) -> Result<ChangeIterator> {
        self.changes(from, limit, false).await
    }

    pub async fn incremental(&self) -> Result<BatchWriter> {
        BatchWriter::begin(self.store.as_ref(), &self.definition).await
    }

    pub async fn full_sync(&self) -> Result<BatchWriter> {
        Err(LayerError::not_supported(format!(
            "full sync is not supported for dataset {}",
            self.name()
        )))
    }
}

/// The layer: one store shared by every dataset
pub struct Datalayer {
    store: Arc<dyn Store>,
    datasets: BTreeMap<String, Dataset>,
}

impl Datalayer {
    /// Connect to MySQL and register the configured datasets.
    pub async fn connect(config: &LayerConfig) -> Result<Self> {
        let store = MysqlStore::connect(&config.native_system_config).await?;
        Ok(Self::with_store(
            Arc::new(store),
            config.dataset_definitions.clone(),
        ))
    }

    pub fn with_store(store: Arc<dyn Store>, definitions: Vec<DatasetDefinition>) -> Self {
        let mut layer = Self {
            store,
            datasets: BTreeMap::new(),
        };
        layer.apply_definitions(definitions);
        layer
    }

    pub fn dataset(&self, name: &str) -> Result<&Dataset> {
        self.datasets
            .get(name)
            .ok_or_else(|| LayerError::DatasetNotFound(name.to_string()))
    }

    /// Descriptions sorted by dataset name
    pub fn dataset_descriptions(&self) -> Vec<DatasetDescription> {
        self.datasets
            .keys()
            .map(|name| DatasetDescription { name: name.clone() })
            .collect()
    }

    /// Reconnect with new settings and reconcile the dataset set.
    pub async fn update_configuration(&mut self, config: &LayerConfig) -> Result<()> {
        let store = MysqlStore::connect(&config.native_system_config).await?;
        if let Err(e) = self.store.disconnect().await {
            tracing::warn!("Failed to close previous database connection: {}", e);
        }
        self.store = Arc::new(store);
        self.apply_definitions(config.dataset_definitions.clone());
        Ok(())
    }

    /// Update datasets in place, drop removed ones and add new ones.
    ///
    /// Outgoing property names are lower-cased to match row item keys.
    pub fn apply_definitions(&mut self, definitions: Vec<DatasetDefinition>) {
        let mut incoming: BTreeMap<String, DatasetDefinition> = definitions
            .into_iter()
            .map(|mut def| {
                if let Some(outgoing) = def.outgoing_mapping_config.as_mut() {
                    for pm in &mut outgoing.property_mappings {
                        pm.property = pm.property.to_lowercase();
                    }
                }
                (def.name.clone(), def)
            })
            .collect();

        self.datasets.retain(|name, _| incoming.contains_key(name));
        for (name, dataset) in self.datasets.iter_mut() {
            if let Some(def) = incoming.remove(name) {
                dataset.definition = def;
                dataset.store = Arc::clone(&self.store);
            }
        }
        for (name, def) in incoming {
            tracing::info!("Registered dataset {}", name);
            self.datasets
                .insert(name, Dataset::new(def, Arc::clone(&self.store)));
        }
    }

    /// Release the connection pool.
    pub async fn stop(&self) -> Result<()> {
        self.store.disconnect().await
    }
}
