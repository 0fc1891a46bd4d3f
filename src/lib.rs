// ABOUTME: Library root for mysql-datalayer
// ABOUTME: Incremental change extraction and batched upserts between MySQL tables and entity streams

pub mod config;
pub mod entity;
pub mod error;
pub mod layer;
pub mod mapping;
pub mod store;
pub mod utils;

pub use config::{DatasetDefinition, LayerConfig};
pub use entity::{Continuation, Entity, Value};
pub use error::{ErrorKind, LayerError, Result};
pub use layer::{BatchWriter, ChangeIterator, Datalayer, Dataset};
