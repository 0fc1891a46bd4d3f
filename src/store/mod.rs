// ABOUTME: Store abstraction between the change engine and the database driver
// ABOUTME: Lazy row cursors with column metadata, and exclusively owned transactions

pub mod mysql;

use async_trait::async_trait;
use chrono::NaiveDateTime;

use crate::error::Result;

pub use self::mysql::MysqlStore;

/// Column metadata reported by a result set.
///
/// `type_name` is the database type name (`INT`, `DATETIME`, `JSON`, ...);
/// an empty name means the driver could not describe the column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMeta {
    pub name: String,
    pub type_name: String,
}

impl ColumnMeta {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

/// A raw cell as handed over by the driver, before column-type decoding.
///
/// Text-protocol drivers deliver most cells as `Bytes`; binary-protocol
/// drivers deliver typed variants.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bytes(Vec<u8>),
    Int(i64),
    UInt(u64),
    Float(f64),
    DateTime(NaiveDateTime),
}

impl SqlValue {
    pub fn text(s: impl Into<String>) -> Self {
        SqlValue::Bytes(s.into().into_bytes())
    }
}

/// Connection-pool level entry point for one dataset's reads and writes.
#[async_trait]
pub trait Store: Send + Sync {
    /// Run a query and return its first row, if any.
    async fn query_first(&self, sql: &str) -> Result<Option<Vec<SqlValue>>>;

    /// Start a query and return a cursor that pulls rows on demand.
    async fn open_cursor(&self, sql: &str) -> Result<Box<dyn RowCursor>>;

    /// Open a transaction owned exclusively by the caller.
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>>;

    /// Release pooled connections.
    async fn disconnect(&self) -> Result<()>;
}

/// Forward-only cursor over one result set.
#[async_trait]
pub trait RowCursor: Send {
    fn columns(&self) -> &[ColumnMeta];

    /// Next row, `Ok(None)` once the result set is exhausted.
    async fn next_row(&mut self) -> Result<Option<Vec<SqlValue>>>;

    /// Release the cursor; remaining rows are discarded.
    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait StoreTransaction: Send {
    /// Execute one or more `;`-separated statements, returning affected rows.
    async fn execute(&mut self, sql: &str) -> Result<u64>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}
