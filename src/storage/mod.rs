//! Storage collaborator used by the ingestion pipeline and feed cache.
//!
//! The pipeline only needs three operations: run a statement, fetch rows,
//! and append rows to a table. Rows are column-name keyed maps of JSON
//! scalars.

pub mod feeds;
pub mod sqlite;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

pub use feeds::FeedLinkCache;
pub use sqlite::SqliteStorage;

/// A column-name keyed row.
pub type Row = Map<String, Value>;

/// Errors raised by a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("Storage task failed: {0}")]
    Task(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Row-oriented storage backend.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Run a statement that returns no rows.
    async fn execute(&self, query: &str) -> StorageResult<()>;

    /// Run a query with positional parameters and collect its rows.
    async fn fetch_rows(&self, query: &str, params: Vec<Value>) -> StorageResult<Vec<Row>>;

    /// Append rows to `table`. Each call is applied atomically.
    async fn insert_rows(&self, table: &str, rows: Vec<Row>) -> StorageResult<usize>;
}

/// Table and column names are interpolated into SQL, so only plain
/// identifiers are accepted.
pub fn validate_identifier(name: &str) -> StorageResult<&str> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(name)
    } else {
        Err(StorageError::InvalidIdentifier(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("raw_posts").is_ok());
        assert!(validate_identifier("_x1").is_ok());
        assert!(validate_identifier("1abc").is_err());
        assert!(validate_identifier("posts; DROP TABLE x").is_err());
        assert!(validate_identifier("").is_err());
    }
}
