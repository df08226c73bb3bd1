//! SQLite-backed storage.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde_json::{Number, Value};
use tracing::debug;

use super::{validate_identifier, Row, Storage, StorageError, StorageResult};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS raw_posts (
    domain TEXT NOT NULL,
    post_id TEXT NOT NULL,
    url TEXT NOT NULL,
    post_created_at TEXT,
    scraped_at TEXT NOT NULL,
    source TEXT NOT NULL,
    request_url TEXT NOT NULL,
    payload TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_raw_posts_identity
    ON raw_posts(domain, post_id);

CREATE TABLE IF NOT EXISTS raw_assets (
    domain TEXT NOT NULL,
    post_id TEXT NOT NULL,
    url TEXT NOT NULL,
    asset_type TEXT NOT NULL,
    scraped_at TEXT NOT NULL,
    source TEXT NOT NULL,
    local_path TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_raw_assets_post
    ON raw_assets(domain, post_id);

CREATE TABLE IF NOT EXISTS site_feeds (
    domain TEXT NOT NULL,
    feed_url TEXT NOT NULL,
    feed_type TEXT NOT NULL,
    scraped_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_site_feeds_domain_time
    ON site_feeds(domain, scraped_at);
"#;

fn db_err(e: rusqlite::Error) -> StorageError {
    StorageError::Database(e.to_string())
}

/// SQLite storage. Blocking work runs on the blocking thread pool.
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open (or create) a database file.
    pub fn open(db_path: &Path) -> StorageResult<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::Database(format!("{}: {}", parent.display(), e)))?;
        }
        let conn = Connection::open(db_path).map_err(db_err)?;

        // Enable WAL mode for better concurrent access
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(db_err)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(db_err)?;

        Self::with_connection(conn)
    }

    /// Open a private in-memory database.
    pub fn in_memory() -> StorageResult<Self> {
        Self::with_connection(Connection::open_in_memory().map_err(db_err)?)
    }

    fn with_connection(conn: Connection) -> StorageResult<Self> {
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run_blocking<T, F>(&self, f: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StorageResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StorageError::Database("connection mutex poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?
    }
}

/// JSON scalar to SQLite value. Nested values are stored as JSON text.
fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_sql_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(hex::encode(b)),
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn execute(&self, query: &str) -> StorageResult<()> {
        let query = query.to_string();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(&query).map_err(db_err)?;
            // Probes such as `SELECT 1` return rows; step through them.
            let mut rows = stmt.query([]).map_err(db_err)?;
            while rows.next().map_err(db_err)?.is_some() {}
            Ok(())
        })
        .await
    }

    async fn fetch_rows(&self, query: &str, params: Vec<Value>) -> StorageResult<Vec<Row>> {
        let query = query.to_string();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(&query).map_err(db_err)?;
            let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
            let params: Vec<SqlValue> = params.iter().map(to_sql_value).collect();

            let mut rows = stmt.query(params_from_iter(params.iter())).map_err(db_err)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next().map_err(db_err)? {
                let mut map = Row::new();
                for (idx, name) in columns.iter().enumerate() {
                    let value = row.get_ref(idx).map_err(db_err)?;
                    map.insert(name.clone(), from_sql_value(value));
                }
                out.push(map);
            }
            Ok(out)
        })
        .await
    }

    async fn insert_rows(&self, table: &str, rows: Vec<Row>) -> StorageResult<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let table = validate_identifier(table)?.to_string();
        for row in &rows {
            for column in row.keys() {
                validate_identifier(column)?;
            }
        }

        self.run_blocking(move |conn| {
            let tx = conn.transaction().map_err(db_err)?;
            for row in &rows {
                let columns: Vec<&str> = row.keys().map(String::as_str).collect();
                let placeholders = vec!["?"; columns.len()].join(", ");
                let sql = format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    table,
                    columns.join(", "),
                    placeholders
                );
                let params: Vec<SqlValue> = row.values().map(to_sql_value).collect();
                tx.prepare_cached(&sql)
                    .map_err(db_err)?
                    .execute(params_from_iter(params.iter()))
                    .map_err(db_err)?;
            }
            tx.commit().map_err(db_err)?;
            debug!("Inserted {} rows into {}", rows.len(), table);
            Ok(rows.len())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_probe_and_round_trip() {
        let storage = SqliteStorage::in_memory().unwrap();
        storage.execute("SELECT 1").await.unwrap();

        let inserted = storage
            .insert_rows(
                "site_feeds",
                vec![row(json!({
                    "domain": "example.test",
                    "feed_url": "https://example.test/feed",
                    "feed_type": "rss2",
                    "scraped_at": "2026-02-01T00:00:00.000Z"
                }))],
            )
            .await
            .unwrap();
        assert_eq!(inserted, 1);

        let rows = storage
            .fetch_rows(
                "SELECT feed_url, feed_type FROM site_feeds WHERE domain = ?",
                vec![json!("example.test")],
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["feed_url"], "https://example.test/feed");
        assert_eq!(rows[0]["feed_type"], "rss2");
    }

    #[tokio::test]
    async fn test_insert_rejects_bad_identifiers() {
        let storage = SqliteStorage::in_memory().unwrap();
        let err = storage
            .insert_rows("raw_posts; --", vec![row(json!({"domain": "x"}))])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidIdentifier(_)));
    }

    #[tokio::test]
    async fn test_failed_insert_is_atomic() {
        let storage = SqliteStorage::in_memory().unwrap();
        let good = row(json!({
            "domain": "d", "feed_url": "u", "feed_type": "atom", "scraped_at": "t"
        }));
        let bad = row(json!({"domain": "d", "missing_column": 1}));

        assert!(storage.insert_rows("site_feeds", vec![good, bad]).await.is_err());
        let rows = storage
            .fetch_rows("SELECT COUNT(*) AS n FROM site_feeds", vec![])
            .await
            .unwrap();
        assert_eq!(rows[0]["n"], 0);
    }

    #[tokio::test]
    async fn test_open_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("dank.db");
        let storage = SqliteStorage::open(&path).unwrap();
        storage.execute("SELECT 1").await.unwrap();
        assert!(path.exists());
    }
}
