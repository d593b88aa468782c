//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use super::key::RequestKey;

/// A response held in the resource cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
  /// When the response was stored
  pub stored_at: DateTime<Utc>,
}

/// Trait for resource cache backends.
///
/// Responses live inside named generations; exactly one generation is
/// queried at a time, and superseded generations are deleted wholesale on
/// activation.
pub trait CacheStore: Send + Sync {
  /// Create the generation if it does not exist yet.
  fn open_generation(&self, label: &str) -> Result<()>;

  /// Store a response under the given key. Last write wins.
  fn put(
    &self,
    label: &str,
    key: &RequestKey,
    method: &str,
    url: &str,
    response: &CachedResponse,
  ) -> Result<()>;

  /// Look up a response by key within a generation.
  fn get(&self, label: &str, key: &RequestKey) -> Result<Option<CachedResponse>>;

  /// Enumerate all stored generation labels.
  fn generations(&self) -> Result<Vec<String>>;

  /// Delete a generation and all of its entries. Returns whether it existed.
  fn delete_generation(&self, label: &str) -> Result<bool>;

  /// Number of entries in a generation.
  fn entry_count(&self, label: &str) -> Result<usize>;
}

/// SQLite-based cache store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open (create if absent) the cache database at the given path.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  /// Open an ephemeral in-memory store.
  pub fn in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_generations (
    label TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Cached responses, keyed by request identity within a generation
CREATE TABLE IF NOT EXISTS cache_entries (
    generation TEXT NOT NULL,
    request_key TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers BLOB NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (generation, request_key)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_generation ON cache_entries(generation);
"#;

impl CacheStore for SqliteStore {
  fn open_generation(&self, label: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR IGNORE INTO cache_generations (label) VALUES (?)",
        params![label],
      )
      .map_err(|e| eyre!("Failed to open generation {}: {}", label, e))?;

    Ok(())
  }

  fn put(
    &self,
    label: &str,
    key: &RequestKey,
    method: &str,
    url: &str,
    response: &CachedResponse,
  ) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let headers = serde_json::to_vec(&response.headers)
      .map_err(|e| eyre!("Failed to serialize response headers: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO cache_entries (generation, request_key, method, url, status, headers, body, stored_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
        params![label, key.as_hex(), method, url, response.status, headers, response.body],
      )
      .map_err(|e| eyre!("Failed to store cache entry for {}: {}", url, e))?;

    Ok(())
  }

  fn get(&self, label: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT status, headers, body, stored_at FROM cache_entries
         WHERE generation = ? AND request_key = ?",
      )
      .map_err(|e| eyre!("Failed to prepare cache lookup: {}", e))?;

    let row: Option<(u16, Vec<u8>, Vec<u8>, String)> = stmt
      .query_row(params![label, key.as_hex()], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .optional()
      .map_err(|e| eyre!("Failed to look up cache entry: {}", e))?;

    match row {
      Some((status, headers, body, stored_at)) => {
        let headers: BTreeMap<String, String> = serde_json::from_slice(&headers)
          .map_err(|e| eyre!("Failed to deserialize cached headers: {}", e))?;
        let stored_at = parse_datetime(&stored_at)?;

        Ok(Some(CachedResponse {
          status,
          headers,
          body,
          stored_at,
        }))
      }
      None => Ok(None),
    }
  }

  fn generations(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT label FROM cache_generations ORDER BY created_at, label")
      .map_err(|e| eyre!("Failed to prepare generation query: {}", e))?;

    let labels = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to enumerate generations: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(labels)
  }

  fn delete_generation(&self, label: &str) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "DELETE FROM cache_entries WHERE generation = ?",
        params![label],
      )
      .map_err(|e| eyre!("Failed to delete entries of generation {}: {}", label, e))?;

    let deleted = conn
      .execute(
        "DELETE FROM cache_generations WHERE label = ?",
        params![label],
      )
      .map_err(|e| eyre!("Failed to delete generation {}: {}", label, e))?;

    Ok(deleted > 0)
  }

  fn entry_count(&self, label: &str) -> Result<usize> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE generation = ?",
        params![label],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries of generation {}: {}", label, e))?;

    Ok(count as usize)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::net::FetchRequest;
  use url::Url;

  fn key(url: &str) -> RequestKey {
    let request = FetchRequest::get(Url::parse(url).unwrap());
    RequestKey::from_request(&request, &[])
  }

  fn response(body: &[u8]) -> CachedResponse {
    CachedResponse {
      status: 200,
      headers: BTreeMap::from([("content-type".to_string(), "text/html".to_string())]),
      body: body.to_vec(),
      stored_at: Utc::now(),
    }
  }

  #[test]
  fn test_put_get_roundtrip() {
    let store = SqliteStore::in_memory().unwrap();
    store.open_generation("v1").unwrap();

    let key = key("https://vault.example.com/index.html");
    store
      .put("v1", &key, "GET", "https://vault.example.com/index.html", &response(b"<html>"))
      .unwrap();

    let cached = store.get("v1", &key).unwrap().unwrap();
    assert_eq!(cached.status, 200);
    assert_eq!(cached.body, b"<html>");
    assert_eq!(cached.headers.get("content-type").unwrap(), "text/html");
  }

  #[test]
  fn test_last_write_wins() {
    let store = SqliteStore::in_memory().unwrap();
    store.open_generation("v1").unwrap();

    let key = key("https://vault.example.com/app.css");
    store
      .put("v1", &key, "GET", "https://vault.example.com/app.css", &response(b"old"))
      .unwrap();
    store
      .put("v1", &key, "GET", "https://vault.example.com/app.css", &response(b"new"))
      .unwrap();

    let cached = store.get("v1", &key).unwrap().unwrap();
    assert_eq!(cached.body, b"new");
    assert_eq!(store.entry_count("v1").unwrap(), 1);
  }

  #[test]
  fn test_lookup_is_generation_scoped() {
    let store = SqliteStore::in_memory().unwrap();
    store.open_generation("v1").unwrap();
    store.open_generation("v2").unwrap();

    let key = key("https://vault.example.com/");
    store
      .put("v1", &key, "GET", "https://vault.example.com/", &response(b"x"))
      .unwrap();

    assert!(store.get("v2", &key).unwrap().is_none());
  }

  #[test]
  fn test_delete_generation_removes_entries() {
    let store = SqliteStore::in_memory().unwrap();
    store.open_generation("v1").unwrap();

    let key = key("https://vault.example.com/");
    store
      .put("v1", &key, "GET", "https://vault.example.com/", &response(b"x"))
      .unwrap();

    assert!(store.delete_generation("v1").unwrap());
    assert!(!store.delete_generation("v1").unwrap());
    assert!(store.get("v1", &key).unwrap().is_none());
    assert_eq!(store.generations().unwrap().len(), 0);
  }

  #[test]
  fn test_open_generation_is_idempotent() {
    let store = SqliteStore::in_memory().unwrap();
    store.open_generation("v1").unwrap();
    store.open_generation("v1").unwrap();

    assert_eq!(store.generations().unwrap(), vec!["v1".to_string()]);
  }
}
