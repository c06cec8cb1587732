//! Cache store trait and its SQLite and in-memory implementations.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use crate::net::Response;

/// Generation-scoped key→response storage.
///
/// The platform cache is abstracted behind this narrow trait so the worker
/// and the fetch strategies can be tested against [`MemoryStore`].
pub trait CacheStore: Send + Sync {
  /// Create the generation if absent. Idempotent.
  fn open(&self, generation: &str) -> Result<()>;

  /// Store a response under `url` in the given generation, overwriting any
  /// prior entry. Only HTTP 200 responses are ever written; anything else is
  /// silently discarded.
  fn put(&self, generation: &str, url: &str, response: &Response) -> Result<()>;

  /// Look up a cached response in the given generation.
  fn match_url(&self, generation: &str, url: &str) -> Result<Option<Response>>;

  /// All generation names sharing the given prefix. Used by the reaper.
  fn list_generation_names(&self, prefix: &str) -> Result<Vec<String>>;

  /// Remove a whole generation and all of its entries. Returns whether the
  /// generation existed.
  fn delete(&self, generation: &str) -> Result<bool>;
}

/// SQLite-backed cache store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

/// Schema for the cache tables.
const CACHE_SCHEMA: &str = r#"
-- Known generations, one row per versioned precache snapshot
CREATE TABLE IF NOT EXISTS generations (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Cached responses, scoped to a generation
CREATE TABLE IF NOT EXISTS responses (
    generation TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (generation, url)
);

CREATE INDEX IF NOT EXISTS idx_responses_generation ON responses(generation);
"#;

impl SqliteStore {
  /// Open or create the store at the given database path.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// In-memory store, used by tests.
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory cache: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// When the given generation was first opened.
  pub fn created_at(&self, generation: &str) -> Result<Option<DateTime<Utc>>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let created: Option<String> = conn
      .query_row(
        "SELECT created_at FROM generations WHERE name = ?",
        params![generation],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query generation: {}", e))?;

    created.map(|s| parse_datetime(&s)).transpose()
  }
}

impl CacheStore for SqliteStore {
  fn open(&self, generation: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR IGNORE INTO generations (name) VALUES (?)",
        params![generation],
      )
      .map_err(|e| eyre!("Failed to open generation {}: {}", generation, e))?;

    Ok(())
  }

  fn put(&self, generation: &str, url: &str, response: &Response) -> Result<()> {
    if response.status != 200 {
      tracing::debug!(url, status = response.status, "Skipping cache write for non-200 response");
      return Ok(());
    }

    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT OR IGNORE INTO generations (name) VALUES (?)",
        params![generation],
      )
      .map_err(|e| eyre!("Failed to register generation {}: {}", generation, e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO responses (generation, url, status, headers, body, cached_at)
         VALUES (?, ?, ?, ?, ?, datetime('now'))",
        params![generation, url, response.status, headers, response.body],
      )
      .map_err(|e| eyre!("Failed to store response for {}: {}", url, e))?;

    Ok(())
  }

  fn match_url(&self, generation: &str, url: &str) -> Result<Option<Response>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<(u16, String, Vec<u8>)> = conn
      .query_row(
        "SELECT status, headers, body FROM responses WHERE generation = ? AND url = ?",
        params![generation, url],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cached response: {}", e))?;

    match row {
      Some((status, headers, body)) => {
        let headers: Vec<(String, String)> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
        Ok(Some(Response {
          status,
          headers,
          body,
        }))
      }
      None => Ok(None),
    }
  }

  fn list_generation_names(&self, prefix: &str) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT name FROM generations WHERE name LIKE ? || '-%' ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare generation query: {}", e))?;

    let names = stmt
      .query_map(params![prefix], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list generations: {}", e))?
      .collect::<std::result::Result<Vec<String>, _>>()
      .map_err(|e| eyre!("Failed to read generation name: {}", e))?;

    Ok(names)
  }

  fn delete(&self, generation: &str) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "DELETE FROM responses WHERE generation = ?",
        params![generation],
      )
      .map_err(|e| eyre!("Failed to delete responses for {}: {}", generation, e))?;

    let removed = conn
      .execute("DELETE FROM generations WHERE name = ?", params![generation])
      .map_err(|e| eyre!("Failed to delete generation {}: {}", generation, e))?;

    Ok(removed > 0)
  }
}

/// In-memory cache store, used as a test double and for ephemeral runs.
#[derive(Default)]
pub struct MemoryStore {
  generations: Mutex<HashMap<String, HashMap<String, Response>>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl CacheStore for MemoryStore {
  fn open(&self, generation: &str) -> Result<()> {
    let mut generations = self
      .generations
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    generations.entry(generation.to_string()).or_default();
    Ok(())
  }

  fn put(&self, generation: &str, url: &str, response: &Response) -> Result<()> {
    if response.status != 200 {
      return Ok(());
    }

    let mut generations = self
      .generations
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    generations
      .entry(generation.to_string())
      .or_default()
      .insert(url.to_string(), response.clone());
    Ok(())
  }

  fn match_url(&self, generation: &str, url: &str) -> Result<Option<Response>> {
    let generations = self
      .generations
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(
      generations
        .get(generation)
        .and_then(|entries| entries.get(url))
        .cloned(),
    )
  }

  fn list_generation_names(&self, prefix: &str) -> Result<Vec<String>> {
    let generations = self
      .generations
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let mut names: Vec<String> = generations
      .keys()
      .filter(|name| name.starts_with(&format!("{}-", prefix)))
      .cloned()
      .collect();
    names.sort();
    Ok(names)
  }

  fn delete(&self, generation: &str) -> Result<bool> {
    let mut generations = self
      .generations
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(generations.remove(generation).is_some())
  }
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
