//! Durable storage for the offline write queue.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

use crate::net::Method;

/// A mutation the application wants delivered to the remote API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mutation {
  pub url: String,
  pub method: Method,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

/// A queued mutation as persisted, with its retry bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedOperation {
  pub id: i64,
  pub url: String,
  pub method: Method,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
  pub enqueued_at: DateTime<Utc>,
  /// Failed delivery attempts so far.
  pub tries: u32,
  /// Earliest retry time, epoch milliseconds.
  pub next_at: i64,
}

/// Storage backend for queued operations.
///
/// Every mutation (insert, retry bump, removal) is applied atomically before
/// the call returns, so the queue survives process restarts at any point.
pub trait QueueStorage: Send + Sync {
  /// Append a mutation. Assigns a monotonically increasing id.
  fn insert(&self, mutation: &Mutation, enqueued_at: DateTime<Utc>, next_at: i64)
    -> Result<QueuedOperation>;

  /// All operations in enqueue (FIFO) order.
  fn all(&self) -> Result<Vec<QueuedOperation>>;

  /// Record a failed attempt: new `tries` count and `next_at` retry time.
  fn bump_retry(&self, id: i64, tries: u32, next_at: i64) -> Result<()>;

  /// Remove an operation after successful delivery (or dead-letter drop).
  fn remove(&self, id: i64) -> Result<()>;
}

/// SQLite-backed queue storage.
pub struct SqliteQueueStorage {
  conn: Mutex<Connection>,
}

/// Schema for the write queue table.
const QUEUE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS write_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL,
    method TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB,
    enqueued_at TEXT NOT NULL,
    tries INTEGER NOT NULL DEFAULT 0,
    next_at INTEGER NOT NULL
);
"#;

impl SqliteQueueStorage {
  /// Open or create the queue at the given database path.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create queue directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open queue database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// In-memory queue, used by tests.
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory queue: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(QUEUE_SCHEMA)
      .map_err(|e| eyre!("Failed to run queue migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }
}

impl QueueStorage for SqliteQueueStorage {
  fn insert(
    &self,
    mutation: &Mutation,
    enqueued_at: DateTime<Utc>,
    next_at: i64,
  ) -> Result<QueuedOperation> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let headers = serde_json::to_string(&mutation.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT INTO write_queue (url, method, headers, body, enqueued_at, tries, next_at)
         VALUES (?, ?, ?, ?, ?, 0, ?)",
        params![
          mutation.url,
          mutation.method.as_str(),
          headers,
          mutation.body,
          enqueued_at.to_rfc3339(),
          next_at
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue operation: {}", e))?;

    let id = conn.last_insert_rowid();

    Ok(QueuedOperation {
      id,
      url: mutation.url.clone(),
      method: mutation.method,
      headers: mutation.headers.clone(),
      body: mutation.body.clone(),
      enqueued_at,
      tries: 0,
      next_at,
    })
  }

  fn all(&self) -> Result<Vec<QueuedOperation>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT id, url, method, headers, body, enqueued_at, tries, next_at
         FROM write_queue ORDER BY id",
      )
      .map_err(|e| eyre!("Failed to prepare queue query: {}", e))?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, i64>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, String>(3)?,
          row.get::<_, Option<Vec<u8>>>(4)?,
          row.get::<_, String>(5)?,
          row.get::<_, u32>(6)?,
          row.get::<_, i64>(7)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query queue: {}", e))?
      .collect::<std::result::Result<Vec<_>, _>>()
      .map_err(|e| eyre!("Failed to read queue row: {}", e))?;

    let mut ops = Vec::with_capacity(rows.len());
    for (id, url, method, headers, body, enqueued_at, tries, next_at) in rows {
      let method = method
        .parse::<Method>()
        .map_err(|e| eyre!("Corrupt queue row {}: {}", id, e))?;
      let headers: Vec<(String, String)> = serde_json::from_str(&headers)
        .map_err(|e| eyre!("Corrupt headers in queue row {}: {}", id, e))?;
      let enqueued_at = DateTime::parse_from_rfc3339(&enqueued_at)
        .map_err(|e| eyre!("Corrupt timestamp in queue row {}: {}", id, e))?
        .with_timezone(&Utc);

      ops.push(QueuedOperation {
        id,
        url,
        method,
        headers,
        body,
        enqueued_at,
        tries,
        next_at,
      });
    }

    Ok(ops)
  }

  fn bump_retry(&self, id: i64, tries: u32, next_at: i64) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "UPDATE write_queue SET tries = ?, next_at = ? WHERE id = ?",
        params![tries, next_at, id],
      )
      .map_err(|e| eyre!("Failed to record retry for operation {}: {}", id, e))?;

    Ok(())
  }

  fn remove(&self, id: i64) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM write_queue WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove operation {}: {}", id, e))?;

    Ok(())
  }
}

/// In-memory queue storage, used as a test double.
#[derive(Default)]
pub struct MemoryQueueStorage {
  inner: Mutex<MemoryQueueInner>,
}

#[derive(Default)]
struct MemoryQueueInner {
  next_id: i64,
  ops: Vec<QueuedOperation>,
}

impl MemoryQueueStorage {
  pub fn new() -> Self {
    Self::default()
  }
}

impl QueueStorage for MemoryQueueStorage {
  fn insert(
    &self,
    mutation: &Mutation,
    enqueued_at: DateTime<Utc>,
    next_at: i64,
  ) -> Result<QueuedOperation> {
    let mut inner = self
      .inner
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    inner.next_id += 1;
    let op = QueuedOperation {
      id: inner.next_id,
      url: mutation.url.clone(),
      method: mutation.method,
      headers: mutation.headers.clone(),
      body: mutation.body.clone(),
      enqueued_at,
      tries: 0,
      next_at,
    };
    inner.ops.push(op.clone());
    Ok(op)
  }

  fn all(&self) -> Result<Vec<QueuedOperation>> {
    let inner = self
      .inner
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(inner.ops.clone())
  }

  fn bump_retry(&self, id: i64, tries: u32, next_at: i64) -> Result<()> {
    let mut inner = self
      .inner
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    if let Some(op) = inner.ops.iter_mut().find(|op| op.id == id) {
      op.tries = tries;
      op.next_at = next_at;
    }
    Ok(())
  }

  fn remove(&self, id: i64) -> Result<()> {
    let mut inner = self
      .inner
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    inner.ops.retain(|op| op.id != id);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn mutation(url: &str) -> Mutation {
    Mutation {
      url: url.to_string(),
      method: Method::Post,
      headers: vec![("content-type".to_string(), "application/json".to_string())],
      body: Some(br#"{"name":"Job A"}"#.to_vec()),
    }
  }

  fn storages() -> Vec<Box<dyn QueueStorage>> {
    vec![
      Box::new(MemoryQueueStorage::new()),
      Box::new(SqliteQueueStorage::open_in_memory().unwrap()),
    ]
  }

  #[test]
  fn test_insert_assigns_fifo_ids() {
    for storage in storages() {
      let now = Utc::now();
      let a = storage.insert(&mutation("/api/jobs"), now, 0).unwrap();
      let b = storage.insert(&mutation("/api/wages"), now, 0).unwrap();
      assert!(b.id > a.id);

      let all = storage.all().unwrap();
      assert_eq!(all.len(), 2);
      assert_eq!(all[0].url, "/api/jobs");
      assert_eq!(all[1].url, "/api/wages");
    }
  }

  #[test]
  fn test_roundtrip_preserves_fields() {
    for storage in storages() {
      let now = Utc::now();
      storage.insert(&mutation("/api/jobs"), now, 1234).unwrap();

      let op = &storage.all().unwrap()[0];
      assert_eq!(op.method, Method::Post);
      assert_eq!(op.headers.len(), 1);
      assert_eq!(op.body.as_deref(), Some(br#"{"name":"Job A"}"#.as_slice()));
      assert_eq!(op.tries, 0);
      assert_eq!(op.next_at, 1234);
      assert_eq!(op.enqueued_at.timestamp(), now.timestamp());
    }
  }

  #[test]
  fn test_bump_retry_updates_in_place() {
    for storage in storages() {
      let now = Utc::now();
      let op = storage.insert(&mutation("/api/jobs"), now, 0).unwrap();

      storage.bump_retry(op.id, 3, 99_000).unwrap();

      let all = storage.all().unwrap();
      assert_eq!(all.len(), 1);
      assert_eq!(all[0].tries, 3);
      assert_eq!(all[0].next_at, 99_000);
    }
  }

  #[test]
  fn test_remove_deletes_only_target() {
    for storage in storages() {
      let now = Utc::now();
      let a = storage.insert(&mutation("/api/jobs"), now, 0).unwrap();
      storage.insert(&mutation("/api/wages"), now, 0).unwrap();

      storage.remove(a.id).unwrap();

      let all = storage.all().unwrap();
      assert_eq!(all.len(), 1);
      assert_eq!(all[0].url, "/api/wages");
    }
  }
}
