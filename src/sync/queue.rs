//! Durable queue of pending vault mutations and its drain contract.
//!
//! Mutations recorded while the backend is unreachable are persisted with a
//! monotonically increasing sequence id and replayed in that order when a
//! sync trigger fires. A recoverable submission failure stops the drain and
//! leaves the remainder queued; a terminal rejection discards the one
//! mutation and records it for user-visible surfacing.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// A vault write operation awaiting replay.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMutation {
  /// Strictly increasing, assigned at enqueue time
  pub sequence_id: i64,
  pub operation: Operation,
  pub entity_id: String,
  /// JSON document submitted to the backend
  pub payload: Vec<u8>,
  pub enqueued_at: DateTime<Utc>,
  /// Submission attempts so far
  pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
  Create,
  Update,
  Delete,
}

impl Operation {
  pub fn as_str(&self) -> &'static str {
    match self {
      Operation::Create => "create",
      Operation::Update => "update",
      Operation::Delete => "delete",
    }
  }

  fn parse(s: &str) -> Result<Self> {
    match s {
      "create" => Ok(Operation::Create),
      "update" => Ok(Operation::Update),
      "delete" => Ok(Operation::Delete),
      other => Err(eyre!("Unknown queued operation '{}'", other)),
    }
  }
}

/// A mutation the backend rejected permanently. Kept out of the queue so it
/// is never retried, but preserved for later user notification.
#[derive(Debug, Clone)]
pub struct FailedMutation {
  pub sequence_id: i64,
  pub operation: Operation,
  pub entity_id: String,
  pub failed_at: DateTime<Utc>,
  pub reason: String,
}

/// How a backend submission failed.
#[derive(Debug, Clone)]
pub enum SubmitError {
  /// Network, timeout or server-side failure; the mutation stays queued and
  /// the drain stops until the next trigger
  Recoverable(String),
  /// Validation-style rejection; the mutation is discarded and never retried
  Terminal(String),
}

/// Seam to the remote backend, mockable in tests.
#[allow(async_fn_in_trait)]
pub trait MutationBackend {
  /// Submit one mutation. `Ok(())` means the backend acknowledged it.
  async fn submit(&self, mutation: &QueuedMutation) -> Result<(), SubmitError>;
}

/// Result of a drain pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
  /// Every queued mutation was acknowledged or terminally failed
  Drained { submitted: usize, failed: usize },
  /// A recoverable failure stopped the drain; `remaining` mutations stay
  /// queued, in order, for the next trigger
  Stopped {
    submitted: usize,
    failed: usize,
    remaining: usize,
  },
}

/// Durable FIFO queue of pending mutations, persisted in SQLite so it
/// survives worker termination between events.
pub struct SyncQueue {
  conn: Mutex<Connection>,
  /// Serializes drains; a trigger arriving mid-drain waits and then finds
  /// whatever the first drain left behind
  drain_lock: tokio::sync::Mutex<()>,
}

impl SyncQueue {
  /// Open (create if absent) the queue database at the given path.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create queue directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open queue database at {}: {}", path.display(), e))?;

    let queue = Self {
      conn: Mutex::new(conn),
      drain_lock: tokio::sync::Mutex::new(()),
    };
    queue.run_migrations()?;

    Ok(queue)
  }

  /// Open an ephemeral in-memory queue.
  pub fn in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory queue database: {}", e))?;

    let queue = Self {
      conn: Mutex::new(conn),
      drain_lock: tokio::sync::Mutex::new(()),
    };
    queue.run_migrations()?;

    Ok(queue)
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(QUEUE_SCHEMA)
      .map_err(|e| eyre!("Failed to run queue migrations: {}", e))?;

    Ok(())
  }

  /// Record a mutation for later replay.
  ///
  /// Assigns the next sequence id and persists the record before returning.
  /// Never touches the network; safe to call while a drain is running (the
  /// new entry extends the tail and is picked up by the same or a later
  /// drain).
  pub fn enqueue(&self, operation: Operation, entity_id: &str, payload: &[u8]) -> Result<i64> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT INTO sync_queue (operation, entity_id, payload) VALUES (?, ?, ?)",
        params![operation.as_str(), entity_id, payload],
      )
      .map_err(|e| eyre!("Failed to enqueue mutation for {}: {}", entity_id, e))?;

    let sequence_id = conn.last_insert_rowid();
    debug!(sequence_id, entity = entity_id, op = operation.as_str(), "mutation queued");
    Ok(sequence_id)
  }

  /// Replay queued mutations against the backend, in enqueue order.
  ///
  /// Drains serialize: a trigger arriving while one is in progress waits
  /// for it, then continues over whatever is still queued, so the combined
  /// effect is a single ordered pass, never a concurrent double-submit.
  /// Invoking with an empty queue is a no-op.
  pub async fn drain<B: MutationBackend>(&self, backend: &B) -> Result<DrainOutcome> {
    let _guard = self.drain_lock.lock().await;

    let mut submitted = 0usize;
    let mut failed = 0usize;

    // Reload the head from persistence on every step: already-acknowledged
    // entries are gone, entries enqueued mid-drain join the tail.
    loop {
      let mutation = match self.front()? {
        Some(m) => m,
        None => break,
      };

      self.record_attempt(mutation.sequence_id)?;

      match backend.submit(&mutation).await {
        Ok(()) => {
          self.remove(mutation.sequence_id)?;
          submitted += 1;
          debug!(sequence_id = mutation.sequence_id, "mutation acknowledged");
        }
        Err(SubmitError::Recoverable(reason)) => {
          let remaining = self.len()?;
          warn!(
            sequence_id = mutation.sequence_id,
            remaining, "drain stopped on recoverable failure: {}", reason
          );
          return Ok(DrainOutcome::Stopped {
            submitted,
            failed,
            remaining,
          });
        }
        Err(SubmitError::Terminal(reason)) => {
          warn!(
            sequence_id = mutation.sequence_id,
            entity = %mutation.entity_id,
            "mutation rejected permanently: {}", reason
          );
          self.mark_failed(&mutation, &reason)?;
          failed += 1;
        }
      }
    }

    if submitted > 0 || failed > 0 {
      info!(submitted, failed, "sync queue drained");
    }
    Ok(DrainOutcome::Drained { submitted, failed })
  }

  /// Pending mutations in replay order.
  pub fn pending(&self) -> Result<Vec<QueuedMutation>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT sequence_id, operation, entity_id, payload, enqueued_at, attempts
         FROM sync_queue ORDER BY sequence_id",
      )
      .map_err(|e| eyre!("Failed to prepare pending query: {}", e))?;

    let rows: Vec<(i64, String, String, Vec<u8>, String, u32)> = stmt
      .query_map([], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
          row.get(5)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query pending mutations: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    let mut mutations = Vec::with_capacity(rows.len());
    for (sequence_id, operation, entity_id, payload, enqueued_at, attempts) in rows {
      mutations.push(QueuedMutation {
        sequence_id,
        operation: Operation::parse(&operation)?,
        entity_id,
        payload,
        enqueued_at: parse_datetime(&enqueued_at)?,
        attempts,
      });
    }

    Ok(mutations)
  }

  /// Permanently failed mutations, for user-visible surfacing.
  pub fn failed(&self) -> Result<Vec<FailedMutation>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT sequence_id, operation, entity_id, failed_at, reason
         FROM failed_mutations ORDER BY sequence_id",
      )
      .map_err(|e| eyre!("Failed to prepare failed query: {}", e))?;

    let rows: Vec<(i64, String, String, String, String)> = stmt
      .query_map([], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query failed mutations: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    let mut failures = Vec::with_capacity(rows.len());
    for (sequence_id, operation, entity_id, failed_at, reason) in rows {
      failures.push(FailedMutation {
        sequence_id,
        operation: Operation::parse(&operation)?,
        entity_id,
        failed_at: parse_datetime(&failed_at)?,
        reason,
      });
    }

    Ok(failures)
  }

  /// Number of queued mutations.
  pub fn len(&self) -> Result<usize> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count queue: {}", e))?;

    Ok(count as usize)
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  /// The queue head: the lowest pending sequence id.
  fn front(&self) -> Result<Option<QueuedMutation>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<(i64, String, String, Vec<u8>, String, u32)> = conn
      .query_row(
        "SELECT sequence_id, operation, entity_id, payload, enqueued_at, attempts
         FROM sync_queue ORDER BY sequence_id LIMIT 1",
        [],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to read queue head: {}", e))?;

    match row {
      Some((sequence_id, operation, entity_id, payload, enqueued_at, attempts)) => {
        Ok(Some(QueuedMutation {
          sequence_id,
          operation: Operation::parse(&operation)?,
          entity_id,
          payload,
          enqueued_at: parse_datetime(&enqueued_at)?,
          attempts,
        }))
      }
      None => Ok(None),
    }
  }

  fn record_attempt(&self, sequence_id: i64) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "UPDATE sync_queue SET attempts = attempts + 1 WHERE sequence_id = ?",
        params![sequence_id],
      )
      .map_err(|e| eyre!("Failed to record attempt for {}: {}", sequence_id, e))?;

    Ok(())
  }

  fn remove(&self, sequence_id: i64) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "DELETE FROM sync_queue WHERE sequence_id = ?",
        params![sequence_id],
      )
      .map_err(|e| eyre!("Failed to remove mutation {}: {}", sequence_id, e))?;

    Ok(())
  }

  /// Move a terminally rejected mutation out of the queue into the failure
  /// record, atomically.
  fn mark_failed(&self, mutation: &QueuedMutation, reason: &str) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT INTO failed_mutations (sequence_id, operation, entity_id, payload, enqueued_at, reason)
       SELECT sequence_id, operation, entity_id, payload, enqueued_at, ?
       FROM sync_queue WHERE sequence_id = ?",
      params![reason, mutation.sequence_id],
    )
    .map_err(|e| eyre!("Failed to record permanent failure: {}", e))?;

    tx.execute(
      "DELETE FROM sync_queue WHERE sequence_id = ?",
      params![mutation.sequence_id],
    )
    .map_err(|e| eyre!("Failed to remove failed mutation: {}", e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit failure record: {}", e))?;

    Ok(())
  }
}

/// Schema for queue tables.
const QUEUE_SCHEMA: &str = r#"
-- Pending mutations; AUTOINCREMENT keeps sequence ids strictly increasing
-- even after deletes
CREATE TABLE IF NOT EXISTS sync_queue (
    sequence_id INTEGER PRIMARY KEY AUTOINCREMENT,
    operation TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    payload BLOB NOT NULL,
    enqueued_at TEXT NOT NULL DEFAULT (datetime('now')),
    attempts INTEGER NOT NULL DEFAULT 0
);

-- Mutations the backend rejected permanently, for later user notification
CREATE TABLE IF NOT EXISTS failed_mutations (
    sequence_id INTEGER PRIMARY KEY,
    operation TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    payload BLOB NOT NULL,
    enqueued_at TEXT NOT NULL,
    failed_at TEXT NOT NULL DEFAULT (datetime('now')),
    reason TEXT NOT NULL
);
"#;

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicBool, Ordering};
  use std::sync::Arc;

  /// Backend that acknowledges everything and records the order it saw.
  #[derive(Default)]
  struct RecordingBackend {
    seen: Mutex<Vec<i64>>,
  }

  impl MutationBackend for RecordingBackend {
    async fn submit(&self, mutation: &QueuedMutation) -> Result<(), SubmitError> {
      self.seen.lock().unwrap().push(mutation.sequence_id);
      Ok(())
    }
  }

  /// Backend scripted per entity id: "reject" fails terminally, "flaky"
  /// fails recoverably until `online` is set.
  struct ScriptedBackend {
    online: AtomicBool,
    seen: Mutex<Vec<i64>>,
  }

  impl ScriptedBackend {
    fn new(online: bool) -> Self {
      Self {
        online: AtomicBool::new(online),
        seen: Mutex::new(Vec::new()),
      }
    }
  }

  impl MutationBackend for ScriptedBackend {
    async fn submit(&self, mutation: &QueuedMutation) -> Result<(), SubmitError> {
      if mutation.entity_id == "reject" {
        return Err(SubmitError::Terminal("validation failed".to_string()));
      }
      if !self.online.load(Ordering::SeqCst) {
        return Err(SubmitError::Recoverable("connection refused".to_string()));
      }
      self.seen.lock().unwrap().push(mutation.sequence_id);
      Ok(())
    }
  }

  fn enqueue_n(queue: &SyncQueue, n: usize) -> Vec<i64> {
    (0..n)
      .map(|i| {
        queue
          .enqueue(Operation::Create, &format!("entry-{}", i), b"{}")
          .unwrap()
      })
      .collect()
  }

  #[tokio::test]
  async fn test_drain_submits_in_sequence_order_and_empties_queue() {
    let queue = SyncQueue::in_memory().unwrap();
    let ids = enqueue_n(&queue, 5);
    let backend = RecordingBackend::default();

    let outcome = queue.drain(&backend).await.unwrap();

    assert_eq!(
      outcome,
      DrainOutcome::Drained {
        submitted: 5,
        failed: 0
      }
    );
    assert!(queue.is_empty().unwrap());
    assert_eq!(*backend.seen.lock().unwrap(), ids);
  }

  #[tokio::test]
  async fn test_sequence_ids_are_strictly_increasing() {
    let queue = SyncQueue::in_memory().unwrap();
    let ids = enqueue_n(&queue, 4);

    assert!(ids.windows(2).all(|w| w[1] > w[0]));

    // Ids are not reused after a drain
    queue.drain(&RecordingBackend::default()).await.unwrap();
    let next = queue.enqueue(Operation::Delete, "entry-x", b"{}").unwrap();
    assert!(next > ids[3]);
  }

  #[tokio::test]
  async fn test_recoverable_failure_stops_drain_and_resumes_without_resubmitting() {
    let queue = SyncQueue::in_memory().unwrap();
    queue.enqueue(Operation::Create, "a", b"{}").unwrap();
    queue.enqueue(Operation::Update, "flaky", b"{}").unwrap();
    queue.enqueue(Operation::Delete, "b", b"{}").unwrap();

    let backend = ScriptedBackend::new(false);
    // "a" would fail too while offline; expect a stop at the head
    let outcome = queue.drain(&backend).await.unwrap();
    assert_eq!(
      outcome,
      DrainOutcome::Stopped {
        submitted: 0,
        failed: 0,
        remaining: 3
      }
    );

    // Connectivity returns: the next trigger resumes from the head and the
    // earlier entries are submitted exactly once, in order
    backend.online.store(true, Ordering::SeqCst);
    let outcome = queue.drain(&backend).await.unwrap();
    assert_eq!(
      outcome,
      DrainOutcome::Drained {
        submitted: 3,
        failed: 0
      }
    );

    let seen = backend.seen.lock().unwrap();
    assert_eq!(seen.len(), 3);
    assert!(seen.windows(2).all(|w| w[1] > w[0]));
  }

  #[tokio::test]
  async fn test_terminal_failure_discards_only_that_mutation() {
    let queue = SyncQueue::in_memory().unwrap();
    queue.enqueue(Operation::Create, "a", b"{}").unwrap();
    queue.enqueue(Operation::Update, "reject", b"{}").unwrap();
    queue.enqueue(Operation::Delete, "b", b"{}").unwrap();

    let backend = ScriptedBackend::new(true);
    let outcome = queue.drain(&backend).await.unwrap();

    assert_eq!(
      outcome,
      DrainOutcome::Drained {
        submitted: 2,
        failed: 1
      }
    );
    assert!(queue.is_empty().unwrap());

    // The rejection is recorded, never to be retried
    let failed = queue.failed().unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].entity_id, "reject");
    assert_eq!(failed[0].reason, "validation failed");
  }

  #[tokio::test]
  async fn test_drain_with_empty_queue_is_a_noop() {
    let queue = SyncQueue::in_memory().unwrap();
    let backend = RecordingBackend::default();

    let outcome = queue.drain(&backend).await.unwrap();

    assert_eq!(
      outcome,
      DrainOutcome::Drained {
        submitted: 0,
        failed: 0
      }
    );
    assert!(backend.seen.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_attempts_are_persisted_across_drains() {
    let queue = SyncQueue::in_memory().unwrap();
    queue.enqueue(Operation::Create, "a", b"{}").unwrap();

    let backend = ScriptedBackend::new(false);
    queue.drain(&backend).await.unwrap();
    queue.drain(&backend).await.unwrap();

    let pending = queue.pending().unwrap();
    assert_eq!(pending[0].attempts, 2);
  }

  /// Backend that enqueues one more mutation while the drain is running.
  struct TailingBackend {
    queue: Arc<SyncQueue>,
    appended: AtomicBool,
    seen: Mutex<Vec<String>>,
  }

  impl MutationBackend for TailingBackend {
    async fn submit(&self, mutation: &QueuedMutation) -> Result<(), SubmitError> {
      if !self.appended.swap(true, Ordering::SeqCst) {
        self
          .queue
          .enqueue(Operation::Create, "late", b"{}")
          .unwrap();
      }
      self.seen.lock().unwrap().push(mutation.entity_id.clone());
      Ok(())
    }
  }

  #[tokio::test]
  async fn test_enqueue_during_drain_extends_the_tail() {
    let queue = Arc::new(SyncQueue::in_memory().unwrap());
    queue.enqueue(Operation::Create, "early", b"{}").unwrap();

    let backend = TailingBackend {
      queue: Arc::clone(&queue),
      appended: AtomicBool::new(false),
      seen: Mutex::new(Vec::new()),
    };

    let outcome = queue.drain(&backend).await.unwrap();

    assert_eq!(
      outcome,
      DrainOutcome::Drained {
        submitted: 2,
        failed: 0
      }
    );
    assert_eq!(*backend.seen.lock().unwrap(), vec!["early", "late"]);
  }

  #[tokio::test]
  async fn test_concurrent_drains_serialize_without_double_submit() {
    let queue = Arc::new(SyncQueue::in_memory().unwrap());
    enqueue_n(&queue, 8);

    let backend = Arc::new(RecordingBackend::default());

    let a = {
      let queue = Arc::clone(&queue);
      let backend = Arc::clone(&backend);
      tokio::spawn(async move { queue.drain(backend.as_ref()).await.unwrap() })
    };
    let b = {
      let queue = Arc::clone(&queue);
      let backend = Arc::clone(&backend);
      tokio::spawn(async move { queue.drain(backend.as_ref()).await.unwrap() })
    };
    a.await.unwrap();
    b.await.unwrap();

    // Between the two passes every mutation was submitted exactly once
    let seen = backend.seen.lock().unwrap();
    assert_eq!(seen.len(), 8);
    assert!(seen.windows(2).all(|w| w[1] > w[0]));
    assert!(queue.is_empty().unwrap());
  }
}
