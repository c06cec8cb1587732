//! Offline write queue.
//!
//! Mutations made while the remote API is unreachable are appended to a
//! durable FIFO queue and replayed by `drain` once connectivity returns.
//! Failed deliveries back off exponentially; an operation only ever leaves
//! the queue on successful delivery (or, when a retry cap is configured, as
//! an explicit dead-letter drop).

mod backoff;
mod storage;

pub use backoff::backoff_ms;
pub use storage::{
  Mutation, MemoryQueueStorage, QueueStorage, QueuedOperation, SqliteQueueStorage,
};

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

use crate::net::{Fetch, Request};

/// Retry timing and dead-letter policy for failed deliveries.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
  /// Base delay for the first retry, milliseconds.
  pub base_ms: u64,
  /// Backoff ceiling, milliseconds.
  pub cap_ms: u64,
  /// Drop an operation once it has failed this many times. `None` retries
  /// forever (the default).
  pub max_tries: Option<u32>,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      base_ms: 2_000,
      cap_ms: 3_600_000,
      max_tries: None,
    }
  }
}

/// Result of one `drain` invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
  /// The pass ran to completion.
  Completed(DrainReport),
  /// Another drain was already in progress; nothing was attempted.
  Skipped,
}

/// Counters from a completed drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
  /// Delivered and removed from the queue.
  pub delivered: usize,
  /// Failed and rescheduled with backoff.
  pub retried: usize,
  /// Dropped after exceeding the retry cap.
  pub dropped: usize,
  /// Not yet due this pass.
  pub deferred: usize,
}

/// Durable FIFO queue of pending mutations.
pub struct WriteQueue<Q: QueueStorage> {
  storage: Arc<Q>,
  policy: RetryPolicy,
  /// Base URL the stored (possibly relative) operation URLs resolve against.
  base: Url,
  draining: AtomicBool,
}

impl<Q: QueueStorage> WriteQueue<Q> {
  pub fn new(storage: Q, policy: RetryPolicy, base: Url) -> Self {
    Self {
      storage: Arc::new(storage),
      policy,
      base,
      draining: AtomicBool::new(false),
    }
  }

  /// Append a mutation for later delivery. Durable before this returns;
  /// never touches the network.
  ///
  /// The URL must resolve against the queue's base; a row that can never be
  /// delivered is rejected here instead of sitting in the queue forever.
  pub fn enqueue(&self, mutation: Mutation) -> Result<QueuedOperation> {
    self
      .base
      .join(&mutation.url)
      .map_err(|e| eyre!("Invalid mutation URL {}: {}", mutation.url, e))?;

    let now = Utc::now();
    let op = self.storage.insert(&mutation, now, now.timestamp_millis())?;
    info!(id = op.id, url = %op.url, method = %op.method, "Queued offline mutation");
    Ok(op)
  }

  /// Read-only snapshot of all pending operations, FIFO order.
  pub fn all_ops(&self) -> Result<Vec<QueuedOperation>> {
    self.storage.all()
  }

  /// Attempt delivery of every due operation.
  pub async fn drain(&self, fetch: &dyn Fetch) -> Result<DrainOutcome> {
    self.drain_at(Utc::now(), fetch).await
  }

  /// Drain pass against an explicit clock, for deterministic retry tests.
  ///
  /// Overlapping invocations are serialized by a guard flag: the second call
  /// returns [`DrainOutcome::Skipped`] without touching any operation.
  pub async fn drain_at(&self, now: DateTime<Utc>, fetch: &dyn Fetch) -> Result<DrainOutcome> {
    if self
      .draining
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .is_err()
    {
      return Ok(DrainOutcome::Skipped);
    }

    let result = self.drain_pass(now, fetch).await;
    self.draining.store(false, Ordering::SeqCst);

    result.map(DrainOutcome::Completed)
  }

  async fn drain_pass(&self, now: DateTime<Utc>, fetch: &dyn Fetch) -> Result<DrainReport> {
    let now_ms = now.timestamp_millis();
    let mut report = DrainReport::default();

    for op in self.storage.all()? {
      if op.next_at > now_ms {
        report.deferred += 1;
        continue;
      }

      // A row with an unresolvable URL (written before validation existed,
      // or by another tool) takes the normal retry path; it must not abort
      // the pass and starve the deliverable rows behind it.
      let attempt = match self.base.join(&op.url) {
        Ok(url) => {
          fetch
            .fetch(Request {
              url,
              method: op.method,
              headers: op.headers.clone(),
              body: op.body.clone(),
            })
            .await
        }
        Err(e) => Err(eyre!("Invalid queued URL {}: {}", op.url, e)),
      };

      match attempt {
        Ok(response) if response.ok() => {
          self.storage.remove(op.id)?;
          report.delivered += 1;
          info!(id = op.id, url = %op.url, "Delivered queued mutation");
        }
        result => {
          // Rejected promise and non-2xx response take the same retry path
          let status = match &result {
            Ok(response) => Some(response.status),
            Err(_) => None,
          };
          let tries = op.tries + 1;

          if self.policy.max_tries.is_some_and(|max| tries >= max) {
            self.storage.remove(op.id)?;
            report.dropped += 1;
            warn!(
              id = op.id,
              url = %op.url,
              tries,
              "Dropping queued mutation after exceeding retry cap"
            );
            continue;
          }

          let delay = backoff_ms(self.policy.base_ms, self.policy.cap_ms, tries);
          let next_at = now_ms + delay as i64;
          self.storage.bump_retry(op.id, tries, next_at)?;
          report.retried += 1;
          warn!(
            id = op.id,
            url = %op.url,
            tries,
            ?status,
            delay_ms = delay,
            "Delivery failed, rescheduled"
          );
        }
      }
    }

    Ok(report)
  }
}
