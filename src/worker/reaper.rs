//! Stale cache-generation cleanup.

use tracing::{info, warn};

use crate::cache::CacheStore;

/// What the reaper deleted (and failed to delete).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
  pub deleted: usize,
  pub failed: usize,
}

/// Delete every generation under `prefix` except `current`.
///
/// A failed deletion is logged and does not stop the remaining siblings from
/// being deleted.
pub fn reap(store: &dyn CacheStore, prefix: &str, current: &str) -> ReapReport {
  let names = match store.list_generation_names(prefix) {
    Ok(names) => names,
    Err(e) => {
      warn!(prefix, error = %e, "Failed to list cache generations");
      return ReapReport::default();
    }
  };

  let mut report = ReapReport::default();
  for name in names {
    if name == current {
      continue;
    }
    match store.delete(&name) {
      Ok(_) => {
        info!(generation = %name, "Deleted stale cache generation");
        report.deleted += 1;
      }
      Err(e) => {
        warn!(generation = %name, error = %e, "Failed to delete stale generation");
        report.failed += 1;
      }
    }
  }

  report
}
