//! Broadcast of cache-generation changes to open application instances.

use tokio::sync::broadcast;
use tracing::debug;

/// Message posted to every subscribed client after a new generation becomes
/// active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheUpdated {
  pub version: String,
}

/// Best-effort fan-out channel for cache lifecycle events.
///
/// Sending never blocks and never fails the caller; a missing or lagging
/// subscriber is the subscriber's problem.
pub struct Notifier {
  tx: broadcast::Sender<CacheUpdated>,
}

impl Notifier {
  pub fn new() -> Self {
    let (tx, _) = broadcast::channel(16);
    Self { tx }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<CacheUpdated> {
    self.tx.subscribe()
  }

  pub fn notify(&self, version: &str) {
    let delivered = self
      .tx
      .send(CacheUpdated {
        version: version.to_string(),
      })
      .unwrap_or(0);
    debug!(version, delivered, "Broadcast cache update");
  }
}

impl Default for Notifier {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_all_subscribers_receive_update() {
    let notifier = Notifier::new();
    let mut a = notifier.subscribe();
    let mut b = notifier.subscribe();

    notifier.notify("0.3.0-ab12cd34");

    let expected = CacheUpdated {
      version: "0.3.0-ab12cd34".to_string(),
    };
    assert_eq!(a.recv().await.unwrap(), expected);
    assert_eq!(b.recv().await.unwrap(), expected);
  }

  #[test]
  fn test_notify_without_subscribers_is_fine() {
    let notifier = Notifier::new();
    notifier.notify("0.3.0-ab12cd34");
  }
}
