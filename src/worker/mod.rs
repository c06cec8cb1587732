//! Cache worker: lifecycle, precaching, generation reaping, request routing
//! and client notification.
//!
//! The worker owns the install/activate lifecycle around a single current
//! cache generation. Install warms the new generation from the precache
//! manifest; activate deletes every stale generation and then broadcasts the
//! new version to subscribed clients.

mod notify;
mod precache;
mod reaper;
mod router;
mod strategy;

pub use notify::{CacheUpdated, Notifier};
pub use precache::PrecacheReport;
pub use reaper::ReapReport;
pub use router::{Router, RouterConfig};
pub use strategy::{Routed, Source};

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::info;
use url::Url;

use crate::cache::{CacheStore, Generation};
use crate::net::Fetch;

/// Lifecycle states, replacing the platform's install/activate events with
/// directly callable transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  Idle,
  Installing,
  Installed,
  Activating,
  Active,
}

impl LifecycleState {
  /// Allowed transitions. `Active → Installing` covers a newer deployment
  /// re-installing over a live worker.
  fn can_transition(self, next: LifecycleState) -> bool {
    use LifecycleState::*;
    matches!(
      (self, next),
      (Idle, Installing)
        | (Installing, Installed)
        | (Installed, Activating)
        | (Activating, Active)
        | (Active, Installing)
    )
  }
}

/// The cache worker for one target generation.
pub struct Worker<S: CacheStore> {
  store: Arc<S>,
  fetch: Arc<dyn Fetch>,
  origin: Url,
  generation: Generation,
  manifest: Vec<String>,
  notifier: Notifier,
  state: LifecycleState,
}

impl<S: CacheStore + 'static> Worker<S> {
  pub fn new(
    store: Arc<S>,
    fetch: Arc<dyn Fetch>,
    origin: Url,
    generation: Generation,
    manifest: Vec<String>,
  ) -> Self {
    Self {
      store,
      fetch,
      origin,
      generation,
      manifest,
      notifier: Notifier::new(),
      state: LifecycleState::Idle,
    }
  }

  pub fn state(&self) -> LifecycleState {
    self.state
  }

  pub fn generation(&self) -> &Generation {
    &self.generation
  }

  /// Subscribe to cache-updated broadcasts.
  pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<CacheUpdated> {
    self.notifier.subscribe()
  }

  fn transition(&mut self, next: LifecycleState) -> Result<()> {
    if !self.state.can_transition(next) {
      return Err(eyre!(
        "Invalid lifecycle transition: {:?} -> {:?}",
        self.state,
        next
      ));
    }
    self.state = next;
    Ok(())
  }

  /// Install step: create the target generation and warm it from the
  /// precache manifest. Best-effort; individual fetch failures never fail
  /// the install.
  pub async fn install(&mut self) -> Result<PrecacheReport> {
    self.transition(LifecycleState::Installing)?;

    let name = self.generation.name();
    self.store.open(&name)?;
    let report = precache::warm(
      self.store.as_ref(),
      self.fetch.as_ref(),
      &self.origin,
      &name,
      &self.manifest,
    )
    .await;

    info!(
      generation = %name,
      stored = report.stored,
      skipped = report.skipped,
      "Install complete"
    );
    self.transition(LifecycleState::Installed)?;
    Ok(report)
  }

  /// Activate step: reap every stale generation, then broadcast the new
  /// version. The reaper runs to completion before the worker reports
  /// `Active`, so clients never see a stale/current cache mixture.
  pub async fn activate(&mut self) -> Result<ReapReport> {
    self.transition(LifecycleState::Activating)?;

    let name = self.generation.name();
    let report = reaper::reap(self.store.as_ref(), self.generation.prefix(), &name);

    self.transition(LifecycleState::Active)?;
    self.notifier.notify(self.generation.version());

    info!(
      generation = %name,
      deleted = report.deleted,
      failed = report.failed,
      "Activate complete"
    );
    Ok(report)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStore;
  use crate::net::{Request, Response};
  use futures::future::BoxFuture;

  /// Serves 200 with the path as body for every request.
  struct AlwaysOk;

  impl Fetch for AlwaysOk {
    fn fetch(&self, request: Request) -> BoxFuture<'static, Result<Response>> {
      let body = request.url.path().as_bytes().to_vec();
      Box::pin(async move {
        Ok(Response {
          status: 200,
          headers: Vec::new(),
          body,
        })
      })
    }
  }

  fn worker(store: Arc<MemoryStore>, version: &str) -> Worker<MemoryStore> {
    Worker::new(
      store,
      Arc::new(AlwaysOk),
      Url::parse("https://akkord.test").unwrap(),
      Generation::new("akkord", version),
      vec!["/index.html".to_string(), "/main.js".to_string()],
    )
  }

  #[tokio::test]
  async fn test_install_precaches_manifest() {
    let store = Arc::new(MemoryStore::new());
    let mut worker = worker(Arc::clone(&store), "1");

    let report = worker.install().await.unwrap();

    assert_eq!(report.stored, 2);
    assert_eq!(worker.state(), LifecycleState::Installed);
    assert!(store
      .match_url("akkord-1", "https://akkord.test/index.html")
      .unwrap()
      .is_some());
  }

  #[tokio::test]
  async fn test_activate_reaps_and_notifies() {
    let store = Arc::new(MemoryStore::new());
    store.open("akkord-old").unwrap();

    let mut worker = worker(Arc::clone(&store), "2");
    let mut updates = worker.subscribe();

    worker.install().await.unwrap();
    let report = worker.activate().await.unwrap();

    assert_eq!(report.deleted, 1);
    assert_eq!(worker.state(), LifecycleState::Active);
    assert_eq!(
      store.list_generation_names("akkord").unwrap(),
      vec!["akkord-2".to_string()]
    );

    let update = updates.recv().await.unwrap();
    assert_eq!(update.version, "2");
  }

  #[tokio::test]
  async fn test_activate_before_install_is_rejected() {
    let store = Arc::new(MemoryStore::new());
    let mut worker = worker(store, "1");

    assert!(worker.activate().await.is_err());
    assert_eq!(worker.state(), LifecycleState::Idle);
  }

  #[tokio::test]
  async fn test_double_install_is_rejected_mid_lifecycle() {
    let store = Arc::new(MemoryStore::new());
    let mut worker = worker(store, "1");

    worker.install().await.unwrap();
    // Installed -> Installing is not a valid transition
    assert!(worker.install().await.is_err());
  }

  #[tokio::test]
  async fn test_reinstall_after_active_is_allowed() {
    let store = Arc::new(MemoryStore::new());
    let mut worker = worker(store, "1");

    worker.install().await.unwrap();
    worker.activate().await.unwrap();
    assert!(worker.install().await.is_ok());
    assert_eq!(worker.state(), LifecycleState::Installed);
  }

  #[tokio::test]
  async fn test_routed_fetch_against_installed_generation() {
    let store = Arc::new(MemoryStore::new());
    let mut worker = worker(Arc::clone(&store), "1");
    worker.install().await.unwrap();
    worker.activate().await.unwrap();

    let router = Router::new(
      store,
      Arc::new(AlwaysOk),
      worker.generation().name(),
      RouterConfig {
        origin: Url::parse("https://akkord.test").unwrap(),
        shell_path: "/index.html".to_string(),
        data_prefixes: vec!["/api/".to_string()],
      },
    );
    let asset = Url::parse("https://akkord.test/main.js").unwrap();
    let routed = router.handle(Request::get(asset)).await.unwrap();

    // Precached entry served via stale-while-revalidate
    assert_eq!(routed.source, Source::Cache);
  }
}
