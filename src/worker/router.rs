//! Request routing: classify each request and dispatch it to a fetch
//! strategy.

use color_eyre::Result;
use std::sync::Arc;
use url::Url;

use crate::cache::CacheStore;
use crate::net::{Fetch, Method, Request};

use super::strategy::{self, PendingWrites, Routed, Source};

/// Static routing configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
  /// Origin of the application; anything else passes through untouched.
  pub origin: Url,
  /// Path of the offline shell document served to navigations with no
  /// better fallback.
  pub shell_path: String,
  /// Path prefixes of volatile API data. Matched requests use network-first
  /// without the shell fallback.
  pub data_prefixes: Vec<String>,
}

/// Routes requests to a strategy against the current cache generation.
pub struct Router<S: CacheStore> {
  store: Arc<S>,
  fetch: Arc<dyn Fetch>,
  generation: String,
  config: RouterConfig,
  writes: PendingWrites,
}

impl<S: CacheStore + 'static> Router<S> {
  pub fn new(
    store: Arc<S>,
    fetch: Arc<dyn Fetch>,
    generation: String,
    config: RouterConfig,
  ) -> Self {
    Self {
      store,
      fetch,
      generation,
      config,
      writes: PendingWrites::new(),
    }
  }

  /// Wait for outstanding background cache writes. Long-lived callers never
  /// need this; a one-shot process calls it before exiting so its last
  /// write-through is not dropped mid-flight.
  pub async fn settle(&self) {
    self.writes.settle().await;
  }

  /// Classification order, first match wins:
  /// 1. non-GET → passthrough (mutations are the write queue's business)
  /// 2. navigation (`Accept: text/html`) → network-first with shell fallback
  /// 3. cross-origin → passthrough
  /// 4. data prefix match → network-first, cache fallback only
  /// 5. everything else → stale-while-revalidate
  pub async fn handle(&self, request: Request) -> Result<Routed> {
    if request.method != Method::Get {
      return self.passthrough(request).await;
    }

    if is_navigation(&request) {
      let shell = self.config.origin.join(&self.config.shell_path)?;
      return strategy::network_first(
        &self.store,
        &self.fetch,
        &self.writes,
        &self.generation,
        request,
        Some(&shell),
      )
      .await;
    }

    if request.url.origin() != self.config.origin.origin() {
      return self.passthrough(request).await;
    }

    if self.is_data(&request.url) {
      return strategy::network_first(
        &self.store,
        &self.fetch,
        &self.writes,
        &self.generation,
        request,
        None,
      )
      .await;
    }

    strategy::stale_while_revalidate(
      &self.store,
      &self.fetch,
      &self.writes,
      &self.generation,
      request,
    )
    .await
  }

  async fn passthrough(&self, request: Request) -> Result<Routed> {
    let response = self.fetch.fetch(request).await?;
    Ok(Routed {
      response,
      source: Source::Passthrough,
    })
  }

  fn is_data(&self, url: &Url) -> bool {
    self
      .config
      .data_prefixes
      .iter()
      .any(|prefix| url.path().starts_with(prefix.as_str()))
  }
}

fn is_navigation(request: &Request) -> bool {
  request
    .header("accept")
    .is_some_and(|accept| accept.contains("text/html"))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheStore, MemoryStore};
  use crate::net::Response;
  use color_eyre::eyre::eyre;
  use futures::future::BoxFuture;
  use std::sync::atomic::{AtomicU32, Ordering};

  const GEN: &str = "akkord-1";

  fn ok_response(body: &str) -> Response {
    Response {
      status: 200,
      headers: Vec::new(),
      body: body.as_bytes().to_vec(),
    }
  }

  /// Echoes the request path as the body, or fails when offline.
  struct EchoFetch {
    offline: bool,
    calls: AtomicU32,
  }

  impl EchoFetch {
    fn online() -> Arc<Self> {
      Arc::new(Self {
        offline: false,
        calls: AtomicU32::new(0),
      })
    }

    fn offline() -> Arc<Self> {
      Arc::new(Self {
        offline: true,
        calls: AtomicU32::new(0),
      })
    }

    fn calls(&self) -> u32 {
      self.calls.load(Ordering::SeqCst)
    }
  }

  impl Fetch for EchoFetch {
    fn fetch(&self, request: Request) -> BoxFuture<'static, Result<Response>> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      let offline = self.offline;
      let body = request.url.path().as_bytes().to_vec();
      Box::pin(async move {
        if offline {
          Err(eyre!("network unreachable"))
        } else {
          Ok(Response {
            status: 200,
            headers: Vec::new(),
            body,
          })
        }
      })
    }
  }

  /// Counts cache lookups so tests can assert a request never touched the
  /// cache.
  struct CountingStore {
    inner: MemoryStore,
    matches: AtomicU32,
  }

  impl CountingStore {
    fn new() -> Self {
      Self {
        inner: MemoryStore::new(),
        matches: AtomicU32::new(0),
      }
    }
  }

  impl CacheStore for CountingStore {
    fn open(&self, generation: &str) -> Result<()> {
      self.inner.open(generation)
    }
    fn put(&self, generation: &str, url: &str, response: &Response) -> Result<()> {
      self.inner.put(generation, url, response)
    }
    fn match_url(&self, generation: &str, url: &str) -> Result<Option<Response>> {
      self.matches.fetch_add(1, Ordering::SeqCst);
      self.inner.match_url(generation, url)
    }
    fn list_generation_names(&self, prefix: &str) -> Result<Vec<String>> {
      self.inner.list_generation_names(prefix)
    }
    fn delete(&self, generation: &str) -> Result<bool> {
      self.inner.delete(generation)
    }
  }

  fn config() -> RouterConfig {
    RouterConfig {
      origin: Url::parse("https://akkord.test").unwrap(),
      shell_path: "/index.html".to_string(),
      data_prefixes: vec!["/api/".to_string()],
    }
  }

  fn router<S: CacheStore + 'static>(store: Arc<S>, fetch: Arc<dyn Fetch>) -> Router<S> {
    Router::new(store, fetch, GEN.to_string(), config())
  }

  fn url(path: &str) -> Url {
    Url::parse("https://akkord.test").unwrap().join(path).unwrap()
  }

  #[tokio::test]
  async fn test_post_is_never_intercepted() {
    let store = Arc::new(CountingStore::new());
    let fetch = EchoFetch::online();
    let router = router(Arc::clone(&store), fetch.clone());

    let request = Request {
      url: url("/api/jobs"),
      method: Method::Post,
      headers: Vec::new(),
      body: Some(b"{}".to_vec()),
    };
    let routed = router.handle(request).await.unwrap();

    assert_eq!(routed.source, Source::Passthrough);
    assert_eq!(fetch.calls(), 1);

    router.settle().await;
    assert_eq!(store.matches.load(Ordering::SeqCst), 0);
    assert!(store
      .inner
      .match_url(GEN, url("/api/jobs").as_str())
      .unwrap()
      .is_none());
  }

  #[tokio::test]
  async fn test_cross_origin_passes_through() {
    let store = Arc::new(CountingStore::new());
    let fetch = EchoFetch::online();
    let router = router(Arc::clone(&store), fetch.clone());

    let other = Url::parse("https://cdn.example.com/lib.js").unwrap();
    let routed = router.handle(Request::get(other)).await.unwrap();

    assert_eq!(routed.source, Source::Passthrough);
    router.settle().await;
    assert_eq!(store.matches.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_navigation_uses_shell_fallback() {
    let store = Arc::new(MemoryStore::new());
    store
      .put(GEN, url("/index.html").as_str(), &ok_response("shell"))
      .unwrap();
    let router = router(store, EchoFetch::offline());

    let routed = router
      .handle(Request::navigate(url("/jobs/17")))
      .await
      .unwrap();

    assert_eq!(routed.source, Source::Shell);
    assert_eq!(routed.response.body, b"shell");
  }

  #[tokio::test]
  async fn test_navigation_online_writes_through() {
    let store = Arc::new(MemoryStore::new());
    let router = router(Arc::clone(&store), EchoFetch::online());

    let routed = router
      .handle(Request::navigate(url("/jobs/17")))
      .await
      .unwrap();
    assert_eq!(routed.source, Source::Network);

    // The write-through has landed once settle returns, even if the
    // process exits immediately afterwards
    router.settle().await;
    assert!(store
      .match_url(GEN, url("/jobs/17").as_str())
      .unwrap()
      .is_some());
  }

  #[tokio::test]
  async fn test_data_request_gets_no_shell_fallback() {
    let store = Arc::new(MemoryStore::new());
    store
      .put(GEN, url("/index.html").as_str(), &ok_response("shell"))
      .unwrap();
    let router = router(store, EchoFetch::offline());

    // No cached match and no shell for data: the error propagates
    let result = router.handle(Request::get(url("/api/templates"))).await;
    assert!(result.is_err());
  }

  #[tokio::test]
  async fn test_data_request_falls_back_to_cached_match() {
    let store = Arc::new(MemoryStore::new());
    store
      .put(GEN, url("/api/templates").as_str(), &ok_response("cached-data"))
      .unwrap();
    let router = router(store, EchoFetch::offline());

    let routed = router
      .handle(Request::get(url("/api/templates")))
      .await
      .unwrap();
    assert_eq!(routed.source, Source::Cache);
    assert_eq!(routed.response.body, b"cached-data");
  }

  #[tokio::test]
  async fn test_static_asset_uses_stale_while_revalidate() {
    let store = Arc::new(MemoryStore::new());
    store
      .put(GEN, url("/styles.css").as_str(), &ok_response("old-css"))
      .unwrap();
    let router = router(Arc::clone(&store), EchoFetch::online());

    let routed = router.handle(Request::get(url("/styles.css"))).await.unwrap();
    assert_eq!(routed.source, Source::Cache);
    assert_eq!(routed.response.body, b"old-css");

    // Background refresh replaced the entry
    router.settle().await;
    let refreshed = store.match_url(GEN, url("/styles.css").as_str()).unwrap().unwrap();
    assert_eq!(refreshed.body, b"/styles.css");
  }
}
