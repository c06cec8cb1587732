//! Fetch strategies: how an intercepted request gets satisfied from network
//! and cache.

use color_eyre::Result;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use crate::cache::CacheStore;
use crate::net::{Fetch, Request, Response};

/// Where a routed response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
  /// Fresh network response.
  Network,
  /// Cached response for the requested URL.
  Cache,
  /// The offline shell document, served when a navigation had no better
  /// fallback.
  Shell,
  /// Not intercepted; forwarded to the network untouched.
  Passthrough,
}

/// A response together with its provenance.
#[derive(Debug, Clone)]
pub struct Routed {
  pub response: Response,
  pub source: Source,
}

/// In-flight background cache writes.
///
/// Write-backs and revalidations never block the response path, but a
/// short-lived process must be able to wait for them before exiting, or a
/// write-through started by its last request is silently dropped.
#[derive(Default)]
pub struct PendingWrites {
  handles: Mutex<Vec<JoinHandle<()>>>,
}

impl PendingWrites {
  pub fn new() -> Self {
    Self::default()
  }

  fn track(&self, handle: JoinHandle<()>) {
    if let Ok(mut handles) = self.handles.lock() {
      handles.push(handle);
    }
  }

  /// Wait for every tracked write to finish.
  pub async fn settle(&self) {
    let handles = match self.handles.lock() {
      Ok(mut handles) => std::mem::take(&mut *handles),
      Err(_) => return,
    };
    for handle in handles {
      let _ = handle.await;
    }
  }
}

/// Network first; on failure fall back to the cached match, then to the
/// offline shell if one is given. With no fallback the network error
/// propagates.
pub async fn network_first<S: CacheStore + 'static>(
  store: &Arc<S>,
  fetch: &Arc<dyn Fetch>,
  writes: &PendingWrites,
  generation: &str,
  request: Request,
  shell: Option<&Url>,
) -> Result<Routed> {
  let url = request.url.clone();

  match fetch.fetch(request).await {
    Ok(response) => {
      write_back(store, writes, generation, url.as_str(), &response);
      Ok(Routed {
        response,
        source: Source::Network,
      })
    }
    Err(err) => {
      if let Some(response) = lookup(store.as_ref(), generation, url.as_str()) {
        return Ok(Routed {
          response,
          source: Source::Cache,
        });
      }
      if let Some(shell) = shell {
        if let Some(response) = lookup(store.as_ref(), generation, shell.as_str()) {
          return Ok(Routed {
            response,
            source: Source::Shell,
          });
        }
      }
      Err(err)
    }
  }
}

/// Serve the cached match immediately and refresh it in the background; with
/// no cached match, block on the network.
pub async fn stale_while_revalidate<S: CacheStore + 'static>(
  store: &Arc<S>,
  fetch: &Arc<dyn Fetch>,
  writes: &PendingWrites,
  generation: &str,
  request: Request,
) -> Result<Routed> {
  let url = request.url.clone();

  if let Some(cached) = lookup(store.as_ref(), generation, url.as_str()) {
    let store = Arc::clone(store);
    let fetch = Arc::clone(fetch);
    let generation = generation.to_string();
    writes.track(tokio::spawn(async move {
      match fetch.fetch(request).await {
        Ok(response) if response.status == 200 => {
          if let Err(e) = store.put(&generation, url.as_str(), &response) {
            warn!(url = %url, error = %e, "Failed to refresh cache entry");
          }
        }
        Ok(response) => {
          debug!(url = %url, status = response.status, "Skipping revalidation write");
        }
        Err(e) => {
          debug!(url = %url, error = %e, "Background revalidation failed");
        }
      }
    }));

    return Ok(Routed {
      response: cached,
      source: Source::Cache,
    });
  }

  let response = fetch.fetch(request).await?;
  write_back(store, writes, generation, url.as_str(), &response);
  Ok(Routed {
    response,
    source: Source::Network,
  })
}

/// Fire-and-forget cache write of a 200 response into the current
/// generation. A failed write never blocks or fails the response path.
fn write_back<S: CacheStore + 'static>(
  store: &Arc<S>,
  writes: &PendingWrites,
  generation: &str,
  url: &str,
  response: &Response,
) {
  if response.status != 200 {
    return;
  }

  let store = Arc::clone(store);
  let generation = generation.to_string();
  let url = url.to_string();
  let response = response.clone();
  writes.track(tokio::spawn(async move {
    if let Err(e) = store.put(&generation, &url, &response) {
      warn!(url = %url, error = %e, "Cache write-back failed");
    }
  }));
}

/// Cache lookup that treats a storage error as a miss. A request racing the
/// reaper may see an entry vanish mid-delete; that falls through to the
/// other fallbacks instead of throwing.
fn lookup(store: &dyn CacheStore, generation: &str, url: &str) -> Option<Response> {
  match store.match_url(generation, url) {
    Ok(hit) => hit,
    Err(e) => {
      warn!(url, error = %e, "Cache lookup failed, treating as miss");
      None
    }
  }
}
