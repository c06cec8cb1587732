//! Best-effort warm start of a new cache generation.

use tracing::warn;
use url::Url;

use crate::cache::CacheStore;
use crate::net::{Fetch, Request};

/// What the precacher managed to store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrecacheReport {
  pub stored: usize,
  pub skipped: usize,
}

/// Fetch every manifest path and store the 200 responses into the given
/// generation.
///
/// Individual failures are logged and skipped; the install step as a whole
/// never fails because of them. An offline-first tool still has to install
/// with partial connectivity.
pub async fn warm(
  store: &dyn CacheStore,
  fetch: &dyn Fetch,
  origin: &Url,
  generation: &str,
  manifest: &[String],
) -> PrecacheReport {
  let mut report = PrecacheReport::default();

  for path in manifest {
    let url = match origin.join(path) {
      Ok(url) => url,
      Err(e) => {
        warn!(path = %path, error = %e, "Skipping unparseable precache path");
        report.skipped += 1;
        continue;
      }
    };

    match fetch.fetch(Request::get(url.clone())).await {
      Ok(response) if response.status == 200 => {
        if let Err(e) = store.put(generation, url.as_str(), &response) {
          warn!(url = %url, error = %e, "Failed to store precached response");
          report.skipped += 1;
        } else {
          report.stored += 1;
        }
      }
      Ok(response) => {
        warn!(url = %url, status = response.status, "Precache fetch returned non-200");
        report.skipped += 1;
      }
      Err(e) => {
        warn!(url = %url, error = %e, "Precache fetch failed");
        report.skipped += 1;
      }
    }
  }

  report
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStore;
  use crate::net::Response;
  use color_eyre::{eyre::eyre, Result};
  use futures::future::BoxFuture;

  /// Serves 200 for known paths, 404 for "/missing", errors otherwise.
  struct FixtureFetch;

  impl Fetch for FixtureFetch {
    fn fetch(&self, request: Request) -> BoxFuture<'static, Result<Response>> {
      let path = request.url.path().to_string();
      Box::pin(async move {
        match path.as_str() {
          "/index.html" | "/main.js" => Ok(Response {
            status: 200,
            headers: Vec::new(),
            body: path.into_bytes(),
          }),
          "/missing" => Ok(Response {
            status: 404,
            headers: Vec::new(),
            body: Vec::new(),
          }),
          _ => Err(eyre!("network down")),
        }
      })
    }
  }

  #[tokio::test]
  async fn test_precache_stores_every_200() {
    let store = MemoryStore::new();
    let origin = Url::parse("https://akkord.test").unwrap();
    let manifest = vec!["/index.html".to_string(), "/main.js".to_string()];

    let report = warm(&store, &FixtureFetch, &origin, "akkord-1", &manifest).await;

    assert_eq!(report, PrecacheReport { stored: 2, skipped: 0 });
    for path in &manifest {
      let url = origin.join(path).unwrap();
      assert!(store.match_url("akkord-1", url.as_str()).unwrap().is_some());
    }
  }

  #[tokio::test]
  async fn test_precache_failures_are_non_fatal() {
    let store = MemoryStore::new();
    let origin = Url::parse("https://akkord.test").unwrap();
    let manifest = vec![
      "/index.html".to_string(),
      "/missing".to_string(),
      "/unreachable".to_string(),
    ];

    let report = warm(&store, &FixtureFetch, &origin, "akkord-1", &manifest).await;

    assert_eq!(report, PrecacheReport { stored: 1, skipped: 2 });
    let shell = origin.join("/index.html").unwrap();
    assert!(store.match_url("akkord-1", shell.as_str()).unwrap().is_some());
    let missing = origin.join("/missing").unwrap();
    assert!(store.match_url("akkord-1", missing.as_str()).unwrap().is_none());
  }
}
