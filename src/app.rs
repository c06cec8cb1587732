//! Wiring of config, storage, worker and queue behind the CLI commands.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use url::Url;

use crate::cache::{version_token, CacheStore, Generation, SqliteStore};
use crate::config::Config;
use crate::net::{Fetch, HttpFetcher, Method, Request};
use crate::queue::{DrainOutcome, Mutation, RetryPolicy, SqliteQueueStorage, WriteQueue};
use crate::worker::{LifecycleState, Routed, Router, RouterConfig, Source, Worker};

pub struct App {
  config: Config,
  origin: Url,
  store: Arc<SqliteStore>,
  queue: WriteQueue<SqliteQueueStorage>,
  fetch: Arc<dyn Fetch>,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let origin = config.origin()?;
    let db_path = config.database_path()?;

    let store = Arc::new(SqliteStore::open(&db_path)?);
    let queue_storage = SqliteQueueStorage::open(&db_path)?;
    let policy = RetryPolicy {
      base_ms: config.queue.backoff_base_ms,
      cap_ms: config.queue.backoff_cap_ms,
      max_tries: config.queue.max_tries,
    };
    let queue = WriteQueue::new(queue_storage, policy, origin.clone());
    let fetch: Arc<dyn Fetch> = Arc::new(HttpFetcher::new(Config::get_api_token())?);

    Ok(Self {
      config,
      origin,
      store,
      queue,
      fetch,
    })
  }

  /// The current generation: pinned via config, otherwise derived from the
  /// crate version and the precache manifest.
  fn generation(&self) -> Generation {
    let version = self.config.cache.version.clone().unwrap_or_else(|| {
      version_token(env!("CARGO_PKG_VERSION"), &self.config.cache.precache)
    });
    Generation::new(&self.config.cache.prefix, version)
  }

  fn router(&self) -> Router<SqliteStore> {
    Router::new(
      Arc::clone(&self.store),
      Arc::clone(&self.fetch),
      self.generation().name(),
      RouterConfig {
        origin: self.origin.clone(),
        shell_path: self.config.cache.shell.clone(),
        data_prefixes: self.config.cache.data_prefixes.clone(),
      },
    )
  }

  /// Install and activate a fresh cache generation.
  pub async fn refresh(&self) -> Result<()> {
    let mut worker = Worker::new(
      Arc::clone(&self.store),
      Arc::clone(&self.fetch),
      self.origin.clone(),
      self.generation(),
      self.config.cache.precache.clone(),
    );

    let mut updates = worker.subscribe();
    let precache = worker.install().await?;
    let reap = worker.activate().await?;
    debug_assert_eq!(worker.state(), LifecycleState::Active);

    if let Ok(update) = updates.try_recv() {
      tracing::debug!(version = %update.version, "Cache update broadcast to clients");
    }

    println!(
      "Generation {} active: {} precached, {} skipped, {} stale generation(s) removed",
      worker.generation().name(),
      precache.stored,
      precache.skipped,
      reap.deleted
    );
    if reap.failed > 0 {
      println!("Warning: {} stale generation(s) could not be removed", reap.failed);
    }
    Ok(())
  }

  /// Replay pending offline mutations against the remote API.
  pub async fn sync(&self) -> Result<()> {
    match self.queue.drain(self.fetch.as_ref()).await? {
      DrainOutcome::Completed(report) => {
        println!(
          "Sync: {} delivered, {} rescheduled, {} dropped, {} not yet due",
          report.delivered, report.retried, report.dropped, report.deferred
        );
      }
      DrainOutcome::Skipped => {
        println!("Sync already in progress, nothing to do");
      }
    }
    Ok(())
  }

  /// Show the current generation and queue state.
  pub fn status(&self) -> Result<()> {
    let generation = self.generation();
    let name = generation.name();

    println!("Generation: {}", name);
    match self.store.created_at(&name)? {
      Some(created) => println!("  built {}", created.format("%Y-%m-%d %H:%M:%S UTC")),
      None => println!("  not installed yet (run `akkord refresh`)"),
    }

    let names = self.store.list_generation_names(generation.prefix())?;
    let stale = names.iter().filter(|n| n.as_str() != name).count();
    if stale > 0 {
      println!("  {} stale generation(s) pending cleanup", stale);
    }

    let ops = self.queue.all_ops()?;
    println!("Pending mutations: {}", ops.len());
    Ok(())
  }

  /// Run one request through the router and print the result.
  pub async fn fetch_url(&self, url: &str, navigate: bool) -> Result<()> {
    let url = self
      .origin
      .join(url)
      .map_err(|e| eyre!("Invalid URL {}: {}", url, e))?;
    let request = if navigate {
      Request::navigate(url)
    } else {
      Request::get(url)
    };

    let router = self.router();
    let routed = router.handle(request).await?;
    println!("{}", describe(&routed));
    if let Ok(text) = std::str::from_utf8(&routed.response.body) {
      println!("{}", text);
    }

    // One-shot process: the background write-through must land before we
    // return and the runtime shuts down
    router.settle().await;
    Ok(())
  }

  /// Enqueue a deferred mutation for the next sync.
  pub fn queue_add(
    &self,
    method: Method,
    url: String,
    body: Option<String>,
    headers: Vec<String>,
  ) -> Result<()> {
    let headers = headers
      .iter()
      .map(|h| {
        h.split_once(':')
          .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
          .ok_or_else(|| eyre!("Invalid header (expected 'name: value'): {}", h))
      })
      .collect::<Result<Vec<_>>>()?;

    let op = self.queue.enqueue(Mutation {
      url,
      method,
      headers,
      body: body.map(String::into_bytes),
    })?;
    println!("Queued operation {} ({} {})", op.id, op.method, op.url);
    Ok(())
  }

  /// List pending mutations.
  pub fn queue_list(&self) -> Result<()> {
    let ops = self.queue.all_ops()?;
    if ops.is_empty() {
      println!("Queue is empty");
      return Ok(());
    }

    for op in ops {
      println!(
        "{:>4}  {:<6} {}  tries={}  enqueued {}",
        op.id,
        op.method,
        op.url,
        op.tries,
        op.enqueued_at.format("%Y-%m-%d %H:%M:%S")
      );
    }
    Ok(())
  }
}

fn describe(routed: &Routed) -> String {
  format!(
    "{} ({}, {} bytes)",
    routed.response.status,
    source_label(routed.source),
    routed.response.body.len()
  )
}

fn source_label(source: Source) -> &'static str {
  match source {
    Source::Network => "network",
    Source::Cache => "cache",
    Source::Shell => "offline shell",
    Source::Passthrough => "passthrough",
  }
}
