mod app;
mod cache;
mod config;
mod net;
mod queue;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::net::Method;

#[derive(Parser, Debug)]
#[command(name = "akkord")]
#[command(about = "Offline-first cache and sync core for the akkord scaffolding job costing client")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/akkord/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show current cache generation and pending queue state
  Status,
  /// Install and activate a fresh cache generation
  Refresh,
  /// Replay pending offline mutations against the remote API
  Sync,
  /// Run one request through the cache router
  Fetch {
    /// Path or absolute URL
    url: String,
    /// Treat the request as a navigation (Accept: text/html)
    #[arg(long)]
    navigate: bool,
  },
  /// Inspect and append to the offline write queue
  Queue {
    #[command(subcommand)]
    command: QueueCommand,
  },
}

#[derive(Subcommand, Debug)]
enum QueueCommand {
  /// List pending mutations
  List,
  /// Enqueue a deferred mutation
  Add {
    /// Path or absolute URL
    url: String,
    /// HTTP method
    #[arg(short, long, default_value = "POST")]
    method: String,
    /// Request body (typically JSON)
    #[arg(short, long)]
    body: Option<String>,
    /// Headers as 'name: value', repeatable
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
  },
}

/// File logging into the platform data dir; the guard must outlive main.
fn init_tracing() -> Result<tracing_appender::non_blocking::WorkerGuard> {
  let log_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("akkord")
    .join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory: {}", e))?;

  let appender = tracing_appender::rolling::daily(log_dir, "akkord.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("akkord=info")),
    )
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  let _log_guard = init_tracing()?;

  let args = Args::parse();

  let config = config::Config::load(args.config.as_deref())?;
  let app = app::App::new(config)?;

  match args.command {
    Command::Status => app.status()?,
    Command::Refresh => app.refresh().await?,
    Command::Sync => app.sync().await?,
    Command::Fetch { url, navigate } => app.fetch_url(&url, navigate).await?,
    Command::Queue { command } => match command {
      QueueCommand::List => app.queue_list()?,
      QueueCommand::Add {
        url,
        method,
        body,
        headers,
      } => {
        let method: Method = method.parse()?;
        app.queue_add(method, url, body, headers)?;
      }
    },
  }

  Ok(())
}
