use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub queue: QueueConfig,
  /// Override for the offline database path (default: data dir).
  pub database: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Origin of the akkord application and its API.
  pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Logical application name; generations are named `"{prefix}-{version}"`.
  pub prefix: String,
  /// Pinned version token. When unset, one is derived from the crate
  /// version and the precache manifest.
  pub version: Option<String>,
  /// Offline shell document served to navigations with no better fallback.
  pub shell: String,
  /// Path prefixes treated as volatile API data (network-first, no shell).
  pub data_prefixes: Vec<String>,
  /// Paths precached at install time.
  pub precache: Vec<String>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      prefix: "akkord".to_string(),
      version: None,
      shell: "/index.html".to_string(),
      data_prefixes: vec!["/api/".to_string()],
      precache: vec![
        "/".to_string(),
        "/index.html".to_string(),
        "/main.js".to_string(),
        "/styles.css".to_string(),
        "/templates/default.json".to_string(),
      ],
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  /// Base retry delay after a failed delivery, milliseconds.
  pub backoff_base_ms: u64,
  /// Backoff ceiling, milliseconds.
  pub backoff_cap_ms: u64,
  /// Drop an operation after this many failed tries. Unset retries forever.
  pub max_tries: Option<u32>,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      backoff_base_ms: 2_000,
      backoff_cap_ms: 3_600_000,
      max_tries: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./akkord.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/akkord/config.yaml
  /// 4. ~/.config/akkord/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/akkord/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("akkord.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("akkord").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// The application origin as a parsed URL.
  pub fn origin(&self) -> Result<Url> {
    Url::parse(&self.api.url).map_err(|e| eyre!("Invalid api.url {}: {}", self.api.url, e))
  }

  /// Path of the offline database.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.database {
      return Ok(path.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("akkord").join("offline.db"))
  }

  /// Get the API token from environment variables.
  ///
  /// Checks AKKORD_API_TOKEN first, then API_TOKEN as fallback. Optional:
  /// the asset host needs no auth, only the mutation API might.
  pub fn get_api_token() -> Option<String> {
    std::env::var("AKKORD_API_TOKEN")
      .or_else(|_| std::env::var("API_TOKEN"))
      .ok()
  }
}
