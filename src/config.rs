use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub api: ApiConfig,
  #[serde(default)]
  pub store: StoreConfig,
  #[serde(default)]
  pub queue: QueueConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base URL of the campaign backend (e.g. "https://crm.example.org/api")
  pub base_url: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
  #[serde(default)]
  pub endpoints: EndpointsConfig,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: "http://localhost:3000/api".to_string(),
      timeout_secs: default_timeout_secs(),
      endpoints: EndpointsConfig::default(),
    }
  }
}

fn default_timeout_secs() -> u64 {
  15
}

/// Collection endpoints, relative to `base_url`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EndpointsConfig {
  pub tenants: String,
  pub voters: String,
  pub workers: String,
}

impl Default for EndpointsConfig {
  fn default() -> Self {
    Self {
      tenants: "/tenants".to_string(),
      voters: "/voters".to_string(),
      workers: "/workers".to_string(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
  /// Database file; defaults to the platform data dir
  pub path: Option<PathBuf>,
}

impl StoreConfig {
  pub fn resolved_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.path {
      return Ok(path.clone());
    }
    dirs::data_dir()
      .map(|dir| dir.join("fieldsync").join("cache.db"))
      .ok_or_else(|| eyre!("Could not determine data directory; set store.path in the config"))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  /// Rejections before an item is moved to dead letters (0 = never)
  pub max_rejections: u32,
  /// Skip later items for an entity once one of its items failed in a drain
  pub defer_same_entity: bool,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      max_rejections: 5,
      defer_same_entity: false,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Default filter when RUST_LOG is unset
  pub level: String,
  /// Also write daily-rotated log files here
  pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      directory: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./fieldsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/fieldsync/config.yaml
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
        "No configuration file found. Create one at ~/.config/fieldsync/config.yaml\n\
                 At minimum it needs `api: {{ base_url: ... }}`."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("fieldsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("fieldsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  /// Bearer token for the backend, from FIELDSYNC_API_TOKEN.
  ///
  /// Optional: some deployments authenticate by cookie at a proxy.
  pub fn get_api_token() -> Option<String> {
    std::env::var("FIELDSYNC_API_TOKEN")
      .ok()
      .filter(|token| !token.trim().is_empty())
  }
}
