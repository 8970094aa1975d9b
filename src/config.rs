use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::RequestKey;
use crate::notify::NotificationStyle;
use crate::router::RouteTable;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin server the application talks to
  pub upstream: Option<String>,
  /// Address the local HTTP front listens on
  pub listen: String,
  /// SQLite file for the response cache and pending queue
  pub database: Option<PathBuf>,
  pub cache: CacheConfig,
  /// Paths fetched into the static collection at install time
  pub precache: Vec<String>,
  /// Path prefixes served network-first from the API collection
  pub api_prefixes: Vec<String>,
  pub offline_page: String,
  pub placeholder_image: String,
  pub connectivity: ConnectivityConfig,
  pub notifications: NotificationConfig,
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Disable to pass every request straight through
  pub enabled: bool,
  /// Deployment version; bumping it retires the previous collections
  pub version: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
  pub probe_interval_secs: u64,
  pub probe_path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
  pub default_title: String,
  pub icon: String,
  pub badge: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Default filter, overridden by RUST_LOG
  pub level: String,
  /// Also write a daily rolling log file here
  pub directory: Option<PathBuf>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      upstream: None,
      listen: "127.0.0.1:8088".to_string(),
      database: None,
      cache: CacheConfig::default(),
      precache: [
        "/",
        "/static/css/base.css",
        "/static/js/main.js",
        "/static/js/offline.js",
        "/static/js/install-prompt.js",
        "/static/images/icon-192x192.png",
        "/static/images/icon-512x512.png",
        "/offline/",
      ]
      .iter()
      .map(|s| s.to_string())
      .collect(),
      api_prefixes: [
        "/api/user-profile/",
        "/api/meal-plan/",
        "/api/food-database/",
        "/api/journal-entries/",
      ]
      .iter()
      .map(|s| s.to_string())
      .collect(),
      offline_page: "/offline/".to_string(),
      placeholder_image: "/static/images/offline-placeholder.png".to_string(),
      connectivity: ConnectivityConfig::default(),
      notifications: NotificationConfig::default(),
      logging: LoggingConfig::default(),
    }
  }
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      version: "v1".to_string(),
    }
  }
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_interval_secs: 15,
      probe_path: "/".to_string(),
    }
  }
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self {
      default_title: "Nutrition Planner".to_string(),
      icon: "/static/images/icon-192x192.png".to_string(),
      badge: "/static/images/icon-512x512.png".to_string(),
    }
  }
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      directory: None,
    }
  }
}

impl CacheConfig {
  pub fn static_cache_name(&self) -> String {
    format!("nutrition-app-{}", self.version)
  }

  pub fn api_cache_name(&self) -> String {
    format!("api-cache-{}", self.version)
  }
}

impl ConnectivityConfig {
  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.probe_interval_secs.max(1))
  }
}

impl Config {
  /// Load the worker configuration.
  ///
  /// An explicit path must exist. Otherwise the first existing file among
  /// `./nutrition-sw.yaml` and `$XDG_CONFIG_HOME/nutrition-sw/config.yaml`
  /// is read, and the built-in defaults apply when neither is present.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    match explicit_path {
      Some(path) if !path.exists() => Err(eyre!(
        "Worker config {} does not exist",
        path.display()
      )),
      Some(path) => Self::read(path),
      None => match Self::candidate_paths().into_iter().find(|p| p.exists()) {
        Some(path) => Self::read(&path),
        None => Ok(Self::default()),
      },
    }
  }

  /// Implicit config locations, most local first.
  fn candidate_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("nutrition-sw.yaml")];
    paths.extend(dirs::config_dir().map(|dir| dir.join("nutrition-sw").join("config.yaml")));
    paths
  }

  fn read(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Cannot read worker config {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Invalid worker config {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    Ok(config)
  }

  /// The origin URL, which must be configured one way or another.
  pub fn upstream_url(&self) -> Result<Url> {
    let raw = self.upstream.as_deref().ok_or_else(|| {
      eyre!("No upstream origin configured. Set `upstream` in the config file or pass --upstream.")
    })?;

    Url::parse(raw).map_err(|e| eyre!("Invalid upstream URL {}: {}", raw, e))
  }

  /// Get the database path, defaulting to the user data directory.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.database {
      return Ok(path.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("nutrition-sw").join("worker.db"))
  }

  pub fn route_table(&self) -> RouteTable {
    RouteTable {
      static_cache: self.cache.static_cache_name(),
      api_cache: self.cache.api_cache_name(),
      api_prefixes: self.api_prefixes.clone(),
      offline_page: RequestKey::from_path(&self.offline_page),
      placeholder_image: RequestKey::from_path(&self.placeholder_image),
    }
  }

  pub fn notification_style(&self) -> NotificationStyle {
    NotificationStyle {
      default_title: self.notifications.default_title.clone(),
      icon: self.notifications.icon.clone(),
      badge: self.notifications.badge.clone(),
    }
  }
}
