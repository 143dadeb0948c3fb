use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::interceptor::{CacheLayout, CacheVersions, InterceptorSettings};
use crate::precache::{CacheOption, Category};
use crate::sync::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub upstream: UpstreamConfig,
  /// Address the proxy listens on
  #[serde(default = "default_listen")]
  pub listen: SocketAddr,
  #[serde(default)]
  pub store: StoreConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub precache: PrecacheConfig,
  /// Clinic activated on first start when none is active yet
  pub default_clinic: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
  /// Base URL of the central clinic server
  pub url: String,
  #[serde(default = "default_api_prefix")]
  pub api_prefix: String,
  /// Per-request timeout. Unset means wait for the upstream.
  pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
  /// SQLite database path (defaults to the data directory)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub name_prefix: String,
  pub versions: CacheVersions,
  /// App shell fetched on install
  pub shell: Vec<String>,
  pub offline_page: String,
  /// Activate right after install instead of waiting for SKIP_WAITING
  pub skip_waiting: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    let settings = InterceptorSettings::default();
    Self {
      name_prefix: settings.layout.prefix,
      versions: settings.layout.versions,
      shell: settings.shell,
      offline_page: settings.offline_page,
      skip_waiting: true,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Upstream path polled to detect connectivity
  pub probe_path: String,
  pub probe_interval_secs: u64,
  /// Interval of the periodic full sync
  pub periodic_interval_secs: u64,
  pub retry: RetryPolicy,
  /// Failed replays before a queued write is marked failed
  pub replay_retry_budget: u32,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      probe_path: "/api/health".to_string(),
      probe_interval_secs: 15,
      periodic_interval_secs: 15 * 60,
      retry: RetryPolicy::default(),
      replay_retry_budget: 5,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PrecacheConfig {
  /// Replacement option lists, per category
  #[serde(default)]
  pub categories: HashMap<Category, Vec<CacheOption>>,
}

fn default_listen() -> SocketAddr {
  SocketAddr::from(([127, 0, 0, 1], 8790))
}

fn default_api_prefix() -> String {
  "/api".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./ocusync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/ocusync/config.yaml
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
        "No configuration file found. Create one at ~/.config/ocusync/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("ocusync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("ocusync").join("config.yaml");
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

    config.upstream_url()?;
    Ok(config)
  }

  /// Upstream API token from `OCUSYNC_API_TOKEN`, if set.
  ///
  /// Used for requests ocusync makes on its own behalf; proxied requests keep
  /// whatever credentials the UI sent.
  pub fn get_api_token() -> Option<String> {
    std::env::var("OCUSYNC_API_TOKEN")
      .ok()
      .filter(|t| !t.trim().is_empty())
  }

  pub fn upstream_url(&self) -> Result<Url> {
    Url::parse(&self.upstream.url)
      .map_err(|e| eyre!("Invalid upstream url '{}': {}", self.upstream.url, e))
  }

  pub fn timeout(&self) -> Option<Duration> {
    self.upstream.timeout_secs.map(Duration::from_secs)
  }

  pub fn interceptor_settings(&self) -> InterceptorSettings {
    InterceptorSettings {
      api_prefix: self.upstream.api_prefix.clone(),
      layout: CacheLayout::new(self.cache.name_prefix.clone(), self.cache.versions.clone()),
      shell: self.cache.shell.clone(),
      offline_page: self.cache.offline_page.clone(),
    }
  }
}

/// Directory for the store and logs.
pub fn data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("ocusync"))
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
  }

  #[test]
  fn test_minimal_config_uses_defaults() {
    let file = write_config("upstream:\n  url: https://clinic.example.org\n");
    let config = Config::load(Some(file.path())).unwrap();

    assert_eq!(config.listen, default_listen());
    assert_eq!(config.upstream.api_prefix, "/api");
    assert_eq!(config.timeout(), None);
    assert!(config.cache.skip_waiting);
    assert_eq!(config.sync.replay_retry_budget, 5);
    assert_eq!(config.sync.retry, RetryPolicy::default());
    assert!(config.precache.categories.is_empty());

    let settings = config.interceptor_settings();
    assert_eq!(settings.layout.current()[0], "ocusync-static-v1");
    assert_eq!(settings.shell, vec!["/", "/manifest.json", "/offline.html"]);
  }

  #[test]
  fn test_full_config() {
    let file = write_config(
      r#"
upstream:
  url: https://clinic.example.org
  api_prefix: /rest
  timeout_secs: 20
listen: 0.0.0.0:9000
store:
  path: /var/lib/ocusync/store.db
cache:
  name_prefix: eyecare
  versions:
    api: v4
  skip_waiting: false
sync:
  probe_path: /rest/ping
  retry:
    max_attempts: 3
precache:
  categories:
    surgery:
      - id: cases
        label: Cases
        path: /rest/surgery
default_clinic: clinic-a
"#,
    );
    let config = Config::load(Some(file.path())).unwrap();

    assert_eq!(config.timeout(), Some(Duration::from_secs(20)));
    assert_eq!(config.listen.port(), 9000);
    assert_eq!(
      config.store.path.as_deref(),
      Some(Path::new("/var/lib/ocusync/store.db"))
    );
    assert!(!config.cache.skip_waiting);
    assert_eq!(config.sync.retry.max_attempts, 3);
    assert_eq!(config.sync.retry.initial_backoff_ms, 2_000);
    assert_eq!(config.sync.probe_interval_secs, 15);
    assert_eq!(config.precache.categories[&Category::Surgery].len(), 1);
    assert_eq!(config.default_clinic.as_deref(), Some("clinic-a"));

    let settings = config.interceptor_settings();
    assert_eq!(settings.api_prefix, "/rest");
    assert_eq!(
      settings.layout.current(),
      vec!["eyecare-static-v1", "eyecare-api-v4", "eyecare-images-v1"]
    );
  }

  #[test]
  fn test_invalid_upstream_rejected() {
    let file = write_config("upstream:\n  url: not a url\n");
    assert!(Config::load(Some(file.path())).is_err());
  }

  #[test]
  fn test_missing_explicit_file() {
    let err = Config::load(Some(Path::new("/nonexistent/ocusync.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }
}
