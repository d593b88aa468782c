use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub backend: BackendConfig,
  pub app: AppConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  /// Override for the directory holding cache.db, queue.db and logs
  pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
  /// Base URL of the remote vault API
  pub url: String,
  /// Path probed to detect connectivity, relative to the base URL
  #[serde(default = "default_health_path")]
  pub health_path: String,
}

fn default_health_path() -> String {
  "/health".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
  /// Origin the application shell is served from
  pub origin: String,
  /// Display name, used as the default notification title
  #[serde(default = "default_app_name")]
  pub name: String,
  /// Static shell resources precached on install
  #[serde(default = "default_shell")]
  pub shell: Vec<String>,
  /// Icon attached to rendered notifications
  #[serde(default = "default_icon")]
  pub notification_icon: String,
  /// Badge attached to rendered notifications
  #[serde(default = "default_badge")]
  pub notification_badge: String,
}

fn default_app_name() -> String {
  "Vault".to_string()
}

fn default_shell() -> Vec<String> {
  vec![
    "/".to_string(),
    "/index.html".to_string(),
    "/manifest.json".to_string(),
  ]
}

fn default_icon() -> String {
  "/icons/icon-192x192.png".to_string()
}

fn default_badge() -> String {
  "/icons/icon-72x72.png".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Version label for the current cache generation. Bump on deploy; the
  /// worker evicts every other generation on activation.
  #[serde(default = "default_cache_version")]
  pub version: String,
  /// Request header names that participate in cache identity
  #[serde(default)]
  pub vary_headers: Vec<String>,
  /// Extra hosts always passed through to the network (the backend host is
  /// always bypassed)
  #[serde(default)]
  pub bypass_hosts: Vec<String>,
  /// URL path prefixes always passed through to the network
  #[serde(default)]
  pub bypass_path_prefixes: Vec<String>,
}

fn default_cache_version() -> String {
  "v1".to_string()
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      version: default_cache_version(),
      vary_headers: Vec::new(),
      bypass_hosts: Vec::new(),
      bypass_path_prefixes: Vec::new(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// Timeout for a single backend submission during drain, in seconds
  #[serde(default = "default_request_timeout")]
  pub request_timeout_secs: u64,
  /// Interval between connectivity probes, in seconds
  #[serde(default = "default_probe_interval")]
  pub probe_interval_secs: u64,
}

fn default_request_timeout() -> u64 {
  10
}

fn default_probe_interval() -> u64 {
  30
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      request_timeout_secs: default_request_timeout(),
      probe_interval_secs: default_probe_interval(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./vaultsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/vaultsync/config.yaml
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
        "No configuration file found. Create one at ~/.config/vaultsync/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("vaultsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("vaultsync").join("config.yaml");
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

  /// Get the backend API token from environment variables.
  ///
  /// Checks VAULTSYNC_TOKEN first, then VAULT_API_TOKEN as fallback.
  pub fn api_token() -> Result<String> {
    std::env::var("VAULTSYNC_TOKEN")
      .or_else(|_| std::env::var("VAULT_API_TOKEN"))
      .map_err(|_| {
        eyre!("Backend API token not found. Set VAULTSYNC_TOKEN or VAULT_API_TOKEN environment variable.")
      })
  }

  /// Resolve the data directory holding the persistent stores.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("vaultsync"))
  }

  /// Label of the cache generation this configuration installs.
  pub fn generation_label(&self) -> String {
    format!("vault-shell-{}", self.cache.version)
  }

  /// Parsed application origin.
  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.app.origin)
      .map_err(|e| eyre!("Invalid app origin {}: {}", self.app.origin, e))
  }

  /// Parsed backend base URL.
  pub fn backend_url(&self) -> Result<Url> {
    Url::parse(&self.backend.url)
      .map_err(|e| eyre!("Invalid backend URL {}: {}", self.backend.url, e))
  }

  /// URL probed to detect backend connectivity.
  pub fn probe_url(&self) -> Result<Url> {
    self
      .backend_url()?
      .join(self.backend.health_path.trim_start_matches('/'))
      .map_err(|e| eyre!("Invalid health path {}: {}", self.backend.health_path, e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const MINIMAL: &str = r#"
backend:
  url: https://abc.supabase.co/rest/v1/
app:
  origin: https://vault.example.com
"#;

  #[test]
  fn test_defaults_applied() {
    let config: Config = serde_yaml::from_str(MINIMAL).unwrap();

    assert_eq!(config.cache.version, "v1");
    assert_eq!(config.sync.request_timeout_secs, 10);
    assert_eq!(config.app.name, "Vault");
    assert!(config.app.shell.contains(&"/index.html".to_string()));
    assert_eq!(config.generation_label(), "vault-shell-v1");
  }

  #[test]
  fn test_probe_url_joins_health_path() {
    let config: Config = serde_yaml::from_str(MINIMAL).unwrap();

    let probe = config.probe_url().unwrap();
    assert!(probe.as_str().ends_with("/health"));
  }
}
