use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::CacheSettings;
use crate::sync::ApprovalTimeouts;

/// Environment variable holding the bearer token.
pub const TOKEN_ENV: &str = "FORMSYNC_TOKEN";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Backend base URL, e.g. "https://forms.example.com/api"
  pub backend_url: String,
  /// SQLite database path (defaults to $XDG_DATA_HOME/formsync/store.db)
  pub database: Option<PathBuf>,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default = "default_http_timeout")]
  pub http_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Age after which cached reads are flagged stale
  #[serde(default = "default_ttl")]
  pub ttl_secs: u64,
  #[serde(default = "default_persist_debounce")]
  pub persist_debounce_ms: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      ttl_secs: default_ttl(),
      persist_debounce_ms: default_persist_debounce(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  #[serde(default = "default_approval_timeout")]
  pub approval_timeout_secs: u64,
  #[serde(default = "default_approval_attachment_timeout")]
  pub approval_attachment_timeout_secs: u64,
  /// Reachability probe interval; 0 disables the probe
  #[serde(default = "default_probe_interval")]
  pub probe_interval_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      approval_timeout_secs: default_approval_timeout(),
      approval_attachment_timeout_secs: default_approval_attachment_timeout(),
      probe_interval_secs: default_probe_interval(),
    }
  }
}

fn default_http_timeout() -> u64 {
  30
}

fn default_ttl() -> u64 {
  600
}

fn default_persist_debounce() -> u64 {
  500
}

fn default_approval_timeout() -> u64 {
  60
}

fn default_approval_attachment_timeout() -> u64 {
  180
}

fn default_probe_interval() -> u64 {
  15
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./formsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/formsync/config.yaml
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
        "No configuration file found. Create one at ~/.config/formsync/config.yaml\n\
                 with at least a backend_url entry."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("formsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("formsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))?;

    if config.backend_url.trim().is_empty() {
      return Err(eyre!("backend_url must not be empty"));
    }

    Ok(config)
  }

  /// Get the API token from the environment, if set.
  pub fn get_api_token() -> Option<String> {
    std::env::var(TOKEN_ENV)
      .ok()
      .filter(|token| !token.is_empty())
  }

  pub fn cache_settings(&self) -> CacheSettings {
    CacheSettings {
      ttl: Duration::from_secs(self.cache.ttl_secs),
      persist_delay: Duration::from_millis(self.cache.persist_debounce_ms),
    }
  }

  pub fn approval_timeouts(&self) -> ApprovalTimeouts {
    ApprovalTimeouts {
      without_attachments: Duration::from_secs(self.sync.approval_timeout_secs),
      with_attachments: Duration::from_secs(self.sync.approval_attachment_timeout_secs),
    }
  }

  pub fn http_timeout(&self) -> Duration {
    Duration::from_secs(self.http_timeout_secs)
  }

  /// `None` when the probe is disabled.
  pub fn probe_interval(&self) -> Option<Duration> {
    match self.sync.probe_interval_secs {
      0 => None,
      secs => Some(Duration::from_secs(secs)),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::parse("backend_url: https://forms.example.com/api\n").unwrap();

    assert_eq!(config.database, None);
    assert_eq!(config.http_timeout(), Duration::from_secs(30));
    assert_eq!(config.cache_settings().ttl, Duration::from_secs(600));
    assert_eq!(config.cache_settings().persist_delay, Duration::from_millis(500));
    assert_eq!(config.approval_timeouts().without_attachments, Duration::from_secs(60));
    assert_eq!(config.approval_timeouts().with_attachments, Duration::from_secs(180));
    assert_eq!(config.probe_interval(), Some(Duration::from_secs(15)));
  }

  #[test]
  fn test_overrides() {
    let yaml = r#"
backend_url: http://localhost:8080
database: /tmp/forms.db
cache:
  ttl_secs: 60
sync:
  approval_attachment_timeout_secs: 300
  probe_interval_secs: 0
"#;
    let config = Config::parse(yaml).unwrap();

    assert_eq!(config.database, Some(PathBuf::from("/tmp/forms.db")));
    assert_eq!(config.cache_settings().ttl, Duration::from_secs(60));
    assert_eq!(config.cache.persist_debounce_ms, 500);
    assert_eq!(config.approval_timeouts().with_attachments, Duration::from_secs(300));
    assert_eq!(config.sync.approval_timeout_secs, 60);
    assert_eq!(config.probe_interval(), None);
  }

  #[test]
  fn test_empty_backend_url_is_rejected() {
    assert!(Config::parse("backend_url: \"\"\n").is_err());
    assert!(Config::parse("database: /tmp/x.db\n").is_err());
  }

  #[test]
  fn test_load_explicit_path() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "backend_url: https://forms.example.com").unwrap();

    let config = Config::load(Some(file.path())).unwrap();
    assert_eq!(config.backend_url, "https://forms.example.com");

    let missing = file.path().with_extension("missing");
    assert!(Config::load(Some(&missing)).is_err());
  }
}
