use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{ClientBuilder, QueryClient, QueryOptions, RetryPolicy};
use crate::event::EventBus;
use crate::filter::FilterConfig;

/// Environment variable naming a config file to use when no path is given.
pub const CONFIG_ENV: &str = "SHOPFLOOR_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  pub cache: CacheConfig,
  pub retry: RetryPolicy,
  pub filters: FilterConfig,
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// How long fetched data is served without a refetch
  #[serde(with = "crate::cache::millis", rename = "stale_time_ms")]
  pub stale_time: Duration,
  /// How long unobserved entries survive garbage collection
  #[serde(with = "crate::cache::millis", rename = "gc_time_ms")]
  pub gc_time: Duration,
  /// Events buffered per subscriber before the slowest one starts missing them
  pub event_capacity: usize,
}

impl Default for CacheConfig {
  fn default() -> Self {
    let options = QueryOptions::default();
    Self {
      stale_time: options.stale_time,
      gc_time: options.gc_time,
      event_capacity: 256,
    }
  }
}

impl CacheConfig {
  pub fn query_options(&self) -> QueryOptions {
    QueryOptions {
      stale_time: self.stale_time,
      gc_time: self.gc_time,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Filter directive used when SHOPFLOOR_LOG is unset (e.g. "info", "shopfloor=debug")
  pub level: String,
  /// Write logs to this file instead of stderr
  pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      file: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided (must exist)
  /// 2. $SHOPFLOOR_CONFIG (must exist when set)
  /// 3. ./shopfloor.yaml (current directory)
  /// 4. $XDG_CONFIG_HOME/shopfloor/config.yaml
  ///
  /// With no file found the defaults apply.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let from_env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
    let path = match explicit_path.map(Path::to_path_buf).or(from_env) {
      Some(p) if p.exists() => Some(p),
      Some(p) => return Err(eyre!("Config file not found: {}", p.display())),
      None => Self::find_config_file(),
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("shopfloor.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("shopfloor").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    // An empty file parses as null, which means all defaults
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  pub fn to_yaml(&self) -> Result<String> {
    serde_yaml::to_string(self).map_err(|e| eyre!("Failed to render config: {}", e))
  }

  /// Client builder carrying the cache and retry settings.
  pub fn client_builder(&self) -> ClientBuilder {
    QueryClient::builder()
      .options(self.cache.query_options())
      .retry(self.retry)
      .events(EventBus::new(self.cache.event_capacity))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_partial_file_keeps_defaults() {
    let config = Config::from_yaml(
      "cache:\n  stale_time_ms: 5000\nretry:\n  max_retries: 5\nfilters:\n  debounce_ms: 150\n  global_ceiling: 40\n",
    )
    .unwrap();

    assert_eq!(config.cache.stale_time, Duration::from_secs(5));
    assert_eq!(config.cache.gc_time, QueryOptions::default().gc_time);
    assert_eq!(config.retry.max_retries, 5);
    assert_eq!(config.retry.base_delay, Duration::from_millis(1000));
    assert_eq!(config.filters.debounce, Duration::from_millis(150));
    assert_eq!(config.filters.guard.global_ceiling, 40);
    assert_eq!(config.logging.level, "info");
  }

  #[test]
  fn test_empty_file_is_default() {
    assert_eq!(Config::from_yaml("").unwrap(), Config::default());
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    let err = Config::load(Some(Path::new("/nonexistent/shopfloor.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }

  #[test]
  fn test_renders_back_to_yaml() {
    let yaml = Config::default().to_yaml().unwrap();
    assert!(yaml.contains("stale_time_ms: 30000"));
    assert!(yaml.contains("debounce_ms: 300"));
    assert_eq!(Config::from_yaml(&yaml).unwrap(), Config::default());
  }
}
