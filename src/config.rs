use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::api::ApiConfig;
use crate::cache::CacheConfig;
use crate::client::ClientConfig;

const CONFIG_ENV: &str = "PATRON_CONFIG";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiSection,
  #[serde(default)]
  pub auth: AuthSection,
  #[serde(default)]
  pub cache: CacheSection,
  #[serde(default)]
  pub logging: LoggingSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiSection {
  pub base_url: String,
  /// Default request timeout in milliseconds
  #[serde(default = "default_timeout_ms")]
  pub timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthSection {
  /// Path prefixes where a 401 while logged out is expected
  #[serde(default)]
  pub public_paths: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
  #[serde(default = "default_storage_key")]
  pub storage_key: String,
  #[serde(default = "default_schema_version")]
  pub schema_version: u32,
  /// Cache key roots that may be written to disk
  #[serde(default, deserialize_with = "deserialize_trimmed_set")]
  pub whitelist: BTreeSet<String>,
  #[serde(default = "default_max_age_hours")]
  pub max_age_hours: u64,
  #[serde(default = "default_flush_interval_ms")]
  pub flush_interval_ms: u64,
  /// SQLite file (default: $XDG_DATA_HOME/patron/cache.db)
  pub path: Option<PathBuf>,
}

impl Default for CacheSection {
  fn default() -> Self {
    Self {
      storage_key: default_storage_key(),
      schema_version: default_schema_version(),
      whitelist: BTreeSet::new(),
      max_age_hours: default_max_age_hours(),
      flush_interval_ms: default_flush_interval_ms(),
      path: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSection {
  #[serde(default = "default_log_level")]
  pub level: String,
}

impl Default for LoggingSection {
  fn default() -> Self {
    Self {
      level: default_log_level(),
    }
  }
}

fn default_timeout_ms() -> u64 {
  ApiConfig::DEFAULT_TIMEOUT.as_millis() as u64
}

fn default_storage_key() -> String {
  CacheConfig::DEFAULT_STORAGE_KEY.to_string()
}

fn default_schema_version() -> u32 {
  1
}

fn default_max_age_hours() -> u64 {
  24
}

fn default_flush_interval_ms() -> u64 {
  1000
}

fn default_log_level() -> String {
  "info".to_string()
}

fn deserialize_trimmed_set<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(
    v.into_iter()
      .map(|s| s.trim().to_string())
      .filter(|s| !s.is_empty())
      .collect(),
  )
}

impl Config {
  /// Load configuration from the first existing candidate: `explicit_path`,
  /// then `$PATRON_CONFIG`, `./patron.yaml` and
  /// `$XDG_CONFIG_HOME/patron/config.yaml`.
  ///
  /// A path named explicitly (argument or env) must exist.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let named = explicit_path
      .map(Path::to_path_buf)
      .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));

    if let Some(path) = named {
      if !path.is_file() {
        return Err(eyre!("Config file not found: {}", path.display()));
      }
      return Self::load_from_path(&path);
    }

    let searched = Self::search_paths();
    match searched.iter().find(|p| p.is_file()) {
      Some(path) => Self::load_from_path(path),
      None => Err(eyre!(
        "No configuration file found (looked in {}); see config.example.yaml",
        searched
          .iter()
          .map(|p| p.display().to_string())
          .collect::<Vec<_>>()
          .join(", ")
      )),
    }
  }

  fn search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("patron.yaml")];
    if let Some(config_dir) = dirs::config_dir() {
      paths.push(config_dir.join("patron").join("config.yaml"));
    }
    paths
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))
  }

  /// Parse and validate YAML configuration.
  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    url::Url::parse(&self.api.base_url)
      .map_err(|e| eyre!("api.base_url '{}' is not a valid URL: {}", self.api.base_url, e))?;

    if self.api.timeout_ms == 0 {
      return Err(eyre!("api.timeout_ms must be greater than zero"));
    }
    if self.cache.schema_version == 0 {
      return Err(eyre!("cache.schema_version must be at least 1"));
    }
    if self.cache.storage_key.trim().is_empty() {
      return Err(eyre!("cache.storage_key must not be empty"));
    }

    Ok(())
  }

  /// The explicit configuration a [`PatronClient`](crate::client::PatronClient) is built from.
  pub fn client_config(&self) -> ClientConfig {
    ClientConfig {
      api: ApiConfig::new(self.api.base_url.clone())
        .with_default_timeout(Duration::from_millis(self.api.timeout_ms)),
      public_paths: self.auth.public_paths.clone(),
      cache: CacheConfig {
        storage_key: self.cache.storage_key.clone(),
        schema_version: self.cache.schema_version,
        whitelist: self.cache.whitelist.clone(),
        max_age: Duration::from_secs(self.cache.max_age_hours * 60 * 60),
        flush_interval: Duration::from_millis(self.cache.flush_interval_ms),
      },
    }
  }

  /// Get the API bearer token from the environment, if set.
  ///
  /// Checks PATRON_API_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("PATRON_API_TOKEN")
      .ok()
      .filter(|t| !t.trim().is_empty())
  }
}
