use crate::eab::EabCredentials;
use crate::signer::KeyType;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Everything the engine reads from the host configuration.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
  /// The ACME endpoint. `<base_uri>/directory` is tried first, then the
  /// base URI itself.
  pub base_uri: String,
  /// Root for the account files, machine key and order cache.
  pub config_path: PathBuf,
  /// How many times order and challenge status is polled.
  #[serde(default = "default_retry_count")]
  pub retry_count: u32,
  /// Seconds between polls.
  #[serde(default = "default_retry_interval")]
  pub retry_interval: u64,
  #[serde(default)]
  pub cache: CacheSettings,
  /// Requested certificate lifetime in days, sent as the order `notAfter`.
  #[serde(default)]
  pub validity_days: Option<u32>,
  #[serde(default)]
  pub terms_of_service_agreed: bool,
  /// Contact email addresses for a new account.
  #[serde(default)]
  pub contacts: Vec<String>,
  #[serde(default)]
  pub eab: Option<EabCredentials>,
  #[serde(default)]
  pub default_key_type: KeyType,
  #[serde(default)]
  pub encrypt_secrets: bool,
  #[serde(default)]
  pub http: HttpSettings,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CacheSettings {
  /// Days a cached order may be reused. Zero or less disables the cache.
  #[serde(default = "default_reuse_days")]
  pub reuse_days: i64,
  /// Defaults to `<config_path>/orders`.
  #[serde(default)]
  pub path: Option<PathBuf>,
}

impl Default for CacheSettings {
  fn default() -> Self {
    CacheSettings {
      reuse_days: default_reuse_days(),
      path: None,
    }
  }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct HttpSettings {
  /// Overall timeout per request, in seconds.
  #[serde(default = "default_timeout")]
  pub timeout: u64,
  /// "1.2" or "1.3".
  #[serde(default)]
  pub min_tls_version: Option<String>,
  #[serde(default)]
  pub proxy: Option<String>,
}

impl Default for HttpSettings {
  fn default() -> Self {
    HttpSettings {
      timeout: default_timeout(),
      min_tls_version: None,
      proxy: None,
    }
  }
}

fn default_retry_count() -> u32 {
  4
}

fn default_retry_interval() -> u64 {
  2
}

fn default_reuse_days() -> i64 {
  1
}

fn default_timeout() -> u64 {
  100
}

impl Settings {
  pub fn new(base_uri: impl Into<String>, config_path: impl Into<PathBuf>) -> Self {
    Settings {
      base_uri: base_uri.into(),
      config_path: config_path.into(),
      retry_count: default_retry_count(),
      retry_interval: default_retry_interval(),
      cache: CacheSettings::default(),
      validity_days: None,
      terms_of_service_agreed: false,
      contacts: vec![],
      eab: None,
      default_key_type: KeyType::default(),
      encrypt_secrets: false,
      http: HttpSettings::default(),
    }
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_secs(self.retry_interval)
  }

  pub fn cache_path(&self) -> PathBuf {
    self
      .cache
      .path
      .clone()
      .unwrap_or_else(|| self.config_path.join("orders"))
  }

  pub fn machine_key_path(&self) -> PathBuf {
    self.config_path.join("machine.key")
  }
}
