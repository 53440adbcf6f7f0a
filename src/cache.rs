use crate::account::read_optional;
use crate::error::*;
use crate::helpers::*;
use crate::order::OrderDetails;
use crate::protect::Protector;
use data_encoding::HEXLOWER;
use openssl::hash::hash;
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::pkey::Private;
use serde_json::json;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::SystemTime;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::instrument;
use tracing::warn;
use tracing::Level;

const ORDER_SUFFIX: &str = ".order.json";
const KEYS_SUFFIX: &str = ".order.keys";

/// Computes the cache key of an order: a hash over everything that decides
/// whether an earlier order can stand in for this one. Identifier order
/// does not matter.
pub fn fingerprint(
  account_id: &str,
  common_name: &str,
  identifiers: &[Identifier],
  csr_fingerprint: &str,
  key_cache_path: Option<&Path>,
) -> Result<String, Error> {
  let mut values: Vec<&str> = identifiers.iter().map(|id| id.value.as_str()).collect();
  values.sort_unstable();
  let input = serde_json::to_string(&json!([
    account_id,
    common_name,
    values,
    csr_fingerprint,
    key_cache_path.map(|p| p.to_string_lossy().into_owned()),
  ]))?;
  Ok(HEXLOWER.encode(&hash(MessageDigest::sha256(), input.as_bytes())?))
}

/// A cached order and the private key made for it.
#[derive(Debug, Clone)]
pub struct CachedOrder {
  pub details: OrderDetails,
  pub key_file: PathBuf,
}

/// Orders kept on disk as `<fingerprint>.order.json` with the private key
/// beside them in `<fingerprint>.order.keys`.
#[derive(Debug, Clone)]
pub struct OrderCache {
  path: PathBuf,
  reuse_days: i64,
  protector: Protector,
}

impl OrderCache {
  pub fn new(path: impl Into<PathBuf>, reuse_days: i64, protector: Protector) -> Self {
    OrderCache {
      path: path.into(),
      reuse_days,
      protector,
    }
  }

  pub fn enabled(&self) -> bool {
    self.reuse_days > 0
  }

  fn max_age(&self) -> Duration {
    Duration::from_secs(self.reuse_days.max(0) as u64 * 86_400)
  }

  pub fn order_file(&self, key: &str) -> PathBuf {
    self.path.join(format!("{}{}", key, ORDER_SUFFIX))
  }

  pub fn key_file(&self, key: &str) -> PathBuf {
    self.path.join(format!("{}{}", key, KEYS_SUFFIX))
  }

  fn is_expired(&self, modified: SystemTime) -> bool {
    match SystemTime::now().duration_since(modified) {
      Ok(age) => age > self.max_age(),
      Err(_) => false,
    }
  }

  /// Returns the cached order for `key` if it is young enough and its key
  /// file still exists. Stale files are cleaned up first. Unreadable
  /// entries count as a miss.
  #[instrument(level = Level::DEBUG, name = "acme2_lifecycle::OrderCache::lookup", skip(self))]
  pub async fn lookup(&self, key: &str) -> Option<CachedOrder> {
    self.housekeeping().await;

    let order_file = self.order_file(key);
    let modified = match tokio::fs::metadata(&order_file).await {
      Ok(meta) => meta.modified().ok()?,
      Err(_) => {
        debug!("No cached order");
        return None;
      }
    };
    if self.is_expired(modified) {
      debug!("Cached order is too old");
      return None;
    }

    let key_file = self.key_file(key);
    if !tokio::fs::try_exists(&key_file).await.unwrap_or(false) {
      debug!("Cached order has no private key");
      return None;
    }

    let text = match read_optional(&order_file).await {
      Ok(Some(text)) => text,
      Ok(None) => return None,
      Err(err) => {
        warn!(error = %err, "Unable to read cached order");
        return None;
      }
    };
    match serde_json::from_str::<OrderDetails>(&text) {
      Ok(details) => Some(CachedOrder { details, key_file }),
      Err(err) => {
        warn!(error = %err, file = %order_file.display(), "Cached order is corrupt");
        None
      }
    }
  }

  pub async fn save(&self, key: &str, details: &OrderDetails) -> Result<(), Error> {
    let json = serde_json::to_string_pretty(details)?;
    write_file_replace(&self.order_file(key), json.as_bytes(), false).await
  }

  /// Rewrites an existing entry. Its age is left alone, so refreshing an
  /// order never extends the reuse window.
  pub async fn update(&self, key: &str, details: &OrderDetails) -> Result<(), Error> {
    let json = serde_json::to_string_pretty(details)?;
    write_file_keep_mtime(&self.order_file(key), json.as_bytes(), false).await
  }

  /// Removes both files of an entry.
  pub async fn delete(&self, key: &str) {
    for file in [self.order_file(key), self.key_file(key)] {
      if let Err(err) = remove_file_if_exists(&file).await {
        warn!(error = %err, file = %file.display(), "Unable to delete cache file");
      }
    }
  }

  pub async fn save_key(&self, key: &str, private_key: &PKey<Private>) -> Result<(), Error> {
    let pem = map_transport_err(String::from_utf8(private_key.private_key_to_pem_pkcs8()?))?;
    let sealed = self.protector.protect(&pem)?;
    write_file_replace(&self.key_file(key), sealed.as_bytes(), true).await
  }

  /// The private key cached for `key`. A key that cannot be read is
  /// logged and treated as absent.
  pub async fn load_key(&self, key: &str) -> Option<PKey<Private>> {
    let stored = match read_optional(&self.key_file(key)).await {
      Ok(stored) => stored?,
      Err(err) => {
        warn!(error = %err, "Unable to read cached private key");
        return None;
      }
    };
    let opened = self
      .protector
      .unprotect(&stored)
      .and_then(|pem| Ok(PKey::private_key_from_pem(pem.as_bytes())?));
    match opened {
      Ok(key) => Some(key),
      Err(err) => {
        warn!(error = %err, "Cached private key is unusable");
        None
      }
    }
  }

  async fn files(&self) -> Result<Vec<PathBuf>, Error> {
    let mut files = vec![];
    let mut entries = match tokio::fs::read_dir(&self.path).await {
      Ok(entries) => entries,
      Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(files),
      Err(err) => return Err(err.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
      if entry.file_type().await?.is_file() {
        files.push(entry.path());
      }
    }
    Ok(files)
  }

  /// Deletes every file older than the reuse window.
  pub async fn housekeeping(&self) {
    let files = match self.files().await {
      Ok(files) => files,
      Err(err) => {
        warn!(error = %err, "Unable to list order cache");
        return;
      }
    };
    for file in files {
      let modified = match tokio::fs::metadata(&file).await.and_then(|m| m.modified()) {
        Ok(modified) => modified,
        Err(_) => continue,
      };
      if self.is_expired(modified) {
        debug!(file = %file.display(), "Removing expired cache file");
        if let Err(err) = remove_file_if_exists(&file).await {
          warn!(error = %err, file = %file.display(), "Unable to delete cache file");
        }
      }
    }
  }

  /// Deletes every file in the cache.
  #[instrument(level = Level::INFO, name = "acme2_lifecycle::OrderCache::clear", err, skip(self))]
  pub async fn clear(&self) -> Result<(), Error> {
    let files = self.files().await?;
    let count = files.len();
    for file in files {
      remove_file_if_exists(&file).await?;
    }
    info!(count, "Cleared order cache");
    Ok(())
  }

  /// Rewrites every cached private key under the current encryption
  /// policy. Keys that cannot be decrypted are reported and left alone.
  #[instrument(level = Level::INFO, name = "acme2_lifecycle::OrderCache::reencrypt", err, skip(self))]
  pub async fn reencrypt(&self) -> Result<(), Error> {
    for file in self.files().await? {
      let is_key = file
        .file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.ends_with(KEYS_SUFFIX))
        .unwrap_or(false);
      if !is_key {
        continue;
      }

      let stored = tokio::fs::read_to_string(&file).await?;
      let plain = match self.protector.unprotect(&stored) {
        Ok(plain) => plain,
        Err(err) => {
          error!(error = %err, file = %file.display(), "Unable to decrypt cached private key");
          continue;
        }
      };
      let sealed = self.protector.protect(&plain)?;
      write_file_keep_mtime(&file, sealed.as_bytes(), true).await?;
      debug!(file = %file.display(), "Re-encrypted cached private key");
    }
    Ok(())
  }
}
