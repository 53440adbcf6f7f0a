use crate::error::*;
use data_encoding::BASE64;
use data_encoding::BASE64URL_NOPAD;
use openssl::ec::EcGroup;
use openssl::ec::EcKey;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::pkey::Private;
use openssl::rsa::Rsa;
use serde::Deserialize;
use serde::Serialize;
use std::ffi::OsString;
use std::path::Path;
use std::path::PathBuf;

/// The kind of an [`Identifier`].
#[derive(Deserialize, Serialize, Debug, Clone, Copy, Eq, PartialEq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierType {
  Dns,
  Ip,
}

/// This is a identifier for a resource that the ACME server
/// can provision certificates for (a domain or an IP address).
#[derive(Deserialize, Serialize, Debug, Clone, Eq, PartialEq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct Identifier {
  /// The type of identifier.
  pub r#type: IdentifierType,
  /// The identifier itself.
  pub value: String,
}

impl Identifier {
  pub fn dns(value: impl Into<String>) -> Self {
    Identifier {
      r#type: IdentifierType::Dns,
      value: value.into(),
    }
  }

  pub fn ip(value: impl Into<String>) -> Self {
    Identifier {
      r#type: IdentifierType::Ip,
      value: value.into(),
    }
  }
}

pub(crate) fn b64(data: &[u8]) -> String {
  BASE64URL_NOPAD.encode(data)
}

/// Decodes base64url, tolerating padding and the standard alphabet since
/// CAs hand out EAB keys in both forms.
pub(crate) fn b64_decode(data: &str) -> Option<Vec<u8>> {
  let trimmed = data.trim().trim_end_matches('=');
  if let Ok(bytes) = BASE64URL_NOPAD.decode(trimmed.as_bytes()) {
    return Some(bytes);
  }
  BASE64.decode(data.trim().as_bytes()).ok()
}

/// Generate a new RSA private key using the specified size,
/// using the system random.
pub fn gen_rsa_private_key(bits: u32) -> Result<PKey<Private>, Error> {
  let rsa = Rsa::generate(bits)?;
  let key = PKey::from_rsa(rsa)?;
  Ok(key)
}

/// Generate a new P-256 private key using the system random.
pub fn gen_ec_p256_private_key() -> Result<PKey<Private>, Error> {
  gen_ec_private_key(Nid::X9_62_PRIME256V1)
}

/// Generate a new P-384 private key using the system random.
pub fn gen_ec_p384_private_key() -> Result<PKey<Private>, Error> {
  gen_ec_private_key(Nid::SECP384R1)
}

fn gen_ec_private_key(curve: Nid) -> Result<PKey<Private>, Error> {
  let group = EcGroup::from_curve_name(curve)?;
  let ec = EcKey::generate(&group)?;
  let key = PKey::from_ec_key(ec)?;
  Ok(key)
}

fn sibling_tmp(path: &Path) -> PathBuf {
  let mut tmp: OsString = path.as_os_str().to_owned();
  tmp.push(".tmp");
  PathBuf::from(tmp)
}

/// Replaces the whole file at `path`, so readers never observe a partial
/// write. Secret files are restricted to the owner on unix.
pub(crate) async fn write_file_replace(
  path: &Path,
  contents: &[u8],
  secret: bool,
) -> Result<(), Error> {
  if let Some(parent) = path.parent() {
    tokio::fs::create_dir_all(parent).await?;
  }
  let tmp = sibling_tmp(path);
  tokio::fs::write(&tmp, contents).await?;

  #[cfg(unix)]
  {
    if secret {
      use std::os::unix::fs::PermissionsExt;
      let perms = std::fs::Permissions::from_mode(0o600);
      tokio::fs::set_permissions(&tmp, perms).await?;
    }
  }
  #[cfg(not(unix))]
  let _ = secret;

  tokio::fs::rename(&tmp, path).await?;
  Ok(())
}

/// Like [`write_file_replace`], but an existing file keeps its modification
/// time.
pub(crate) async fn write_file_keep_mtime(
  path: &Path,
  contents: &[u8],
  secret: bool,
) -> Result<(), Error> {
  let modified = tokio::fs::metadata(path)
    .await
    .and_then(|meta| meta.modified())
    .ok();
  write_file_replace(path, contents, secret).await?;
  if let Some(modified) = modified {
    let file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
    file.into_std().await.set_modified(modified)?;
  }
  Ok(())
}

/// Removes a file, treating an already missing file as success.
pub(crate) async fn remove_file_if_exists(path: &Path) -> Result<(), Error> {
  match tokio::fs::remove_file(path).await {
    Ok(()) => Ok(()),
    Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
    Err(err) => Err(err.into()),
  }
}
