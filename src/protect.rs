use crate::error::*;
use crate::helpers::*;
use openssl::rand::rand_bytes;
use openssl::symm::decrypt_aead;
use openssl::symm::encrypt_aead;
use openssl::symm::Cipher;
use std::path::Path;
use tracing::debug;
use tracing::info;

const SEALED_PREFIX: &str = "enc:v1:";
const KEY_LEN: usize = 32;
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Seals secrets written to disk under the current encryption policy.
///
/// Sealed values are bound to the machine key kept in the configuration
/// root. Plain values are passed through, so turning encryption on or off
/// only needs a re-encrypt pass.
#[derive(Clone)]
pub struct Protector {
  key: Option<Vec<u8>>,
  encrypt: bool,
}

impl std::fmt::Debug for Protector {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Protector")
      .field("has_key", &self.key.is_some())
      .field("encrypt", &self.encrypt)
      .finish()
  }
}

impl Protector {
  /// Stores secrets as plain text and cannot open sealed ones.
  pub fn plain() -> Self {
    Protector {
      key: None,
      encrypt: false,
    }
  }

  pub fn with_key(key: Vec<u8>, encrypt: bool) -> Result<Self, Error> {
    if key.len() != KEY_LEN {
      return Err(Error::Configuration(format!(
        "machine key must be {} bytes",
        KEY_LEN
      )));
    }
    Ok(Protector {
      key: Some(key),
      encrypt,
    })
  }

  /// Loads the machine key at `key_path`, creating it on first use.
  pub async fn machine_bound(key_path: &Path, encrypt: bool) -> Result<Self, Error> {
    let key = match tokio::fs::read(key_path).await {
      Ok(key) => key,
      Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
        let mut key = vec![0u8; KEY_LEN];
        rand_bytes(&mut key)?;
        write_file_replace(key_path, &key, true).await?;
        info!(path = %key_path.display(), "Created machine key");
        key
      }
      Err(err) => return Err(err.into()),
    };
    Protector::with_key(key, encrypt)
  }

  pub fn encrypts(&self) -> bool {
    self.encrypt
  }

  pub fn protect(&self, plain: &str) -> Result<String, Error> {
    let key = match (&self.key, self.encrypt) {
      (Some(key), true) => key,
      _ => return Ok(plain.to_string()),
    };

    let mut iv = [0u8; IV_LEN];
    rand_bytes(&mut iv)?;
    let mut tag = [0u8; TAG_LEN];
    let sealed = encrypt_aead(
      Cipher::aes_256_gcm(),
      key,
      Some(&iv),
      &[],
      plain.as_bytes(),
      &mut tag,
    )?;

    let mut blob = Vec::with_capacity(IV_LEN + TAG_LEN + sealed.len());
    blob.extend_from_slice(&iv);
    blob.extend_from_slice(&tag);
    blob.extend_from_slice(&sealed);
    Ok(format!("{}{}", SEALED_PREFIX, b64(&blob)))
  }

  pub fn unprotect(&self, stored: &str) -> Result<String, Error> {
    let encoded = match stored.strip_prefix(SEALED_PREFIX) {
      Some(encoded) => encoded,
      None => return Ok(stored.to_string()),
    };
    debug!("Opening sealed secret");

    let key = self.key.as_ref().ok_or_else(|| {
      Error::Protection(
        "the data is encrypted but no machine key is available".to_string(),
      )
    })?;
    let blob = b64_decode(encoded)
      .filter(|blob| blob.len() >= IV_LEN + TAG_LEN)
      .ok_or_else(|| Error::Protection("sealed data is truncated".to_string()))?;
    let (iv, rest) = blob.split_at(IV_LEN);
    let (tag, sealed) = rest.split_at(TAG_LEN);

    let plain = decrypt_aead(Cipher::aes_256_gcm(), key, Some(iv), &[], sealed, tag)
      .map_err(|_| {
        Error::Protection(
          "decryption failed, the data was probably encrypted on another machine or with a different machine key"
            .to_string(),
        )
      })?;
    String::from_utf8(plain)
      .map_err(|_| Error::Protection("sealed data is not text".to_string()))
  }
}
