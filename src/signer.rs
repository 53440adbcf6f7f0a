use crate::error::*;
use crate::helpers::*;
use crate::jws::JwsTool;
use openssl::pkey::PKey;
use serde::Deserialize;
use serde::Serialize;
use std::str::FromStr;
use std::sync::OnceLock;

const RSA_BITS: u32 = 3072;

/// The JWS algorithm of an account key.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum KeyType {
  #[serde(rename = "ES256")]
  Es256,
  #[serde(rename = "ES384")]
  Es384,
  #[serde(rename = "RS256")]
  Rs256,
}

impl Default for KeyType {
  fn default() -> Self {
    KeyType::Es256
  }
}

impl KeyType {
  pub fn as_str(&self) -> &'static str {
    match self {
      KeyType::Es256 => "ES256",
      KeyType::Es384 => "ES384",
      KeyType::Rs256 => "RS256",
    }
  }

  /// The algorithm to try when the server rejects this one.
  pub fn fallback(&self) -> KeyType {
    match self {
      KeyType::Rs256 => KeyType::Es256,
      KeyType::Es256 | KeyType::Es384 => KeyType::Rs256,
    }
  }
}

impl std::fmt::Display for KeyType {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for KeyType {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "ES256" => Ok(KeyType::Es256),
      "ES384" => Ok(KeyType::Es384),
      "RS256" => Ok(KeyType::Rs256),
      other => Err(Error::Configuration(format!(
        "unrecognized key type {}",
        other
      ))),
    }
  }
}

/// The persisted form of a [`Signer`].
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SignerExport {
  pub key_type: Option<String>,
  pub key_export: String,
}

/// Holds the account key. The key material never changes after
/// construction, so the signing tool built from it is memoized; a different
/// key type means a new `Signer`.
#[derive(Clone)]
pub struct Signer {
  key_type: Option<String>,
  key_pem: String,
  tool: OnceLock<JwsTool>,
}

impl std::fmt::Debug for Signer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Signer")
      .field("key_type", &self.key_type)
      .finish()
  }
}

impl Signer {
  /// Generates a new key of the given type.
  pub fn create(key_type: KeyType) -> Result<Signer, Error> {
    let key = match key_type {
      KeyType::Es256 => gen_ec_p256_private_key()?,
      KeyType::Es384 => gen_ec_p384_private_key()?,
      KeyType::Rs256 => gen_rsa_private_key(RSA_BITS)?,
    };
    let key_pem = map_transport_err(String::from_utf8(
      key.private_key_to_pem_pkcs8()?,
    ))?;
    let signer = Signer {
      key_type: Some(key_type.as_str().to_string()),
      key_pem,
      tool: OnceLock::new(),
    };
    signer.signing_tool()?;
    Ok(signer)
  }

  /// Reconstructs a signer from persisted material. Nothing is validated
  /// until the signing tool is first requested.
  pub fn from_export(export: SignerExport) -> Signer {
    Signer {
      key_type: export.key_type,
      key_pem: export.key_export,
      tool: OnceLock::new(),
    }
  }

  pub fn export(&self) -> SignerExport {
    SignerExport {
      key_type: self.key_type.clone(),
      key_export: self.key_pem.clone(),
    }
  }

  pub fn key_type(&self) -> Result<KeyType, Error> {
    match &self.key_type {
      Some(key_type) => key_type.parse(),
      None => Err(Error::Configuration("missing key type".to_string())),
    }
  }

  /// The JWS signer for this key, built on first use.
  pub fn signing_tool(&self) -> Result<&JwsTool, Error> {
    if let Some(tool) = self.tool.get() {
      return Ok(tool);
    }
    let key_type = self.key_type()?;
    let key = PKey::private_key_from_pem(self.key_pem.as_bytes())?;
    let tool = JwsTool::new(key_type.as_str(), key)?;
    Ok(self.tool.get_or_init(|| tool))
  }
}
