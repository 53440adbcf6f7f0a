//! External Account Binding, as defined in
//! [RFC 8555 section 7.3.4](https://datatracker.ietf.org/doc/html/rfc8555#section-7.3.4).

use crate::error::*;
use crate::helpers::*;
use crate::jws::sign_flattened;
use crate::jws::FlattenedJws;
use crate::jws::Jwk;
use async_trait::async_trait;
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::sign::Signer;
use serde::Deserialize;
use serde::Serialize;

/// The MAC algorithms a CA may ask us to bind with.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum EabAlgorithm {
  Hs256,
  Hs384,
  Hs512,
}

impl EabAlgorithm {
  pub fn parse(alg: &str) -> Result<Self, Error> {
    match alg.to_ascii_uppercase().as_str() {
      "HS256" => Ok(EabAlgorithm::Hs256),
      "HS384" => Ok(EabAlgorithm::Hs384),
      "HS512" => Ok(EabAlgorithm::Hs512),
      _ => Err(Error::Configuration(format!(
        "unsupported external account binding algorithm {}",
        alg
      ))),
    }
  }

  pub fn name(&self) -> &'static str {
    match self {
      EabAlgorithm::Hs256 => "HS256",
      EabAlgorithm::Hs384 => "HS384",
      EabAlgorithm::Hs512 => "HS512",
    }
  }

  fn digest(&self) -> MessageDigest {
    match self {
      EabAlgorithm::Hs256 => MessageDigest::sha256(),
      EabAlgorithm::Hs384 => MessageDigest::sha384(),
      EabAlgorithm::Hs512 => MessageDigest::sha512(),
    }
  }
}

/// Externally issued credentials linking a new account to one the CA
/// already knows.
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct EabCredentials {
  pub key_identifier: String,
  /// The MAC key, base64url encoded.
  pub key: String,
  #[serde(default = "default_algorithm")]
  pub algorithm: String,
  /// Contact address the CA associated with these credentials, if any.
  #[serde(default)]
  pub contact: Option<String>,
}

fn default_algorithm() -> String {
  "HS256".to_string()
}

#[derive(Serialize)]
struct EabProtectedHeader<'a> {
  alg: &'static str,
  /// Key identifier from the Certificate Authority.
  kid: &'a str,
  /// Always the new-account URL, the only request that carries a binding.
  url: &'a str,
}

/// Produces the `externalAccountBinding` member of a new-account request:
/// the account JWK signed with the CA issued MAC key.
pub fn create_external_account_binding(
  credentials: &EabCredentials,
  account_jwk: &Jwk,
  url: &str,
) -> Result<FlattenedJws, Error> {
  let alg = EabAlgorithm::parse(&credentials.algorithm)?;
  let key = b64_decode(&credentials.key).ok_or_else(|| {
    Error::Configuration(
      "external account binding key is not valid base64url".to_string(),
    )
  })?;
  let hmac = PKey::hmac(&key)?;

  let header = EabProtectedHeader {
    alg: alg.name(),
    kid: &credentials.key_identifier,
    url,
  };
  let payload = serde_json::to_string(account_jwk)?;

  sign_flattened(&header, &payload, |data| {
    let mut signer = Signer::new(alg.digest(), &hmac)?;
    signer.update(data)?;
    Ok(signer.sign_to_vec()?)
  })
}

/// A CA specific helper that trades something the operator knows (an email
/// address or an API key) for EAB credentials.
#[async_trait]
pub trait EabCredentialExchange: Send + Sync {
  /// Menu label, e.g. "Register with email address".
  fn label(&self) -> &str;

  /// What to ask the operator for.
  fn prompt(&self) -> &str;

  /// Whether the input should be read like a password.
  fn secret_input(&self) -> bool {
    false
  }

  async fn exchange(&self, input: &str) -> Result<EabCredentials, Error>;
}
