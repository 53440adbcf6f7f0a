use crate::error::*;
use crate::helpers::*;
use openssl::bn::BigNumContext;
use openssl::ecdsa::EcdsaSig;
use openssl::hash::hash;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::Id;
use openssl::pkey::PKey;
use openssl::pkey::Private;
use openssl::sign::Signer;
use serde::Deserialize;
use serde::Serialize;

#[derive(Serialize)]
struct JwsHeader<'a> {
  alg: &'a str,
  #[serde(skip_serializing_if = "Option::is_none")]
  nonce: Option<&'a str>,
  url: &'a str,
  #[serde(skip_serializing_if = "Option::is_none")]
  kid: Option<&'a str>,
  #[serde(skip_serializing_if = "Option::is_none")]
  jwk: Option<&'a Jwk>,
}

/// A public JSON Web Key. Members are declared in lexicographic order so the
/// serialized form is the RFC 7638 thumbprint input.
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
#[serde(untagged)]
pub enum Jwk {
  Ec {
    crv: String,
    kty: String,
    x: String,
    y: String,
  },
  Rsa {
    e: String,
    kty: String,
    n: String,
  },
}

impl Jwk {
  pub fn new(pkey: &PKey<Private>) -> Result<Jwk, Error> {
    match pkey.id() {
      Id::RSA => {
        let rsa = pkey.rsa()?;
        Ok(Jwk::Rsa {
          e: b64(&rsa.e().to_vec()),
          kty: "RSA".to_string(),
          n: b64(&rsa.n().to_vec()),
        })
      }
      Id::EC => {
        let ec = pkey.ec_key()?;
        let group = ec.group();
        let (crv, size) = curve_params(group.curve_name())?;
        let mut x = openssl::bn::BigNum::new()?;
        let mut y = openssl::bn::BigNum::new()?;
        let mut ctx = BigNumContext::new()?;
        ec.public_key()
          .affine_coordinates_gfp(group, &mut x, &mut y, &mut ctx)?;
        Ok(Jwk::Ec {
          crv: crv.to_string(),
          kty: "EC".to_string(),
          x: b64(&x.to_vec_padded(size)?),
          y: b64(&y.to_vec_padded(size)?),
        })
      }
      _ => Err(Error::Configuration(
        "only RSA and EC keys can be used for account signing".to_string(),
      )),
    }
  }

  /// The base64url SHA-256 thumbprint of this key.
  pub fn thumbprint(&self) -> Result<String, Error> {
    let canonical = serde_json::to_string(self)?;
    Ok(b64(&hash(MessageDigest::sha256(), canonical.as_bytes())?))
  }
}

fn curve_params(nid: Option<Nid>) -> Result<(&'static str, i32), Error> {
  match nid {
    Some(Nid::X9_62_PRIME256V1) => Ok(("P-256", 32)),
    Some(Nid::SECP384R1) => Ok(("P-384", 48)),
    _ => Err(Error::Configuration(
      "unsupported elliptic curve for account signing".to_string(),
    )),
  }
}

/// A JWS in the flattened JSON serialization.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FlattenedJws {
  pub protected: String,
  pub payload: String,
  pub signature: String,
}

pub(crate) fn sign_flattened<H, F>(
  header: &H,
  payload: &str,
  sign: F,
) -> Result<FlattenedJws, Error>
where
  H: Serialize,
  F: FnOnce(&[u8]) -> Result<Vec<u8>, Error>,
{
  let protected = b64(serde_json::to_string(header)?.as_bytes());
  let payload = b64(payload.as_bytes());
  let signature = b64(&sign(format!("{}.{}", protected, payload).as_bytes())?);

  Ok(FlattenedJws {
    protected,
    payload,
    signature,
  })
}

/// The concrete signer behind an account key: the key, its JWS algorithm
/// and its public JWK.
#[derive(Clone)]
pub struct JwsTool {
  alg: &'static str,
  key: PKey<Private>,
  jwk: Jwk,
}

impl std::fmt::Debug for JwsTool {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("JwsTool")
      .field("alg", &self.alg)
      .field("jwk", &self.jwk)
      .finish()
  }
}

impl JwsTool {
  pub(crate) fn new(alg: &'static str, key: PKey<Private>) -> Result<Self, Error> {
    let expected = match alg {
      "RS256" => Id::RSA,
      "ES256" | "ES384" => Id::EC,
      _ => {
        return Err(Error::Configuration(format!(
          "unsupported signature algorithm {}",
          alg
        )))
      }
    };
    if key.id() != expected {
      return Err(Error::Configuration(format!(
        "key material does not match algorithm {}",
        alg
      )));
    }
    let jwk = Jwk::new(&key)?;
    Ok(JwsTool { alg, key, jwk })
  }

  pub fn alg(&self) -> &'static str {
    self.alg
  }

  pub fn jwk(&self) -> &Jwk {
    &self.jwk
  }

  pub(crate) fn sign(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
    let digest = match self.alg {
      "ES384" => MessageDigest::sha384(),
      _ => MessageDigest::sha256(),
    };
    let mut signer = Signer::new(digest, &self.key)?;
    signer.update(data)?;
    let signature = signer.sign_to_vec()?;

    if self.key.id() == Id::EC {
      let size = match self.alg {
        "ES384" => 48,
        _ => 32,
      };
      let sig = EcdsaSig::from_der(&signature)?;
      let mut raw = sig.r().to_vec_padded(size)?;
      raw.extend(sig.s().to_vec_padded(size)?);
      return Ok(raw);
    }
    Ok(signature)
  }
}

/// Builds the signed body of an ACME request. Without a `kid` the public
/// key is embedded as `jwk`.
pub(crate) fn jws(
  url: &str,
  nonce: Option<&str>,
  payload: &str,
  tool: &JwsTool,
  kid: Option<&str>,
) -> Result<String, Error> {
  let header = JwsHeader {
    alg: tool.alg(),
    nonce,
    url,
    kid,
    jwk: if kid.is_none() { Some(tool.jwk()) } else { None },
  };

  let body = sign_flattened(&header, payload, |data| tool.sign(data))?;
  Ok(serde_json::to_string(&body)?)
}

/// The key authorization for a challenge token: `token.thumbprint`.
pub(crate) fn key_authorization(token: &str, jwk: &Jwk) -> Result<String, Error> {
  Ok(format!("{}.{}", token, jwk.thumbprint()?))
}
