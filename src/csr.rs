use crate::error::*;
use crate::helpers::*;
use crate::signer::KeyType;
use async_trait::async_trait;
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::pkey::Private;
use openssl::stack::Stack;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::X509Name;
use openssl::x509::X509Req;

/// Longest common name X.509 allows.
const MAX_CN_LEN: usize = 64;

/// A signed request and the private key it was made for.
pub struct CsrBundle {
  /// DER encoded CSR.
  pub csr: Vec<u8>,
  pub private_key: PKey<Private>,
}

/// Produces CSRs for orders. Implementations decide key type, extensions
/// and whether keys are reused.
#[async_trait]
pub trait CsrSource: Send + Sync {
  /// A stable description of everything that shapes the CSR. Orders whose
  /// CSR would differ must not share a cache entry.
  fn cache_fingerprint(&self) -> String;

  /// Builds a CSR for `common_name` and `identifiers`. `private_key` is the
  /// key already cached for this order, if any.
  async fn generate(
    &self,
    common_name: &str,
    identifiers: &[Identifier],
    private_key: Option<PKey<Private>>,
  ) -> Result<CsrBundle, Error>;
}

/// A plain CSR: a fresh key of the given type, the common name as subject
/// and every identifier as a SAN.
#[derive(Debug, Clone)]
pub struct AutomaticCsr {
  key_type: KeyType,
}

impl AutomaticCsr {
  pub fn new(key_type: KeyType) -> Self {
    AutomaticCsr { key_type }
  }

  fn gen_key(&self) -> Result<PKey<Private>, Error> {
    match self.key_type {
      KeyType::Es256 => gen_ec_p256_private_key(),
      KeyType::Es384 => gen_ec_p384_private_key(),
      KeyType::Rs256 => gen_rsa_private_key(3072),
    }
  }
}

#[async_trait]
impl CsrSource for AutomaticCsr {
  fn cache_fingerprint(&self) -> String {
    format!("automatic-{}", self.key_type)
  }

  async fn generate(
    &self,
    common_name: &str,
    identifiers: &[Identifier],
    private_key: Option<PKey<Private>>,
  ) -> Result<CsrBundle, Error> {
    let private_key = match private_key {
      Some(key) => key,
      None => self.gen_key()?,
    };
    let csr = gen_csr(&private_key, common_name, identifiers)?;
    Ok(CsrBundle {
      csr: csr.to_der()?,
      private_key,
    })
  }
}

fn gen_csr(
  pkey: &PKey<Private>,
  common_name: &str,
  identifiers: &[Identifier],
) -> Result<X509Req, Error> {
  if identifiers.is_empty() {
    return Err(Error::Validation(
      "You need to supply at least one identifier",
    ));
  }

  let mut builder = X509Req::builder()?;
  let mut name = X509Name::builder()?;
  if common_name.len() <= MAX_CN_LEN {
    name.append_entry_by_text("CN", common_name)?;
  }
  builder.set_subject_name(&name.build())?;

  // Add all identifiers as SANs
  let san_extension = {
    let mut san = SubjectAlternativeName::new();
    for identifier in identifiers {
      match identifier.r#type {
        IdentifierType::Dns => san.dns(&identifier.value),
        IdentifierType::Ip => san.ip(&identifier.value),
      };
    }
    san.build(&builder.x509v3_context(None))?
  };
  let mut stack = Stack::new()?;
  stack.push(san_extension)?;
  builder.add_extensions(&stack)?;

  builder.set_pubkey(pkey)?;
  builder.sign(pkey, MessageDigest::sha256())?;

  Ok(builder.build())
}
