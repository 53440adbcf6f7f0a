use crate::error::*;
use crate::helpers::*;
use crate::jws::key_authorization;
use crate::protect::Protector;
use crate::signer::Signer;
use crate::signer::SignerExport;
use serde::Deserialize;
use serde::Serialize;
use std::path::Path;
use std::path::PathBuf;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::instrument;
use tracing::warn;
use tracing::Level;

const SIGNER_FILE: &str = "signer.json";
const ACCOUNT_FILE: &str = "account.json";

/// The status of an [`Account`].
///
/// Possible values are "valid", "deactivated",
/// and "revoked". The value "deactivated" should be used to indicate client-
/// initiated deactivation whereas "revoked" should be used to indicate server-
/// initiated deactivation.
#[derive(Serialize, Deserialize, Eq, PartialEq, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub enum AccountStatus {
  Valid,
  Deactivated,
  Revoked,
}

/// What the server knows about an account, plus the account URL it
/// assigned, which is also the `kid` of every later request.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AccountDetails {
  /// The account URL.
  #[serde(default)]
  pub kid: String,
  /// The status of this account.
  pub status: AccountStatus,
  /// An array of URLs that the server can use to contact the client for
  /// issues related to this account.
  #[serde(default)]
  pub contact: Option<Vec<String>>,
  /// Including this field in a newAccount request, with a value of true,
  /// indicates the client's agreement with the terms of service.
  #[serde(default)]
  pub terms_of_service_agreed: Option<bool>,
  /// A URL from which a list of orders submitted by this account can be
  /// fetched.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub orders: Option<String>,
}

/// An ACME account: the server side identity and the key that proves it.
#[derive(Debug, Clone)]
pub struct Account {
  pub details: AccountDetails,
  pub signer: Signer,
}

impl Account {
  /// The account ID, which is the account URL.
  pub fn id(&self) -> &str {
    &self.details.kid
  }

  /// The key authorization a challenge response must publish for `token`.
  pub fn key_authorization(&self, token: &str) -> Result<String, Error> {
    key_authorization(token, self.signer.signing_tool()?.jwk())
  }
}

/// Keeps the default account of a configuration root on disk.
///
/// The signer and the account details live in separate files, so a signer
/// that can no longer be read does not take the account identity with it.
#[derive(Debug, Clone)]
pub struct AccountStore {
  root: PathBuf,
  protector: Protector,
}

impl AccountStore {
  pub fn new(root: impl Into<PathBuf>, protector: Protector) -> Self {
    AccountStore {
      root: root.into(),
      protector,
    }
  }

  fn signer_path(&self) -> PathBuf {
    self.root.join(SIGNER_FILE)
  }

  fn account_path(&self) -> PathBuf {
    self.root.join(ACCOUNT_FILE)
  }

  /// Loads the persisted account. Missing files mean there is no account
  /// yet; unreadable ones are logged and treated the same way.
  #[instrument(level = Level::DEBUG, name = "acme2_lifecycle::AccountStore::load_default", skip(self), fields(root = %self.root.display()))]
  pub async fn load_default(&self) -> Option<Account> {
    match self.load().await {
      Ok(account) => account,
      Err(err) => {
        warn!(error = %err, "Unable to load the stored account, a new one will be created");
        None
      }
    }
  }

  async fn load(&self) -> Result<Option<Account>, Error> {
    let signer_text = match read_optional(&self.signer_path()).await? {
      Some(text) => text,
      None => {
        debug!("No stored signer");
        return Ok(None);
      }
    };
    let account_text = match read_optional(&self.account_path()).await? {
      Some(text) => text,
      None => {
        debug!("No stored account details");
        return Ok(None);
      }
    };

    let export: SignerExport =
      serde_json::from_str(&self.protector.unprotect(&signer_text)?)?;
    let signer = Signer::from_export(export);
    signer.signing_tool()?;
    let details: AccountDetails = serde_json::from_str(&account_text)?;

    info!(account = %details.kid, "Loaded stored account");
    Ok(Some(Account { details, signer }))
  }

  /// Writes the signer (protected) and the account details.
  #[instrument(level = Level::DEBUG, name = "acme2_lifecycle::AccountStore::save_default", err, skip(self, account), fields(account = %account.details.kid))]
  pub async fn save_default(&self, account: &Account) -> Result<(), Error> {
    self.save_signer(&account.signer).await?;
    let details = serde_json::to_string_pretty(&account.details)?;
    write_file_replace(&self.account_path(), details.as_bytes(), false).await
  }

  async fn save_signer(&self, signer: &Signer) -> Result<(), Error> {
    let export = serde_json::to_string(&signer.export())?;
    let sealed = self.protector.protect(&export)?;
    write_file_replace(&self.signer_path(), sealed.as_bytes(), true).await
  }

  /// Rewrites the signer under the current encryption policy.
  #[instrument(level = Level::INFO, name = "acme2_lifecycle::AccountStore::reencrypt", err, skip(self))]
  pub async fn reencrypt(&self) -> Result<(), Error> {
    let path = self.signer_path();
    let stored = match read_optional(&path).await? {
      Some(stored) => stored,
      None => {
        debug!("No stored signer to re-encrypt");
        return Ok(());
      }
    };
    let plain = match self.protector.unprotect(&stored) {
      Ok(plain) => plain,
      Err(err) => {
        error!(
          error = %err,
          "Unable to decrypt the account signer. If the configuration was copied from another machine, create a new account there instead"
        );
        return Err(err);
      }
    };
    let sealed = self.protector.protect(&plain)?;
    write_file_replace(&path, sealed.as_bytes(), true).await?;
    info!(encrypted = self.protector.encrypts(), "Re-encrypted account signer");
    Ok(())
  }
}

pub(crate) async fn read_optional(path: &Path) -> Result<Option<String>, Error> {
  match tokio::fs::read_to_string(path).await {
    Ok(text) => Ok(Some(text)),
    Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
    Err(err) => Err(err.into()),
  }
}
