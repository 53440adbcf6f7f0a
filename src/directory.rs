use crate::error::*;
use serde::Deserialize;
use serde::Serialize;
use tracing::instrument;
use tracing::warn;
use tracing::Level;

pub struct DirectoryBuilder {
  url: String,
  http_client: Option<reqwest::Client>,
}

impl DirectoryBuilder {
  /// `url` is the configured base URI of the CA, not necessarily the
  /// directory document itself.
  pub fn new(url: String) -> Self {
    DirectoryBuilder {
      url,
      http_client: None,
    }
  }

  pub fn http_client(&mut self, http_client: reqwest::Client) -> &mut Self {
    self.http_client = Some(http_client);
    self
  }

  /// Fetches `<base>/directory`. If that fails, the base URI is fetched
  /// once as the directory document, for CAs that publish it there.
  #[instrument(level = Level::INFO, name = "acme2_lifecycle::DirectoryBuilder::build", err, skip(self), fields(url = %self.url))]
  pub async fn build(&mut self) -> Result<ServiceDirectory, Error> {
    let http_client = self
      .http_client
      .clone()
      .unwrap_or_else(reqwest::Client::new);

    let primary = format!("{}/directory", self.url.trim_end_matches('/'));
    match fetch(&http_client, &primary).await {
      Ok(dir) => Ok(dir),
      Err(err) => {
        warn!(error = %err, url = %primary, "Unable to get directory, retrying with the base URI");
        fetch(&http_client, &self.url).await
      }
    }
  }
}

async fn fetch(
  http_client: &reqwest::Client,
  url: &str,
) -> Result<ServiceDirectory, Error> {
  let resp = http_client.get(url).send().await?;
  let status = resp.status();
  if !status.is_success() {
    let mut err = resp.json::<ServerError>().await.unwrap_or_default();
    err.status = Some(status.as_u16());
    return Err(err.into());
  }
  resp.json::<ServerResult<ServiceDirectory>>().await?.into()
}

/// The resource URLs a CA publishes. Fetched once per session.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDirectory {
  #[serde(rename = "newNonce")]
  pub new_nonce_url: String,
  #[serde(rename = "newAccount")]
  pub new_account_url: String,
  #[serde(rename = "newOrder")]
  pub new_order_url: String,
  #[serde(rename = "revokeCert")]
  pub revoke_cert_url: String,
  #[serde(rename = "keyChange", default)]
  pub key_change_url: Option<String>,
  #[serde(rename = "newAuthz", default)]
  pub new_authz_url: Option<String>,
  #[serde(default)]
  pub meta: Option<DirectoryMeta>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryMeta {
  pub terms_of_service: Option<String>,
  pub website: Option<String>,
  pub caa_identities: Option<Vec<String>>,
  pub external_account_required: Option<bool>,
}

impl ServiceDirectory {
  pub fn terms_of_service(&self) -> Option<&str> {
    self.meta.as_ref()?.terms_of_service.as_deref()
  }

  pub fn external_account_required(&self) -> bool {
    self
      .meta
      .as_ref()
      .and_then(|meta| meta.external_account_required)
      .unwrap_or(false)
  }
}
