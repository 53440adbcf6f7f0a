use crate::account::Account;
use crate::account::AccountDetails;
use crate::authorization::Authorization;
use crate::authorization::Challenge;
use crate::directory::ServiceDirectory;
use crate::eab::create_external_account_binding;
use crate::eab::EabCredentials;
use crate::error::*;
use crate::helpers::*;
use crate::jws::jws;
use crate::order::OrderDetails;
use crate::order::OrderPayload;
use crate::policy::retry_bad_nonce;
use crate::policy::with_backoff;
use crate::policy::NonceSource;
use crate::signer::Signer;
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::sync::RwLock;
use tracing::debug;
use tracing::debug_span;
use tracing::field;
use tracing::instrument;
use tracing::Level;
use tracing::Span;
use tracing_futures::Instrument;

const CONTENT_TYPE_JOSE: &str = "application/jose+json";
const ACCEPT_PEM_CHAIN: &str = "application/pem-certificate-chain";

/// How a request identifies its signer: the embedded public key for
/// new-account, the account URL for everything after.
#[derive(Clone, Copy)]
enum Auth<'a> {
  Jwk(&'a Signer),
  Kid(&'a Signer, &'a str),
}

impl<'a> Auth<'a> {
  fn signer(&self) -> &'a Signer {
    match *self {
      Auth::Jwk(signer) => signer,
      Auth::Kid(signer, _) => signer,
    }
  }

  fn kid(&self) -> Option<&'a str> {
    match *self {
      Auth::Jwk(_) => None,
      Auth::Kid(_, kid) => Some(kid),
    }
  }
}

#[derive(Debug)]
pub(crate) struct RawResponse {
  pub(crate) headers: HeaderMap,
  pub(crate) body: Vec<u8>,
}

impl RawResponse {
  fn location(&self) -> Option<String> {
    self
      .headers
      .get(reqwest::header::LOCATION)
      .and_then(|hv| hv.to_str().ok())
      .map(str::to_string)
  }

  fn require_location(&self, what: &'static str) -> Result<String, Error> {
    self.location().ok_or_else(|| transport_err(what))
  }

  fn decode<T: DeserializeOwned>(&self) -> Result<T, Error> {
    Ok(serde_json::from_slice(&self.body)?)
  }
}

fn extract_nonce(headers: &HeaderMap) -> Result<Option<String>, Error> {
  match headers.get("replay-nonce") {
    Some(hv) => Ok(Some(map_transport_err(hv.to_str())?.to_string())),
    None => Ok(None),
  }
}

fn problem_from(status: StatusCode, body: &[u8]) -> ServerError {
  let mut err: ServerError = serde_json::from_slice(body).unwrap_or_default();
  err.status = Some(status.as_u16());
  if err.detail.is_none() && err.r#type.is_none() {
    err.detail = Some(String::from_utf8_lossy(body).into_owned());
  }
  err
}

/// The authenticated connection to one CA: HTTP client, directory, the
/// current nonce and the account requests are signed with.
///
/// Every signed call goes through a single gated pipeline, which admits one
/// logical call at a time and applies the backoff and bad-nonce policies.
pub struct Session {
  http_client: reqwest::Client,
  directory: ServiceDirectory,
  nonce: Mutex<Option<String>>,
  gate: Mutex<()>,
  account: RwLock<Option<Arc<Account>>>,
}

impl std::fmt::Debug for Session {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Session")
      .field("directory", &self.directory)
      .finish()
  }
}

#[async_trait]
impl NonceSource for Session {
  async fn refresh_nonce(&self) -> Result<(), Error> {
    let nonce = self.fetch_nonce().await?;
    *self.nonce.lock().await = Some(nonce);
    Ok(())
  }
}

impl Session {
  pub fn new(http_client: reqwest::Client, directory: ServiceDirectory) -> Self {
    Session {
      http_client,
      directory,
      nonce: Mutex::new(None),
      gate: Mutex::new(()),
      account: RwLock::new(None),
    }
  }

  pub fn directory(&self) -> &ServiceDirectory {
    &self.directory
  }

  pub async fn set_account(&self, account: Arc<Account>) {
    *self.account.write().await = Some(account);
  }

  /// The account requests are signed with.
  pub async fn account(&self) -> Result<Arc<Account>, Error> {
    self.account.read().await.clone().ok_or_else(|| {
      Error::Configuration("the session has no account yet".to_string())
    })
  }

  async fn fetch_nonce(&self) -> Result<String, Error> {
    let resp = self
      .http_client
      .head(&self.directory.new_nonce_url)
      .send()
      .await?;
    match extract_nonce(resp.headers())? {
      Some(nonce) => Ok(nonce),
      None => Err(transport_err("newNonce request must return a nonce")),
    }
  }

  async fn take_nonce(&self) -> Result<String, Error> {
    let stored = self.nonce.lock().await.take();
    match stored {
      Some(nonce) => Ok(nonce),
      None => self.fetch_nonce().await,
    }
  }

  /// One signed POST. Keeps the nonce the server hands back and turns an
  /// error status into a [`ServerError`].
  async fn post_once(
    &self,
    url: &str,
    payload: &str,
    auth: Auth<'_>,
    accept: Option<&str>,
  ) -> Result<RawResponse, Error> {
    let nonce = self.take_nonce().await?;
    let tool = auth.signer().signing_tool()?;
    let body = jws(url, Some(&nonce), payload, tool, auth.kid())?;

    let mut req = self
      .http_client
      .post(url)
      .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE_JOSE);
    if let Some(accept) = accept {
      req = req.header(reqwest::header::ACCEPT, accept);
    }
    let resp = req.body(body).send().await?;

    let status = resp.status();
    let headers = resp.headers().clone();
    if let Some(nonce) = extract_nonce(&headers)? {
      *self.nonce.lock().await = Some(nonce);
    }
    let body = resp.bytes().await?.to_vec();

    if !status.is_success() {
      return Err(problem_from(status, &body).into());
    }
    Ok(RawResponse { headers, body })
  }

  /// Runs one logical call. The gate is taken once here; the retries inside
  /// the policies reuse it instead of queueing again.
  async fn execute(
    &self,
    op: &'static str,
    url: &str,
    payload: &str,
    auth: Auth<'_>,
    accept: Option<&str>,
  ) -> Result<RawResponse, Error> {
    let _gate = self.gate.lock().await;
    let span = debug_span!("acme_call", op, url);
    with_backoff(move || {
      retry_bad_nonce(self, move || self.post_once(url, payload, auth, accept))
    })
    .instrument(span)
    .await
  }

  async fn execute_as_account(
    &self,
    op: &'static str,
    url: &str,
    payload: &str,
    accept: Option<&str>,
  ) -> Result<RawResponse, Error> {
    let account = self.account().await?;
    let auth = Auth::Kid(&account.signer, &account.details.kid);
    self.execute(op, url, payload, auth, accept).await
  }

  /// Registers `signer` with the CA, binding it to an external account when
  /// credentials are given. The returned details carry the account URL.
  #[instrument(level = Level::INFO, name = "acme2_lifecycle::Session::create_account", err, skip(self, signer, eab), fields(contact = ?contact, eab = eab.is_some(), account_id = field::Empty))]
  pub async fn create_account(
    &self,
    signer: &Signer,
    contact: &[String],
    terms_of_service_agreed: bool,
    eab: Option<&EabCredentials>,
  ) -> Result<AccountDetails, Error> {
    let url = self.directory.new_account_url.as_str();

    let mut payload = json!({
      "contact": contact,
      "termsOfServiceAgreed": terms_of_service_agreed,
    });
    if let Some(eab) = eab {
      let jwk = signer.signing_tool()?.jwk();
      let binding = create_external_account_binding(eab, jwk, url)?;
      payload["externalAccountBinding"] = serde_json::to_value(binding)?;
    }
    let payload = serde_json::to_string(&payload)?;

    let raw = self
      .execute("create-account", url, &payload, Auth::Jwk(signer), None)
      .await?;
    let mut details: AccountDetails = raw.decode()?;
    details.kid =
      raw.require_location("mandatory location header in newAccount not present")?;
    Span::current().record("account_id", &field::display(&details.kid));
    Ok(details)
  }

  /// Replaces the contact list of the current account.
  #[instrument(level = Level::INFO, name = "acme2_lifecycle::Session::update_account", err, skip(self))]
  pub async fn update_account(
    &self,
    contact: &[String],
  ) -> Result<AccountDetails, Error> {
    let account = self.account().await?;
    let payload = serde_json::to_string(&json!({ "contact": contact }))?;
    let raw = self
      .execute_as_account("update-account", &account.details.kid, &payload, None)
      .await?;
    let mut details: AccountDetails = raw.decode()?;
    details.kid = account.details.kid.clone();
    Ok(details)
  }

  #[instrument(level = Level::INFO, name = "acme2_lifecycle::Session::create_order", err, skip(self), fields(order = field::Empty))]
  pub async fn create_order(
    &self,
    identifiers: &[Identifier],
    not_after: Option<&str>,
  ) -> Result<OrderDetails, Error> {
    let mut payload = json!({ "identifiers": identifiers });
    if let Some(not_after) = not_after {
      payload["notAfter"] = json!(not_after);
    }
    let payload = serde_json::to_string(&payload)?;

    let url = self.directory.new_order_url.as_str();
    let raw = self
      .execute_as_account("create-order", url, &payload, None)
      .await?;
    let order_url =
      raw.require_location("mandatory location header in newOrder response not present")?;
    Span::current().record("order", &field::display(&order_url));

    Ok(OrderDetails {
      url: order_url,
      payload: raw.decode::<OrderPayload>()?,
    })
  }

  #[instrument(level = Level::DEBUG, name = "acme2_lifecycle::Session::get_order", err, skip(self), fields(status = field::Empty))]
  pub async fn get_order(&self, url: &str) -> Result<OrderDetails, Error> {
    if url.is_empty() {
      return Err(Error::Configuration("order URL is missing".to_string()));
    }
    let raw = self.execute_as_account("get-order", url, "", None).await?;
    let payload: OrderPayload = raw.decode()?;
    Span::current().record("status", &field::debug(&payload.status));
    Ok(OrderDetails {
      url: url.to_string(),
      payload,
    })
  }

  #[instrument(level = Level::DEBUG, name = "acme2_lifecycle::Session::get_authorization", err, skip(self))]
  pub async fn get_authorization(&self, url: &str) -> Result<Authorization, Error> {
    let raw = self
      .execute_as_account("get-authorization", url, "", None)
      .await?;
    let mut authorization: Authorization = raw.decode()?;
    authorization.url = url.to_string();
    Ok(authorization)
  }

  #[instrument(level = Level::DEBUG, name = "acme2_lifecycle::Session::get_challenge", err, skip(self), fields(status = field::Empty))]
  pub async fn get_challenge(&self, url: &str) -> Result<Challenge, Error> {
    let raw = self.execute_as_account("get-challenge", url, "", None).await?;
    let challenge: Challenge = raw.decode()?;
    Span::current().record("status", &field::debug(&challenge.status));
    Ok(challenge)
  }

  /// Tells the CA the challenge response is in place.
  #[instrument(level = Level::INFO, name = "acme2_lifecycle::Session::answer_challenge", err, skip(self), fields(status = field::Empty))]
  pub async fn answer_challenge(&self, url: &str) -> Result<Challenge, Error> {
    let raw = self
      .execute_as_account("answer-challenge", url, "{}", None)
      .await?;
    let challenge: Challenge = raw.decode()?;
    Span::current().record("status", &field::debug(&challenge.status));
    Ok(challenge)
  }

  /// Submits the DER encoded CSR to the order's finalize URL.
  #[instrument(level = Level::INFO, name = "acme2_lifecycle::Session::finalize_order", err, skip(self, order, csr), fields(order = %order.url, status = field::Empty))]
  pub async fn finalize_order(
    &self,
    order: &OrderDetails,
    csr: &[u8],
  ) -> Result<OrderDetails, Error> {
    let payload = serde_json::to_string(&json!({ "csr": b64(csr) }))?;
    let raw = self
      .execute_as_account("finalize-order", &order.payload.finalize_url, &payload, None)
      .await?;
    let payload: OrderPayload = raw.decode()?;
    Span::current().record("status", &field::debug(&payload.status));
    Ok(OrderDetails {
      url: order.url.clone(),
      payload,
    })
  }

  /// Downloads the PEM certificate chain.
  #[instrument(level = Level::INFO, name = "acme2_lifecycle::Session::download_certificate", err, skip(self))]
  pub async fn download_certificate(&self, url: &str) -> Result<Vec<u8>, Error> {
    let raw = self
      .execute_as_account("download-certificate", url, "", Some(ACCEPT_PEM_CHAIN))
      .await?;
    debug!(bytes = raw.body.len(), "Downloaded certificate chain");
    Ok(raw.body)
  }

  /// Revokes a DER encoded certificate issued to this account.
  #[instrument(level = Level::INFO, name = "acme2_lifecycle::Session::revoke_certificate", err, skip(self, certificate))]
  pub async fn revoke_certificate(
    &self,
    certificate: &[u8],
    reason: Option<u8>,
  ) -> Result<(), Error> {
    let mut payload = json!({ "certificate": b64(certificate) });
    if let Some(reason) = reason {
      payload["reason"] = json!(reason);
    }
    let payload = serde_json::to_string(&payload)?;
    let url = self.directory.revoke_cert_url.as_str();
    self
      .execute_as_account("revoke-certificate", url, &payload, None)
      .await?;
    Ok(())
  }

  /// Plain GET of a document the CA links to, like the terms of service.
  pub async fn download(&self, url: &str) -> Result<Vec<u8>, Error> {
    let resp = self.http_client.get(url).send().await?;
    let status = resp.status();
    let body = resp.bytes().await?.to_vec();
    if !status.is_success() {
      return Err(problem_from(status, &body).into());
    }
    Ok(body)
  }
}
