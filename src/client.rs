use crate::account::Account;
use crate::account::AccountStore;
use crate::authorization::Authorization;
use crate::authorization::Challenge;
use crate::bootstrap::normalize_contacts;
use crate::bootstrap::Bootstrapper;
use crate::cache::OrderCache;
use crate::csr::CsrSource;
use crate::eab::EabCredentialExchange;
use crate::error::*;
use crate::input::InputService;
use crate::order::OrderDetails;
use crate::order::OrderRequest;
use crate::order_manager::AcmeOrder;
use crate::order_manager::OrderManager;
use crate::protect::Protector;
use crate::session::Session;
use crate::settings::Settings;
use openssl::pkey::PKey;
use openssl::pkey::Private;
use openssl::x509::X509;
use std::sync::Arc;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::Level;

/// The secret protection for `settings`. A machine key is used when
/// encryption is on, or when one exists from an earlier run so that
/// secrets sealed back then can still be read.
async fn protector_for(settings: &Settings) -> Result<Protector, Error> {
  let key_path = settings.machine_key_path();
  let has_key = tokio::fs::try_exists(&key_path).await.unwrap_or(false);
  if settings.encrypt_secrets || has_key {
    Protector::machine_bound(&key_path, settings.encrypt_secrets).await
  } else {
    Ok(Protector::plain())
  }
}

pub struct AcmeClientBuilder {
  settings: Settings,
  http_client: Option<reqwest::Client>,
  input: Option<Arc<dyn InputService>>,
  exchanges: Vec<Arc<dyn EabCredentialExchange>>,
}

impl AcmeClientBuilder {
  pub fn new(settings: Settings) -> Self {
    AcmeClientBuilder {
      settings,
      http_client: None,
      input: None,
      exchanges: vec![],
    }
  }

  pub fn http_client(&mut self, http_client: reqwest::Client) -> &mut Self {
    self.http_client = Some(http_client);
    self
  }

  /// The operator to ask during first-run setup. Without one the setup is
  /// unattended.
  pub fn input(&mut self, input: Arc<dyn InputService>) -> &mut Self {
    self.input = Some(input);
    self
  }

  pub fn eab_exchange(&mut self, exchange: Arc<dyn EabCredentialExchange>) -> &mut Self {
    self.exchanges.push(exchange);
    self
  }

  /// Connects to the CA and loads or creates the account.
  pub async fn build(&mut self) -> Result<AcmeClient, Error> {
    let settings = Arc::new(self.settings.clone());
    let protector = protector_for(&settings).await?;
    let store = AccountStore::new(settings.config_path.clone(), protector.clone());

    let mut bootstrapper = Bootstrapper::new(settings.clone(), store.clone());
    if let Some(http_client) = &self.http_client {
      bootstrapper.http_client(http_client.clone());
    }
    if let Some(input) = &self.input {
      bootstrapper.input(input.clone());
    }
    for exchange in &self.exchanges {
      bootstrapper.eab_exchange(exchange.clone());
    }
    let session = bootstrapper.run().await?;

    let cache = OrderCache::new(settings.cache_path(), settings.cache.reuse_days, protector);
    let orders = OrderManager::new(session.clone(), settings.clone(), cache);
    Ok(AcmeClient {
      settings,
      session,
      store,
      orders,
    })
  }
}

/// A finalized order and the private key its certificate belongs to.
pub struct FinalizedOrder {
  pub details: OrderDetails,
  pub private_key: PKey<Private>,
}

/// Everything a renewal needs from the CA, on top of an authenticated
/// session.
pub struct AcmeClient {
  settings: Arc<Settings>,
  session: Arc<Session>,
  store: AccountStore,
  orders: OrderManager,
}

impl AcmeClient {
  pub fn session(&self) -> &Arc<Session> {
    &self.session
  }

  pub async fn account(&self) -> Result<Arc<Account>, Error> {
    self.session.account().await
  }

  /// See [`OrderManager::get_or_create`].
  pub async fn get_or_create_order(
    &self,
    request: &OrderRequest,
  ) -> Result<Option<AcmeOrder>, Error> {
    self.orders.get_or_create(request).await
  }

  pub async fn authorizations(&self, order: &AcmeOrder) -> Result<Vec<Authorization>, Error> {
    let mut authorizations = vec![];
    for url in &order.details.payload.authorization_urls {
      authorizations.push(self.session.get_authorization(url).await?);
    }
    Ok(authorizations)
  }

  /// Tells the CA the response for `challenge` is in place and polls until
  /// it is valid or invalid. Returns the last state seen when the retry
  /// budget runs out first.
  #[instrument(level = Level::INFO, name = "acme2_lifecycle::AcmeClient::answer_challenge", err, skip(self, challenge), fields(url = %challenge.url))]
  pub async fn answer_challenge(&self, challenge: &Challenge) -> Result<Challenge, Error> {
    let mut challenge = self.session.answer_challenge(&challenge.url).await?;
    let mut attempts = 0;
    while !challenge.status.is_terminal() && attempts < self.settings.retry_count {
      tokio::time::sleep(self.settings.poll_interval()).await;
      challenge = self.session.get_challenge(&challenge.url).await?;
      attempts += 1;
      debug!(attempts, status = ?challenge.status, "Polled challenge");
    }
    Ok(challenge)
  }

  /// Makes the CSR for `order` with `csr` and finalizes the order.
  pub async fn finalize_order(
    &self,
    order: &AcmeOrder,
    csr: &dyn CsrSource,
  ) -> Result<FinalizedOrder, Error> {
    let bundle = self.orders.prepare_csr(order, csr).await?;
    let details = self.orders.finalize(order, &bundle.csr).await?;
    Ok(FinalizedOrder {
      details,
      private_key: bundle.private_key,
    })
  }

  /// Downloads the chain of a valid order, leaf first.
  pub async fn download_certificate(&self, order: &OrderDetails) -> Result<Vec<X509>, Error> {
    let url = order.payload.certificate_url.as_deref().ok_or_else(|| {
      Error::Configuration(format!("order {} has no certificate yet", order.url))
    })?;
    let pem = self.session.download_certificate(url).await?;
    Ok(X509::stack_from_pem(&pem)?)
  }

  /// Revokes `certificate`. `reason` is an RFC 5280 reason code.
  pub async fn revoke_certificate(
    &self,
    certificate: &X509,
    reason: Option<u8>,
  ) -> Result<(), Error> {
    self
      .session
      .revoke_certificate(&certificate.to_der()?, reason)
      .await
  }

  /// Replaces the account contacts with the valid ones among `addresses`.
  #[instrument(level = Level::INFO, name = "acme2_lifecycle::AcmeClient::change_contacts", err, skip(self))]
  pub async fn change_contacts(&self, addresses: &[String]) -> Result<(), Error> {
    let contacts = normalize_contacts(addresses)?;
    let current = self.session.account().await?;
    let details = self.session.update_account(&contacts).await?;
    let account = Arc::new(Account {
      details,
      signer: current.signer.clone(),
    });
    self.store.save_default(&account).await?;
    self.session.set_account(account).await;
    info!(contacts = ?contacts, "Updated account contacts");
    Ok(())
  }

  /// Rewrites the account signer and every cached order key under the
  /// configured encryption policy.
  pub async fn reencrypt_secrets(&self) -> Result<(), Error> {
    self.store.reencrypt().await?;
    self.orders.reencrypt().await
  }

  pub async fn clear_cache(&self) -> Result<(), Error> {
    self.orders.clear_cache().await
  }
}
