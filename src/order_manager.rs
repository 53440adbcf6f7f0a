use crate::cache::fingerprint;
use crate::cache::OrderCache;
use crate::csr::CsrBundle;
use crate::csr::CsrSource;
use crate::error::*;
use crate::helpers::*;
use crate::order::OrderDetails;
use crate::order::OrderRequest;
use crate::order::OrderStatus;
use crate::session::Session;
use crate::settings::Settings;
use chrono::DateTime;
use chrono::DurationRound;
use chrono::SecondsFormat;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;
use tracing::error;
use tracing::field;
use tracing::info;
use tracing::instrument;
use tracing::warn;
use tracing::Level;
use tracing::Span;

/// An order ready to be worked on, together with what it was created for.
#[derive(Debug, Clone)]
pub struct AcmeOrder {
  pub details: OrderDetails,
  /// The cache fingerprint of the request.
  pub cache_key: String,
  pub common_name: String,
  pub identifiers: Vec<Identifier>,
  /// Where the private key for this order is cached.
  pub key_file: PathBuf,
  /// Whether the order came out of the cache.
  pub reused: bool,
}

impl AcmeOrder {
  pub fn status(&self) -> OrderStatus {
    self.details.status()
  }
}

/// The requested end of validity: `days` from `now`, truncated to the hour.
fn not_after(now: DateTime<Utc>, days: u32) -> Result<String, Error> {
  let end = (now + chrono::Duration::days(days as i64))
    .duration_trunc(chrono::Duration::hours(1))
    .map_err(|err| Error::Other(Box::new(err)))?;
  Ok(end.to_rfc3339_opts(SecondsFormat::Secs, true))
}

/// Creates, reuses and finalizes orders for the account of a session.
#[derive(Debug)]
pub struct OrderManager {
  session: Arc<Session>,
  settings: Arc<Settings>,
  cache: OrderCache,
}

impl OrderManager {
  pub fn new(session: Arc<Session>, settings: Arc<Settings>, cache: OrderCache) -> Self {
    OrderManager {
      session,
      settings,
      cache,
    }
  }

  /// Returns a cached order for the same request if the server still
  /// considers it valid or ready, and a new one otherwise. `None` means the
  /// server rejected the new order; the reason has been logged.
  #[instrument(level = Level::INFO, name = "acme2_lifecycle::OrderManager::get_or_create", err, skip(self, request), fields(cache_key = field::Empty, reused = field::Empty))]
  pub async fn get_or_create(
    &self,
    request: &OrderRequest,
  ) -> Result<Option<AcmeOrder>, Error> {
    let account = self.session.account().await?;
    let (identifiers, common_name) = request.resolve()?;
    let cache_key = fingerprint(
      account.id(),
      &common_name,
      &identifiers,
      &request.csr.cache_fingerprint(),
      request.key_cache_path.as_deref(),
    )?;
    Span::current().record("cache_key", &field::display(&cache_key));

    if !self.cache.enabled() {
      debug!("Order reuse is disabled");
    } else if let Some(cached) = self.cache.lookup(&cache_key).await {
      match self.session.get_order(&cached.details.url).await {
        Ok(details) if details.status().is_reusable() => {
          info!(order = %details.url, status = ?details.status(), "Reusing cached order");
          Span::current().record("reused", &true);
          if let Err(err) = self.cache.update(&cache_key, &details).await {
            warn!(error = %err, "Unable to update cached order");
          }
          return Ok(Some(AcmeOrder {
            details,
            cache_key,
            common_name,
            identifiers,
            key_file: cached.key_file,
            reused: true,
          }));
        }
        Ok(details) => {
          info!(status = ?details.status(), "Cached order can no longer be used");
          self.cache.delete(&cache_key).await;
        }
        Err(err) => {
          warn!(error = %err, "Unable to refresh cached order");
          self.cache.delete(&cache_key).await;
        }
      }
    }

    Span::current().record("reused", &false);
    self.create(identifiers, common_name, cache_key).await
  }

  async fn create(
    &self,
    identifiers: Vec<Identifier>,
    common_name: String,
    cache_key: String,
  ) -> Result<Option<AcmeOrder>, Error> {
    let not_after = match self.settings.validity_days {
      Some(days) => Some(not_after(Utc::now(), days)?),
      None => None,
    };

    let details = self
      .session
      .create_order(&identifiers, not_after.as_deref())
      .await?;
    if let Some(err) = &details.payload.error {
      error!(
        detail = err.detail.as_deref().unwrap_or_default(),
        problem = err.r#type.as_deref().unwrap_or_default(),
        "The order was rejected"
      );
      return Ok(None);
    }
    info!(order = %details.url, status = ?details.status(), "Created order");

    if self.cache.enabled() {
      self.cache.save(&cache_key, &details).await?;
    }
    Ok(Some(AcmeOrder {
      details,
      key_file: self.cache.key_file(&cache_key),
      cache_key,
      common_name,
      identifiers,
      reused: false,
    }))
  }

  /// Produces the CSR for `order`. A reused order gets the private key
  /// cached with it. Any other order gets a fresh key, which replaces
  /// whatever key file is left under its fingerprint when reuse is enabled.
  #[instrument(level = Level::DEBUG, name = "acme2_lifecycle::OrderManager::prepare_csr", err, skip(self, order, source), fields(order = %order.details.url))]
  pub async fn prepare_csr(
    &self,
    order: &AcmeOrder,
    source: &dyn CsrSource,
  ) -> Result<CsrBundle, Error> {
    let cached_key = if order.reused && self.cache.enabled() {
      self.cache.load_key(&order.cache_key).await
    } else {
      None
    };
    let had_key = cached_key.is_some();
    let bundle = source
      .generate(&order.common_name, &order.identifiers, cached_key)
      .await?;
    if self.cache.enabled() && !had_key {
      self.cache.save_key(&order.cache_key, &bundle.private_key).await?;
    }
    Ok(bundle)
  }

  async fn wait_while(
    &self,
    mut details: OrderDetails,
    status: OrderStatus,
  ) -> Result<OrderDetails, Error> {
    let mut attempts = 0;
    while details.status() == status && attempts < self.settings.retry_count {
      tokio::time::sleep(self.settings.poll_interval()).await;
      details = self.session.get_order(&details.url).await?;
      attempts += 1;
      debug!(attempts, status = ?details.status(), "Polled order");
    }
    Ok(details)
  }

  /// Waits for `order` to become ready, submits the CSR and waits for the
  /// CA to finish processing. An order that never becomes ready is returned
  /// as it is; check its status.
  #[instrument(level = Level::INFO, name = "acme2_lifecycle::OrderManager::finalize", err, skip(self, order, csr), fields(order = %order.details.url, status = field::Empty))]
  pub async fn finalize(&self, order: &AcmeOrder, csr: &[u8]) -> Result<OrderDetails, Error> {
    if order.status() == OrderStatus::Valid {
      debug!("Order is already valid");
      Span::current().record("status", &field::debug(OrderStatus::Valid));
      return Ok(order.details.clone());
    }

    let details = self
      .wait_while(order.details.clone(), OrderStatus::Pending)
      .await?;
    if details.status() != OrderStatus::Ready {
      warn!(status = ?details.status(), "Order is not ready, it will not be finalized");
      Span::current().record("status", &field::debug(details.status()));
      return Ok(details);
    }

    let details = self.session.finalize_order(&details, csr).await?;
    let details = self.wait_while(details, OrderStatus::Processing).await?;
    Span::current().record("status", &field::debug(details.status()));

    if self.cache.enabled() {
      if let Err(err) = self.cache.update(&order.cache_key, &details).await {
        warn!(error = %err, "Unable to update cached order");
      }
    }
    Ok(details)
  }

  pub async fn clear_cache(&self) -> Result<(), Error> {
    self.cache.clear().await
  }

  pub async fn reencrypt(&self) -> Result<(), Error> {
    self.cache.reencrypt().await
  }
}
