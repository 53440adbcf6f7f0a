use crate::csr::CsrSource;
use crate::error::*;
use crate::helpers::*;
use serde::Deserialize;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

/// Where an order stands. `Pending` until every authorization is valid,
/// then `Ready` for a CSR, `Processing` while the CA issues, and finally
/// `Valid` or `Invalid`.
#[derive(Serialize, Deserialize, Debug, Eq, PartialEq, Clone, Copy)]
#[serde(rename_all = "camelCase")]
pub enum OrderStatus {
  Pending,
  Ready,
  Processing,
  Valid,
  Invalid,
}

impl OrderStatus {
  /// Whether a cached order in this state may be handed out again.
  pub fn is_reusable(&self) -> bool {
    matches!(self, OrderStatus::Valid | OrderStatus::Ready)
  }
}

/// The order object exactly as the CA returns it.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OrderPayload {
  pub status: OrderStatus,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub expires: Option<String>,
  pub identifiers: Vec<Identifier>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub not_before: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub not_after: Option<String>,

  /// Set when the CA refused the order outright.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<ServerError>,

  #[serde(rename = "authorizations", default)]
  pub authorization_urls: Vec<String>,
  /// The CSR is posted here once the order is ready.
  #[serde(rename = "finalize")]
  pub finalize_url: String,
  /// Only present on valid orders.
  #[serde(rename = "certificate", default, skip_serializing_if = "Option::is_none")]
  pub certificate_url: Option<String>,
}

/// An order as the server reported it, with the URL it lives at.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OrderDetails {
  pub url: String,
  pub payload: OrderPayload,
}

impl OrderDetails {
  pub fn status(&self) -> OrderStatus {
    self.payload.status
  }
}

/// The certificate a caller wants: which identifiers, which common name,
/// and who produces the CSR.
#[derive(Clone)]
pub struct OrderRequest {
  pub identifiers: Vec<Identifier>,
  pub common_name: Option<String>,
  pub csr: Arc<dyn CsrSource>,
  /// Where the CSR source keeps a private key it reuses across renewals.
  pub key_cache_path: Option<PathBuf>,
}

impl std::fmt::Debug for OrderRequest {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("OrderRequest")
      .field("identifiers", &self.identifiers)
      .field("common_name", &self.common_name)
      .field("csr", &self.csr.cache_fingerprint())
      .field("key_cache_path", &self.key_cache_path)
      .finish()
  }
}

impl OrderRequest {
  pub fn new(identifiers: Vec<Identifier>, csr: Arc<dyn CsrSource>) -> Self {
    OrderRequest {
      identifiers,
      common_name: None,
      csr,
      key_cache_path: None,
    }
  }

  pub fn with_common_name(mut self, common_name: impl Into<String>) -> Self {
    self.common_name = Some(common_name.into());
    self
  }

  pub fn with_key_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
    self.key_cache_path = Some(path.into());
    self
  }

  /// The identifiers without duplicates, and a common name that is one of
  /// them. A common name outside the set is replaced by the first
  /// identifier.
  pub fn resolve(&self) -> Result<(Vec<Identifier>, String), Error> {
    let mut identifiers: Vec<Identifier> = vec![];
    for identifier in &self.identifiers {
      if !identifiers.contains(identifier) {
        identifiers.push(identifier.clone());
      }
    }
    let first = match identifiers.first() {
      Some(first) => first.value.clone(),
      None => return Err(Error::Validation("an order needs at least one identifier")),
    };

    let common_name = match &self.common_name {
      Some(cn) if identifiers.iter().any(|id| id.value.eq_ignore_ascii_case(cn)) => {
        cn.clone()
      }
      Some(cn) => {
        warn!(
          common_name = %cn,
          replacement = %first,
          "Common name is not one of the identifiers, replacing it"
        );
        first
      }
      None => first,
    };
    Ok((identifiers, common_name))
  }
}
