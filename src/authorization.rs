use crate::error::ServerError;
use crate::helpers::Identifier;
use serde::Deserialize;
use serde::Serialize;

/// Lifecycle of an authorization (RFC 8555 section 7.1.6).
#[derive(Serialize, Deserialize, Debug, Eq, PartialEq, Clone, Copy)]
#[serde(rename_all = "camelCase")]
pub enum AuthorizationStatus {
  Pending,
  Valid,
  Invalid,
  Deactivated,
  Expired,
  Revoked,
}

/// Proof of control over one identifier of an order, as the CA tracks it.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Authorization {
  /// Where the authorization was fetched from. Not part of the body.
  #[serde(skip)]
  pub url: String,

  pub identifier: Identifier,
  pub status: AuthorizationStatus,
  /// RFC 3339 timestamp, required once the authorization is valid.
  pub expires: Option<String>,
  /// Pending authorizations offer every challenge type the CA accepts.
  /// Settled ones only list the challenge that decided them.
  pub challenges: Vec<Challenge>,
  pub wildcard: Option<bool>,
}

impl Authorization {
  pub fn get_challenge(&self, typ: &str) -> Option<&Challenge> {
    self.challenges.iter().find(|challenge| challenge.r#type == typ)
  }
}

#[derive(Serialize, Deserialize, Debug, Eq, PartialEq, Clone, Copy)]
#[serde(rename_all = "camelCase")]
pub enum ChallengeStatus {
  Pending,
  Processing,
  Valid,
  Invalid,
}

impl ChallengeStatus {
  pub fn is_terminal(&self) -> bool {
    matches!(self, ChallengeStatus::Valid | ChallengeStatus::Invalid)
  }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
  /// `http-01`, `dns-01`, `tls-alpn-01` and so on.
  pub r#type: String,
  /// Posting `{}` here tells the CA to start validating.
  pub url: String,
  pub status: ChallengeStatus,
  pub validated: Option<String>,
  /// Why validation failed.
  pub error: Option<ServerError>,
  pub token: Option<String>,
}
