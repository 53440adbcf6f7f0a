use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("configuration error: {0}")]
  Configuration(String),

  #[error("validation error: {0}")]
  Validation(&'static str),

  #[error(transparent)]
  Server(#[from] ServerError),

  #[error("service is too busy, try again later: {0}")]
  TooBusy(Box<Error>),

  #[error("the terms of service were not accepted")]
  TermsNotAccepted,

  #[error("unable to read protected data: {0}")]
  Protection(String),

  #[error(transparent)]
  Io(#[from] std::io::Error),

  #[error(transparent)]
  Transient(Box<dyn std::error::Error + Send + Sync>),

  #[error(transparent)]
  Transport(Box<dyn std::error::Error + Send + Sync>),

  #[error(transparent)]
  Other(Box<dyn std::error::Error + Send + Sync>),
}

#[derive(Debug, thiserror::Error)]
#[error("transport error: {0}")]
pub struct TransportError(&'static str);

pub fn transport_err(msg: &'static str) -> Error {
  Error::Transport(Box::new(TransportError(msg)))
}

pub fn map_transport_err<T, E: std::error::Error + Send + Sync + 'static>(
  res: Result<T, E>,
) -> Result<T, Error> {
  res.map_err(|err| Error::Transport(Box::new(err)))
}

impl From<reqwest::Error> for Error {
  fn from(err: reqwest::Error) -> Self {
    if err.is_connect() || err.is_timeout() {
      Self::Transient(Box::new(err))
    } else {
      Self::Transport(Box::new(err))
    }
  }
}

impl From<serde_json::Error> for Error {
  fn from(err: serde_json::Error) -> Self {
    Self::Transport(Box::new(err))
  }
}

impl From<openssl::error::ErrorStack> for Error {
  fn from(err: openssl::error::ErrorStack) -> Self {
    Self::Other(Box::new(err))
  }
}

impl Error {
  /// The problem kind, if this error is a problem document from the server.
  pub fn problem_kind(&self) -> Option<ProblemKind> {
    match self {
      Error::Server(err) => Some(err.kind()),
      _ => None,
    }
  }

  /// Conditions the backoff policy absorbs: a 429 that is not a rate
  /// limit, or a connection that could not be made in time.
  pub(crate) fn is_busy(&self) -> bool {
    match self {
      Error::Server(err) => {
        err.status == Some(429) && err.kind() != ProblemKind::RateLimited
      }
      Error::Transient(_) => true,
      _ => false,
    }
  }
}

const PROBLEM_PREFIX: &str = "urn:ietf:params:acme:error:";

/// The problem types the request pipeline and bootstrapper react to.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ProblemKind {
  BadNonce,
  BadSignatureAlgorithm,
  RateLimited,
  UserActionRequired,
  /// Any other ACME problem type, without the `urn:ietf:params:acme:error:`
  /// prefix.
  Other(String),
  /// The problem document carried no (or a non ACME) type.
  Unknown,
}

/// The result of an operation that can return a [`ServerError`].
#[derive(Deserialize)]
#[serde(rename_all = "camelCase", untagged)]
pub enum ServerResult<T> {
  Ok(T),
  Err(ServerError),
}

impl<T> From<ServerResult<T>> for Result<T, Error> {
  fn from(res: ServerResult<T>) -> Self {
    match res {
      ServerResult::Ok(t) => Ok(t),
      ServerResult::Err(err) => Err(err.into()),
    }
  }
}

/// This is an error as returned by the ACME server.
#[derive(Serialize, Deserialize, Debug, Clone, Default, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("ServerError({}): {}: {}", r#type.clone().unwrap_or_default(), title.clone().unwrap_or_default(), detail.clone().unwrap_or_default())]
pub struct ServerError {
  /// The type of this error.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub r#type: Option<String>,
  /// The human readable title of this error.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  /// The status code of this error.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub status: Option<u16>,
  /// The human readable extra description for this error.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub detail: Option<String>,
  /// A URL the user can visit to resolve the problem.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub instance: Option<String>,
}

impl ServerError {
  pub fn kind(&self) -> ProblemKind {
    let typ = match self.r#type.as_deref() {
      Some(typ) => typ,
      None => return ProblemKind::Unknown,
    };
    match typ.strip_prefix(PROBLEM_PREFIX) {
      Some("badNonce") => ProblemKind::BadNonce,
      Some("badSignatureAlgorithm") => ProblemKind::BadSignatureAlgorithm,
      Some("rateLimited") => ProblemKind::RateLimited,
      Some("userActionRequired") => ProblemKind::UserActionRequired,
      Some(other) => ProblemKind::Other(other.to_string()),
      None => ProblemKind::Unknown,
    }
  }
}
