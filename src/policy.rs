//! Retry policies wrapped around every authenticated ACME call.
//!
//! The backoff loop is the outer one; each of its attempts runs the full
//! bad-nonce loop. Both are plain bounded loops so the ceilings are visible.

use crate::error::*;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::debug;
use tracing::error;
use tracing::warn;

/// Total attempts of one call when the server keeps reporting a bad nonce.
pub(crate) const MAX_NONCE_ATTEMPTS: u32 = 3;

/// Total attempts of one call while the server answers with a busy 429.
pub(crate) const MAX_BACKOFF_ATTEMPTS: u32 = 5;

/// Something that can replace the stored nonce with a fresh one.
#[async_trait]
pub(crate) trait NonceSource: Sync {
  async fn refresh_nonce(&self) -> Result<(), Error>;
}

/// Seconds to wait after the `attempt`th (zero based) busy response.
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
  Duration::from_secs(2u64.pow(attempt + 3))
}

/// Runs `op`, fetching a new nonce and trying again when the server rejects
/// the one we sent. User-action-required problems are logged and returned
/// untouched, as is anything else.
pub(crate) async fn retry_bad_nonce<N, T, F, Fut>(
  nonces: &N,
  mut op: F,
) -> Result<T, Error>
where
  N: NonceSource + ?Sized,
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T, Error>>,
{
  let mut attempt = 1;
  loop {
    let err = match op().await {
      Err(Error::Server(err)) => err,
      other => return other,
    };

    match err.kind() {
      ProblemKind::BadNonce if attempt < MAX_NONCE_ATTEMPTS => {
        debug!(attempt, "Bad nonce, fetching a new one");
        nonces.refresh_nonce().await?;
        attempt += 1;
      }
      ProblemKind::BadNonce => {
        warn!(attempt, "Bad nonce, giving up");
        return Err(err.into());
      }
      ProblemKind::UserActionRequired => {
        error!(
          detail = err.detail.as_deref().unwrap_or_default(),
          instance = err.instance.as_deref().unwrap_or_default(),
          "The CA requires action from the account holder"
        );
        return Err(err.into());
      }
      _ => return Err(err.into()),
    }
  }
}

/// Runs `op`, sleeping and trying again while the server says it is busy.
/// A genuine rate limit is never retried, since every retry only spends
/// more of the quota.
pub(crate) async fn with_backoff<T, F, Fut>(mut op: F) -> Result<T, Error>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T, Error>>,
{
  let mut attempt = 0;
  loop {
    match op().await {
      Err(err) if err.is_busy() => {
        if attempt + 1 >= MAX_BACKOFF_ATTEMPTS {
          warn!(attempts = attempt + 1, "Service too busy, giving up");
          return Err(Error::TooBusy(Box::new(err)));
        }
        let delay = backoff_delay(attempt);
        warn!(error = %err, delay = ?delay, "Service busy, backing off");
        tokio::time::sleep(delay).await;
        attempt += 1;
      }
      Err(err) => {
        if err.problem_kind() == Some(ProblemKind::RateLimited) {
          warn!(error = %err, "Rate limited by the CA");
        }
        return Err(err);
      }
      ok => return ok,
    }
  }
}
