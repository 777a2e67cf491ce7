//! Bounded retry for transient store failures.

use std::future::Future;

use crate::Error;

/// Run `op`, converting its error into the core taxonomy. A
/// [`Error::StoreUnavailable`] failure is retried exactly once; every other
/// outcome is returned as-is.
pub async fn retry_once<T, E, F, Fut>(label: &str, mut op: F) -> Result<T, Error>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T, E>>,
  E: Into<Error>,
{
  match op().await.map_err(Into::into) {
    Err(err) if err.is_retryable() => {
      tracing::warn!(op = label, error = %err, "transient store failure, retrying once");
      op().await.map_err(Into::into)
    }
    other => other,
  }
}
