use meridian_core::{StoreError, StoreResult};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Runs a store request bounded by `timeout` and by the caller's
/// cancellation, whichever fires first. A canceled caller always observes
/// [`StoreError::Canceled`], even if the request was ready.
pub(crate) async fn bounded<T, F>(
    cancel: &CancellationToken,
    timeout: Duration,
    operation: &str,
    request: F,
) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StoreError::canceled(operation)),
        result = tokio::time::timeout(timeout, request) => match result {
            Ok(result) => result,
            Err(_) => Err(StoreError::deadline_exceeded(operation)),
        },
    }
}
