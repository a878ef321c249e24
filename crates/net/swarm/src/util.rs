//! Small cancellation helpers.

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::SwarmError;

/// Run `fut`, resolving to [`SwarmError::Cancelled`] if `cancel` fires
/// first.
pub(crate) async fn with_cancel<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, SwarmError>
where
    F: Future<Output = Result<T, SwarmError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SwarmError::Cancelled),
        result = fut => result,
    }
}

/// A token that fires when either input does. The caller should cancel
/// the returned token once it is done with it, which also reaps the
/// forwarding task.
pub(crate) fn linked_token(a: &CancellationToken, b: &CancellationToken) -> CancellationToken {
    let linked = a.child_token();
    let b = b.clone();
    let forward = linked.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = b.cancelled() => forward.cancel(),
            _ = forward.cancelled() => {}
        }
    });
    linked
}
