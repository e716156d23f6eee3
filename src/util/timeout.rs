//! Timeout and cancellation helpers for suspension points.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::TurnloopError;

/// Wrap a future with a timeout.
pub async fn with_timeout<T>(
    duration: Duration,
    future: impl Future<Output = Result<T, TurnloopError>>,
) -> Result<T, TurnloopError> {
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(TurnloopError::Timeout(duration.as_millis() as u64)),
    }
}

/// Await a future bounded by both a timeout and a cancellation token.
///
/// Cancellation wins over completion when both are ready; the future is
/// dropped in either case.
pub async fn bounded<T>(
    duration: Duration,
    cancel: &CancellationToken,
    what: &str,
    future: impl Future<Output = Result<T, TurnloopError>>,
) -> Result<T, TurnloopError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TurnloopError::Cancelled(format!("{what} cancelled"))),
        result = with_timeout(duration, future) => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn with_timeout_reports_elapsed_budget() {
        let err = with_timeout(Duration::from_millis(20), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, TurnloopError>(())
        })
        .await
        .expect_err("should time out");

        assert!(matches!(err, TurnloopError::Timeout(20)));
    }

    #[tokio::test]
    async fn bounded_prefers_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = bounded(Duration::from_secs(5), &cancel, "model call", async {
            Ok::<_, TurnloopError>(1)
        })
        .await
        .expect_err("cancelled token should win");

        assert!(matches!(err, TurnloopError::Cancelled(message) if message.contains("model call")));
    }

    #[tokio::test]
    async fn bounded_passes_through_result() {
        let cancel = CancellationToken::new();
        let value = bounded(Duration::from_secs(1), &cancel, "op", async {
            Ok::<_, TurnloopError>(7)
        })
        .await
        .expect("should complete");
        assert_eq!(value, 7);
    }
}
