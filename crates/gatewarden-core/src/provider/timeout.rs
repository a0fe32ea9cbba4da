//! Request deadline harness.
//!
//! The admission controller enforces its own call deadline, so a handler
//! that overruns must be overtaken: the harness emits a deterministic
//! timeout response and drops the handler future, which cancels every
//! subject worker still running (their `JoinSet` goes down with the
//! future). A dropped worker never reaches its cache insert, so cancelled
//! work is never published.

use std::future::Future;
use std::time::Duration;

use axum::response::{IntoResponse, Response};
use tracing::error;

use super::error::ProviderError;

/// Runs `handler` under `deadline`, answering with a `500` + `systemError`
/// envelope when the deadline elapses first. A zero deadline means no
/// deadline at all and the harness is transparent.
///
/// `is_mutation` only flavors the log line; both endpoints time out the
/// same way.
pub(super) async fn with_deadline(
    deadline: Duration,
    is_mutation: bool,
    handler: impl Future<Output = Response>,
) -> Response {
    if deadline.is_zero() {
        return handler.await;
    }

    match tokio::time::timeout(deadline, handler).await {
        Ok(response) => response,
        Err(_) => {
            let endpoint = if is_mutation { "mutate" } else { "verify" };
            let deadline_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX);
            error!(endpoint, deadline_ms, "handler exceeded its deadline");
            ProviderError::Timeout(format!("operation timed out after {deadline_ms}ms"))
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use axum::http::StatusCode;

    use super::*;
    use crate::externaldata::ProviderResponse;

    async fn quick_response() -> Response {
        (StatusCode::OK, "done").into_response()
    }

    #[tokio::test]
    async fn forwards_response_under_deadline() {
        let response = with_deadline(Duration::from_secs(5), false, quick_response()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"done");
    }

    #[tokio::test]
    async fn zero_deadline_is_transparent() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            quick_response().await
        };
        let response = with_deadline(Duration::ZERO, false, slow).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn expiry_yields_500_with_system_error() {
        let stuck = async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            quick_response().await
        };
        let response = with_deadline(Duration::from_millis(20), true, stuck).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let decoded: ProviderResponse = serde_json::from_slice(&body).unwrap();
        let system_error = decoded.response.system_error.unwrap();
        assert_eq!(system_error, "Timeout: operation timed out after 20ms");
        assert!(decoded.response.items.is_empty());
    }
}
