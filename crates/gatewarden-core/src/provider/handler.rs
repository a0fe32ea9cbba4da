//! Verify and mutate handlers.
//!
//! Both endpoints decode a `ProviderRequest`, spawn one worker per subject,
//! and collect items over a bounded channel in completion order. Workers
//! never abort their peers: a parse failure, executor error, or panic
//! becomes that subject's item and the rest of the batch proceeds.
//!
//! Per subject, the worker takes the single-flight lock for its cache key,
//! consults the TTL cache, and only then invokes the executor, so duplicate
//! keys in one batch (or across concurrent batches) run the computation at
//! most once per TTL window. Errors are not cached.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::error::ProviderError;
use super::timeout::with_deadline;
use super::{ProviderState, MUTATE_KEY_PREFIX, VERIFY_KEY_PREFIX};
use crate::executor::Executor;
use crate::externaldata::{ProviderRequest, ProviderResponse, ResponseItem};
use crate::reference::Reference;

/// Liveness probe.
pub(super) async fn healthz() -> StatusCode {
    StatusCode::OK
}

/// `POST /ratify/gatekeeper/v1/verify`.
pub(super) async fn verify(State(state): State<Arc<ProviderState>>, body: Bytes) -> Response {
    let executor = state.executor();
    let deadline = executor.verify_request_timeout();
    with_deadline(deadline, false, handle_verify(state, executor, body)).await
}

/// `POST /ratify/gatekeeper/v1/mutate`.
pub(super) async fn mutate(State(state): State<Arc<ProviderState>>, body: Bytes) -> Response {
    let executor = state.executor();
    let deadline = executor.mutation_request_timeout();
    with_deadline(deadline, true, handle_mutate(state, executor, body)).await
}

async fn handle_verify(
    state: Arc<ProviderState>,
    executor: Arc<dyn Executor>,
    body: Bytes,
) -> Response {
    let keys = match decode_keys(&body) {
        Ok(keys) => keys,
        Err(response) => return response,
    };
    info!(subjects = keys.len(), "processing verify request");

    let items = fan_out(keys, |key| {
        verify_subject(Arc::clone(&state), Arc::clone(&executor), key)
    })
    .await;
    (StatusCode::OK, Json(ProviderResponse::from_items(items))).into_response()
}

async fn handle_mutate(
    state: Arc<ProviderState>,
    executor: Arc<dyn Executor>,
    body: Bytes,
) -> Response {
    let keys = match decode_keys(&body) {
        Ok(keys) => keys,
        Err(response) => return response,
    };
    info!(subjects = keys.len(), "processing mutate request");

    let items = fan_out(keys, |key| {
        mutate_subject(Arc::clone(&state), Arc::clone(&executor), key)
    })
    .await;
    (StatusCode::OK, Json(ProviderResponse::from_items(items))).into_response()
}

fn decode_keys(body: &Bytes) -> Result<Vec<String>, Response> {
    match serde_json::from_slice::<ProviderRequest>(body) {
        Ok(request) => Ok(request.request.keys),
        Err(error) => {
            warn!(error = %error, "failed to decode provider request");
            Err(
                ProviderError::BadRequest(format!("failed to decode provider request: {error}"))
                    .into_response(),
            )
        }
    }
}

/// Runs `work` for every key in parallel and gathers one item per key in
/// completion order.
async fn fan_out<F, Fut>(keys: Vec<String>, work: F) -> Vec<ResponseItem>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = ResponseItem> + Send + 'static,
{
    let capacity = keys.len().max(1);
    let (tx, mut rx) = mpsc::channel::<ResponseItem>(capacity);
    let mut workers: JoinSet<()> = JoinSet::new();

    for key in keys {
        let tx = tx.clone();
        let subject = work(key.clone());
        workers.spawn(async move {
            let item = guard_worker(key, subject).await;
            // Fails only when the request was cancelled and the collector
            // is gone.
            let _ = tx.send(item).await;
        });
    }
    drop(tx);

    let mut items = Vec::with_capacity(capacity);
    while let Some(item) = rx.recv().await {
        items.push(item);
    }
    while workers.join_next().await.is_some() {}
    items
}

/// Converts a worker panic into that subject's error item.
async fn guard_worker(
    key: String,
    subject: impl Future<Output = ResponseItem>,
) -> ResponseItem {
    match AssertUnwindSafe(subject).catch_unwind().await {
        Ok(item) => item,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(key = %key, message, "subject worker panicked");
            ResponseItem::error(
                key,
                ProviderError::ExecutorFailure(format!("subject worker panicked: {message}")),
            )
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

async fn verify_subject(
    state: Arc<ProviderState>,
    executor: Arc<dyn Executor>,
    key: String,
) -> ResponseItem {
    let reference = match Reference::parse(&key) {
        Ok(reference) => reference,
        Err(error) => {
            warn!(key = %key, error = %error, "failed to parse subject reference");
            return ResponseItem::error(key, ProviderError::ReferenceInvalid);
        }
    };

    let cache_key = format!("{VERIFY_KEY_PREFIX}{key}");
    let _guard = state.key_mutex.lock(&cache_key).await;

    if let Some(value) = state.cache.get(&cache_key) {
        debug!(key = %key, "verification result served from cache");
        return ResponseItem::value(key, value);
    }

    match executor.verify(&reference).await {
        Ok(result) => match serde_json::to_value(&result) {
            Ok(value) => {
                state.cache.set(&cache_key, value.clone());
                ResponseItem::value(key, value)
            }
            Err(error) => ResponseItem::error(
                key,
                ProviderError::ExecutorFailure(format!(
                    "failed to serialize verification result: {error}"
                )),
            ),
        },
        Err(error) => {
            warn!(key = %key, error = %error, "verification failed");
            ResponseItem::error(key, ProviderError::from(error))
        }
    }
}

async fn mutate_subject(
    state: Arc<ProviderState>,
    executor: Arc<dyn Executor>,
    key: String,
) -> ResponseItem {
    let reference = match Reference::parse(&key) {
        Ok(reference) => reference,
        Err(error) => {
            warn!(key = %key, error = %error, "failed to parse subject reference");
            return ResponseItem::error(key, ProviderError::ReferenceInvalid);
        }
    };

    // Already pinned; nothing to resolve.
    if reference.digest().is_some() {
        let value = Value::String(reference.original().to_string());
        return ResponseItem::value(key, value);
    }

    let cache_key = format!("{MUTATE_KEY_PREFIX}{key}");
    let _guard = state.key_mutex.lock(&cache_key).await;

    if let Some(value) = state.cache.get(&cache_key) {
        debug!(key = %key, "pinned reference served from cache");
        return ResponseItem::value(key, value);
    }

    let Some(store) = executor.store(&state.mutation_store_name) else {
        return ResponseItem::error(
            key,
            ProviderError::StoreFailure(format!(
                "mutation store {:?} is not configured",
                state.mutation_store_name
            )),
        );
    };

    match store.get_subject_descriptor(&reference).await {
        Ok(descriptor) => {
            let pinned = format!("{}@{}", reference.path(), descriptor.digest);
            let value = Value::String(pinned);
            state.cache.set(&cache_key, value.clone());
            ResponseItem::value(key, value)
        }
        Err(error) => {
            warn!(key = %key, error = %error, "subject resolution failed");
            ResponseItem::error(key, ProviderError::StoreFailure(error.to_string()))
        }
    }
}
