//! External-data provider HTTP surface.
//!
//! This module implements the endpoints the admission controller calls:
//!
//! - `POST /ratify/gatekeeper/v1/verify` — batched verification verdicts
//! - `POST /ratify/gatekeeper/v1/mutate` — digest-pinned references
//! - `GET  /ratify/gatekeeper/v1/healthz` — liveness
//!
//! Subjects within a batch are processed in parallel and answered in
//! completion order; callers match items by `key`. Each request snapshots
//! the executor factory once and runs under that executor's deadline; the
//! timeout harness answers `500` with a `systemError` when the deadline
//! elapses, and per-subject failures ride inside a normal `200` response.
//!
//! The verify and mutate paths share one TTL cache and one keyed
//! single-flight mutex with disjoint key prefixes, so a subject being
//! verified never blocks its own mutation and vice versa.

mod error;
mod handler;
mod timeout;


use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;

pub use error::ProviderError;

use crate::cache::ResultCache;
use crate::executor::{Executor, GetExecutor};
use crate::keymutex::KeyMutex;

/// Path of the verify endpoint.
pub const VERIFY_ROUTE: &str = "/ratify/gatekeeper/v1/verify";

/// Path of the mutate endpoint.
pub const MUTATE_ROUTE: &str = "/ratify/gatekeeper/v1/mutate";

/// Path of the liveness endpoint.
pub const HEALTH_ROUTE: &str = "/ratify/gatekeeper/v1/healthz";

/// Cache keyspace prefix for verification results.
pub(crate) const VERIFY_KEY_PREFIX: &str = "ver:";

/// Cache keyspace prefix for pinned references.
pub(crate) const MUTATE_KEY_PREFIX: &str = "mut:";

/// Maximum request body size in bytes. Admission batches are small; this
/// caps decode work on hostile input.
const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Shared state behind the provider endpoints.
pub(crate) struct ProviderState {
    pub(crate) get_executor: GetExecutor,
    pub(crate) mutation_store_name: String,
    pub(crate) cache: ResultCache,
    pub(crate) key_mutex: KeyMutex,
}

impl ProviderState {
    /// Snapshots the current executor for one request.
    pub(crate) fn executor(&self) -> Arc<dyn Executor> {
        (self.get_executor)()
    }
}

/// The provider endpoints wrapped around their shared state.
pub struct ProviderHandler {
    state: Arc<ProviderState>,
}

impl ProviderHandler {
    /// Creates the provider surface.
    ///
    /// `get_executor` is snapshotted once per request; `cache_ttl` of zero
    /// disables result caching; `mutation_store_name` selects the store the
    /// mutate endpoint resolves digests through.
    #[must_use]
    pub fn new(
        get_executor: GetExecutor,
        cache_ttl: Duration,
        mutation_store_name: impl Into<String>,
    ) -> Self {
        Self {
            state: Arc::new(ProviderState {
                get_executor,
                mutation_store_name: mutation_store_name.into(),
                cache: ResultCache::new(cache_ttl),
                key_mutex: KeyMutex::new(),
            }),
        }
    }

    /// Returns the axum router for the provider endpoints.
    #[must_use]
    pub fn router(&self) -> Router {
        Router::new()
            .route(VERIFY_ROUTE, post(handler::verify))
            .route(MUTATE_ROUTE, post(handler::mutate))
            .route(HEALTH_ROUTE, get(handler::healthz))
            .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
            .with_state(Arc::clone(&self.state))
    }
}
