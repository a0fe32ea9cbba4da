//! Executor contract.
//!
//! The executor turns one subject reference into a [`VerifyResult`] using
//! whatever stores, verifiers, and policy it was built with. The HTTP
//! surface consumes the trait; [`core::CoreExecutor`] is the stock
//! composition over the collaborator boundary.
//!
//! Servers receive a [`GetExecutor`] factory rather than an executor so a
//! configuration reload can swap the backing object atomically. Handlers
//! snapshot the factory's return once per request and use that snapshot for
//! the whole request.

pub mod config;
pub mod core;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::reference::Reference;
use crate::store::{ReferrerStore, StoreError};
use crate::verifier::VerifierReport;

/// Verify-request deadline applied when the configuration omits one.
pub const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Mutation-request deadline applied when the configuration omits one.
pub const DEFAULT_MUTATION_TIMEOUT: Duration = Duration::from_millis(2000);

/// Factory returning the current executor; see the module docs.
pub type GetExecutor = Arc<dyn Fn() -> Arc<dyn Executor> + Send + Sync>;

/// Errors surfaced by an executor.
#[derive(Debug, Error, Clone)]
pub enum ExecutorError {
    /// No store returned any referrer for the subject.
    #[error("no referrers found for {0}")]
    ReferrersNotFound(String),

    /// A store call failed while verifying.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Aggregate outcome of verifying one subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResult {
    /// The policy verdict over all reports.
    pub is_success: bool,
    /// One report per verifier run.
    pub verifier_reports: Vec<VerifierReport>,
}

/// Produces verification results for subject references.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Verifies one subject.
    async fn verify(&self, subject: &Reference) -> Result<VerifyResult, ExecutorError>;

    /// Looks up a configured store by name; the mutation path resolves
    /// digests through this.
    fn store(&self, name: &str) -> Option<Arc<dyn ReferrerStore>>;

    /// Deadline for a verify request.
    fn verify_request_timeout(&self) -> Duration {
        DEFAULT_VERIFY_TIMEOUT
    }

    /// Deadline for a mutation request.
    fn mutation_request_timeout(&self) -> Duration {
        DEFAULT_MUTATION_TIMEOUT
    }
}
