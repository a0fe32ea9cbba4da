//! # gatewarden-core
//!
//! Core library for gatewarden, an external-data provider consulted by a
//! Kubernetes admission controller. For every container-image reference in
//! a batch it resolves an immutable digest, runs pluggable verifiers over
//! the image's signed referrers, evaluates a policy over the reports, and
//! answers the external-data protocol.
//!
//! ## Pieces
//!
//! - **Reference parsing**: pure normalization of `repo[:tag][@digest]`
//!   strings ([`reference`])
//! - **Wire protocol**: the request/response envelopes ([`externaldata`])
//! - **Concurrency plumbing**: keyed single-flight ([`keymutex`]) over a
//!   TTL result cache ([`cache`])
//! - **Collaborators**: narrow trait boundaries for stores, verifiers, and
//!   policy ([`store`], [`verifier`], [`policy`]), composed by the stock
//!   executor ([`executor`])
//! - **HTTP surface**: the verify/mutate/healthz endpoints with their
//!   deadline harness ([`provider`])
//!
//! Registry clients, concrete verifiers, and policy languages live behind
//! the trait boundaries and are not part of this crate.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use gatewarden_core::executor::core::CoreExecutor;
//! use gatewarden_core::executor::{Executor, GetExecutor};
//! use gatewarden_core::provider::ProviderHandler;
//!
//! let executor: Arc<dyn Executor> = Arc::new(CoreExecutor::builder().build());
//! let get_executor: GetExecutor = Arc::new(move || Arc::clone(&executor));
//! let provider = ProviderHandler::new(get_executor, Duration::from_secs(10), "oras");
//! let app = provider.router();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod cache;
pub mod executor;
pub mod externaldata;
pub mod keymutex;
pub mod mocks;
pub mod policy;
pub mod provider;
pub mod reference;
pub mod store;
pub mod verifier;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::executor::config::ExecutorConfig;
    pub use crate::executor::core::CoreExecutor;
    pub use crate::executor::{Executor, GetExecutor, VerifyResult};
    pub use crate::provider::ProviderHandler;
    pub use crate::reference::{Digest, Reference};
    pub use crate::store::ReferrerStore;
    pub use crate::verifier::{ReferenceVerifier, VerifierReport};
}

pub use executor::{Executor, GetExecutor, VerifyResult};
pub use provider::ProviderHandler;
pub use reference::Reference;
