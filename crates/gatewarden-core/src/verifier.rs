//! Verifier boundary.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::reference::Reference;
use crate::store::{ReferenceDescriptor, ReferrerStore};

/// A verifier failed to produce a report.
#[derive(Debug, Error, Clone)]
#[error("verifier {name} failed: {message}")]
pub struct VerifierError {
    /// Name of the failing verifier.
    pub name: String,
    /// What went wrong.
    pub message: String,
}

/// Outcome of running one verifier against one referrer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifierReport {
    /// The subject the report is about, as submitted.
    pub subject: String,
    /// Name of the verifier that produced the report.
    pub name: String,
    /// Artifact type of the referrer that was checked.
    pub artifact_type: String,
    /// Whether the check passed.
    pub is_success: bool,
    /// Human-readable outcome detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Verifier-specific structured output.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub extensions: Value,
}

impl VerifierReport {
    /// Builds a failure report for a verifier that errored instead of
    /// completing.
    #[must_use]
    pub fn from_error(
        subject: &Reference,
        referrer: &ReferenceDescriptor,
        error: &VerifierError,
    ) -> Self {
        Self {
            subject: subject.original().to_string(),
            name: error.name.clone(),
            artifact_type: referrer.artifact_type.clone(),
            is_success: false,
            message: Some(error.message.clone()),
            extensions: Value::Null,
        }
    }
}

/// A pluggable checker over referrer artifacts.
#[async_trait]
pub trait ReferenceVerifier: Send + Sync {
    /// Verifier name, echoed in reports.
    fn name(&self) -> &str;

    /// Whether this verifier understands the given artifact type.
    fn can_verify(&self, artifact_type: &str) -> bool;

    /// Runs the check for one referrer of `subject`, reading manifest and
    /// blob content through `store` as needed.
    async fn verify(
        &self,
        subject: &Reference,
        referrer: &ReferenceDescriptor,
        store: &dyn ReferrerStore,
    ) -> Result<VerifierReport, VerifierError>;
}
