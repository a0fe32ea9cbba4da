//! Referrer store boundary.
//!
//! A referrer store is a read-only source of artifacts that refer to a
//! subject image, typically backed by a registry. The engine consumes the
//! capability set below and nothing else; registry clients, remote caching,
//! and authentication all live behind it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::reference::{Digest, Reference};

/// Errors surfaced by referrer store implementations.
#[derive(Debug, Error, Clone)]
pub enum StoreError {
    /// The subject reference does not resolve in this store.
    #[error("subject {0} not found")]
    SubjectNotFound(String),

    /// Any other store failure; the message passes through to the caller.
    #[error("{0}")]
    Failure(String),
}

/// Descriptor of a resolved subject image.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectDescriptor {
    /// The immutable digest the subject resolves to.
    pub digest: Digest,
    /// Media type of the subject manifest.
    pub media_type: String,
    /// Size of the subject manifest in bytes.
    pub size: u64,
}

/// Descriptor of one referrer artifact attached to a subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceDescriptor {
    /// Digest of the referrer manifest.
    pub digest: Digest,
    /// Artifact type, used to select verifiers.
    pub artifact_type: String,
    /// Size of the referrer manifest in bytes.
    pub size: u64,
}

/// A referrer manifest with its blob descriptors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceManifest {
    /// Media type of the manifest.
    pub media_type: String,
    /// Artifact type declared by the manifest.
    pub artifact_type: String,
    /// Blob descriptors, as raw descriptor objects.
    #[serde(default)]
    pub blobs: Vec<Value>,
}

/// One page of referrers.
#[derive(Debug, Clone, Default)]
pub struct ListReferrersResult {
    /// The referrers on this page.
    pub referrers: Vec<ReferenceDescriptor>,
    /// Continuation token; `None` on the last page.
    pub next_token: Option<String>,
}

/// Capability set of a referrer store.
#[async_trait]
pub trait ReferrerStore: Send + Sync {
    /// Store name, used to select the mutation store.
    fn name(&self) -> &str;

    /// Lists referrers of `subject`, optionally filtered by artifact type.
    /// An empty `artifact_types` slice means no filter. `next_token`
    /// continues a previous page.
    async fn list_referrers(
        &self,
        subject: &Reference,
        artifact_types: &[String],
        next_token: Option<&str>,
    ) -> Result<ListReferrersResult, StoreError>;

    /// Fetches the complete blob content for `digest`.
    ///
    /// Implementations must return the entire blob: a partial read is a
    /// [`StoreError::Failure`], not a short buffer.
    async fn get_blob_content(
        &self,
        subject: &Reference,
        digest: &Digest,
    ) -> Result<Vec<u8>, StoreError>;

    /// Fetches the manifest of one referrer.
    async fn get_reference_manifest(
        &self,
        subject: &Reference,
        referrer: &ReferenceDescriptor,
    ) -> Result<ReferenceManifest, StoreError>;

    /// Resolves the subject to its descriptor, including the digest.
    async fn get_subject_descriptor(
        &self,
        subject: &Reference,
    ) -> Result<SubjectDescriptor, StoreError>;
}
