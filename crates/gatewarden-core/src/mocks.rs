//! Test doubles for the collaborator boundary.
//!
//! Used by this crate's own tests and by embedders exercising handler or
//! executor behavior without a registry. The store resolves tags from a
//! scripted map and the verifier counts invocations, which is what the
//! single-flight tests key on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::policy::PolicyEnforcer;
use crate::reference::{Digest, Reference};
use crate::store::{
    ListReferrersResult, ReferenceDescriptor, ReferenceManifest, ReferrerStore, StoreError,
    SubjectDescriptor,
};
use crate::verifier::{ReferenceVerifier, VerifierError, VerifierReport};

const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
const ARTIFACT_MEDIA_TYPE: &str = "application/vnd.oci.artifact.manifest.v1+json";

/// A well-formed digest for tests.
#[must_use]
pub fn test_digest() -> Digest {
    Digest::parse("sha256:2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae")
        .expect("static test digest is valid")
}

/// A scripted referrer store.
pub struct MockStore {
    name: String,
    referrers: Vec<ReferenceDescriptor>,
    resolutions: HashMap<String, Digest>,
    blobs: HashMap<String, Vec<u8>>,
    descriptor_failure: Option<String>,
    descriptor_lookups: AtomicUsize,
}

impl MockStore {
    /// Creates an empty store with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            referrers: Vec::new(),
            resolutions: HashMap::new(),
            blobs: HashMap::new(),
            descriptor_failure: None,
            descriptor_lookups: AtomicUsize::new(0),
        }
    }

    /// Attaches a referrer of the given artifact type to every subject.
    #[must_use]
    pub fn with_referrer(mut self, artifact_type: impl Into<String>, digest: Digest) -> Self {
        self.referrers.push(ReferenceDescriptor {
            digest,
            artifact_type: artifact_type.into(),
            size: 0,
        });
        self
    }

    /// Scripts a tag-to-digest resolution.
    #[must_use]
    pub fn with_resolution(mut self, tag: impl Into<String>, digest: Digest) -> Self {
        self.resolutions.insert(tag.into(), digest);
        self
    }

    /// Scripts blob content for a digest.
    #[must_use]
    pub fn with_blob(mut self, digest: &Digest, content: Vec<u8>) -> Self {
        self.blobs.insert(digest.to_string(), content);
        self
    }

    /// Makes every descriptor lookup fail with the given message.
    #[must_use]
    pub fn with_descriptor_failure(mut self, message: impl Into<String>) -> Self {
        self.descriptor_failure = Some(message.into());
        self
    }

    /// How many descriptor lookups have run.
    #[must_use]
    pub fn descriptor_lookups(&self) -> usize {
        self.descriptor_lookups.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ReferrerStore for MockStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_referrers(
        &self,
        _subject: &Reference,
        artifact_types: &[String],
        _next_token: Option<&str>,
    ) -> Result<ListReferrersResult, StoreError> {
        let referrers = self
            .referrers
            .iter()
            .filter(|referrer| {
                artifact_types.is_empty()
                    || artifact_types.iter().any(|t| *t == referrer.artifact_type)
            })
            .cloned()
            .collect();
        Ok(ListReferrersResult {
            referrers,
            next_token: None,
        })
    }

    async fn get_blob_content(
        &self,
        _subject: &Reference,
        digest: &Digest,
    ) -> Result<Vec<u8>, StoreError> {
        Ok(self
            .blobs
            .get(&digest.to_string())
            .cloned()
            .unwrap_or_default())
    }

    async fn get_reference_manifest(
        &self,
        _subject: &Reference,
        referrer: &ReferenceDescriptor,
    ) -> Result<ReferenceManifest, StoreError> {
        Ok(ReferenceManifest {
            media_type: ARTIFACT_MEDIA_TYPE.to_string(),
            artifact_type: referrer.artifact_type.clone(),
            blobs: Vec::new(),
        })
    }

    async fn get_subject_descriptor(
        &self,
        subject: &Reference,
    ) -> Result<SubjectDescriptor, StoreError> {
        self.descriptor_lookups.fetch_add(1, Ordering::Relaxed);
        if let Some(message) = &self.descriptor_failure {
            return Err(StoreError::Failure(message.clone()));
        }

        let digest = match subject.digest() {
            Some(digest) => digest.clone(),
            None => subject
                .tag()
                .and_then(|tag| self.resolutions.get(tag))
                .cloned()
                .ok_or_else(|| StoreError::SubjectNotFound(subject.original().to_string()))?,
        };
        Ok(SubjectDescriptor {
            digest,
            media_type: MANIFEST_MEDIA_TYPE.to_string(),
            size: 0,
        })
    }
}

/// A verifier with a scripted outcome and an invocation counter.
pub struct MockVerifier {
    name: String,
    artifact_type: String,
    outcome: bool,
    delay: Option<Duration>,
    error: Option<String>,
    invocations: AtomicUsize,
}

impl MockVerifier {
    /// Creates a succeeding verifier for one artifact type.
    #[must_use]
    pub fn new(name: impl Into<String>, artifact_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            artifact_type: artifact_type.into(),
            outcome: true,
            delay: None,
            error: None,
            invocations: AtomicUsize::new(0),
        }
    }

    /// Makes the verifier report failure instead of success.
    #[must_use]
    pub fn failing(mut self) -> Self {
        self.outcome = false;
        self
    }

    /// Makes every run sleep before reporting, to simulate slow remote
    /// checks.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Makes every run return an error instead of a report.
    #[must_use]
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }

    /// How many times `verify` has run.
    #[must_use]
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ReferenceVerifier for MockVerifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_verify(&self, artifact_type: &str) -> bool {
        artifact_type == self.artifact_type
    }

    async fn verify(
        &self,
        subject: &Reference,
        referrer: &ReferenceDescriptor,
        _store: &dyn ReferrerStore,
    ) -> Result<VerifierReport, VerifierError> {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.error {
            return Err(VerifierError {
                name: self.name.clone(),
                message: message.clone(),
            });
        }
        Ok(VerifierReport {
            subject: subject.original().to_string(),
            name: self.name.clone(),
            artifact_type: referrer.artifact_type.clone(),
            is_success: self.outcome,
            message: Some(if self.outcome {
                "verification succeeded".to_string()
            } else {
                "verification failed".to_string()
            }),
            extensions: Value::Null,
        })
    }
}

/// A policy that wants every referrer verified and passes the subject when
/// any report succeeded.
pub struct AnySuccessPolicy;

impl PolicyEnforcer for AnySuccessPolicy {
    fn verify_needed(&self, _subject: &Reference, _referrer: &ReferenceDescriptor) -> bool {
        true
    }

    fn overall_verify_success(&self, reports: &[VerifierReport]) -> bool {
        reports.iter().any(|report| report.is_success)
    }
}
