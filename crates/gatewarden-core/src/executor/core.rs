//! Stock executor composition.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::config::ExecutorConfig;
use super::{Executor, ExecutorError, VerifyResult};
use crate::policy::PolicyEnforcer;
use crate::reference::Reference;
use crate::store::ReferrerStore;
use crate::verifier::{ReferenceVerifier, VerifierReport};

/// An executor that walks every configured store's referrers and runs every
/// capable verifier against each of them, then asks the policy enforcer for
/// the verdict.
pub struct CoreExecutor {
    stores: Vec<Arc<dyn ReferrerStore>>,
    verifiers: Vec<Arc<dyn ReferenceVerifier>>,
    policy: Option<Arc<dyn PolicyEnforcer>>,
    config: ExecutorConfig,
}

impl CoreExecutor {
    /// Starts building an executor.
    #[must_use]
    pub fn builder() -> CoreExecutorBuilder {
        CoreExecutorBuilder::default()
    }

    /// Pins the subject to a digest through `store` when it does not carry
    /// one already.
    async fn resolve_subject(
        &self,
        store: &Arc<dyn ReferrerStore>,
        subject: &Reference,
    ) -> Result<Reference, ExecutorError> {
        if subject.digest().is_some() {
            return Ok(subject.clone());
        }
        let descriptor = store.get_subject_descriptor(subject).await?;
        debug!(
            subject = subject.original(),
            digest = %descriptor.digest,
            store = store.name(),
            "resolved subject digest"
        );
        Ok(subject.with_digest(descriptor.digest))
    }
}

#[async_trait]
impl Executor for CoreExecutor {
    async fn verify(&self, subject: &Reference) -> Result<VerifyResult, ExecutorError> {
        let mut reports: Vec<VerifierReport> = Vec::new();
        let mut any_referrer = false;

        for store in &self.stores {
            let pinned = self.resolve_subject(store, subject).await?;
            let mut next_token: Option<String> = None;

            loop {
                let page = store
                    .list_referrers(&pinned, &[], next_token.as_deref())
                    .await?;

                for referrer in page.referrers {
                    any_referrer = true;
                    if let Some(policy) = &self.policy {
                        if !policy.verify_needed(&pinned, &referrer) {
                            continue;
                        }
                    }
                    for verifier in &self.verifiers {
                        if !verifier.can_verify(&referrer.artifact_type) {
                            continue;
                        }
                        let report = match verifier
                            .verify(&pinned, &referrer, store.as_ref())
                            .await
                        {
                            Ok(report) => report,
                            Err(error) => {
                                warn!(
                                    subject = subject.original(),
                                    verifier = verifier.name(),
                                    error = %error,
                                    "verifier failed"
                                );
                                VerifierReport::from_error(&pinned, &referrer, &error)
                            }
                        };
                        reports.push(report);
                    }
                }

                next_token = page.next_token;
                if next_token.is_none() {
                    break;
                }
            }
        }

        if !any_referrer {
            return Err(ExecutorError::ReferrersNotFound(
                subject.original().to_string(),
            ));
        }

        let is_success = match &self.policy {
            Some(policy) => policy.overall_verify_success(&reports),
            None => reports.iter().any(|report| report.is_success),
        };
        Ok(VerifyResult {
            is_success,
            verifier_reports: reports,
        })
    }

    fn store(&self, name: &str) -> Option<Arc<dyn ReferrerStore>> {
        self.stores
            .iter()
            .find(|store| store.name() == name)
            .map(Arc::clone)
    }

    fn verify_request_timeout(&self) -> Duration {
        self.config.verify_request_timeout()
    }

    fn mutation_request_timeout(&self) -> Duration {
        self.config.mutation_request_timeout()
    }
}

/// Builder for [`CoreExecutor`].
#[derive(Default)]
pub struct CoreExecutorBuilder {
    stores: Vec<Arc<dyn ReferrerStore>>,
    verifiers: Vec<Arc<dyn ReferenceVerifier>>,
    policy: Option<Arc<dyn PolicyEnforcer>>,
    config: ExecutorConfig,
}

impl CoreExecutorBuilder {
    /// Adds a referrer store.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn ReferrerStore>) -> Self {
        self.stores.push(store);
        self
    }

    /// Adds a verifier.
    #[must_use]
    pub fn verifier(mut self, verifier: Arc<dyn ReferenceVerifier>) -> Self {
        self.verifiers.push(verifier);
        self
    }

    /// Sets the policy enforcer. Without one, any successful report makes
    /// the subject pass.
    #[must_use]
    pub fn policy(mut self, policy: Arc<dyn PolicyEnforcer>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Sets the executor configuration.
    #[must_use]
    pub fn config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Finishes the build.
    #[must_use]
    pub fn build(self) -> CoreExecutor {
        CoreExecutor {
            stores: self.stores,
            verifiers: self.verifiers,
            policy: self.policy,
            config: self.config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{test_digest, AnySuccessPolicy, MockStore, MockVerifier};

    const ARTIFACT_TYPE: &str = "application/vnd.test.signature";

    fn subject() -> Reference {
        Reference::parse("localhost:5000/net-monitor:v1").unwrap()
    }

    #[tokio::test]
    async fn verify_collects_reports_and_applies_policy() {
        let store = Arc::new(
            MockStore::new("oras")
                .with_resolution("v1", test_digest())
                .with_referrer(ARTIFACT_TYPE, test_digest()),
        );
        let verifier = Arc::new(MockVerifier::new("notation", ARTIFACT_TYPE));
        let executor = CoreExecutor::builder()
            .store(store)
            .verifier(Arc::clone(&verifier) as Arc<dyn ReferenceVerifier>)
            .policy(Arc::new(AnySuccessPolicy))
            .build();

        let result = executor.verify(&subject()).await.unwrap();
        assert!(result.is_success);
        assert_eq!(result.verifier_reports.len(), 1);
        assert_eq!(result.verifier_reports[0].name, "notation");
        assert_eq!(result.verifier_reports[0].artifact_type, ARTIFACT_TYPE);
        assert_eq!(verifier.invocations(), 1);
    }

    #[tokio::test]
    async fn verify_resolves_digest_before_listing() {
        let store = Arc::new(
            MockStore::new("oras")
                .with_resolution("v1", test_digest())
                .with_referrer(ARTIFACT_TYPE, test_digest()),
        );
        let verifier = Arc::new(MockVerifier::new("notation", ARTIFACT_TYPE));
        let executor = CoreExecutor::builder()
            .store(Arc::clone(&store) as Arc<dyn ReferrerStore>)
            .verifier(verifier)
            .build();

        executor.verify(&subject()).await.unwrap();
        assert_eq!(store.descriptor_lookups(), 1);
    }

    #[tokio::test]
    async fn verify_skips_verifiers_for_other_artifact_types() {
        let store = Arc::new(
            MockStore::new("oras")
                .with_resolution("v1", test_digest())
                .with_referrer(ARTIFACT_TYPE, test_digest()),
        );
        let other = Arc::new(MockVerifier::new("sbom", "application/vnd.test.sbom"));
        let executor = CoreExecutor::builder()
            .store(store)
            .verifier(Arc::clone(&other) as Arc<dyn ReferenceVerifier>)
            .policy(Arc::new(AnySuccessPolicy))
            .build();

        let result = executor.verify(&subject()).await.unwrap();
        assert!(result.verifier_reports.is_empty());
        assert!(!result.is_success);
        assert_eq!(other.invocations(), 0);
    }

    #[tokio::test]
    async fn verify_errs_without_referrers() {
        let store = Arc::new(MockStore::new("oras").with_resolution("v1", test_digest()));
        let executor = CoreExecutor::builder()
            .store(store)
            .verifier(Arc::new(MockVerifier::new("notation", ARTIFACT_TYPE)))
            .build();

        let error = executor.verify(&subject()).await.unwrap_err();
        assert!(matches!(error, ExecutorError::ReferrersNotFound(_)));
    }

    #[tokio::test]
    async fn verifier_error_becomes_failure_report() {
        let store = Arc::new(
            MockStore::new("oras")
                .with_resolution("v1", test_digest())
                .with_referrer(ARTIFACT_TYPE, test_digest()),
        );
        let broken = Arc::new(
            MockVerifier::new("notation", ARTIFACT_TYPE).with_error("key store unreachable"),
        );
        let executor = CoreExecutor::builder()
            .store(store)
            .verifier(broken)
            .policy(Arc::new(AnySuccessPolicy))
            .build();

        let result = executor.verify(&subject()).await.unwrap();
        assert!(!result.is_success);
        assert_eq!(result.verifier_reports.len(), 1);
        assert!(!result.verifier_reports[0].is_success);
        assert!(result.verifier_reports[0]
            .message
            .as_deref()
            .unwrap()
            .contains("key store unreachable"));
    }

    #[tokio::test]
    async fn unresolvable_subject_is_a_store_error() {
        let store = Arc::new(MockStore::new("oras").with_referrer(ARTIFACT_TYPE, test_digest()));
        let executor = CoreExecutor::builder()
            .store(store)
            .verifier(Arc::new(MockVerifier::new("notation", ARTIFACT_TYPE)))
            .build();

        let error = executor.verify(&subject()).await.unwrap_err();
        assert!(matches!(error, ExecutorError::Store(_)));
    }

    #[test]
    fn store_lookup_by_name() {
        let executor = CoreExecutor::builder()
            .store(Arc::new(MockStore::new("oras")))
            .store(Arc::new(MockStore::new("local")))
            .build();
        assert_eq!(executor.store("local").unwrap().name(), "local");
        assert!(executor.store("absent").is_none());
    }

    #[test]
    fn timeouts_come_from_config() {
        let config: ExecutorConfig = toml::from_str(
            r#"
            verification_request_timeout = "1s"
            "#,
        )
        .unwrap();
        let executor = CoreExecutor::builder().config(config).build();
        assert_eq!(executor.verify_request_timeout(), Duration::from_secs(1));
        assert_eq!(
            executor.mutation_request_timeout(),
            super::super::DEFAULT_MUTATION_TIMEOUT
        );
    }
}
