//! Policy enforcer boundary.

use crate::reference::Reference;
use crate::store::ReferenceDescriptor;
use crate::verifier::VerifierReport;

/// Decides whether a set of verifier reports satisfies admission.
pub trait PolicyEnforcer: Send + Sync {
    /// Whether the given referrer needs verification at all. Returning
    /// `false` skips it without a report.
    fn verify_needed(&self, subject: &Reference, referrer: &ReferenceDescriptor) -> bool;

    /// The overall verdict for the collected reports.
    fn overall_verify_success(&self, reports: &[VerifierReport]) -> bool;
}
