//! Error kinds surfaced over the provider protocol.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::executor::ExecutorError;
use crate::externaldata::ProviderResponse;
use crate::reference::ReferenceError;
use crate::store::StoreError;

/// A failure attributable to one subject or to the whole request.
///
/// The rendered form, `<Kind>: <detail>`, is what lands in a response
/// item's `error` field or in the envelope's `systemError`, and callers
/// match on the kind prefix.
#[derive(Debug, Error, Clone)]
pub enum ProviderError {
    /// The subject reference did not parse. The detail is fixed so callers
    /// can match it; the specific grammar violation goes to the log.
    #[error("ReferenceInvalid: failed to parse subject reference")]
    ReferenceInvalid,

    /// The executor failed; the executor's message passes through.
    #[error("ExecutorFailure: {0}")]
    ExecutorFailure(String),

    /// A mutate-path store lookup failed.
    #[error("StoreFailure: {0}")]
    StoreFailure(String),

    /// The handler exceeded its deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The request body was malformed.
    #[error("BadRequest: {0}")]
    BadRequest(String),
}

impl ProviderError {
    /// The HTTP status a request-wide occurrence of this error maps to.
    ///
    /// Per-subject kinds ride inside a `200` response; only request-wide
    /// failures change the status line.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::ReferenceInvalid | Self::ExecutorFailure(_) | Self::StoreFailure(_) => {
                StatusCode::OK
            }
            Self::Timeout(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ProviderError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(ProviderResponse::system_error(&self))).into_response()
    }
}

impl From<ReferenceError> for ProviderError {
    fn from(_: ReferenceError) -> Self {
        Self::ReferenceInvalid
    }
}

impl From<ExecutorError> for ProviderError {
    fn from(error: ExecutorError) -> Self {
        Self::ExecutorFailure(error.to_string())
    }
}

impl From<StoreError> for ProviderError {
    fn from(error: StoreError) -> Self {
        Self::StoreFailure(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_kind_prefixed_messages() {
        assert_eq!(
            ProviderError::ReferenceInvalid.to_string(),
            "ReferenceInvalid: failed to parse subject reference"
        );
        assert_eq!(
            ProviderError::ExecutorFailure("boom".into()).to_string(),
            "ExecutorFailure: boom"
        );
        assert_eq!(
            ProviderError::Timeout("operation timed out after 5000ms".into()).to_string(),
            "Timeout: operation timed out after 5000ms"
        );
    }

    #[test]
    fn status_codes() {
        assert_eq!(ProviderError::ReferenceInvalid.status_code(), StatusCode::OK);
        assert_eq!(
            ProviderError::Timeout(String::new()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ProviderError::BadRequest(String::new()).status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn every_reference_error_maps_to_the_fixed_detail() {
        let error = crate::reference::Reference::parse("&&").unwrap_err();
        let mapped = ProviderError::from(error);
        assert_eq!(
            mapped.to_string(),
            "ReferenceInvalid: failed to parse subject reference"
        );
    }
}
