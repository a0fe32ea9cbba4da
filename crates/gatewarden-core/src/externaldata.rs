//! External-data provider wire protocol.
//!
//! The admission controller consults this provider with a batched
//! `ProviderRequest` and matches results back by `key`, so item order in the
//! `ProviderResponse` carries no meaning. Field names on the wire are fixed
//! by the protocol and must not drift.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version understood by this provider.
pub const API_VERSION: &str = "externaldata.gatekeeper.sh/v1alpha1";

/// `kind` of a request envelope.
pub const REQUEST_KIND: &str = "ProviderRequest";

/// `kind` of a response envelope.
pub const RESPONSE_KIND: &str = "ProviderResponse";

/// A batched request from the admission controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRequest {
    /// Protocol version of the envelope.
    pub api_version: String,
    /// Envelope kind, `ProviderRequest`.
    pub kind: String,
    /// The batch payload.
    pub request: RequestBody,
}

/// Payload of a [`ProviderRequest`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestBody {
    /// Subject references to process. An empty batch is valid.
    #[serde(default)]
    pub keys: Vec<String>,
}

impl ProviderRequest {
    /// Builds a request for the given subject references.
    #[must_use]
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            api_version: API_VERSION.to_string(),
            kind: REQUEST_KIND.to_string(),
            request: RequestBody {
                keys: keys.into_iter().map(Into::into).collect(),
            },
        }
    }
}

/// A batched response to the admission controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderResponse {
    /// Protocol version of the envelope.
    pub api_version: String,
    /// Envelope kind, `ProviderResponse`.
    pub kind: String,
    /// The result payload.
    pub response: ResponseBody,
}

/// Payload of a [`ProviderResponse`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseBody {
    /// Whether the controller may cache and replay this response.
    pub idempotent: bool,
    /// Per-subject results, in completion order.
    #[serde(default)]
    pub items: Vec<ResponseItem>,
    /// Request-wide failure, e.g. a timeout or a malformed body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_error: Option<String>,
}

/// One per-subject result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseItem {
    /// The subject reference exactly as submitted.
    pub key: String,
    /// Serialized result, absent when `error` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Per-subject failure, `<Kind>: <detail>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseItem {
    /// A successful item carrying a serialized result.
    #[must_use]
    pub fn value(key: String, value: Value) -> Self {
        Self {
            key,
            value: Some(value),
            error: None,
        }
    }

    /// A failed item carrying an error string.
    #[must_use]
    pub fn error(key: String, error: impl ToString) -> Self {
        Self {
            key,
            value: None,
            error: Some(error.to_string()),
        }
    }
}

impl ProviderResponse {
    /// Builds a response from collected items.
    #[must_use]
    pub fn from_items(items: Vec<ResponseItem>) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: RESPONSE_KIND.to_string(),
            response: ResponseBody {
                idempotent: true,
                items,
                system_error: None,
            },
        }
    }

    /// Builds a response whose only content is a request-wide failure.
    #[must_use]
    pub fn system_error(error: impl ToString) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: RESPONSE_KIND.to_string(),
            response: ResponseBody {
                idempotent: true,
                items: Vec::new(),
                system_error: Some(error.to_string()),
            },
        }
    }
}
