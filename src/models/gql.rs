//! GQL request/response structures.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::GqlOperation;

/// A GQL request body for Twitch's persisted query system.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GqlRequest {
    pub operation_name: String,
    pub extensions: GqlExtensions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GqlExtensions {
    pub persisted_query: PersistedQuery,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedQuery {
    pub version: u8,
    pub sha256_hash: String,
}

impl GqlRequest {
    /// Create a new GQL request from an operation definition.
    pub fn new(operation: &GqlOperation, variables: Option<Value>) -> Self {
        Self {
            operation_name: operation.name.to_string(),
            extensions: GqlExtensions {
                persisted_query: PersistedQuery {
                    version: 1,
                    sha256_hash: operation.sha256().to_string(),
                },
            },
            variables,
        }
    }
}

/// A generic GQL response wrapper.
#[derive(Debug, Clone, Deserialize)]
pub struct GqlResponse {
    pub data: Option<Value>,
    pub errors: Option<Vec<GqlError>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GqlError {
    pub message: String,
    pub path: Option<Vec<Value>>,
}

impl GqlResponse {
    /// Check if the response contains errors.
    pub fn has_errors(&self) -> bool {
        self.errors.as_ref().is_some_and(|e| !e.is_empty())
    }

    /// Whether any error message indicates a transient backend failure
    /// that warrants retrying the whole operation batch.
    pub fn is_retriable(&self) -> bool {
        const TRANSIENT: [&str; 3] = [
            "service unavailable",
            "service timeout",
            "context deadline exceeded",
        ];
        self.errors
            .as_ref()
            .is_some_and(|errors| errors.iter().any(|e| TRANSIENT.contains(&e.message.as_str())))
    }
}

// =============================================================================
// Tests
// =============================================================================
