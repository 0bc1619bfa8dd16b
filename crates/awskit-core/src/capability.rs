//! The seam between the dispatcher and a concrete service client.
//!
//! A [`ServiceCapability`] performs exactly one provider call per invocation.
//! It never retries, refreshes credentials or follows cursors; the dispatcher
//! owns all of that.

use crate::credentials::Credentials;
use crate::operation::{Operation, Params, Service};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Failure reported by a capability for a single call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ProviderError {
    /// Provider error code, e.g. "NoSuchBucket" or "Throttling".
    pub code: String,
    pub message: String,
    pub status_code: Option<u16>,
    pub request_id: Option<String>,
    /// The call did not complete within its deadline.
    pub timeout: bool,
    /// The connection could not be established or was dropped.
    pub connect: bool,
}

impl ProviderError {
    pub fn new(code: &str, message: &str) -> Self {
        Self {
            code: code.to_string(),
            message: message.to_string(),
            status_code: None,
            request_id: None,
            timeout: false,
            connect: false,
        }
    }

    pub fn timeout(message: &str) -> Self {
        Self {
            timeout: true,
            ..Self::new("RequestTimeout", message)
        }
    }

    pub fn connection(message: &str) -> Self {
        Self {
            connect: true,
            ..Self::new("ConnectionError", message)
        }
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    pub fn with_request_id(mut self, request_id: &str) -> Self {
        self.request_id = Some(request_id.to_string());
        self
    }
}

/// Everything a capability needs for one call.
#[derive(Debug, Clone)]
pub struct ProviderCall<'a> {
    pub operation: Operation,
    pub params: &'a Params,
    pub credentials: &'a Credentials,
    pub region: &'a str,
    /// Cursor of the page to fetch, `None` for the first page.
    pub cursor: Option<&'a str>,
    pub page_size: Option<u32>,
    /// Client token for mutating calls, constant across retries.
    pub client_token: Option<&'a str>,
}

/// Normalized response of a single call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// For listing calls a JSON array of items; otherwise any JSON value.
    pub payload: Value,
    /// Cursor of the next page, if the provider reported one.
    pub cursor: Option<String>,
    /// Resource states reported by a mutating call, one per affected resource.
    pub states: Vec<String>,
}

impl ProviderResponse {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            cursor: None,
            states: Vec::new(),
        }
    }

    pub fn page(items: Vec<Value>, cursor: Option<String>) -> Self {
        Self {
            payload: Value::Array(items),
            cursor,
            states: Vec::new(),
        }
    }

    pub fn with_states(mut self, states: Vec<String>) -> Self {
        self.states = states;
        self
    }
}

/// A pre-authenticated client for one provider service.
#[async_trait]
pub trait ServiceCapability: Send + Sync {
    /// The service this capability serves.
    fn service(&self) -> Service;

    /// Perform one provider call.
    async fn call(&self, call: ProviderCall<'_>) -> Result<ProviderResponse, ProviderError>;
}
