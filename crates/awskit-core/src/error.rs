//! Error taxonomy for dispatched operations.
//!
//! Every failure that leaves the dispatcher is a [`ToolkitError`] tagged with an
//! [`ErrorKind`]. Provider failures arrive as [`ProviderError`]s and are
//! classified here, following the retry classification used by the AWS SDKs:
//! throttling and server faults are transient, expired tokens are recoverable
//! by a credential refresh, and everything else is permanent.

use crate::capability::ProviderError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No usable credentials could be resolved.
    Auth,
    /// Credentials are stale and a refresh was attempted or is impossible.
    AuthExpired,
    /// Network, throttling or server error that may succeed on retry.
    Transient,
    /// Validation, not-found, permission or conflict error. Never retried.
    Permanent,
    /// The retry budget ran out; wraps the last transient failure.
    RetryExhausted,
    /// The caller cancelled the execution.
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Auth => "AuthError",
            ErrorKind::AuthExpired => "AuthExpired",
            ErrorKind::Transient => "Transient",
            ErrorKind::Permanent => "Permanent",
            ErrorKind::RetryExhausted => "RetryExhausted",
            ErrorKind::Cancelled => "Cancelled",
        }
    }

    /// Short guidance shown next to the error by front-ends.
    pub fn hint(&self) -> &'static str {
        match self {
            ErrorKind::Auth => "no usable credentials; configure keys, a profile or a role",
            ErrorKind::AuthExpired => "credentials expired and could not be refreshed",
            ErrorKind::Transient => "temporary failure; try again",
            ErrorKind::Permanent => "will not succeed without changing the request",
            ErrorKind::RetryExhausted => "service kept failing; try again later",
            ErrorKind::Cancelled => "cancelled by caller",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by the dispatcher and the credential provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolkitError {
    pub kind: ErrorKind,
    /// Provider error code (e.g. "AccessDenied", "Throttling") or a local code.
    pub code: String,
    /// Human-readable message, verbatim from the provider where available.
    pub message: String,
    /// `service:operation` the error belongs to.
    pub operation: Option<String>,
    /// Underlying calls made before the error surfaced.
    pub attempts: u32,
    pub status_code: Option<u16>,
    pub request_id: Option<String>,
    /// For `RetryExhausted`: the kind of the last underlying failure.
    pub last_kind: Option<ErrorKind>,
    /// Whether the (last) underlying failure was a throttling signal.
    pub throttled: bool,
}

impl ToolkitError {
    pub fn new(kind: ErrorKind, code: &str, message: &str) -> Self {
        Self {
            kind,
            code: code.to_string(),
            message: message.to_string(),
            operation: None,
            attempts: 0,
            status_code: None,
            request_id: None,
            last_kind: None,
            throttled: false,
        }
    }

    pub fn auth(message: &str) -> Self {
        Self::new(ErrorKind::Auth, "CredentialError", message)
    }

    pub fn auth_expired(message: &str) -> Self {
        Self::new(ErrorKind::AuthExpired, "CredentialsExpired", message)
    }

    pub fn permanent(code: &str, message: &str) -> Self {
        Self::new(ErrorKind::Permanent, code, message)
    }

    pub fn transient(code: &str, message: &str) -> Self {
        Self::new(ErrorKind::Transient, code, message)
    }

    pub fn validation(message: &str) -> Self {
        Self::permanent("ValidationError", message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "Cancelled", "execution cancelled by caller")
    }

    /// Wrap the last transient failure once the retry budget is spent.
    pub fn retry_exhausted(last: ToolkitError) -> Self {
        Self {
            kind: ErrorKind::RetryExhausted,
            last_kind: Some(last.kind),
            ..last
        }
    }

    /// Classify a provider failure.
    pub fn from_provider(err: &ProviderError) -> Self {
        let (kind, throttled) = classify(err);
        Self {
            kind,
            code: err.code.clone(),
            message: err.message.clone(),
            operation: None,
            attempts: 0,
            status_code: err.status_code,
            request_id: err.request_id.clone(),
            last_kind: None,
            throttled,
        }
    }

    pub fn with_operation(mut self, operation: &str) -> Self {
        self.operation = Some(operation.to_string());
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    /// Re-tag the error with a different kind, keeping its context.
    pub fn into_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, ErrorKind::Transient | ErrorKind::AuthExpired)
    }
}

impl fmt::Display for ToolkitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(ref op) = self.operation {
            write!(f, " in {}", op)?;
        }
        if self.attempts > 0 {
            write!(f, " after {} attempt(s)", self.attempts)?;
        }
        write!(f, ": [{}] {}", self.code, self.message)?;
        if let Some(status) = self.status_code {
            write!(f, " (HTTP {})", status)?;
        }
        if let Some(ref req_id) = self.request_id {
            write!(f, " [RequestId: {}]", req_id)?;
        }
        Ok(())
    }
}

impl std::error::Error for ToolkitError {}

/// Provider codes that signal a rate limit.
const THROTTLING_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "ThrottledException",
    "RequestThrottledException",
    "TooManyRequestsException",
    "ProvisionedThroughputExceededException",
    "RequestLimitExceeded",
    "BandwidthLimitExceeded",
    "LimitExceededException",
    "RequestThrottled",
    "SlowDown",
    "EC2ThrottledException",
    "PriorRequestNotComplete",
];

/// Provider codes for server-side faults worth retrying.
const TRANSIENT_CODES: &[&str] = &[
    "TransactionInProgressException",
    "InternalError",
    "InternalFailure",
    "InternalServerError",
    "ServiceUnavailable",
    "ServiceUnavailableException",
    "RequestTimeout",
    "RequestTimeoutException",
    "IDPCommunicationError",
];

/// Provider codes meaning the signing credentials are no longer valid in time.
const EXPIRED_CODES: &[&str] = &[
    "ExpiredToken",
    "ExpiredTokenException",
    "RequestExpired",
    "TokenRefreshRequired",
];

/// Classify a provider error into a kind plus a throttling flag.
pub fn classify(err: &ProviderError) -> (ErrorKind, bool) {
    if EXPIRED_CODES.contains(&err.code.as_str()) {
        return (ErrorKind::AuthExpired, false);
    }
    if THROTTLING_CODES.contains(&err.code.as_str()) || err.status_code == Some(429) {
        return (ErrorKind::Transient, true);
    }
    if err.timeout || err.connect {
        return (ErrorKind::Transient, false);
    }
    if TRANSIENT_CODES.contains(&err.code.as_str()) {
        return (ErrorKind::Transient, false);
    }
    match err.status_code {
        Some(500) | Some(502) | Some(503) | Some(504) => (ErrorKind::Transient, false),
        _ => (ErrorKind::Permanent, false),
    }
}

pub type ToolkitResult<T> = Result<T, ToolkitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_context() {
        let err = ToolkitError::permanent("NoSuchBucket", "The specified bucket does not exist")
            .with_operation("s3:delete_bucket")
            .with_attempts(1)
            .with_status(404);
        let s = err.to_string();
        assert!(s.starts_with("Permanent in s3:delete_bucket after 1 attempt(s)"));
        assert!(s.contains("[NoSuchBucket]"));
        assert!(s.contains("HTTP 404"));
    }

    #[test]
    fn throttling_is_transient_and_flagged() {
        let err = ProviderError::new("Throttling", "Rate exceeded").with_status(400);
        assert_eq!(classify(&err), (ErrorKind::Transient, true));
        let err = ProviderError::new("Unknown", "slow down").with_status(429);
        assert_eq!(classify(&err), (ErrorKind::Transient, true));
    }

    #[test]
    fn server_faults_are_transient() {
        let err = ProviderError::new("UnknownError", "bad gateway").with_status(502);
        assert_eq!(classify(&err), (ErrorKind::Transient, false));
        let err = ProviderError::new("InternalError", "oops").with_status(400);
        assert_eq!(classify(&err), (ErrorKind::Transient, false));
    }

    #[test]
    fn transport_failures_are_transient() {
        assert_eq!(classify(&ProviderError::timeout("timed out")).0, ErrorKind::Transient);
        assert_eq!(classify(&ProviderError::connection("refused")).0, ErrorKind::Transient);
    }

    #[test]
    fn expired_tokens_need_refresh() {
        let err = ProviderError::new("ExpiredToken", "The security token included in the request is expired")
            .with_status(400);
        assert_eq!(classify(&err).0, ErrorKind::AuthExpired);
    }

    #[test]
    fn permission_and_validation_are_permanent() {
        let err = ProviderError::new("AccessDenied", "Access Denied").with_status(403);
        assert_eq!(classify(&err).0, ErrorKind::Permanent);
        let err = ProviderError::new("InvalidParameterValue", "bad").with_status(400);
        assert_eq!(classify(&err).0, ErrorKind::Permanent);
    }

    #[test]
    fn retry_exhausted_keeps_last_failure() {
        let last = ToolkitError::from_provider(&ProviderError::new("SlowDown", "Please reduce your request rate").with_status(503))
            .with_attempts(5);
        let err = ToolkitError::retry_exhausted(last);
        assert_eq!(err.kind, ErrorKind::RetryExhausted);
        assert_eq!(err.last_kind, Some(ErrorKind::Transient));
        assert!(err.throttled);
        assert_eq!(err.code, "SlowDown");
        assert_eq!(err.attempts, 5);
    }

    #[test]
    fn serde_roundtrip_keeps_kind() {
        let err = ToolkitError::auth("no credential source configured").with_operation("ec2:list_instances");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"kind\":\"auth\""));
        let back: ToolkitError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }
}
