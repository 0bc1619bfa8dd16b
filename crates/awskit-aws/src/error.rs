//! Provider error parsing.
//!
//! AWS reports failures in one of three shapes: an XML `<Error>` document
//! (Query and REST-XML services), a JSON body with `__type` or an
//! `x-amzn-ErrorType` header (REST-JSON services), or an empty body for
//! `HEAD` requests. All of them become a [`ProviderError`]; the core decides
//! whether it is retryable.

use crate::client::HttpResponse;
use crate::xml::XmlNode;
use awskit_core::ProviderError;

/// Maximum length of a raw body quoted in an error message.
const SNIPPET_CHARS: usize = 200;

fn snippet(body: &str) -> String {
    body.chars().take(SNIPPET_CHARS).collect()
}

/// Error code used when a response carries nothing but a status.
pub fn status_code_name(status: u16) -> String {
    match status {
        400 => "BadRequest".to_string(),
        401 => "Unauthorized".to_string(),
        403 => "AccessDenied".to_string(),
        404 => "NotFound".to_string(),
        409 => "Conflict".to_string(),
        412 => "PreconditionFailed".to_string(),
        429 => "TooManyRequestsException".to_string(),
        500 => "InternalError".to_string(),
        502 => "BadGateway".to_string(),
        503 => "ServiceUnavailable".to_string(),
        504 => "GatewayTimeout".to_string(),
        other => format!("Http{}", other),
    }
}

/// Parse an AWS XML error response.
///
/// ```xml
/// <ErrorResponse>
///   <Error>
///     <Code>InvalidParameterValue</Code>
///     <Message>The filter ...</Message>
///   </Error>
///   <RequestId>abc-123</RequestId>
/// </ErrorResponse>
/// ```
///
/// EC2 wraps the error in `<Response><Errors>` and S3 uses a bare `<Error>`
/// root; both are found by descendant search.
pub fn parse_xml_error(status: u16, body: &str) -> ProviderError {
    let root = match XmlNode::parse(body) {
        Ok(root) => root,
        Err(_) => {
            return ProviderError::new(&status_code_name(status), &snippet(body)).with_status(status);
        }
    };
    let text = |name: &str| {
        if root.name == name && !root.text.is_empty() {
            Some(root.text.clone())
        } else {
            root.find_text(name).map(String::from)
        }
    };

    let code = text("Code").unwrap_or_else(|| status_code_name(status));
    let message = text("Message").unwrap_or_else(|| format!("HTTP {} with no error message", status));
    let mut err = ProviderError::new(&code, &message).with_status(status);
    if let Some(id) = text("RequestId").or_else(|| text("RequestID")) {
        err = err.with_request_id(&id);
    }
    err
}

/// Parse an AWS JSON error response.
///
/// ```json
/// {
///   "__type": "ResourceNotFoundException",
///   "message": "Function not found: ..."
/// }
/// ```
///
/// The `x-amzn-ErrorType` header wins over the body when present.
pub fn parse_json_error(status: u16, body: &str, error_type: Option<&str>) -> ProviderError {
    let header_code = error_type
        .map(|t| t.split(':').next().unwrap_or(t).trim())
        .filter(|t| !t.is_empty())
        .map(String::from);

    let parsed = serde_json::from_str::<serde_json::Value>(body).ok();
    let body_code = parsed.as_ref().and_then(|val| {
        val.get("__type")
            .or_else(|| val.get("code"))
            .or_else(|| val.get("Code"))
            .and_then(|v| v.as_str())
            // __type can be "com.amazonaws.lambda#ResourceNotFoundException"
            .map(|s| s.rsplit('#').next().unwrap_or(s).to_string())
    });
    let message = parsed
        .as_ref()
        .and_then(|val| {
            val.get("message")
                .or_else(|| val.get("Message"))
                .or_else(|| val.get("errorMessage"))
                .and_then(|v| v.as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| {
            if body.trim().is_empty() {
                format!("HTTP {} with no error message", status)
            } else {
                snippet(body)
            }
        });

    let code = header_code.or(body_code).unwrap_or_else(|| status_code_name(status));
    ProviderError::new(&code, &message).with_status(status)
}

/// Turn a non-2xx response into a [`ProviderError`].
pub fn from_response(response: &HttpResponse) -> ProviderError {
    let body = response.text();
    let trimmed = body.trim_start();
    let mut err = if trimmed.starts_with('<') {
        parse_xml_error(response.status, trimmed)
    } else if trimmed.is_empty() && response.header("x-amzn-errortype").is_none() {
        ProviderError::new(
            &status_code_name(response.status),
            &format!("HTTP {} with empty body", response.status),
        )
        .with_status(response.status)
    } else {
        parse_json_error(response.status, trimmed, response.header("x-amzn-errortype"))
    };
    if err.request_id.is_none() {
        if let Some(ref id) = response.request_id {
            err = err.with_request_id(id);
        }
    }
    err
}

/// Map a transport failure.
pub fn from_transport(err: &reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::timeout(&err.to_string())
    } else if err.is_builder() {
        ProviderError::new("InvalidRequest", &err.to_string())
    } else {
        // Connect, request and body failures are all connection-level.
        ProviderError::connection(&err.to_string())
    }
}
