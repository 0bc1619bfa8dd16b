//! Base AWS HTTP client with SigV4 signing.
//!
//! Sends exactly one signed request per call and turns non-2xx responses into
//! [`ProviderError`]s. Retries, backoff and credential refresh belong to the
//! dispatcher, so nothing here loops or sleeps.

use crate::error;
use crate::signing::{uri_encode, SigV4Signer};
use awskit_core::{Credentials, Params, ParamsExt, ProviderError, Region, Service};
use reqwest::Client;
use serde_json::Value;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

pub const USER_AGENT: &str = concat!("awskit/", env!("CARGO_PKG_VERSION"));

/// A request before endpoint resolution and signing.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: String,
    /// Already URI-encoded path, starting with `/`.
    pub path: String,
    /// Raw query parameters; encoded when the URL is built.
    pub query: Vec<(String, String)>,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_string(),
            path: if path.starts_with('/') {
                path.to_string()
            } else {
                format!("/{}", path)
            },
            query: Vec::new(),
            headers: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    /// AWS Query protocol call: form-encoded POST to `/`.
    ///
    /// Used by EC2, IAM, STS, CloudWatch and RDS.
    pub fn query_api(params: &BTreeMap<String, String>) -> Self {
        let body = params
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        Self::new("POST", "/")
            .with_header("content-type", "application/x-www-form-urlencoded; charset=utf-8")
            .with_body(body)
    }

    pub fn with_query(mut self, name: &str, value: &str) -> Self {
        self.query.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_json(self, value: &Value) -> Self {
        self.with_header("content-type", "application/json")
            .with_body(value.to_string())
    }

    /// Value of a query parameter.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    /// Encoded query string without the leading `?`.
    pub fn query_string(&self) -> String {
        self.query
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Full URL against `endpoint`.
    pub fn url(&self, endpoint: &str) -> String {
        let base = endpoint.trim_end_matches('/');
        if self.query.is_empty() {
            format!("{}{}", base, self.path)
        } else {
            format!("{}{}?{}", base, self.path, self.query_string())
        }
    }
}

/// Response from an AWS API call.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    /// Header names are lowercase.
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub request_id: Option<String>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Signing HTTP client shared by every service capability.
#[derive(Debug, Clone)]
pub struct AwsClient {
    http: Client,
    /// Custom endpoint URL override (for LocalStack, MinIO, etc.).
    endpoint_override: Option<String>,
    user_agent: String,
}

impl AwsClient {
    pub fn new(endpoint_override: Option<String>) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            http,
            endpoint_override: endpoint_override.filter(|url| !url.trim().is_empty()),
            user_agent: USER_AGENT.to_string(),
        }
    }

    pub fn endpoint_override(&self) -> Option<&str> {
        self.endpoint_override.as_deref()
    }

    /// Base endpoint of `service` in `region`.
    pub fn endpoint(&self, service: Service, region: &str) -> String {
        match self.endpoint_override {
            Some(ref url) => url.clone(),
            None => Region::new(region).endpoint(service),
        }
    }

    /// Sign and send one request.
    pub async fn send(
        &self,
        service: Service,
        request: &HttpRequest,
        credentials: &Credentials,
        region: &str,
    ) -> Result<HttpResponse, ProviderError> {
        let endpoint = self.endpoint(service, region);
        let url = request.url(&endpoint);
        let signing_region = Region::new(region).signing_region(service);
        let signer = SigV4Signer::new(service, &signing_region);

        let mut to_sign = request.headers.clone();
        to_sign.insert("host".to_string(), extract_host(&endpoint));
        let signed = signer.sign(&request.method, &url, &to_sign, &request.body, credentials)?;

        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| ProviderError::new("InvalidRequest", &format!("invalid HTTP method: {}", request.method)))?;
        let mut req = self.http.request(method, &url);
        for (key, value) in request.headers.iter().chain(signed.iter().map(|(k, v)| (k, v))) {
            req = req.header(key.as_str(), value.as_str());
        }
        req = req.header("user-agent", &self.user_agent);
        if !request.body.is_empty() {
            req = req.body(request.body.clone());
        }

        log::debug!("{} {} {}", service, request.method, url);
        let resp = req.send().await.map_err(|e| error::from_transport(&e))?;

        let status = resp.status().as_u16();
        let mut headers = BTreeMap::new();
        for (key, value) in resp.headers() {
            if let Ok(v) = value.to_str() {
                headers.insert(key.as_str().to_ascii_lowercase(), v.to_string());
            }
        }
        let request_id = headers
            .get("x-amz-request-id")
            .or_else(|| headers.get("x-amzn-requestid"))
            .cloned();
        let body = resp.bytes().await.map_err(|e| error::from_transport(&e))?.to_vec();

        let response = HttpResponse {
            status,
            headers,
            body,
            request_id,
        };
        if response.is_success() {
            Ok(response)
        } else {
            Err(error::from_response(&response))
        }
    }

    /// Presigned URL for `request`; nothing is sent.
    pub fn presign(
        &self,
        service: Service,
        request: &HttpRequest,
        credentials: &Credentials,
        region: &str,
        expires_in: Duration,
    ) -> Result<String, ProviderError> {
        let endpoint = self.endpoint(service, region);
        let url = request.url(&endpoint);
        let signer = SigV4Signer::new(service, &Region::new(region).signing_region(service));
        let mut headers = BTreeMap::new();
        headers.insert("host".to_string(), extract_host(&endpoint));
        signer.presign_at(&request.method, &url, &headers, credentials, expires_in, SystemTime::now())
    }
}

/// Host (and non-default port) of a URL.
fn extract_host(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.host_str().map(|h| match u.port() {
                Some(port) => format!("{}:{}", h, port),
                None => h.to_string(),
            })
        })
        .unwrap_or_else(|| "amazonaws.com".to_string())
}

/// Helper to build Query API parameters with common fields.
pub fn build_query_params(action: &str, version: &str) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    params.insert("Action".to_string(), action.to_string());
    params.insert("Version".to_string(), version.to_string());
    params
}

/// Add `prefix.N` entries (1-based) for a list of values.
pub fn add_indexed(params: &mut BTreeMap<String, String>, prefix: &str, values: &[String]) {
    for (i, value) in values.iter().enumerate() {
        params.insert(format!("{}.{}", prefix, i + 1), value.clone());
    }
}

/// Helper to add EC2 filter parameters (`Filter.N.Name`, `Filter.N.Value.M`).
pub fn add_filters(params: &mut BTreeMap<String, String>, filters: &[(String, Vec<String>)]) {
    for (i, (name, values)) in filters.iter().enumerate() {
        let idx = i + 1;
        params.insert(format!("Filter.{}.Name", idx), name.clone());
        for (j, val) in values.iter().enumerate() {
            params.insert(format!("Filter.{}.Value.{}", idx, j + 1), val.clone());
        }
    }
}

/// Helper to add tag parameters (`prefix.N.Key`, `prefix.N.Value`).
pub fn add_tags(params: &mut BTreeMap<String, String>, tags: &[(String, String)], prefix: &str) {
    for (i, (key, value)) in tags.iter().enumerate() {
        let idx = i + 1;
        params.insert(format!("{}.{}.Key", prefix, idx), key.clone());
        params.insert(format!("{}.{}.Value", prefix, idx), value.clone());
    }
}

/// A required string parameter.
pub fn required_param<'a>(params: &'a Params, name: &str) -> Result<&'a str, ProviderError> {
    params
        .str_param(name)
        .ok_or_else(|| ProviderError::new("ValidationError", &format!("missing required parameter: {}", name)))
}

/// Clamp a requested page size to what an API accepts.
pub fn clamp_page_size(page_size: Option<u32>, min: u32, max: u32) -> Option<String> {
    page_size.map(|n| n.clamp(min, max).to_string())
}
