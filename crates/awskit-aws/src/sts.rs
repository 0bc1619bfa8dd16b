//! STS over the Query protocol (API version 2011-06-15).
//!
//! Serves the `caller_identity` operation and issues role credentials for the
//! core credential provider through [`StsTokenIssuer`].

use crate::client::{self, AwsClient, HttpRequest, HttpResponse};
use crate::xml::XmlNode;
use async_trait::async_trait;
use awskit_core::config::DEFAULT_REGION;
use awskit_core::operation::StsOp;
use awskit_core::{AssumeRoleRequest, Credentials, ProviderCall, ProviderError, ProviderResponse, Service, TokenIssuer};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const API_VERSION: &str = "2011-06-15";

pub fn build(op: StsOp, _call: &ProviderCall<'_>) -> Result<HttpRequest, ProviderError> {
    let q = client::build_query_params(op.descriptor().provider_call, API_VERSION);
    Ok(HttpRequest::query_api(&q))
}

pub fn parse(op: StsOp, response: &HttpResponse) -> Result<ProviderResponse, ProviderError> {
    parse_body(op, &response.text())
}

pub fn parse_body(op: StsOp, body: &str) -> Result<ProviderResponse, ProviderError> {
    let root = XmlNode::parse(body)?;
    let result = root.result(op.descriptor().provider_call);
    Ok(match op {
        StsOp::CallerIdentity => ProviderResponse::new(json!({
            "account": result.string("Account"),
            "arn": result.string("Arn"),
            "user_id": result.string("UserId"),
        })),
    })
}

/// Query parameters of an AssumeRole call.
pub fn assume_role_params(request: &AssumeRoleRequest) -> BTreeMap<String, String> {
    let mut q = client::build_query_params("AssumeRole", API_VERSION);
    q.insert("RoleArn".to_string(), request.role_arn.clone());
    q.insert("RoleSessionName".to_string(), request.session_name.clone());
    if let Some(ref external_id) = request.external_id {
        q.insert("ExternalId".to_string(), external_id.clone());
    }
    if let Some(duration) = request.duration_seconds {
        q.insert("DurationSeconds".to_string(), duration.to_string());
    }
    q
}

/// Temporary credentials from an AssumeRole response body.
pub fn parse_assume_role(body: &str, region: &str, role_arn: &str) -> Result<Credentials, ProviderError> {
    let root = XmlNode::parse(body)?;
    let creds = root
        .result("AssumeRole")
        .child("Credentials")
        .ok_or_else(|| ProviderError::new("MalformedResponse", "AssumeRole response has no Credentials"))?;
    let field = |name: &str| {
        creds
            .text_of(name)
            .ok_or_else(|| ProviderError::new("MalformedResponse", &format!("AssumeRole response has no {}", name)))
    };

    let expiration = DateTime::parse_from_rfc3339(field("Expiration")?)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ProviderError::new("MalformedResponse", &format!("invalid Expiration: {}", e)))?;

    Ok(Credentials::new(field("AccessKeyId")?, field("SecretAccessKey")?, region)
        .with_session_token(field("SessionToken")?)
        .with_expiration(expiration)
        .with_provider(&format!("assume_role:{}", role_arn)))
}

/// Issues role credentials with STS AssumeRole.
#[derive(Debug, Clone)]
pub struct StsTokenIssuer {
    client: Arc<AwsClient>,
}

impl StsTokenIssuer {
    pub fn new(client: Arc<AwsClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TokenIssuer for StsTokenIssuer {
    async fn assume_role(&self, source: &Credentials, request: &AssumeRoleRequest) -> Result<Credentials, ProviderError> {
        let region = if source.region.trim().is_empty() {
            DEFAULT_REGION
        } else {
            source.region.as_str()
        };
        log::debug!("sts: assuming role {} as {}", request.role_arn, request.session_name);
        let req = HttpRequest::query_api(&assume_role_params(request));
        let resp = self.client.send(Service::Sts, &req, source, region).await?;
        parse_assume_role(&resp.text(), region, &request.role_arn)
    }
}
