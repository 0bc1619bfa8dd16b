//! [`ServiceCapability`] implementations over [`AwsClient`].
//!
//! One [`AwsCapability`] serves one service. A call builds the request for the
//! operation, sends it once and normalizes the response. Every registered
//! operation is routed by an exhaustive `match`. The S3 presign, download and
//! empty-bucket operations are handled in [`s3`] instead.

use crate::client::{AwsClient, HttpRequest, HttpResponse};
use crate::{cloudwatch, ec2, iam, lambda, rds, s3, sts};
use async_trait::async_trait;
use awskit_core::operation::{Operation, S3Op};
use awskit_core::{ProviderCall, ProviderError, ProviderResponse, Service, ServiceCapability};
use std::sync::Arc;

/// Build the HTTP request for `call`.
pub fn build_request(call: &ProviderCall<'_>) -> Result<HttpRequest, ProviderError> {
    match call.operation {
        Operation::Ec2(op) => ec2::build(op, call),
        Operation::S3(op) => s3::build(op, call),
        Operation::Lambda(op) => lambda::build(op, call),
        Operation::Rds(op) => rds::build(op, call),
        Operation::Iam(op) => iam::build(op, call),
        Operation::CloudWatch(op) => cloudwatch::build(op, call),
        Operation::Sts(op) => sts::build(op, call),
    }
}

/// Normalize a successful response for `call`.
pub fn parse_response(call: &ProviderCall<'_>, response: &HttpResponse) -> Result<ProviderResponse, ProviderError> {
    match call.operation {
        Operation::Ec2(op) => ec2::parse(op, response),
        Operation::S3(op) => s3::parse(op, call, response),
        Operation::Lambda(op) => lambda::parse(op, call, response),
        Operation::Rds(op) => rds::parse(op, response),
        Operation::Iam(op) => iam::parse(op, call, response),
        Operation::CloudWatch(op) => cloudwatch::parse(op, response),
        Operation::Sts(op) => sts::parse(op, response),
    }
}

/// Capability for one AWS service.
#[derive(Debug, Clone)]
pub struct AwsCapability {
    service: Service,
    client: Arc<AwsClient>,
}

impl AwsCapability {
    pub fn new(service: Service, client: Arc<AwsClient>) -> Self {
        Self { service, client }
    }
}

#[async_trait]
impl ServiceCapability for AwsCapability {
    fn service(&self) -> Service {
        self.service
    }

    async fn call(&self, call: ProviderCall<'_>) -> Result<ProviderResponse, ProviderError> {
        if call.operation.service() != self.service {
            return Err(ProviderError::new(
                "OperationNotSupported",
                &format!("{} is not served by the {} capability", call.operation, self.service),
            ));
        }
        match call.operation {
            Operation::S3(S3Op::GeneratePresignedUrl) => return s3::presign(&self.client, &call),
            Operation::S3(S3Op::DownloadFile) => return s3::download_file(&self.client, &call).await,
            Operation::S3(S3Op::DeleteAllObjects) => return s3::delete_all_objects(&self.client, &call).await,
            _ => {}
        }
        let request = build_request(&call)?;
        let response = self
            .client
            .send(self.service, &request, call.credentials, call.region)
            .await?;
        parse_response(&call, &response)
    }
}

/// One capability per supported service, sharing `client`.
pub fn capabilities(client: Arc<AwsClient>) -> Vec<Arc<dyn ServiceCapability>> {
    Service::ALL
        .iter()
        .map(|service| Arc::new(AwsCapability::new(*service, client.clone())) as Arc<dyn ServiceCapability>)
        .collect()
}
