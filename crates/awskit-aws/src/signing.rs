//! AWS Signature Version 4 through the `aws-sigv4` crate.
//!
//! The signer takes the request as it will be sent (method, full URL, headers
//! and body) and returns the headers to add: `authorization`, `x-amz-date`,
//! `x-amz-security-token` for temporary credentials and, for S3,
//! `x-amz-content-sha256`. Presigning puts the same material in the query
//! string instead.

use awskit_core::{Credentials, ProviderError, Service};
use aws_credential_types::Credentials as SigningCredentials;
use aws_sigv4::http_request::{
    sign, PayloadChecksumKind, PercentEncodingMode, SignableBody, SignableRequest, SignatureLocation,
    SigningSettings, UriPathNormalizationMode,
};
use aws_sigv4::sign::v4;
use aws_smithy_runtime_api::client::identity::Identity;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

/// Longest validity SigV4 allows for a presigned URL.
pub const MAX_PRESIGN_EXPIRY: Duration = Duration::from_secs(7 * 24 * 3600);

/// Characters left unescaped by AWS URI encoding.
const AWS_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.').remove(b'~');

/// URI-encode a query value or path segment.
pub fn uri_encode(s: &str) -> String {
    utf8_percent_encode(s, AWS_ENCODE_SET).to_string()
}

/// URI-encode an object key, keeping `/` separators.
pub fn encode_path(s: &str) -> String {
    s.split('/').map(uri_encode).collect::<Vec<_>>().join("/")
}

/// Signs requests for one service in one region.
#[derive(Debug, Clone)]
pub struct SigV4Signer {
    signing_name: &'static str,
    region: String,
    /// S3 signs the payload hash header and the path as sent.
    s3: bool,
}

impl SigV4Signer {
    pub fn new(service: Service, region: &str) -> Self {
        Self {
            signing_name: service.endpoint_prefix(),
            region: region.to_string(),
            s3: service == Service::S3,
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    fn settings(&self) -> SigningSettings {
        let mut settings = SigningSettings::default();
        if self.s3 {
            settings.payload_checksum_kind = PayloadChecksumKind::XAmzSha256;
            settings.percent_encoding_mode = PercentEncodingMode::Single;
            settings.uri_path_normalization_mode = UriPathNormalizationMode::Disabled;
        }
        settings
    }

    /// Sign now.
    pub fn sign(
        &self,
        method: &str,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: &[u8],
        credentials: &Credentials,
    ) -> Result<Vec<(String, String)>, ProviderError> {
        self.sign_at(method, url, headers, body, credentials, SystemTime::now())
    }

    /// Sign at a fixed time and return the headers to add to the request.
    pub fn sign_at(
        &self,
        method: &str,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: &[u8],
        credentials: &Credentials,
        time: SystemTime,
    ) -> Result<Vec<(String, String)>, ProviderError> {
        let identity = identity(credentials);
        let params = v4::SigningParams::builder()
            .identity(&identity)
            .region(&self.region)
            .name(self.signing_name)
            .time(time)
            .settings(self.settings())
            .build()
            .map_err(|e| ProviderError::new("SigningError", &e.to_string()))?
            .into();

        let signable = SignableRequest::new(
            method,
            url,
            headers.iter().map(|(k, v)| (k.as_str(), v.as_str())),
            SignableBody::Bytes(body),
        )
        .map_err(|e| ProviderError::new("SigningError", &e.to_string()))?;

        let (instructions, _signature) = sign(signable, &params)
            .map_err(|e| ProviderError::new("SigningError", &e.to_string()))?
            .into_parts();

        Ok(instructions
            .headers()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect())
    }

    /// Query-string signed URL for `method` on `url`, valid for `expires_in`
    /// from `time`. The payload is left unsigned.
    pub fn presign_at(
        &self,
        method: &str,
        url: &str,
        headers: &BTreeMap<String, String>,
        credentials: &Credentials,
        expires_in: Duration,
        time: SystemTime,
    ) -> Result<String, ProviderError> {
        if expires_in.is_zero() || expires_in > MAX_PRESIGN_EXPIRY {
            return Err(ProviderError::new(
                "ValidationError",
                &format!(
                    "presigned URL expiry must be between 1 and {} seconds",
                    MAX_PRESIGN_EXPIRY.as_secs()
                ),
            ));
        }
        let identity = identity(credentials);
        let mut settings = self.settings();
        settings.signature_location = SignatureLocation::QueryParams;
        settings.expires_in = Some(expires_in);
        settings.payload_checksum_kind = PayloadChecksumKind::NoHeader;

        let params = v4::SigningParams::builder()
            .identity(&identity)
            .region(&self.region)
            .name(self.signing_name)
            .time(time)
            .settings(settings)
            .build()
            .map_err(|e| ProviderError::new("SigningError", &e.to_string()))?
            .into();

        let signable = SignableRequest::new(
            method,
            url,
            headers.iter().map(|(k, v)| (k.as_str(), v.as_str())),
            SignableBody::UnsignedPayload,
        )
        .map_err(|e| ProviderError::new("SigningError", &e.to_string()))?;

        let (instructions, _signature) = sign(signable, &params)
            .map_err(|e| ProviderError::new("SigningError", &e.to_string()))?
            .into_parts();

        let query = instructions
            .params()
            .iter()
            .map(|(name, value)| format!("{}={}", uri_encode(name), uri_encode(value)))
            .collect::<Vec<_>>()
            .join("&");
        let separator = if url.contains('?') { '&' } else { '?' };
        Ok(format!("{}{}{}", url, separator, query))
    }
}

fn identity(credentials: &Credentials) -> Identity {
    SigningCredentials::new(
        credentials.access_key_id.clone(),
        credentials.secret_access_key.clone(),
        credentials.session_token.clone(),
        None,
        "awskit",
    )
    .into()
}
