//! S3 over REST + XML with path-style addressing.
//!
//! Path-style URLs (`https://s3.<region>.amazonaws.com/<bucket>/<key>`) keep
//! endpoint overrides for MinIO and LocalStack working unchanged.
//!
//! Most operations are one request. Presigning sends nothing, downloading
//! also writes a local file, and emptying a bucket alternates listings with
//! batch deletes.

use crate::client::{required_param, AwsClient, HttpRequest, HttpResponse};
use crate::error;
use crate::signing::{encode_path, uri_encode};
use crate::xml::XmlNode;
use awskit_core::operation::S3Op;
use awskit_core::{ParamsExt, ProviderCall, ProviderError, ProviderResponse, Service};
use base64::Engine;
use chrono::Utc;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::Duration;

const S3_NAMESPACE: &str = "http://s3.amazonaws.com/doc/2006-03-01/";

/// DeleteObjects accepts at most this many keys.
const DELETE_BATCH: u32 = 1000;

const PRESIGN_METHODS: &[&str] = &["GET", "PUT", "HEAD", "DELETE"];

const DEFAULT_PRESIGN_EXPIRY_SECS: u64 = 3600;

fn object_path(bucket: &str, key: &str) -> String {
    format!("/{}/{}", uri_encode(bucket), encode_path(key.trim_start_matches('/')))
}

fn list_objects_request(bucket: &str, prefix: Option<&str>, max_keys: Option<u32>, cursor: Option<&str>) -> HttpRequest {
    let mut req = HttpRequest::new("GET", &format!("/{}", uri_encode(bucket))).with_query("list-type", "2");
    if let Some(prefix) = prefix {
        req = req.with_query("prefix", prefix);
    }
    if let Some(size) = max_keys {
        req = req.with_query("max-keys", &size.clamp(1, 1000).to_string());
    }
    if let Some(cursor) = cursor {
        req = req.with_query("continuation-token", cursor);
    }
    req
}

/// Quiet DeleteObjects for `keys`; S3 wants a checksum of the body.
pub fn delete_objects_request(bucket: &str, keys: &[String]) -> HttpRequest {
    let mut body = format!(r#"<Delete xmlns="{}"><Quiet>true</Quiet>"#, S3_NAMESPACE);
    for key in keys {
        body.push_str("<Object><Key>");
        body.push_str(&quick_xml::escape::escape(key.as_str()));
        body.push_str("</Key></Object>");
    }
    body.push_str("</Delete>");
    let checksum = base64::engine::general_purpose::STANDARD.encode(Sha256::digest(body.as_bytes()));
    HttpRequest::new("POST", &format!("/{}", uri_encode(bucket)))
        .with_query("delete", "")
        .with_header("content-type", "application/xml")
        .with_header("x-amz-checksum-sha256", &checksum)
        .with_body(body)
}

pub fn build(op: S3Op, call: &ProviderCall<'_>) -> Result<HttpRequest, ProviderError> {
    let params = call.params;

    Ok(match op {
        S3Op::ListBuckets => {
            let mut req = HttpRequest::new("GET", "/");
            if let Some(size) = call.page_size {
                req = req.with_query("max-buckets", &size.clamp(1, 10_000).to_string());
            }
            if let Some(cursor) = call.cursor {
                req = req.with_query("continuation-token", cursor);
            }
            req
        }
        S3Op::CreateBucket => {
            let name = required_param(params, "name")?;
            let region = params.str_param("region").unwrap_or(call.region);
            let req = HttpRequest::new("PUT", &format!("/{}", uri_encode(name)));
            // us-east-1 rejects an explicit location constraint.
            if region == "us-east-1" {
                req
            } else {
                req.with_header("content-type", "application/xml").with_body(format!(
                    r#"<CreateBucketConfiguration xmlns="{}"><LocationConstraint>{}</LocationConstraint></CreateBucketConfiguration>"#,
                    S3_NAMESPACE, region
                ))
            }
        }
        S3Op::DeleteBucket => HttpRequest::new("DELETE", &format!("/{}", uri_encode(required_param(params, "name")?))),
        S3Op::ListObjects => {
            let bucket = required_param(params, "bucket")?;
            let mut req = list_objects_request(bucket, params.str_param("prefix"), call.page_size, call.cursor);
            if let Some(delimiter) = params.str_param("delimiter") {
                req = req.with_query("delimiter", delimiter);
            }
            req
        }
        S3Op::PutObject => {
            let path = object_path(required_param(params, "bucket")?, required_param(params, "key")?);
            let body = match (params.str_param("body_base64"), params.get("body")) {
                (Some(encoded), _) => base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(|e| ProviderError::new("ValidationError", &format!("body_base64 is not valid base64: {}", e)))?,
                (None, Some(Value::String(text))) => text.clone().into_bytes(),
                (None, Some(Value::Null)) | (None, None) => Vec::new(),
                (None, Some(other)) => other.to_string().into_bytes(),
            };
            let content_type = params.str_param("content_type").unwrap_or("application/octet-stream");
            HttpRequest::new("PUT", &path)
                .with_header("content-type", content_type)
                .with_body(body)
        }
        S3Op::GetObject => HttpRequest::new(
            "GET",
            &object_path(required_param(params, "bucket")?, required_param(params, "key")?),
        ),
        S3Op::HeadObject => HttpRequest::new(
            "HEAD",
            &object_path(required_param(params, "bucket")?, required_param(params, "key")?),
        ),
        S3Op::DeleteObject => HttpRequest::new(
            "DELETE",
            &object_path(required_param(params, "bucket")?, required_param(params, "key")?),
        ),
        S3Op::CopyObject => {
            let source = object_path(
                required_param(params, "source_bucket")?,
                required_param(params, "source_key")?,
            );
            HttpRequest::new(
                "PUT",
                &object_path(required_param(params, "bucket")?, required_param(params, "key")?),
            )
            .with_header("x-amz-copy-source", &source)
        }
        S3Op::PutBucketPolicy => {
            let bucket = required_param(params, "bucket")?;
            let policy = match params.get("policy") {
                Some(Value::String(text)) => text.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            };
            HttpRequest::new("PUT", &format!("/{}", uri_encode(bucket)))
                .with_query("policy", "")
                .with_header("content-type", "application/json")
                .with_body(policy)
        }
        // The request that gets presigned.
        S3Op::GeneratePresignedUrl => {
            let method = params.str_param("method").unwrap_or("GET").to_ascii_uppercase();
            if !PRESIGN_METHODS.contains(&method.as_str()) {
                return Err(ProviderError::new(
                    "ValidationError",
                    &format!("method must be one of {}, got '{}'", PRESIGN_METHODS.join(", "), method),
                ));
            }
            HttpRequest::new(
                &method,
                &object_path(required_param(params, "bucket")?, required_param(params, "key")?),
            )
        }
        S3Op::DownloadFile => HttpRequest::new(
            "GET",
            &object_path(required_param(params, "bucket")?, required_param(params, "key")?),
        ),
        // Each round of emptying starts with a listing page.
        S3Op::DeleteAllObjects => list_objects_request(
            required_param(params, "bucket")?,
            params.str_param("prefix"),
            Some(DELETE_BATCH),
            call.cursor,
        ),
    })
}

pub fn parse(op: S3Op, call: &ProviderCall<'_>, response: &HttpResponse) -> Result<ProviderResponse, ProviderError> {
    let params = call.params;
    let bucket = params.str_param("bucket").or_else(|| params.str_param("name")).unwrap_or("");
    let key = params.str_param("key").unwrap_or("");

    Ok(match op {
        S3Op::ListBuckets => {
            let root = XmlNode::parse(&response.text())?;
            let items = root
                .list("Buckets", "Bucket")
                .into_iter()
                .map(|b| {
                    json!({
                        "name": b.string("Name"),
                        "creation_date": b.string("CreationDate"),
                        "region": b.string("BucketRegion"),
                    })
                })
                .collect();
            ProviderResponse::page(items, root.text_of("ContinuationToken").map(String::from))
        }
        S3Op::CreateBucket => ProviderResponse::new(json!({
            "name": bucket,
            "location": response.header("location"),
        })),
        S3Op::DeleteBucket => ProviderResponse::new(json!({ "name": bucket, "deleted": true })),
        S3Op::ListObjects => {
            let root = XmlNode::parse(&response.text())?;
            let items = root
                .children_named("Contents")
                .map(|o| {
                    json!({
                        "key": o.string("Key"),
                        "size": o.int("Size"),
                        "last_modified": o.string("LastModified"),
                        "etag": o.text_of("ETag").map(|e| e.trim_matches('"').to_string()),
                        "storage_class": o.string("StorageClass"),
                    })
                })
                .collect();
            let cursor = if root.text_of("IsTruncated") == Some("true") {
                root.text_of("NextContinuationToken").map(String::from)
            } else {
                None
            };
            ProviderResponse::page(items, cursor)
        }
        S3Op::PutObject => ProviderResponse::new(json!({
            "bucket": bucket,
            "key": key,
            "etag": etag(response),
            "version_id": response.header("x-amz-version-id"),
        })),
        S3Op::GetObject => {
            let mut payload = object_metadata(bucket, key, response);
            match std::str::from_utf8(&response.body) {
                Ok(text) => payload["body"] = Value::String(text.to_string()),
                Err(_) => {
                    payload["body_base64"] =
                        Value::String(base64::engine::general_purpose::STANDARD.encode(&response.body))
                }
            }
            ProviderResponse::new(payload)
        }
        S3Op::HeadObject => ProviderResponse::new(object_metadata(bucket, key, response)),
        S3Op::DeleteObject => ProviderResponse::new(json!({ "bucket": bucket, "key": key, "deleted": true })),
        S3Op::CopyObject => {
            // A copy can fail after the 200 status line has been sent.
            let root = XmlNode::parse(&response.text())?;
            if root.name == "Error" {
                return Err(error::parse_xml_error(response.status, &response.text()));
            }
            ProviderResponse::new(json!({
                "bucket": bucket,
                "key": key,
                "etag": root.text_of("ETag").map(|e| e.trim_matches('"').to_string()),
                "last_modified": root.string("LastModified"),
            }))
        }
        S3Op::PutBucketPolicy => ProviderResponse::new(json!({ "bucket": bucket, "policy_applied": true })),
        S3Op::GeneratePresignedUrl => {
            return Err(ProviderError::new(
                "OperationNotSupported",
                "presigned URLs are generated locally, not from a response",
            ))
        }
        S3Op::DownloadFile => ProviderResponse::new(object_metadata(bucket, key, response)),
        // One DeleteObjects batch.
        S3Op::DeleteAllObjects => {
            let root = XmlNode::parse(&response.text())?;
            let errors: Vec<Value> = root
                .children_named("Error")
                .map(|e| {
                    json!({
                        "key": e.string("Key"),
                        "code": e.string("Code"),
                        "message": e.string("Message"),
                    })
                })
                .collect();
            ProviderResponse::new(json!({
                "bucket": bucket,
                "deleted": root.children_named("Deleted").count(),
                "errors": errors,
            }))
        }
    })
}

/// Presigned URL for an object; no request is sent.
pub fn presign(client: &AwsClient, call: &ProviderCall<'_>) -> Result<ProviderResponse, ProviderError> {
    let request = build(S3Op::GeneratePresignedUrl, call)?;
    let expires_in = call.params.u64_param("expires_in").unwrap_or(DEFAULT_PRESIGN_EXPIRY_SECS);
    let url = client.presign(
        Service::S3,
        &request,
        call.credentials,
        call.region,
        Duration::from_secs(expires_in),
    )?;
    let expires_at = Utc::now() + chrono::Duration::seconds(expires_in as i64);
    Ok(ProviderResponse::new(json!({
        "bucket": call.params.str_param("bucket"),
        "key": call.params.str_param("key"),
        "method": request.method,
        "url": url,
        "expires_in": expires_in,
        "expires_at": expires_at.to_rfc3339(),
    })))
}

/// GET the object and write its body to `path`, creating parent directories.
pub async fn download_file(client: &AwsClient, call: &ProviderCall<'_>) -> Result<ProviderResponse, ProviderError> {
    let path = Path::new(required_param(call.params, "path")?);
    let request = build(S3Op::DownloadFile, call)?;
    let response = client.send(Service::S3, &request, call.credentials, call.region).await?;
    let mut parsed = parse(S3Op::DownloadFile, call, &response)?;
    write_file(path, &response.body).await?;
    log::info!("downloaded {} byte(s) to {}", response.body.len(), path.display());
    parsed.payload["path"] = json!(path.display().to_string());
    parsed.payload["bytes"] = json!(response.body.len());
    Ok(parsed)
}

async fn write_file(path: &Path, body: &[u8]) -> Result<(), ProviderError> {
    let local = |e: std::io::Error| ProviderError::new("LocalFileError", &format!("{}: {}", path.display(), e));
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(local)?;
    }
    tokio::fs::write(path, body).await.map_err(local)
}

/// Delete every object under the optional `prefix`, a listing page at a time.
///
/// Rerunning after a partial failure is safe: already deleted keys no longer
/// show up in the listing.
pub async fn delete_all_objects(client: &AwsClient, call: &ProviderCall<'_>) -> Result<ProviderResponse, ProviderError> {
    let bucket = required_param(call.params, "bucket")?;
    let mut cursor: Option<String> = None;
    let mut deleted = 0u64;
    let mut batches = 0u32;

    loop {
        let listing_call = ProviderCall {
            cursor: cursor.as_deref(),
            ..*call
        };
        let request = build(S3Op::DeleteAllObjects, &listing_call)?;
        let listing = client.send(Service::S3, &request, call.credentials, call.region).await?;
        let page = parse(S3Op::ListObjects, &listing_call, &listing)?;
        let keys: Vec<String> = page
            .payload
            .as_array()
            .map(|items| items.iter().filter_map(|o| o["key"].as_str().map(String::from)).collect())
            .unwrap_or_default();

        if !keys.is_empty() {
            let batch = client
                .send(Service::S3, &delete_objects_request(bucket, &keys), call.credentials, call.region)
                .await?;
            let outcome = parse(S3Op::DeleteAllObjects, call, &batch)?;
            let errors = outcome.payload["errors"].as_array().cloned().unwrap_or_default();
            if let Some(first) = errors.first() {
                return Err(ProviderError::new(
                    "DeleteObjectsFailed",
                    &format!(
                        "{} of {} object(s) in batch {} were not deleted; first: {} ({})",
                        errors.len(),
                        keys.len(),
                        batches + 1,
                        first["key"].as_str().unwrap_or("?"),
                        first["code"].as_str().unwrap_or("unknown")
                    ),
                ));
            }
            deleted += keys.len() as u64;
            batches += 1;
            log::debug!("deleted batch {} of {} object(s) from {}", batches, keys.len(), bucket);
        }

        match page.cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    Ok(ProviderResponse::new(json!({
        "bucket": bucket,
        "prefix": call.params.str_param("prefix"),
        "deleted": deleted,
        "batches": batches,
    })))
}

fn etag(response: &HttpResponse) -> Option<String> {
    response.header("etag").map(|e| e.trim_matches('"').to_string())
}

fn object_metadata(bucket: &str, key: &str, response: &HttpResponse) -> Value {
    json!({
        "bucket": bucket,
        "key": key,
        "content_type": response.header("content-type"),
        "content_length": response.header("content-length").and_then(|l| l.parse::<u64>().ok()),
        "etag": etag(response),
        "last_modified": response.header("last-modified"),
        "version_id": response.header("x-amz-version-id"),
    })
}
