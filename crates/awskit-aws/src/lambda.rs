//! Lambda over REST + JSON (API version 2015-03-31).

use crate::client::{required_param, HttpRequest, HttpResponse};
use crate::signing::uri_encode;
use awskit_core::operation::LambdaOp;
use awskit_core::{Params, ParamsExt, ProviderCall, ProviderError, ProviderResponse};
use base64::Engine;
use serde_json::{json, Map, Value};

const API_PREFIX: &str = "/2015-03-31/functions";
const MAPPINGS_PREFIX: &str = "/2015-03-31/event-source-mappings";

const INVOCATION_TYPES: &[&str] = &["RequestResponse", "Event", "DryRun"];

/// Deployment package as sent in `Code.ZipFile`; checked to be base64.
fn zip_file(params: &Params) -> Result<String, ProviderError> {
    let encoded = required_param(params, "zip_base64")?;
    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| ProviderError::new("ValidationError", &format!("zip_base64 is not valid base64: {}", e)))?;
    Ok(encoded.to_string())
}

/// Streams need a starting position; queues reject one.
fn is_stream_source(arn: &str) -> bool {
    arn.contains(":kinesis:") || (arn.contains(":dynamodb:") && arn.contains("/stream/")) || arn.contains(":kafka:")
}

pub fn build(op: LambdaOp, call: &ProviderCall<'_>) -> Result<HttpRequest, ProviderError> {
    let params = call.params;
    let function_path = || -> Result<String, ProviderError> {
        Ok(format!("{}/{}", API_PREFIX, uri_encode(required_param(params, "function_name")?)))
    };

    Ok(match op {
        LambdaOp::ListFunctions => {
            let mut req = HttpRequest::new("GET", &format!("{}/", API_PREFIX));
            if let Some(size) = call.page_size {
                req = req.with_query("MaxItems", &size.clamp(1, 10_000).to_string());
            }
            if let Some(cursor) = call.cursor {
                req = req.with_query("Marker", cursor);
            }
            req
        }
        LambdaOp::GetFunction => HttpRequest::new("GET", &function_path()?),
        LambdaOp::Invoke => {
            let invocation_type = params.str_param("invocation_type").unwrap_or("RequestResponse");
            if !INVOCATION_TYPES.contains(&invocation_type) {
                return Err(ProviderError::new(
                    "ValidationError",
                    &format!(
                        "invocation_type must be one of {}, got '{}'",
                        INVOCATION_TYPES.join(", "),
                        invocation_type
                    ),
                ));
            }
            let payload = match params.get("payload") {
                Some(Value::String(text)) => text.clone(),
                Some(Value::Null) | None => "{}".to_string(),
                Some(other) => other.to_string(),
            };
            HttpRequest::new("POST", &format!("{}/invocations", function_path()?))
                .with_header("x-amz-invocation-type", invocation_type)
                .with_header("content-type", "application/json")
                .with_body(payload)
        }
        LambdaOp::DeleteFunction => HttpRequest::new("DELETE", &function_path()?),
        LambdaOp::CreateFunction => {
            let mut body = json!({
                "FunctionName": required_param(params, "function_name")?,
                "Runtime": required_param(params, "runtime")?,
                "Role": required_param(params, "role_arn")?,
                "Handler": required_param(params, "handler")?,
                "Code": { "ZipFile": zip_file(params)? },
                "Timeout": params.u64_param("timeout").unwrap_or(30),
                "MemorySize": params.u64_param("memory_size").unwrap_or(128),
                "Publish": params.bool_param("publish").unwrap_or(false),
            });
            if let Some(description) = params.str_param("description") {
                body["Description"] = json!(description);
            }
            let variables: Map<String, Value> = params
                .string_map("environment")
                .into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect();
            if !variables.is_empty() {
                body["Environment"] = json!({ "Variables": variables });
            }
            HttpRequest::new("POST", API_PREFIX).with_json(&body)
        }
        LambdaOp::UpdateFunctionCode => HttpRequest::new("PUT", &format!("{}/code", function_path()?)).with_json(&json!({
            "ZipFile": zip_file(params)?,
            "Publish": params.bool_param("publish").unwrap_or(false),
        })),
        LambdaOp::AddPermission => {
            let mut body = json!({
                "StatementId": required_param(params, "statement_id")?,
                "Action": required_param(params, "action")?,
                "Principal": required_param(params, "principal")?,
            });
            if let Some(source) = params.str_param("source_arn") {
                body["SourceArn"] = json!(source);
            }
            HttpRequest::new("POST", &format!("{}/policy", function_path()?)).with_json(&body)
        }
        LambdaOp::CreateEventSourceMapping => {
            let source = required_param(params, "event_source_arn")?;
            let mut body = json!({
                "EventSourceArn": source,
                "FunctionName": required_param(params, "function_name")?,
                "Enabled": params.bool_param("enabled").unwrap_or(true),
            });
            match params.str_param("starting_position") {
                Some(position) => body["StartingPosition"] = json!(position),
                None if is_stream_source(source) => body["StartingPosition"] = json!("LATEST"),
                None => {}
            }
            if let Some(size) = params.u64_param("batch_size") {
                body["BatchSize"] = json!(size);
            }
            HttpRequest::new("POST", &format!("{}/", MAPPINGS_PREFIX)).with_json(&body)
        }
    })
}

fn function_summary(f: &Value) -> Value {
    json!({
        "function_name": f["FunctionName"],
        "function_arn": f["FunctionArn"],
        "runtime": f["Runtime"],
        "handler": f["Handler"],
        "role": f["Role"],
        "memory_size": f["MemorySize"],
        "timeout": f["Timeout"],
        "code_size": f["CodeSize"],
        "last_modified": f["LastModified"],
        "state": f["State"],
        "version": f["Version"],
    })
}

fn json_body(response: &HttpResponse) -> Result<Value, ProviderError> {
    if response.body.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(&response.body)
        .map_err(|e| ProviderError::new("MalformedResponse", &format!("invalid JSON response: {}", e)))
}

pub fn parse(op: LambdaOp, call: &ProviderCall<'_>, response: &HttpResponse) -> Result<ProviderResponse, ProviderError> {
    let function_name = call.params.str_param("function_name").unwrap_or("");

    Ok(match op {
        LambdaOp::ListFunctions => {
            let body = json_body(response)?;
            let items = body["Functions"]
                .as_array()
                .map(|fs| fs.iter().map(function_summary).collect())
                .unwrap_or_default();
            let cursor = body["NextMarker"].as_str().filter(|m| !m.is_empty()).map(String::from);
            ProviderResponse::page(items, cursor)
        }
        LambdaOp::GetFunction => {
            let body = json_body(response)?;
            let mut payload = function_summary(&body["Configuration"]);
            payload["code_location"] = body["Code"]["Location"].clone();
            payload["tags"] = body["Tags"].clone();
            ProviderResponse::new(payload)
        }
        LambdaOp::Invoke => {
            // The function's own output is opaque; keep it as JSON when it parses.
            let output = match serde_json::from_slice::<Value>(&response.body) {
                Ok(value) => value,
                Err(_) => Value::String(response.text().into_owned()),
            };
            ProviderResponse::new(json!({
                "function_name": function_name,
                "status_code": response.status,
                "function_error": response.header("x-amz-function-error"),
                "executed_version": response.header("x-amz-executed-version"),
                "payload": output,
            }))
        }
        LambdaOp::DeleteFunction => ProviderResponse::new(json!({ "function_name": function_name, "deleted": true })),
        LambdaOp::CreateFunction => {
            let body = json_body(response)?;
            ProviderResponse::new(function_summary(&body)).with_states(string_states(&body["State"]))
        }
        LambdaOp::UpdateFunctionCode => {
            let body = json_body(response)?;
            let mut payload = function_summary(&body);
            payload["last_update_status"] = body["LastUpdateStatus"].clone();
            payload["code_sha256"] = body["CodeSha256"].clone();
            ProviderResponse::new(payload).with_states(string_states(&body["LastUpdateStatus"]))
        }
        LambdaOp::AddPermission => {
            let body = json_body(response)?;
            // The statement comes back as a JSON document inside a string.
            let statement = body["Statement"]
                .as_str()
                .and_then(|text| serde_json::from_str::<Value>(text).ok())
                .unwrap_or(Value::Null);
            ProviderResponse::new(json!({
                "function_name": function_name,
                "statement_id": call.params.str_param("statement_id"),
                "statement": statement,
            }))
        }
        LambdaOp::CreateEventSourceMapping => {
            let body = json_body(response)?;
            ProviderResponse::new(json!({
                "uuid": body["UUID"],
                "event_source_arn": body["EventSourceArn"],
                "function_arn": body["FunctionArn"],
                "state": body["State"],
                "batch_size": body["BatchSize"],
            }))
            .with_states(string_states(&body["State"]))
        }
    })
}

fn string_states(value: &Value) -> Vec<String> {
    value.as_str().map(|s| vec![s.to_string()]).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use awskit_core::operation::Operation;
    use awskit_core::{Credentials, Params};
    use std::collections::BTreeMap;

    fn params(value: Value) -> Params {
        value.as_object().cloned().unwrap_or_default()
    }

    fn call<'a>(op: LambdaOp, params: &'a Params, creds: &'a Credentials, cursor: Option<&'a str>) -> ProviderCall<'a> {
        ProviderCall {
            operation: Operation::Lambda(op),
            params,
            credentials: creds,
            region: "us-east-1",
            cursor,
            page_size: Some(50),
            client_token: None,
        }
    }

    fn response(status: u16, body: &str, headers: &[(&str, &str)]) -> HttpResponse {
        HttpResponse {
            status,
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            body: body.as_bytes().to_vec(),
            request_id: None,
        }
    }

    #[test]
    fn list_functions_request_and_page() {
        let creds = Credentials::new("AKID", "secret", "us-east-1");
        let p = Params::new();
        let c = call(LambdaOp::ListFunctions, &p, &creds, Some("m1"));
        let req = build(LambdaOp::ListFunctions, &c).unwrap();
        assert_eq!(req.path, "/2015-03-31/functions/");
        assert_eq!(req.query_param("Marker"), Some("m1"));
        assert_eq!(req.query_param("MaxItems"), Some("50"));

        let body = r#"{"Functions":[{"FunctionName":"resize","Runtime":"python3.12","MemorySize":256}],"NextMarker":"m2"}"#;
        let resp = parse(LambdaOp::ListFunctions, &c, &response(200, body, &[])).unwrap();
        assert_eq!(resp.payload[0]["function_name"], "resize");
        assert_eq!(resp.payload[0]["memory_size"], 256);
        assert_eq!(resp.cursor.as_deref(), Some("m2"));

        let resp = parse(LambdaOp::ListFunctions, &c, &response(200, r#"{"Functions":[],"NextMarker":null}"#, &[])).unwrap();
        assert_eq!(resp.cursor, None);
    }

    #[test]
    fn invoke_sends_payload_and_type() {
        let creds = Credentials::new("AKID", "secret", "us-east-1");
        let p = params(json!({"function_name": "resize", "payload": {"size": 128}, "invocation_type": "Event"}));
        let c = call(LambdaOp::Invoke, &p, &creds, None);
        let req = build(LambdaOp::Invoke, &c).unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/2015-03-31/functions/resize/invocations");
        assert_eq!(req.headers["x-amz-invocation-type"], "Event");
        assert_eq!(req.body, br#"{"size":128}"#.to_vec());

        let resp = parse(
            LambdaOp::Invoke,
            &c,
            &response(200, r#"{"ok":true}"#, &[("x-amz-executed-version", "$LATEST")]),
        )
        .unwrap();
        assert_eq!(resp.payload["payload"]["ok"], true);
        assert_eq!(resp.payload["executed_version"], "$LATEST");
        assert_eq!(resp.payload["function_error"], Value::Null);
    }

    #[test]
    fn invoke_rejects_unknown_invocation_type() {
        let creds = Credentials::new("AKID", "secret", "us-east-1");
        let p = params(json!({"function_name": "f", "invocation_type": "Later"}));
        let err = build(LambdaOp::Invoke, &call(LambdaOp::Invoke, &p, &creds, None)).unwrap_err();
        assert_eq!(err.code, "ValidationError");
    }

    #[test]
    fn create_function_body_and_state() {
        let creds = Credentials::new("AKID", "secret", "us-east-1");
        let p = params(json!({
            "function_name": "resize",
            "runtime": "python3.12",
            "role_arn": "arn:aws:iam::123:role/lambda",
            "handler": "app.handler",
            "zip_base64": "UEsDBA==",
            "environment": {"STAGE": "prod"}
        }));
        let c = call(LambdaOp::CreateFunction, &p, &creds, None);
        let req = build(LambdaOp::CreateFunction, &c).unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/2015-03-31/functions");
        let body: Value = serde_json::from_slice(&req.body).unwrap();
        assert_eq!(body["Code"]["ZipFile"], "UEsDBA==");
        assert_eq!(body["Timeout"], 30);
        assert_eq!(body["MemorySize"], 128);
        assert_eq!(body["Environment"]["Variables"]["STAGE"], "prod");

        let resp = parse(
            LambdaOp::CreateFunction,
            &c,
            &response(201, r#"{"FunctionName":"resize","State":"Pending"}"#, &[]),
        )
        .unwrap();
        assert_eq!(resp.states, vec!["Pending"]);
        assert_eq!(resp.payload["function_name"], "resize");
    }

    #[test]
    fn update_code_rejects_bad_zip() {
        let creds = Credentials::new("AKID", "secret", "us-east-1");
        let p = params(json!({"function_name": "resize", "zip_base64": "not base64!"}));
        let err = build(LambdaOp::UpdateFunctionCode, &call(LambdaOp::UpdateFunctionCode, &p, &creds, None)).unwrap_err();
        assert_eq!(err.code, "ValidationError");

        let p = params(json!({"function_name": "resize", "zip_base64": "UEsDBA=="}));
        let c = call(LambdaOp::UpdateFunctionCode, &p, &creds, None);
        let req = build(LambdaOp::UpdateFunctionCode, &c).unwrap();
        assert_eq!(req.method, "PUT");
        assert_eq!(req.path, "/2015-03-31/functions/resize/code");
        let resp = parse(
            LambdaOp::UpdateFunctionCode,
            &c,
            &response(200, r#"{"FunctionName":"resize","LastUpdateStatus":"InProgress"}"#, &[]),
        )
        .unwrap();
        assert_eq!(resp.states, vec!["InProgress"]);
    }

    #[test]
    fn add_permission_unwraps_statement() {
        let creds = Credentials::new("AKID", "secret", "us-east-1");
        let p = params(json!({
            "function_name": "resize",
            "statement_id": "s3-invoke",
            "action": "lambda:InvokeFunction",
            "principal": "s3.amazonaws.com"
        }));
        let c = call(LambdaOp::AddPermission, &p, &creds, None);
        let req = build(LambdaOp::AddPermission, &c).unwrap();
        assert_eq!(req.path, "/2015-03-31/functions/resize/policy");
        let body: Value = serde_json::from_slice(&req.body).unwrap();
        assert!(body.get("SourceArn").is_none());

        let resp = parse(
            LambdaOp::AddPermission,
            &c,
            &response(201, r#"{"Statement":"{"Sid":"s3-invoke","Effect":"Allow"}"}"#, &[]),
        )
        .unwrap();
        assert_eq!(resp.payload["statement"]["Effect"], "Allow");
    }

    #[test]
    fn event_source_mapping_starting_position_only_for_streams() {
        let creds = Credentials::new("AKID", "secret", "us-east-1");
        let stream = params(json!({
            "function_name": "resize",
            "event_source_arn": "arn:aws:kinesis:us-east-1:123:stream/clicks"
        }));
        let req = build(
            LambdaOp::CreateEventSourceMapping,
            &call(LambdaOp::CreateEventSourceMapping, &stream, &creds, None),
        )
        .unwrap();
        assert_eq!(req.path, "/2015-03-31/event-source-mappings/");
        let body: Value = serde_json::from_slice(&req.body).unwrap();
        assert_eq!(body["StartingPosition"], "LATEST");

        let queue = params(json!({
            "function_name": "resize",
            "event_source_arn": "arn:aws:sqs:us-east-1:123:jobs"
        }));
        let c = call(LambdaOp::CreateEventSourceMapping, &queue, &creds, None);
        let body: Value = serde_json::from_slice(&build(LambdaOp::CreateEventSourceMapping, &c).unwrap().body).unwrap();
        assert!(body.get("StartingPosition").is_none());

        let resp = parse(
            LambdaOp::CreateEventSourceMapping,
            &c,
            &response(202, r#"{"UUID":"u-1","State":"Creating","BatchSize":10}"#, &[]),
        )
        .unwrap();
        assert_eq!(resp.states, vec!["Creating"]);
        assert_eq!(resp.payload["uuid"], "u-1");
    }

    #[test]
    fn get_function_flattens_configuration() {
        let creds = Credentials::new("AKID", "secret", "us-east-1");
        let p = params(json!({"function_name": "resize"}));
        let c = call(LambdaOp::GetFunction, &p, &creds, None);
        let body = r#"{"Configuration":{"FunctionName":"resize","State":"Active"},"Code":{"Location":"https://awslambda/x"}}"#;
        let resp = parse(LambdaOp::GetFunction, &c, &response(200, body, &[])).unwrap();
        assert_eq!(resp.payload["state"], "Active");
        assert_eq!(resp.payload["code_location"], "https://awslambda/x");
    }
}
