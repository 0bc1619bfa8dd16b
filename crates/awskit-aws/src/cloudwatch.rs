//! CloudWatch over the Query protocol (API version 2010-08-01).

use crate::client::{self, required_param, HttpRequest, HttpResponse};
use crate::xml::XmlNode;
use awskit_core::operation::CloudWatchOp;
use awskit_core::{ParamsExt, ProviderCall, ProviderError, ProviderResponse};
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

pub const API_VERSION: &str = "2010-08-01";

const STATISTICS: &[&str] = &["SampleCount", "Average", "Sum", "Minimum", "Maximum"];

fn timestamp(params: &awskit_core::Params, name: &str) -> Result<String, ProviderError> {
    let raw = required_param(params, name)?;
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc).to_rfc3339())
        .map_err(|_| ProviderError::new("ValidationError", &format!("{} must be an RFC 3339 timestamp, got '{}'", name, raw)))
}

pub fn query_params(op: CloudWatchOp, call: &ProviderCall<'_>) -> Result<BTreeMap<String, String>, ProviderError> {
    let params = call.params;
    let mut q = client::build_query_params(op.descriptor().provider_call, API_VERSION);
    let dimensions = params.string_map("dimensions");

    match op {
        CloudWatchOp::ListMetrics => {
            if let Some(ns) = params.str_param("namespace") {
                q.insert("Namespace".to_string(), ns.to_string());
            }
            if let Some(name) = params.str_param("metric_name") {
                q.insert("MetricName".to_string(), name.to_string());
            }
            add_dimensions(&mut q, &dimensions);
            if let Some(cursor) = call.cursor {
                q.insert("NextToken".to_string(), cursor.to_string());
            }
        }
        CloudWatchOp::GetMetricStatistics => {
            q.insert("Namespace".to_string(), required_param(params, "namespace")?.to_string());
            q.insert("MetricName".to_string(), required_param(params, "metric_name")?.to_string());
            q.insert("StartTime".to_string(), timestamp(params, "start_time")?);
            q.insert("EndTime".to_string(), timestamp(params, "end_time")?);
            q.insert("Period".to_string(), params.u64_param("period").unwrap_or(300).to_string());
            let mut stats = params.string_list("statistics");
            if stats.is_empty() {
                stats.push("Average".to_string());
            }
            if let Some(bad) = stats.iter().find(|s| !STATISTICS.contains(&s.as_str())) {
                return Err(ProviderError::new(
                    "ValidationError",
                    &format!("unknown statistic '{}', expected one of {}", bad, STATISTICS.join(", ")),
                ));
            }
            client::add_indexed(&mut q, "Statistics.member", &stats);
            add_dimensions(&mut q, &dimensions);
            if let Some(unit) = params.str_param("unit") {
                q.insert("Unit".to_string(), unit.to_string());
            }
        }
        CloudWatchOp::DescribeAlarms => {
            if let Some(state) = params.str_param("state_value") {
                q.insert("StateValue".to_string(), state.to_ascii_uppercase());
            }
            if let Some(prefix) = params.str_param("alarm_name_prefix") {
                q.insert("AlarmNamePrefix".to_string(), prefix.to_string());
            }
            if let Some(size) = client::clamp_page_size(call.page_size, 1, 100) {
                q.insert("MaxRecords".to_string(), size);
            }
            if let Some(cursor) = call.cursor {
                q.insert("NextToken".to_string(), cursor.to_string());
            }
        }
    }
    Ok(q)
}

fn add_dimensions(q: &mut BTreeMap<String, String>, dimensions: &[(String, String)]) {
    for (i, (name, value)) in dimensions.iter().enumerate() {
        q.insert(format!("Dimensions.member.{}.Name", i + 1), name.clone());
        q.insert(format!("Dimensions.member.{}.Value", i + 1), value.clone());
    }
}

pub fn build(op: CloudWatchOp, call: &ProviderCall<'_>) -> Result<HttpRequest, ProviderError> {
    Ok(HttpRequest::query_api(&query_params(op, call)?))
}

pub fn parse(op: CloudWatchOp, response: &HttpResponse) -> Result<ProviderResponse, ProviderError> {
    parse_body(op, &response.text())
}

pub fn parse_body(op: CloudWatchOp, body: &str) -> Result<ProviderResponse, ProviderError> {
    let root = XmlNode::parse(body)?;
    let result = root.result(op.descriptor().provider_call);
    let next_token = result.text_of("NextToken").map(String::from);

    Ok(match op {
        CloudWatchOp::ListMetrics => {
            let items = result
                .list("Metrics", "member")
                .into_iter()
                .map(|m| {
                    let mut dims = Map::new();
                    for d in m.list("Dimensions", "member") {
                        if let Some(name) = d.text_of("Name") {
                            dims.insert(name.to_string(), d.string("Value"));
                        }
                    }
                    json!({
                        "namespace": m.string("Namespace"),
                        "metric_name": m.string("MetricName"),
                        "dimensions": dims,
                    })
                })
                .collect();
            ProviderResponse::page(items, next_token)
        }
        CloudWatchOp::GetMetricStatistics => {
            let mut points: Vec<Value> = result
                .list("Datapoints", "member")
                .into_iter()
                .map(|p| {
                    json!({
                        "timestamp": p.string("Timestamp"),
                        "average": p.float("Average"),
                        "sum": p.float("Sum"),
                        "minimum": p.float("Minimum"),
                        "maximum": p.float("Maximum"),
                        "sample_count": p.float("SampleCount"),
                        "unit": p.string("Unit"),
                    })
                })
                .collect();
            // CloudWatch returns datapoints unordered.
            points.sort_by(|a, b| {
                a["timestamp"]
                    .as_str()
                    .unwrap_or("")
                    .cmp(b["timestamp"].as_str().unwrap_or(""))
            });
            ProviderResponse::new(json!({
                "label": result.string("Label"),
                "datapoints": points,
            }))
        }
        CloudWatchOp::DescribeAlarms => {
            let items = result
                .list("MetricAlarms", "member")
                .into_iter()
                .map(|a| {
                    json!({
                        "alarm_name": a.string("AlarmName"),
                        "alarm_arn": a.string("AlarmArn"),
                        "state_value": a.string("StateValue"),
                        "state_reason": a.string("StateReason"),
                        "metric_name": a.string("MetricName"),
                        "namespace": a.string("Namespace"),
                        "threshold": a.float("Threshold"),
                        "comparison_operator": a.string("ComparisonOperator"),
                    })
                })
                .collect();
            ProviderResponse::page(items, next_token)
        }
    })
}
