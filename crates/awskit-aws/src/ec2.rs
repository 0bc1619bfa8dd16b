//! EC2 over the Query protocol (API version 2016-11-15).
//!
//! Responses use lower camel case element names and `<item>` list entries.

use crate::client::{self, required_param, HttpRequest, HttpResponse};
use crate::xml::XmlNode;
use awskit_core::operation::Ec2Op;
use awskit_core::{ParamsExt, ProviderCall, ProviderError, ProviderResponse};
use base64::Engine;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

pub const API_VERSION: &str = "2016-11-15";

/// Query parameters for `op`.
pub fn query_params(op: Ec2Op, call: &ProviderCall<'_>) -> Result<BTreeMap<String, String>, ProviderError> {
    let params = call.params;
    let mut q = client::build_query_params(op.descriptor().provider_call, API_VERSION);

    match op {
        Ec2Op::ListInstances => {
            let ids = params.string_list("instance_ids");
            let mut filters: Vec<(String, Vec<String>)> = Vec::new();
            let states = params.string_list("state");
            if !states.is_empty() {
                filters.push(("instance-state-name".to_string(), states));
            }
            for (name, values) in params.string_map("filters") {
                let values = values.split(',').map(|v| v.trim().to_string()).collect();
                filters.push((name, values));
            }
            client::add_filters(&mut q, &filters);
            if ids.is_empty() {
                if let Some(size) = client::clamp_page_size(call.page_size, 5, 1000) {
                    q.insert("MaxResults".to_string(), size);
                }
            } else {
                client::add_indexed(&mut q, "InstanceId", &ids);
            }
            if let Some(cursor) = call.cursor {
                q.insert("NextToken".to_string(), cursor.to_string());
            }
        }
        Ec2Op::CreateInstance => {
            q.insert("ImageId".to_string(), required_param(params, "image_id")?.to_string());
            q.insert("InstanceType".to_string(), required_param(params, "instance_type")?.to_string());
            let count = params.u64_param("count").unwrap_or(1).max(1).to_string();
            q.insert("MinCount".to_string(), count.clone());
            q.insert("MaxCount".to_string(), count);
            if let Some(key) = params.str_param("key_name") {
                q.insert("KeyName".to_string(), key.to_string());
            }
            client::add_indexed(&mut q, "SecurityGroupId", &params.string_list("security_group_ids"));
            if let Some(subnet) = params.str_param("subnet_id") {
                q.insert("SubnetId".to_string(), subnet.to_string());
            }
            if let Some(data) = params.str_param("user_data") {
                q.insert(
                    "UserData".to_string(),
                    base64::engine::general_purpose::STANDARD.encode(data),
                );
            }
            let tags = params.string_map("tags");
            if !tags.is_empty() {
                q.insert("TagSpecification.1.ResourceType".to_string(), "instance".to_string());
                client::add_tags(&mut q, &tags, "TagSpecification.1.Tag");
            }
            if let Some(token) = call.client_token {
                q.insert("ClientToken".to_string(), token.to_string());
            }
        }
        Ec2Op::StartInstance | Ec2Op::TerminateInstance => {
            client::add_indexed(&mut q, "InstanceId", &instance_ids(call)?);
        }
        Ec2Op::StopInstance => {
            client::add_indexed(&mut q, "InstanceId", &instance_ids(call)?);
            if params.bool_param("force").unwrap_or(false) {
                q.insert("Force".to_string(), "true".to_string());
            }
        }
        Ec2Op::InstanceStatus => {
            client::add_indexed(&mut q, "InstanceId", &instance_ids(call)?);
            q.insert("IncludeAllInstances".to_string(), "true".to_string());
        }
        Ec2Op::AddTags => {
            let resources = params.string_list("resource_id");
            if resources.is_empty() {
                required_param(params, "resource_id")?;
            }
            client::add_indexed(&mut q, "ResourceId", &resources);
            let tags = params.string_map("tags");
            if tags.is_empty() {
                return Err(ProviderError::new("ValidationError", "tags must be a non-empty map"));
            }
            client::add_tags(&mut q, &tags, "Tag");
        }
        Ec2Op::CreateSecurityGroup => {
            q.insert("GroupName".to_string(), required_param(params, "group_name")?.to_string());
            q.insert("GroupDescription".to_string(), required_param(params, "description")?.to_string());
            if let Some(vpc) = params.str_param("vpc_id") {
                q.insert("VpcId".to_string(), vpc.to_string());
            }
        }
        Ec2Op::CreateKeyPair => {
            q.insert("KeyName".to_string(), required_param(params, "key_name")?.to_string());
            if let Some(kind) = params.str_param("key_type") {
                q.insert("KeyType".to_string(), kind.to_string());
            }
        }
    }
    Ok(q)
}

fn instance_ids(call: &ProviderCall<'_>) -> Result<Vec<String>, ProviderError> {
    let ids = call.params.string_list("instance_id");
    if ids.is_empty() {
        required_param(call.params, "instance_id")?;
    }
    Ok(ids)
}

pub fn build(op: Ec2Op, call: &ProviderCall<'_>) -> Result<HttpRequest, ProviderError> {
    Ok(HttpRequest::query_api(&query_params(op, call)?))
}

pub fn parse(op: Ec2Op, response: &HttpResponse) -> Result<ProviderResponse, ProviderError> {
    parse_body(op, &response.text())
}

/// Normalize a successful response body.
pub fn parse_body(op: Ec2Op, body: &str) -> Result<ProviderResponse, ProviderError> {
    let root = XmlNode::parse(body)?;

    Ok(match op {
        Ec2Op::ListInstances => {
            let items = root
                .list("reservationSet", "item")
                .into_iter()
                .flat_map(|reservation| reservation.list("instancesSet", "item"))
                .map(instance)
                .collect();
            ProviderResponse::page(items, root.text_of("nextToken").map(String::from))
        }
        Ec2Op::CreateInstance => {
            let nodes = root.list("instancesSet", "item");
            let states = nodes.iter().filter_map(|n| nested_text(n, &["instanceState", "name"])).collect();
            let instances: Vec<Value> = nodes.into_iter().map(instance).collect();
            ProviderResponse::new(json!({
                "reservation_id": root.string("reservationId"),
                "owner_id": root.string("ownerId"),
                "instances": instances,
            }))
            .with_states(states)
        }
        Ec2Op::StartInstance | Ec2Op::StopInstance | Ec2Op::TerminateInstance => {
            let nodes = root.list("instancesSet", "item");
            let states = nodes.iter().filter_map(|n| nested_text(n, &["currentState", "name"])).collect();
            let changes: Vec<Value> = nodes
                .into_iter()
                .map(|n| {
                    json!({
                        "instance_id": n.string("instanceId"),
                        "previous_state": nested(n, &["previousState", "name"]),
                        "current_state": nested(n, &["currentState", "name"]),
                    })
                })
                .collect();
            ProviderResponse::new(json!({ "instances": changes })).with_states(states)
        }
        Ec2Op::InstanceStatus => {
            let statuses: Vec<Value> = root
                .list("instanceStatusSet", "item")
                .into_iter()
                .map(|n| {
                    json!({
                        "instance_id": n.string("instanceId"),
                        "availability_zone": n.string("availabilityZone"),
                        "state": nested(n, &["instanceState", "name"]),
                        "system_status": nested(n, &["systemStatus", "status"]),
                        "instance_status": nested(n, &["instanceStatus", "status"]),
                    })
                })
                .collect();
            ProviderResponse::new(json!({ "statuses": statuses }))
        }
        Ec2Op::AddTags => ProviderResponse::new(json!({ "tagged": root.text_of("return") == Some("true") })),
        Ec2Op::CreateSecurityGroup => ProviderResponse::new(json!({
            "group_id": root.string("groupId"),
            "security_group_arn": root.string("securityGroupArn"),
        })),
        Ec2Op::CreateKeyPair => ProviderResponse::new(json!({
            "key_name": root.string("keyName"),
            "key_pair_id": root.string("keyPairId"),
            "key_fingerprint": root.string("keyFingerprint"),
            "key_material": root.string("keyMaterial"),
        })),
    })
}

fn nested_text(node: &XmlNode, path: &[&str]) -> Option<String> {
    node.path(path).map(|n| n.text.clone()).filter(|t| !t.is_empty())
}

fn nested(node: &XmlNode, path: &[&str]) -> Value {
    nested_text(node, path).map_or(Value::Null, Value::String)
}

fn tag_map(node: &XmlNode) -> Value {
    let mut tags = Map::new();
    for tag in node.list("tagSet", "item") {
        if let Some(key) = tag.text_of("key") {
            tags.insert(key.to_string(), Value::String(tag.text_of("value").unwrap_or("").to_string()));
        }
    }
    Value::Object(tags)
}

fn instance(node: &XmlNode) -> Value {
    json!({
        "instance_id": node.string("instanceId"),
        "image_id": node.string("imageId"),
        "instance_type": node.string("instanceType"),
        "state": nested(node, &["instanceState", "name"]),
        "private_ip": node.string("privateIpAddress"),
        "public_ip": node.string("ipAddress"),
        "launch_time": node.string("launchTime"),
        "availability_zone": nested(node, &["placement", "availabilityZone"]),
        "key_name": node.string("keyName"),
        "subnet_id": node.string("subnetId"),
        "vpc_id": node.string("vpcId"),
        "tags": tag_map(node),
    })
}
