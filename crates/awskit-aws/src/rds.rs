//! RDS over the Query protocol (API version 2014-10-31).

use crate::client::{self, required_param, HttpRequest, HttpResponse};
use crate::xml::XmlNode;
use awskit_core::operation::RdsOp;
use awskit_core::{ParamsExt, ProviderCall, ProviderError, ProviderResponse};
use serde_json::{json, Value};
use std::collections::BTreeMap;

pub const API_VERSION: &str = "2014-10-31";

pub fn query_params(op: RdsOp, call: &ProviderCall<'_>) -> Result<BTreeMap<String, String>, ProviderError> {
    let params = call.params;
    let mut q = client::build_query_params(op.descriptor().provider_call, API_VERSION);
    let paged = |q: &mut BTreeMap<String, String>| {
        if let Some(size) = client::clamp_page_size(call.page_size, 20, 100) {
            q.insert("MaxRecords".to_string(), size);
        }
        if let Some(cursor) = call.cursor {
            q.insert("Marker".to_string(), cursor.to_string());
        }
    };

    match op {
        RdsOp::ListInstances => {
            if let Some(id) = params.str_param("db_instance_id") {
                q.insert("DBInstanceIdentifier".to_string(), id.to_string());
            }
            paged(&mut q);
        }
        RdsOp::ListSnapshots => {
            if let Some(id) = params.str_param("db_instance_id") {
                q.insert("DBInstanceIdentifier".to_string(), id.to_string());
            }
            if let Some(kind) = params.str_param("snapshot_type") {
                q.insert("SnapshotType".to_string(), kind.to_string());
            }
            paged(&mut q);
        }
        RdsOp::StartInstance | RdsOp::StopInstance => {
            q.insert(
                "DBInstanceIdentifier".to_string(),
                required_param(params, "db_instance_id")?.to_string(),
            );
        }
        RdsOp::DeleteInstance => {
            q.insert(
                "DBInstanceIdentifier".to_string(),
                required_param(params, "db_instance_id")?.to_string(),
            );
            match params.str_param("final_snapshot_id") {
                Some(snapshot) => {
                    q.insert("SkipFinalSnapshot".to_string(), "false".to_string());
                    q.insert("FinalDBSnapshotIdentifier".to_string(), snapshot.to_string());
                }
                None if params.bool_param("skip_final_snapshot").unwrap_or(false) => {
                    q.insert("SkipFinalSnapshot".to_string(), "true".to_string());
                }
                None => {
                    return Err(ProviderError::new(
                        "ValidationError",
                        "delete_instance needs final_snapshot_id or skip_final_snapshot=true",
                    ));
                }
            }
        }
        RdsOp::CreateSnapshot => {
            q.insert(
                "DBInstanceIdentifier".to_string(),
                required_param(params, "db_instance_id")?.to_string(),
            );
            q.insert(
                "DBSnapshotIdentifier".to_string(),
                required_param(params, "snapshot_id")?.to_string(),
            );
        }
        RdsOp::CreateInstance => {
            q.insert(
                "DBInstanceIdentifier".to_string(),
                required_param(params, "db_instance_id")?.to_string(),
            );
            q.insert(
                "DBInstanceClass".to_string(),
                required_param(params, "instance_class")?.to_string(),
            );
            q.insert("Engine".to_string(), required_param(params, "engine")?.to_string());
            q.insert(
                "MasterUsername".to_string(),
                required_param(params, "master_username")?.to_string(),
            );
            q.insert(
                "MasterUserPassword".to_string(),
                required_param(params, "master_password")?.to_string(),
            );
            q.insert(
                "AllocatedStorage".to_string(),
                params.u64_param("allocated_storage").unwrap_or(20).to_string(),
            );
            q.insert(
                "StorageType".to_string(),
                params.str_param("storage_type").unwrap_or("gp2").to_string(),
            );
            q.insert(
                "MultiAZ".to_string(),
                params.bool_param("multi_az").unwrap_or(false).to_string(),
            );
            q.insert(
                "BackupRetentionPeriod".to_string(),
                params.u64_param("backup_retention_period").unwrap_or(7).to_string(),
            );
            if let Some(name) = params.str_param("db_name") {
                q.insert("DBName".to_string(), name.to_string());
            }
            if let Some(group) = params.str_param("subnet_group_name") {
                q.insert("DBSubnetGroupName".to_string(), group.to_string());
            }
            client::add_indexed(
                &mut q,
                "VpcSecurityGroupIds.VpcSecurityGroupId",
                &params.string_list("vpc_security_group_ids"),
            );
            client::add_tags(&mut q, &params.string_map("tags"), "Tags.Tag");
        }
        RdsOp::RestoreFromSnapshot => {
            q.insert(
                "DBInstanceIdentifier".to_string(),
                required_param(params, "db_instance_id")?.to_string(),
            );
            q.insert(
                "DBSnapshotIdentifier".to_string(),
                required_param(params, "snapshot_id")?.to_string(),
            );
            if let Some(class) = params.str_param("instance_class") {
                q.insert("DBInstanceClass".to_string(), class.to_string());
            }
        }
        RdsOp::ModifyInstance => {
            q.insert(
                "DBInstanceIdentifier".to_string(),
                required_param(params, "db_instance_id")?.to_string(),
            );
            q.insert(
                "ApplyImmediately".to_string(),
                params.bool_param("apply_immediately").unwrap_or(false).to_string(),
            );
            let class = params.str_param("instance_class");
            let storage = params.u64_param("allocated_storage");
            if class.is_none() && storage.is_none() {
                return Err(ProviderError::new(
                    "ValidationError",
                    "modify_instance needs instance_class or allocated_storage",
                ));
            }
            if let Some(class) = class {
                q.insert("DBInstanceClass".to_string(), class.to_string());
            }
            if let Some(storage) = storage {
                q.insert("AllocatedStorage".to_string(), storage.to_string());
            }
        }
    }
    Ok(q)
}

pub fn build(op: RdsOp, call: &ProviderCall<'_>) -> Result<HttpRequest, ProviderError> {
    Ok(HttpRequest::query_api(&query_params(op, call)?))
}

pub fn parse(op: RdsOp, response: &HttpResponse) -> Result<ProviderResponse, ProviderError> {
    parse_body(op, &response.text())
}

pub fn parse_body(op: RdsOp, body: &str) -> Result<ProviderResponse, ProviderError> {
    let root = XmlNode::parse(body)?;
    let result = root.result(op.descriptor().provider_call);
    let marker = || result.text_of("Marker").map(String::from);

    Ok(match op {
        RdsOp::ListInstances => {
            let items = result.list("DBInstances", "DBInstance").into_iter().map(db_instance).collect();
            ProviderResponse::page(items, marker())
        }
        RdsOp::ListSnapshots => {
            let items = result.list("DBSnapshots", "DBSnapshot").into_iter().map(db_snapshot).collect();
            ProviderResponse::page(items, marker())
        }
        RdsOp::StartInstance
        | RdsOp::StopInstance
        | RdsOp::DeleteInstance
        | RdsOp::CreateInstance
        | RdsOp::RestoreFromSnapshot
        | RdsOp::ModifyInstance => {
            let node = result
                .child("DBInstance")
                .ok_or_else(|| ProviderError::new("MalformedResponse", "response has no DBInstance"))?;
            let states = node.text_of("DBInstanceStatus").map(|s| vec![s.to_string()]).unwrap_or_default();
            ProviderResponse::new(db_instance(node)).with_states(states)
        }
        RdsOp::CreateSnapshot => {
            let node = result
                .child("DBSnapshot")
                .ok_or_else(|| ProviderError::new("MalformedResponse", "response has no DBSnapshot"))?;
            let states = node.text_of("Status").map(|s| vec![s.to_string()]).unwrap_or_default();
            ProviderResponse::new(db_snapshot(node)).with_states(states)
        }
    })
}

fn db_instance(node: &XmlNode) -> Value {
    let endpoint = node.child("Endpoint");
    json!({
        "db_instance_id": node.string("DBInstanceIdentifier"),
        "instance_class": node.string("DBInstanceClass"),
        "engine": node.string("Engine"),
        "engine_version": node.string("EngineVersion"),
        "status": node.string("DBInstanceStatus"),
        "endpoint": endpoint.map_or(Value::Null, |e| e.string("Address")),
        "port": endpoint.map_or(Value::Null, |e| e.int("Port")),
        "allocated_storage": node.int("AllocatedStorage"),
        "multi_az": node.boolean("MultiAZ"),
        "availability_zone": node.string("AvailabilityZone"),
        "db_instance_arn": node.string("DBInstanceArn"),
    })
}

fn db_snapshot(node: &XmlNode) -> Value {
    json!({
        "snapshot_id": node.string("DBSnapshotIdentifier"),
        "db_instance_id": node.string("DBInstanceIdentifier"),
        "status": node.string("Status"),
        "engine": node.string("Engine"),
        "snapshot_type": node.string("SnapshotType"),
        "snapshot_create_time": node.string("SnapshotCreateTime"),
        "allocated_storage": node.int("AllocatedStorage"),
    })
}
