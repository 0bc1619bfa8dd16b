//! Operation registry, requests and results.
//!
//! The registry is a closed set: [`Operation`] wraps one enum per service and
//! each variant carries a static [`OperationDescriptor`] with its listing,
//! mutation and state-confirmation rules.

use crate::error::ToolkitError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Operation parameters: a JSON object keyed by parameter name.
pub type Params = Map<String, Value>;

/// Typed accessors over [`Params`].
pub trait ParamsExt {
    fn str_param(&self, name: &str) -> Option<&str>;
    fn string_list(&self, name: &str) -> Vec<String>;
    fn string_map(&self, name: &str) -> Vec<(String, String)>;
    fn bool_param(&self, name: &str) -> Option<bool>;
    fn u64_param(&self, name: &str) -> Option<u64>;
}

impl ParamsExt for Params {
    fn str_param(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.as_str()),
            _ => None,
        }
    }

    /// Accepts a JSON array of strings or a comma-separated string.
    fn string_list(&self, name: &str) -> Vec<String> {
        match self.get(name) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    Value::Null => None,
                    other => Some(other.to_string()),
                })
                .collect(),
            Some(Value::String(s)) => s
                .split(',')
                .map(|p| p.trim())
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Accepts a JSON object, or a JSON array of `{Key, Value}` pairs.
    fn string_map(&self, name: &str) -> Vec<(String, String)> {
        let scalar = |v: &Value| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        match self.get(name) {
            Some(Value::Object(map)) => map.iter().map(|(k, v)| (k.clone(), scalar(v))).collect(),
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| {
                    let key = item.get("Key").or_else(|| item.get("key"))?;
                    let value = item.get("Value").or_else(|| item.get("value"))?;
                    Some((scalar(key), scalar(value)))
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    fn bool_param(&self, name: &str) -> Option<bool> {
        match self.get(name)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Some(true),
                "false" | "no" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    fn u64_param(&self, name: &str) -> Option<u64> {
        match self.get(name)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

// ── Services ────────────────────────────────────────────────────────

/// Provider services reachable through the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    Ec2,
    S3,
    Lambda,
    Rds,
    Iam,
    CloudWatch,
    Sts,
}

impl Service {
    pub const ALL: &'static [Service] = &[
        Service::Ec2,
        Service::S3,
        Service::Lambda,
        Service::Rds,
        Service::Iam,
        Service::CloudWatch,
        Service::Sts,
    ];

    /// Name used on the command line and in operation labels.
    pub fn name(&self) -> &'static str {
        match self {
            Service::Ec2 => "ec2",
            Service::S3 => "s3",
            Service::Lambda => "lambda",
            Service::Rds => "rds",
            Service::Iam => "iam",
            Service::CloudWatch => "cloudwatch",
            Service::Sts => "sts",
        }
    }

    /// Endpoint prefix and SigV4 signing name.
    pub fn endpoint_prefix(&self) -> &'static str {
        match self {
            Service::CloudWatch => "monitoring",
            other => other.name(),
        }
    }

    pub fn parse(name: &str) -> Option<Service> {
        let lower = name.trim().to_ascii_lowercase();
        match lower.as_str() {
            "monitoring" => Some(Service::CloudWatch),
            _ => Service::ALL.iter().copied().find(|s| s.name() == lower),
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Descriptors ─────────────────────────────────────────────────────

/// Static rules attached to every registered operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationDescriptor {
    /// Operation name within its service.
    pub name: &'static str,
    /// Provider action or REST call this maps to.
    pub provider_call: &'static str,
    /// The operation returns a page of items and may report a cursor.
    pub listing: bool,
    /// The operation changes provider state; it is sent with a client token.
    pub mutating: bool,
    /// States confirming the mutation; empty when no confirmation applies.
    pub expected_states: &'static [&'static str],
    /// Parameter names that must be present.
    pub required: &'static [&'static str],
    /// Error codes meaning the effect was already applied by an earlier send.
    pub already_applied_codes: &'static [&'static str],
}

const fn read(name: &'static str, provider_call: &'static str, required: &'static [&'static str]) -> OperationDescriptor {
    OperationDescriptor {
        name,
        provider_call,
        listing: false,
        mutating: false,
        expected_states: &[],
        required,
        already_applied_codes: &[],
    }
}

const fn listing(name: &'static str, provider_call: &'static str, required: &'static [&'static str]) -> OperationDescriptor {
    OperationDescriptor {
        listing: true,
        ..read(name, provider_call, required)
    }
}

const fn mutation(name: &'static str, provider_call: &'static str, required: &'static [&'static str]) -> OperationDescriptor {
    OperationDescriptor {
        mutating: true,
        ..read(name, provider_call, required)
    }
}

const fn transition(
    name: &'static str,
    provider_call: &'static str,
    required: &'static [&'static str],
    expected_states: &'static [&'static str],
) -> OperationDescriptor {
    OperationDescriptor {
        expected_states,
        ..mutation(name, provider_call, required)
    }
}

macro_rules! service_ops {
    (
        $(#[$meta:meta])*
        $enum:ident {
            $( $variant:ident => $desc:expr, )+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $enum {
            $( $variant, )+
        }

        impl $enum {
            pub const ALL: &'static [$enum] = &[ $( $enum::$variant, )+ ];

            pub fn descriptor(&self) -> &'static OperationDescriptor {
                match self {
                    $( $enum::$variant => {
                        const D: OperationDescriptor = $desc;
                        &D
                    } )+
                }
            }

            pub fn parse(name: &str) -> Option<$enum> {
                let wanted = name.trim().replace('-', "_").to_ascii_lowercase();
                Self::ALL.iter().copied().find(|op| op.descriptor().name == wanted)
            }
        }
    };
}

service_ops! {
    /// EC2 operations.
    Ec2Op {
        ListInstances => listing("list_instances", "DescribeInstances", &[]),
        CreateInstance => transition("create_instance", "RunInstances", &["image_id", "instance_type"], &["pending", "running"]),
        StartInstance => transition("start_instance", "StartInstances", &["instance_id"], &["pending", "running"]),
        StopInstance => transition("stop_instance", "StopInstances", &["instance_id"], &["stopping", "stopped"]),
        TerminateInstance => transition("terminate_instance", "TerminateInstances", &["instance_id"], &["shutting-down", "terminated"]),
        InstanceStatus => read("instance_status", "DescribeInstanceStatus", &["instance_id"]),
        AddTags => mutation("add_tags", "CreateTags", &["resource_id", "tags"]),
        CreateSecurityGroup => OperationDescriptor {
            already_applied_codes: &["InvalidGroup.Duplicate"],
            ..mutation("create_security_group", "CreateSecurityGroup", &["group_name", "description"])
        },
        CreateKeyPair => mutation("create_key_pair", "CreateKeyPair", &["key_name"]),
    }
}

service_ops! {
    /// S3 operations.
    S3Op {
        ListBuckets => listing("list_buckets", "ListBuckets", &[]),
        CreateBucket => OperationDescriptor {
            already_applied_codes: &["BucketAlreadyOwnedByYou"],
            ..mutation("create_bucket", "CreateBucket", &["name"])
        },
        DeleteBucket => mutation("delete_bucket", "DeleteBucket", &["name"]),
        ListObjects => listing("list_objects", "ListObjectsV2", &["bucket"]),
        PutObject => mutation("put_object", "PutObject", &["bucket", "key"]),
        GetObject => read("get_object", "GetObject", &["bucket", "key"]),
        HeadObject => read("head_object", "HeadObject", &["bucket", "key"]),
        DeleteObject => mutation("delete_object", "DeleteObject", &["bucket", "key"]),
        CopyObject => mutation("copy_object", "CopyObject", &["source_bucket", "source_key", "bucket", "key"]),
        PutBucketPolicy => mutation("put_bucket_policy", "PutBucketPolicy", &["bucket", "policy"]),
        GeneratePresignedUrl => read("generate_presigned_url", "PresignObjectUrl", &["bucket", "key"]),
        DownloadFile => read("download_file", "GetObject", &["bucket", "key", "path"]),
        DeleteAllObjects => mutation("delete_all_objects", "DeleteObjects", &["bucket"]),
    }
}

service_ops! {
    /// Lambda operations.
    LambdaOp {
        ListFunctions => listing("list_functions", "ListFunctions", &[]),
        GetFunction => read("get_function", "GetFunction", &["function_name"]),
        Invoke => mutation("invoke", "Invoke", &["function_name"]),
        DeleteFunction => mutation("delete_function", "DeleteFunction", &["function_name"]),
        CreateFunction => OperationDescriptor {
            already_applied_codes: &["ResourceConflictException"],
            ..transition(
                "create_function",
                "CreateFunction",
                &["function_name", "runtime", "role_arn", "handler", "zip_base64"],
                &["Pending", "Active"]
            )
        },
        UpdateFunctionCode => transition(
            "update_function_code",
            "UpdateFunctionCode",
            &["function_name", "zip_base64"],
            &["InProgress", "Successful"]
        ),
        AddPermission => OperationDescriptor {
            already_applied_codes: &["ResourceConflictException"],
            ..mutation("add_permission", "AddPermission", &["function_name", "statement_id", "action", "principal"])
        },
        CreateEventSourceMapping => transition(
            "create_event_source_mapping",
            "CreateEventSourceMapping",
            &["function_name", "event_source_arn"],
            &["Creating", "Enabling", "Enabled"]
        ),
    }
}

service_ops! {
    /// RDS operations.
    RdsOp {
        ListInstances => listing("list_instances", "DescribeDBInstances", &[]),
        StartInstance => transition("start_instance", "StartDBInstance", &["db_instance_id"], &["starting", "available"]),
        StopInstance => transition("stop_instance", "StopDBInstance", &["db_instance_id"], &["stopping", "stopped"]),
        DeleteInstance => transition("delete_instance", "DeleteDBInstance", &["db_instance_id"], &["deleting"]),
        CreateSnapshot => transition("create_snapshot", "CreateDBSnapshot", &["db_instance_id", "snapshot_id"], &["creating", "available"]),
        ListSnapshots => listing("list_snapshots", "DescribeDBSnapshots", &[]),
        CreateInstance => OperationDescriptor {
            already_applied_codes: &["DBInstanceAlreadyExists"],
            ..transition(
                "create_instance",
                "CreateDBInstance",
                &["db_instance_id", "instance_class", "engine", "master_username", "master_password"],
                &["creating", "available"]
            )
        },
        RestoreFromSnapshot => OperationDescriptor {
            already_applied_codes: &["DBInstanceAlreadyExists"],
            ..transition(
                "restore_from_snapshot",
                "RestoreDBInstanceFromDBSnapshot",
                &["db_instance_id", "snapshot_id"],
                &["creating", "available"]
            )
        },
        ModifyInstance => transition("modify_instance", "ModifyDBInstance", &["db_instance_id"], &["modifying", "available"]),
    }
}

service_ops! {
    /// IAM operations.
    IamOp {
        ListUsers => listing("list_users", "ListUsers", &[]),
        CreateUser => OperationDescriptor {
            already_applied_codes: &["EntityAlreadyExists"],
            ..mutation("create_user", "CreateUser", &["user_name"])
        },
        DeleteUser => mutation("delete_user", "DeleteUser", &["user_name"]),
        ListRoles => listing("list_roles", "ListRoles", &[]),
        AttachUserPolicy => mutation("attach_user_policy", "AttachUserPolicy", &["user_name", "policy_arn"]),
        ListAccessKeys => listing("list_access_keys", "ListAccessKeys", &[]),
        CreateRole => OperationDescriptor {
            already_applied_codes: &["EntityAlreadyExists"],
            ..mutation("create_role", "CreateRole", &["role_name", "assume_role_policy"])
        },
        DeleteRole => mutation("delete_role", "DeleteRole", &["role_name"]),
        DetachUserPolicy => mutation("detach_user_policy", "DetachUserPolicy", &["user_name", "policy_arn"]),
        AttachRolePolicy => mutation("attach_role_policy", "AttachRolePolicy", &["role_name", "policy_arn"]),
        DetachRolePolicy => mutation("detach_role_policy", "DetachRolePolicy", &["role_name", "policy_arn"]),
        CreateAccessKey => mutation("create_access_key", "CreateAccessKey", &["user_name"]),
        DeleteAccessKey => mutation("delete_access_key", "DeleteAccessKey", &["access_key_id"]),
        ListUserPolicies => listing("list_user_policies", "ListAttachedUserPolicies", &["user_name"]),
        ListRolePolicies => listing("list_role_policies", "ListAttachedRolePolicies", &["role_name"]),
    }
}

service_ops! {
    /// CloudWatch operations.
    CloudWatchOp {
        ListMetrics => listing("list_metrics", "ListMetrics", &[]),
        GetMetricStatistics => read(
            "get_metric_statistics",
            "GetMetricStatistics",
            &["namespace", "metric_name", "start_time", "end_time"]
        ),
        DescribeAlarms => listing("describe_alarms", "DescribeAlarms", &[]),
    }
}

service_ops! {
    /// STS operations.
    StsOp {
        CallerIdentity => read("caller_identity", "GetCallerIdentity", &[]),
    }
}

// ── Operation ───────────────────────────────────────────────────────

/// A registered operation of one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Ec2(Ec2Op),
    S3(S3Op),
    Lambda(LambdaOp),
    Rds(RdsOp),
    Iam(IamOp),
    CloudWatch(CloudWatchOp),
    Sts(StsOp),
}

impl Operation {
    /// Look up `{service, operation}`; `None` when either is unknown.
    pub fn parse(service: &str, operation: &str) -> Option<Operation> {
        Some(match Service::parse(service)? {
            Service::Ec2 => Operation::Ec2(Ec2Op::parse(operation)?),
            Service::S3 => Operation::S3(S3Op::parse(operation)?),
            Service::Lambda => Operation::Lambda(LambdaOp::parse(operation)?),
            Service::Rds => Operation::Rds(RdsOp::parse(operation)?),
            Service::Iam => Operation::Iam(IamOp::parse(operation)?),
            Service::CloudWatch => Operation::CloudWatch(CloudWatchOp::parse(operation)?),
            Service::Sts => Operation::Sts(StsOp::parse(operation)?),
        })
    }

    pub fn service(&self) -> Service {
        match self {
            Operation::Ec2(_) => Service::Ec2,
            Operation::S3(_) => Service::S3,
            Operation::Lambda(_) => Service::Lambda,
            Operation::Rds(_) => Service::Rds,
            Operation::Iam(_) => Service::Iam,
            Operation::CloudWatch(_) => Service::CloudWatch,
            Operation::Sts(_) => Service::Sts,
        }
    }

    pub fn descriptor(&self) -> &'static OperationDescriptor {
        match self {
            Operation::Ec2(op) => op.descriptor(),
            Operation::S3(op) => op.descriptor(),
            Operation::Lambda(op) => op.descriptor(),
            Operation::Rds(op) => op.descriptor(),
            Operation::Iam(op) => op.descriptor(),
            Operation::CloudWatch(op) => op.descriptor(),
            Operation::Sts(op) => op.descriptor(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.descriptor().name
    }

    /// `service:operation`, as used in errors and logs.
    pub fn label(&self) -> String {
        format!("{}:{}", self.service(), self.name())
    }

    /// Every registered operation, grouped by service.
    pub fn all() -> Vec<Operation> {
        let mut ops = Vec::new();
        ops.extend(Ec2Op::ALL.iter().copied().map(Operation::Ec2));
        ops.extend(S3Op::ALL.iter().copied().map(Operation::S3));
        ops.extend(LambdaOp::ALL.iter().copied().map(Operation::Lambda));
        ops.extend(RdsOp::ALL.iter().copied().map(Operation::Rds));
        ops.extend(IamOp::ALL.iter().copied().map(Operation::Iam));
        ops.extend(CloudWatchOp::ALL.iter().copied().map(Operation::CloudWatch));
        ops.extend(StsOp::ALL.iter().copied().map(Operation::Sts));
        ops
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.service(), self.name())
    }
}

// ── Request / Result ────────────────────────────────────────────────

/// A logical operation to dispatch. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRequest {
    service: String,
    operation: String,
    #[serde(default)]
    params: Params,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    idempotency_key: Option<String>,
    #[serde(default)]
    single_page: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cursor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    region: Option<String>,
}

impl OperationRequest {
    pub fn new(service: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            operation: operation.into(),
            params: Params::new(),
            idempotency_key: None,
            single_page: false,
            cursor: None,
            region: None,
        }
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn params(mut self, params: Params) -> Self {
        self.params.extend(params);
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Return only the first page (or the page at `cursor`) with its cursor.
    pub fn single_page(mut self) -> Self {
        self.single_page = true;
        self
    }

    pub fn cursor(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn service_name(&self) -> &str {
        &self.service
    }

    pub fn operation_name(&self) -> &str {
        &self.operation
    }

    pub fn parameters(&self) -> &Params {
        &self.params
    }

    pub fn key(&self) -> Option<&str> {
        self.idempotency_key.as_deref()
    }

    pub fn is_single_page(&self) -> bool {
        self.single_page
    }

    pub fn start_cursor(&self) -> Option<&str> {
        self.cursor.as_deref().filter(|c| !c.is_empty())
    }

    pub fn region_override(&self) -> Option<&str> {
        self.region.as_deref().filter(|r| !r.is_empty())
    }

    /// Resolve against the registry and check required parameters.
    pub fn resolve(&self) -> Result<Operation, ToolkitError> {
        let label = format!("{}:{}", self.service, self.operation);
        let op = match Operation::parse(&self.service, &self.operation) {
            Some(op) => op,
            None if Service::parse(&self.service).is_none() => {
                return Err(ToolkitError::permanent(
                    "UnknownService",
                    &format!("unknown service '{}'", self.service),
                )
                .with_operation(&label))
            }
            None => {
                return Err(ToolkitError::permanent(
                    "UnknownOperation",
                    &format!("unknown operation '{}' for service '{}'", self.operation, self.service),
                )
                .with_operation(&label))
            }
        };

        let missing: Vec<&str> = op
            .descriptor()
            .required
            .iter()
            .copied()
            .filter(|name| match self.params.get(*name) {
                None | Some(Value::Null) => true,
                Some(Value::String(s)) => s.is_empty(),
                Some(_) => false,
            })
            .collect();
        if !missing.is_empty() {
            return Err(ToolkitError::validation(&format!(
                "missing required parameter(s): {}",
                missing.join(", ")
            ))
            .with_operation(&op.label()));
        }
        Ok(op)
    }

    /// Stable identity of the request body, used to detect key reuse.
    ///
    /// Names are taken in their canonical form, so aliases of the same
    /// operation (`create-bucket`, `S3:create_bucket`) fingerprint alike.
    pub fn fingerprint(&self) -> String {
        let operation = match Operation::parse(&self.service, &self.operation) {
            Some(op) => op.label(),
            None => format!(
                "{}:{}",
                self.service.trim().to_ascii_lowercase(),
                self.operation.trim().to_ascii_lowercase()
            ),
        };
        serde_json::json!({
            "operation": operation,
            "params": self.params,
            "region": self.region,
        })
        .to_string()
    }
}

/// Normalized successful outcome of an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    /// `service:operation`.
    pub operation: String,
    pub payload: Value,
    /// Cursor of the next page; only set for single-page requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    /// Underlying provider calls made.
    pub calls: u32,
    pub pages: u32,
    /// Resource state reported by a confirmed mutation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// Served from the idempotency ledger without a provider call.
    #[serde(default)]
    pub replayed: bool,
}

impl OperationResult {
    /// Items of a listing result.
    pub fn items(&self) -> &[Value] {
        match &self.payload {
            Value::Array(items) => items,
            _ => &[],
        }
    }
}
