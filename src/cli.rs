//! Command-line surface.
//!
//! `call` reaches any registered operation; the per-service subcommands are
//! shortcuts that build the same [`OperationRequest`]s.

use anyhow::{bail, Context, Result};
use awskit_core::{OperationRequest, Params};
use base64::Engine;
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// awskit - EC2, S3, Lambda, RDS, IAM and CloudWatch from the command line.
#[derive(Parser, Debug)]
#[command(name = "awskit")]
#[command(about = "AWS utility toolkit with retries, pagination and credential refresh")]
#[command(version)]
pub struct Cli {
    #[command(flatten)]
    pub globals: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// YAML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Region for this invocation
    #[arg(long, global = true)]
    pub region: Option<String>,

    /// Named profile from the shared credentials file
    #[arg(long, global = true)]
    pub profile: Option<String>,

    /// Role to assume with the resolved credentials
    #[arg(long, global = true)]
    pub role_arn: Option<String>,

    /// Endpoint override (LocalStack, MinIO)
    #[arg(long, global = true)]
    pub endpoint_url: Option<String>,

    /// Maximum attempts per provider call
    #[arg(long, global = true)]
    pub max_attempts: Option<u32>,

    /// Items requested per page
    #[arg(long, global = true)]
    pub page_size: Option<u32>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print results and errors as JSON
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Dispatch any registered operation
    Call(CallArgs),

    /// EC2 instances
    Ec2 {
        #[command(subcommand)]
        command: Ec2Command,
    },

    /// S3 buckets and objects
    S3 {
        #[command(subcommand)]
        command: S3Command,
    },

    /// Lambda functions
    Lambda {
        #[command(subcommand)]
        command: LambdaCommand,
    },

    /// RDS instances
    Rds {
        #[command(subcommand)]
        command: RdsCommand,
    },

    /// Show the identity behind the resolved credentials
    Whoami,

    /// List every registered operation
    Operations,

    /// Print version information
    Version,
}

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Service name (ec2, s3, lambda, rds, iam, cloudwatch, sts)
    pub service: String,

    /// Operation name, e.g. list_instances
    pub operation: String,

    /// Parameter as key=value; the value is read as JSON when it parses
    #[arg(long = "param", value_parser = parse_param)]
    pub params: Vec<(String, Value)>,

    /// Parameters as one JSON object
    #[arg(long)]
    pub params_json: Option<String>,

    /// Key that makes a mutating call safe to repeat
    #[arg(long)]
    pub idempotency_key: Option<String>,

    /// Return one page and its cursor instead of every page
    #[arg(long)]
    pub single_page: bool,

    /// Cursor of the page to start from
    #[arg(long)]
    pub cursor: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Ec2Command {
    /// List instances
    List {
        /// Only instances in this state (running, stopped, ...)
        #[arg(long)]
        state: Option<String>,
    },

    /// Launch one instance
    Create {
        instance_type: String,
        image_id: String,

        #[arg(long)]
        key_name: Option<String>,

        /// Tags as a JSON object, e.g. '{"Name":"web"}'
        #[arg(long)]
        tags: Option<String>,

        #[arg(long)]
        idempotency_key: Option<String>,
    },

    /// Terminate an instance
    Terminate {
        instance_id: String,

        /// Confirm termination
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum S3Command {
    /// List buckets
    ListBuckets,

    /// Create a bucket in the invocation region
    CreateBucket { name: String },

    /// Upload a local file
    Upload {
        file: PathBuf,
        bucket: String,

        /// Object key; defaults to the file name
        #[arg(long)]
        key: Option<String>,
    },

    /// List objects in a bucket
    ListObjects {
        bucket: String,

        #[arg(long)]
        prefix: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum LambdaCommand {
    /// List functions
    List,

    /// Invoke a function synchronously
    Invoke {
        name: String,

        /// Event payload as JSON
        #[arg(long)]
        payload: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum RdsCommand {
    /// List database instances
    List,
}

/// What a parsed command asks for.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Dispatch(OperationRequest),
    ListOperations,
    Version,
}

/// Parse a `key=value` pair. Values that are valid JSON keep their type.
pub fn parse_param(raw: &str) -> std::result::Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty parameter name in '{}'", raw));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn json_object(raw: &str, what: &str) -> Result<Params> {
    match serde_json::from_str::<Value>(raw).with_context(|| format!("{} is not valid JSON", what))? {
        Value::Object(map) => Ok(map),
        _ => bail!("{} must be a JSON object", what),
    }
}

impl Command {
    /// Translate the command into an [`Action`].
    pub fn action(&self) -> Result<Action> {
        let request = match self {
            Command::Call(args) => {
                let mut request = OperationRequest::new(&args.service, &args.operation);
                if let Some(ref raw) = args.params_json {
                    request = request.params(json_object(raw, "--params-json")?);
                }
                for (key, value) in &args.params {
                    request = request.param(key, value.clone());
                }
                if let Some(ref key) = args.idempotency_key {
                    request = request.idempotency_key(key);
                }
                if args.single_page {
                    request = request.single_page();
                }
                if let Some(ref cursor) = args.cursor {
                    request = request.cursor(cursor);
                }
                request
            }
            Command::Ec2 { command } => ec2_request(command)?,
            Command::S3 { command } => s3_request(command)?,
            Command::Lambda { command } => match command {
                LambdaCommand::List => OperationRequest::new("lambda", "list_functions"),
                LambdaCommand::Invoke { name, payload } => {
                    let mut request = OperationRequest::new("lambda", "invoke").param("function_name", name.as_str());
                    if let Some(raw) = payload {
                        let value: Value =
                            serde_json::from_str(raw).context("--payload is not valid JSON")?;
                        request = request.param("payload", value);
                    }
                    request
                }
            },
            Command::Rds { command } => match command {
                RdsCommand::List => OperationRequest::new("rds", "list_instances"),
            },
            Command::Whoami => OperationRequest::new("sts", "caller_identity"),
            Command::Operations => return Ok(Action::ListOperations),
            Command::Version => return Ok(Action::Version),
        };
        Ok(Action::Dispatch(request))
    }
}

fn ec2_request(command: &Ec2Command) -> Result<OperationRequest> {
    Ok(match command {
        Ec2Command::List { state } => {
            let mut request = OperationRequest::new("ec2", "list_instances");
            if let Some(state) = state {
                request = request.param("state", state.as_str());
            }
            request
        }
        Ec2Command::Create {
            instance_type,
            image_id,
            key_name,
            tags,
            idempotency_key,
        } => {
            let mut request = OperationRequest::new("ec2", "create_instance")
                .param("instance_type", instance_type.as_str())
                .param("image_id", image_id.as_str());
            if let Some(key) = key_name {
                request = request.param("key_name", key.as_str());
            }
            if let Some(raw) = tags {
                request = request.param("tags", Value::Object(json_object(raw, "--tags")?));
            }
            if let Some(key) = idempotency_key {
                request = request.idempotency_key(key);
            }
            request
        }
        Ec2Command::Terminate { instance_id, yes } => {
            if !yes {
                bail!("refusing to terminate {} without --yes", instance_id);
            }
            OperationRequest::new("ec2", "terminate_instance").param("instance_id", instance_id.as_str())
        }
    })
}

fn s3_request(command: &S3Command) -> Result<OperationRequest> {
    Ok(match command {
        S3Command::ListBuckets => OperationRequest::new("s3", "list_buckets"),
        S3Command::CreateBucket { name } => OperationRequest::new("s3", "create_bucket").param("name", name.as_str()),
        S3Command::Upload { file, bucket, key } => {
            let key = match key {
                Some(key) => key.clone(),
                None => default_object_key(file)?,
            };
            let body = std::fs::read(file).with_context(|| format!("cannot read {}", file.display()))?;
            OperationRequest::new("s3", "put_object")
                .param("bucket", bucket.as_str())
                .param("key", key)
                .param("body_base64", base64::engine::general_purpose::STANDARD.encode(body))
        }
        S3Command::ListObjects { bucket, prefix } => {
            let mut request = OperationRequest::new("s3", "list_objects").param("bucket", bucket.as_str());
            if let Some(prefix) = prefix {
                request = request.param("prefix", prefix.as_str());
            }
            request
        }
    })
}

fn default_object_key(file: &Path) -> Result<String> {
    file.file_name()
        .and_then(|name| name.to_str())
        .map(String::from)
        .with_context(|| format!("cannot derive an object key from {}; pass --key", file.display()))
}
