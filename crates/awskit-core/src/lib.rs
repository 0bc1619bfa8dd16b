//! # awskit-core
//!
//! Provider-agnostic core of the toolkit: a dispatcher that turns logical
//! operations into calls on a [`ServiceCapability`], with retry and backoff,
//! pagination, single-flight credential refresh and idempotent mutations.
//!
//! ## Modules
//!
//! - **operation**: operation registry, requests and results
//! - **dispatcher**: the `execute` entry point
//! - **provider**: credential cache and refresh coordination
//! - **credentials**: credential material and sources
//! - **retry**: backoff policy and retry bookkeeping
//! - **idempotency**: ledger of keyed mutating executions
//! - **capability**: the trait concrete service clients implement
//! - **config**: layered settings and region handling
//! - **error**: error taxonomy and classification

pub mod capability;
pub mod config;
pub mod credentials;
pub mod dispatcher;
pub mod error;
pub mod idempotency;
pub mod operation;
pub mod provider;
pub mod retry;

pub use capability::{ProviderCall, ProviderError, ProviderResponse, ServiceCapability};
pub use config::{ConfigError, Region, ToolkitConfig};
pub use credentials::{AssumeRoleRequest, AssumeRoleSource, CredentialSource, Credentials};
pub use dispatcher::{Dispatcher, DispatcherBuilder};
pub use error::{ErrorKind, ToolkitError, ToolkitResult};
pub use operation::{Operation, OperationRequest, OperationResult, Params, ParamsExt, Service};
pub use provider::{CredentialProvider, TokenIssuer};
pub use retry::{RetryMode, RetryPolicy};

pub use tokio_util::sync::CancellationToken;
