//! Wiring between the command line, configuration and the dispatcher.

use crate::cli::{Action, Cli, GlobalArgs};
use crate::{logging, render};
use awskit_aws::{capabilities, AwsClient, StsTokenIssuer};
use awskit_core::{
    CancellationToken, ConfigError, CredentialProvider, Dispatcher, OperationRequest, ToolkitConfig,
};
use std::sync::Arc;

/// Text to print and the process exit code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub code: i32,
    pub output: String,
    /// Human-readable errors go to stderr; everything else to stdout.
    pub to_stderr: bool,
}

impl Outcome {
    fn ok(output: String) -> Self {
        Self { code: 0, output, to_stderr: false }
    }

    fn usage(message: String) -> Self {
        Self { code: render::EXIT_USAGE, output: format!("error: {}", message), to_stderr: true }
    }

    pub fn print(&self) {
        if self.output.is_empty() {
            return;
        }
        if self.to_stderr {
            eprintln!("{}", self.output);
        } else {
            println!("{}", self.output);
        }
    }
}

/// Overlay command-line flags on a loaded configuration.
pub fn apply_overrides(config: &mut ToolkitConfig, globals: &GlobalArgs) {
    if let Some(ref region) = globals.region {
        config.region = Some(region.clone());
    }
    if let Some(ref profile) = globals.profile {
        config.credentials.profile = Some(profile.clone());
    }
    if let Some(ref arn) = globals.role_arn {
        config.credentials.role_arn = Some(arn.clone());
    }
    if let Some(ref url) = globals.endpoint_url {
        config.endpoint_url = Some(url.clone());
    }
    if let Some(attempts) = globals.max_attempts {
        config.max_attempts = attempts;
    }
    if let Some(size) = globals.page_size {
        config.page_size = Some(size);
    }
}

/// Defaults, file, environment, then flags; validated.
pub fn load_config(globals: &GlobalArgs) -> Result<ToolkitConfig, ConfigError> {
    let mut config = ToolkitConfig::load(globals.config.as_deref())?;
    apply_overrides(&mut config, globals);
    config.validate()?;
    Ok(config)
}

/// Dispatcher with an AWS capability for every service.
pub fn build_dispatcher(config: &ToolkitConfig) -> Dispatcher {
    let client = Arc::new(AwsClient::new(config.endpoint_url.clone()));
    let region = config.effective_region();
    let credentials = CredentialProvider::builder(config.credential_source())
        .token_issuer(Arc::new(StsTokenIssuer::new(client.clone())))
        .retry_policy(config.retry_policy())
        .default_region(&region.name)
        .build();
    Dispatcher::builder(credentials)
        .capabilities(capabilities(client))
        .config(config)
        .build()
}

/// Execute one request and render its outcome.
pub async fn execute(
    dispatcher: &Dispatcher,
    request: &OperationRequest,
    cancel: &CancellationToken,
    as_json: bool,
) -> Outcome {
    match dispatcher.execute_with_cancel(request, cancel).await {
        Ok(result) => Outcome::ok(render::result(&result, as_json)),
        Err(err) => Outcome {
            code: render::exit_code(err.kind),
            output: render::error(&err, as_json),
            to_stderr: !as_json,
        },
    }
}

/// Run a parsed command line to completion.
pub async fn run(cli: Cli) -> Outcome {
    let globals = &cli.globals;
    let request = match cli.command.action() {
        Ok(Action::Version) => {
            return Outcome::ok(format!("awskit {}", env!("CARGO_PKG_VERSION")));
        }
        Ok(Action::ListOperations) => return Outcome::ok(render::operations(globals.json)),
        Ok(Action::Dispatch(request)) => request,
        Err(err) => return Outcome::usage(format!("{:#}", err)),
    };

    let config = match load_config(globals) {
        Ok(config) => config,
        Err(err) => return Outcome::usage(err.to_string()),
    };
    if let Err(err) = logging::init(&config.log_level, globals.verbose, config.log_json) {
        eprintln!("warning: logging disabled: {}", err);
    }
    // Config was loaded before a subscriber existed.
    for warning in config.warnings() {
        tracing::warn!("{}", warning);
    }

    let dispatcher = build_dispatcher(&config);
    tracing::debug!(
        region = %dispatcher.default_region(),
        service = request.service_name(),
        operation = request.operation_name(),
        "dispatching"
    );

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, cancelling");
                cancel.cancel();
            }
        })
    };

    let outcome = execute(&dispatcher, &request, &cancel, globals.json).await;
    interrupt.abort();
    outcome
}
