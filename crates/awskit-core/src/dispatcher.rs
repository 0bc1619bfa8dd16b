//! The operation dispatcher.
//!
//! `execute` resolves a request against the registry, obtains credentials,
//! drives the service capability through retries and pages, confirms state
//! transitions for mutations and returns one normalized result.

use crate::capability::{ProviderCall, ProviderError, ProviderResponse, ServiceCapability};
use crate::config::ToolkitConfig;
use crate::error::{ErrorKind, ToolkitError};
use crate::idempotency::{Admission, IdempotencyLedger};
use crate::operation::{Operation, OperationDescriptor, OperationRequest, OperationResult, Params, Service};
use crate::provider::CredentialProvider;
use crate::retry::{wait_backoff, RetryPolicy, RetryState};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Builder for [`Dispatcher`].
pub struct DispatcherBuilder {
    capabilities: HashMap<Service, Arc<dyn ServiceCapability>>,
    credentials: CredentialProvider,
    policy: RetryPolicy,
    refresh_margin: Duration,
    attempt_timeout: Duration,
    page_size: Option<u32>,
    default_region: String,
}

impl DispatcherBuilder {
    /// Register a capability; replaces any earlier one for the same service.
    pub fn capability(mut self, capability: Arc<dyn ServiceCapability>) -> Self {
        self.capabilities.insert(capability.service(), capability);
        self
    }

    pub fn capabilities<I>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn ServiceCapability>>,
    {
        for capability in capabilities {
            self.capabilities.insert(capability.service(), capability);
        }
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = margin;
        self
    }

    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn page_size(mut self, page_size: Option<u32>) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn default_region(mut self, region: &str) -> Self {
        self.default_region = region.to_string();
        self
    }

    /// Take retry, timeout, paging and region settings from `config`.
    pub fn config(self, config: &ToolkitConfig) -> Self {
        let region = config.effective_region();
        self.retry_policy(config.retry_policy())
            .refresh_margin(config.refresh_margin())
            .attempt_timeout(config.attempt_timeout())
            .page_size(config.page_size)
            .default_region(&region.name)
    }

    pub fn build(self) -> Dispatcher {
        Dispatcher {
            capabilities: self.capabilities,
            credentials: self.credentials,
            policy: self.policy,
            refresh_margin: self.refresh_margin,
            attempt_timeout: self.attempt_timeout,
            page_size: self.page_size,
            default_region: self.default_region,
            ledger: IdempotencyLedger::new(),
        }
    }
}

/// Single entry point for every provider operation.
pub struct Dispatcher {
    capabilities: HashMap<Service, Arc<dyn ServiceCapability>>,
    credentials: CredentialProvider,
    policy: RetryPolicy,
    refresh_margin: Duration,
    attempt_timeout: Duration,
    page_size: Option<u32>,
    default_region: String,
    ledger: IdempotencyLedger,
}

/// Per-execution context shared by every page and attempt.
struct Execution<'a> {
    capability: &'a dyn ServiceCapability,
    operation: Operation,
    params: &'a Params,
    region: &'a str,
    label: &'a str,
    client_token: Option<&'a str>,
    keyed: bool,
    cancel: &'a CancellationToken,
    calls: u32,
    /// Attempt and backoff budget for the whole request, across pages.
    retry: RetryState,
    /// The single forced refresh has been spent.
    refreshed: bool,
}

impl Dispatcher {
    pub fn builder(credentials: CredentialProvider) -> DispatcherBuilder {
        DispatcherBuilder {
            capabilities: HashMap::new(),
            credentials,
            policy: RetryPolicy::default(),
            refresh_margin: Duration::from_secs(60),
            attempt_timeout: Duration::from_secs(30),
            page_size: None,
            default_region: crate::config::DEFAULT_REGION.to_string(),
        }
    }

    pub fn credentials(&self) -> &CredentialProvider {
        &self.credentials
    }

    pub fn ledger(&self) -> &IdempotencyLedger {
        &self.ledger
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn default_region(&self) -> &str {
        &self.default_region
    }

    pub fn services(&self) -> Vec<Service> {
        let mut services: Vec<Service> = self.capabilities.keys().copied().collect();
        services.sort_by_key(|s| s.name());
        services
    }

    pub async fn execute(&self, request: &OperationRequest) -> Result<OperationResult, ToolkitError> {
        self.execute_with_cancel(request, &CancellationToken::new()).await
    }

    /// Like [`Dispatcher::execute`]; `cancel` is honored before each attempt,
    /// before each page and during backoff waits.
    pub async fn execute_with_cancel(
        &self,
        request: &OperationRequest,
        cancel: &CancellationToken,
    ) -> Result<OperationResult, ToolkitError> {
        let operation = request.resolve()?;
        let label = operation.label();
        let descriptor = operation.descriptor();

        let capability = self.capabilities.get(&operation.service()).ok_or_else(|| {
            ToolkitError::permanent(
                "ServiceNotConfigured",
                &format!("no client capability registered for {}", operation.service()),
            )
            .with_operation(&label)
        })?;

        if cancel.is_cancelled() {
            return Err(ToolkitError::cancelled().with_operation(&label));
        }

        let mut ticket = None;
        if descriptor.mutating {
            if let Some(key) = request.key() {
                match self
                    .ledger
                    .admit(key, &request.fingerprint())
                    .map_err(|e| e.with_operation(&label))?
                {
                    Admission::Replay(result) => {
                        log::info!("{} replayed from idempotency key {}", label, key);
                        return Ok(result);
                    }
                    Admission::Proceed(t) => ticket = Some(t),
                }
            }
        }

        let client_token = descriptor.mutating.then(|| {
            request
                .key()
                .map(String::from)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
        });
        let region = request.region_override().unwrap_or(&self.default_region);

        let mut exec = Execution {
            capability: capability.as_ref(),
            operation,
            params: request.parameters(),
            region,
            label: &label,
            client_token: client_token.as_deref(),
            keyed: request.key().is_some(),
            cancel,
            calls: 0,
            retry: RetryState::new(),
            refreshed: false,
        };

        let result = self.run(&mut exec, descriptor, request).await?;
        log::info!(
            "{} completed: {} call(s), {} page(s)",
            label,
            result.calls,
            result.pages
        );
        if let Some(ticket) = ticket {
            ticket.complete(&result);
        }
        Ok(result)
    }

    async fn run(
        &self,
        exec: &mut Execution<'_>,
        descriptor: &OperationDescriptor,
        request: &OperationRequest,
    ) -> Result<OperationResult, ToolkitError> {
        let mut cursor = request.start_cursor().map(String::from);
        let mut seen: HashSet<String> = cursor.iter().cloned().collect();
        let mut items: Vec<Value> = Vec::new();
        let mut pages = 0u32;

        loop {
            if exec.cancel.is_cancelled() {
                return Err(ToolkitError::cancelled()
                    .with_operation(exec.label)
                    .with_attempts(exec.calls));
            }

            let response = self.call_page(exec, cursor.as_deref()).await?;
            pages += 1;

            if !descriptor.listing {
                let state = confirm_state(descriptor, &response)
                    .map_err(|e| e.with_operation(exec.label).with_attempts(exec.calls))?;
                return Ok(OperationResult {
                    operation: exec.label.to_string(),
                    payload: response.payload,
                    cursor: None,
                    calls: exec.calls,
                    pages,
                    state,
                    replayed: false,
                });
            }

            match response.payload {
                Value::Array(page) => items.extend(page),
                Value::Null => {}
                other => items.push(other),
            }
            let next = response.cursor.filter(|c| !c.is_empty());

            if request.is_single_page() {
                return Ok(OperationResult {
                    operation: exec.label.to_string(),
                    payload: Value::Array(items),
                    cursor: next,
                    calls: exec.calls,
                    pages,
                    state: None,
                    replayed: false,
                });
            }

            match next {
                None => {
                    return Ok(OperationResult {
                        operation: exec.label.to_string(),
                        payload: Value::Array(items),
                        cursor: None,
                        calls: exec.calls,
                        pages,
                        state: None,
                        replayed: false,
                    })
                }
                Some(next) => {
                    if !seen.insert(next.clone()) {
                        return Err(ToolkitError::permanent(
                            "PaginationLoop",
                            &format!("provider repeated pagination cursor '{}'", next),
                        )
                        .with_operation(exec.label)
                        .with_attempts(exec.calls));
                    }
                    log::debug!("{} fetching page {} ({} items so far)", exec.label, pages + 1, items.len());
                    cursor = Some(next);
                }
            }
        }
    }

    /// One page. Attempts, backoff and the forced refresh draw on the
    /// request-wide budget in `exec`.
    async fn call_page(
        &self,
        exec: &mut Execution<'_>,
        cursor: Option<&str>,
    ) -> Result<ProviderResponse, ToolkitError> {
        let descriptor = exec.operation.descriptor();
        let mut credentials = self.fresh_credentials(exec).await?;

        loop {
            if exec.cancel.is_cancelled() {
                return Err(ToolkitError::cancelled()
                    .with_operation(exec.label)
                    .with_attempts(exec.calls));
            }
            exec.retry.record_attempt();
            exec.calls += 1;

            let call = ProviderCall {
                operation: exec.operation,
                params: exec.params,
                credentials: &credentials,
                region: exec.region,
                cursor,
                page_size: self.page_size,
                client_token: exec.client_token,
            };
            let outcome = match tokio::time::timeout(self.attempt_timeout, exec.capability.call(call)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ProviderError::timeout(&format!(
                    "no response within {}s",
                    self.attempt_timeout.as_secs_f64()
                ))),
            };
            let failure = match outcome {
                Ok(response) => return Ok(response),
                Err(failure) => failure,
            };

            // A resent token that the provider reports as already applied
            // means an earlier send of this request took effect.
            if descriptor.already_applied_codes.contains(&failure.code.as_str())
                && (exec.keyed || exec.retry.attempts > 1)
            {
                log::info!("{} already applied ({})", exec.label, failure.code);
                return Ok(ProviderResponse::new(json!({
                    "already_applied": true,
                    "code": failure.code,
                    "message": failure.message,
                })));
            }

            let err = ToolkitError::from_provider(&failure).with_operation(exec.label);
            match err.kind {
                ErrorKind::AuthExpired => {
                    if exec.refreshed {
                        return Err(err.with_attempts(exec.calls));
                    }
                    exec.refreshed = true;
                    log::warn!("{} credentials rejected as expired, refreshing", exec.label);
                    credentials = self
                        .credentials
                        .refresh_until(&credentials, exec.cancel)
                        .await
                        .map_err(|e| e.with_operation(exec.label).with_attempts(exec.calls))?;
                }
                ErrorKind::Transient => match exec.retry.schedule(&self.policy, &err) {
                    Some(delay) => {
                        log::warn!(
                            "{} attempt {} failed with {}, retrying in {}ms",
                            exec.label,
                            exec.retry.attempts,
                            err.code,
                            delay.as_millis()
                        );
                        wait_backoff(delay, Some(exec.cancel))
                            .await
                            .map_err(|e| e.with_operation(exec.label).with_attempts(exec.calls))?;
                        credentials = self.fresh_credentials(exec).await?;
                    }
                    None => {
                        log::warn!(
                            "{} giving up after {} attempt(s), {}ms of backoff",
                            exec.label,
                            exec.retry.attempts,
                            exec.retry.total_backoff.as_millis()
                        );
                        return Err(ToolkitError::retry_exhausted(err.with_attempts(exec.calls)));
                    }
                },
                _ => return Err(err.with_attempts(exec.calls)),
            }
        }
    }

    async fn fresh_credentials(&self, exec: &Execution<'_>) -> Result<crate::credentials::Credentials, ToolkitError> {
        self.credentials
            .credentials_until(exec.region, self.refresh_margin, exec.cancel)
            .await
            .map_err(|e| e.with_operation(exec.label).with_attempts(exec.calls))
    }
}

/// Check the reported resource states against the accepted set.
fn confirm_state(descriptor: &OperationDescriptor, response: &ProviderResponse) -> Result<Option<String>, ToolkitError> {
    if descriptor.expected_states.is_empty() {
        return Ok(response.states.first().cloned());
    }
    if response.states.is_empty() {
        return Err(ToolkitError::permanent(
            "StateTransitionRejected",
            "provider did not report a resource state",
        ));
    }
    let rejected: Vec<&str> = response
        .states
        .iter()
        .map(String::as_str)
        .filter(|state| {
            !descriptor
                .expected_states
                .iter()
                .any(|expected| expected.eq_ignore_ascii_case(state))
        })
        .collect();
    if !rejected.is_empty() {
        return Err(ToolkitError::permanent(
            "StateTransitionRejected",
            &format!(
                "{} of {} resource(s) in unexpected state: {} (accepted: {})",
                rejected.len(),
                response.states.len(),
                rejected.join(", "),
                descriptor.expected_states.join(", ")
            ),
        ));
    }
    Ok(response.states.first().cloned())
}
