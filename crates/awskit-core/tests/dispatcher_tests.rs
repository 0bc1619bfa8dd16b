//! Dispatcher behavior against scripted capabilities.
//!
//! All tests run on paused tokio time, so backoff sleeps complete instantly
//! while elapsed virtual time stays observable.

use async_trait::async_trait;
use awskit_core::{
    AssumeRoleRequest, AssumeRoleSource, CancellationToken, CredentialProvider, CredentialSource, Credentials,
    Dispatcher, ErrorKind, OperationRequest, ProviderCall, ProviderError, ProviderResponse, RetryMode, RetryPolicy,
    Service, ServiceCapability, TokenIssuer,
};
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Step = Result<ProviderResponse, ProviderError>;

#[derive(Debug, Clone)]
struct Recorded {
    operation: String,
    cursor: Option<String>,
    client_token: Option<String>,
    access_key_id: String,
}

/// Replays a fixed script of responses, one per call.
struct Scripted {
    service: Service,
    script: Mutex<VecDeque<Step>>,
    repeat: Option<Step>,
    calls: Mutex<Vec<Recorded>>,
}

impl Scripted {
    fn new(service: Service, steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            service,
            script: Mutex::new(steps.into()),
            repeat: None,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn always(service: Service, step: Step) -> Arc<Self> {
        Arc::new(Self {
            service,
            script: Mutex::new(VecDeque::new()),
            repeat: Some(step),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn recorded(&self) -> Vec<Recorded> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ServiceCapability for Scripted {
    fn service(&self) -> Service {
        self.service
    }

    async fn call(&self, call: ProviderCall<'_>) -> Result<ProviderResponse, ProviderError> {
        self.calls.lock().unwrap().push(Recorded {
            operation: call.operation.name().to_string(),
            cursor: call.cursor.map(String::from),
            client_token: call.client_token.map(String::from),
            access_key_id: call.credentials.access_key_id.clone(),
        });
        let next = self.script.lock().unwrap().pop_front();
        match next.or_else(|| self.repeat.clone()) {
            Some(step) => step,
            None => Err(ProviderError::new("ScriptExhausted", "no scripted response left")),
        }
    }
}

/// Issues `ASIA<n>` credentials, optionally after a delay.
struct CountingIssuer {
    calls: AtomicU32,
    delay: Duration,
}

impl CountingIssuer {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            delay,
        })
    }

    fn count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenIssuer for CountingIssuer {
    async fn assume_role(&self, source: &Credentials, _request: &AssumeRoleRequest) -> Result<Credentials, ProviderError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(Credentials::new(&format!("ASIA{}", n), "temp", &source.region)
            .with_session_token("token")
            .with_expiration(Utc::now() + ChronoDuration::hours(1)))
    }
}

fn static_provider() -> CredentialProvider {
    CredentialProvider::from_static(Credentials::new("AKIATEST", "secret", "us-east-1"))
}

fn role_provider(issuer: Arc<CountingIssuer>) -> CredentialProvider {
    let source = CredentialSource::AssumeRole(AssumeRoleSource::new(
        "arn:aws:iam::123456789012:role/test",
        CredentialSource::Static(Credentials::new("AKIABASE", "base", "us-east-1")),
    ));
    CredentialProvider::builder(source).token_issuer(issuer).build()
}

fn fixed_policy() -> RetryPolicy {
    RetryPolicy::default().with_mode(RetryMode::Fixed)
}

fn dispatcher(capability: Arc<Scripted>, provider: CredentialProvider) -> Dispatcher {
    Dispatcher::builder(provider)
        .capability(capability)
        .retry_policy(fixed_policy())
        .build()
}

fn page(ids: &[&str], next: Option<&str>) -> Step {
    let items = ids.iter().map(|id| json!({ "instance_id": id })).collect();
    Ok(ProviderResponse::page(items, next.map(String::from)))
}

fn throttle() -> Step {
    Err(ProviderError::new("Throttling", "Rate exceeded").with_status(400))
}

fn server_fault() -> Step {
    Err(ProviderError::new("ServiceUnavailable", "Service is unavailable").with_status(503))
}

fn expired() -> Step {
    Err(ProviderError::new("ExpiredToken", "The security token included in the request is expired").with_status(400))
}

fn create_bucket(name: &str) -> OperationRequest {
    OperationRequest::new("s3", "create_bucket").param("name", name)
}

// ── Pagination ──────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_listing_concatenates_three_pages() {
    let cap = Scripted::new(
        Service::Ec2,
        vec![
            page(&["i-1", "i-2"], Some("p2")),
            page(&["i-3", "i-4"], Some("p3")),
            page(&["i-5", "i-6"], None),
        ],
    );
    let d = dispatcher(cap.clone(), static_provider());
    let request = OperationRequest::new("ec2", "list_instances").region("us-east-1");

    let result = d.execute(&request).await.unwrap();

    let ids: Vec<&str> = result
        .items()
        .iter()
        .map(|v| v["instance_id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["i-1", "i-2", "i-3", "i-4", "i-5", "i-6"]);
    assert_eq!(result.calls, 3);
    assert_eq!(result.pages, 3);
    assert_eq!(result.cursor, None);
    assert_eq!(cap.count(), 3);
    let cursors: Vec<Option<String>> = cap.recorded().into_iter().map(|r| r.cursor).collect();
    assert_eq!(cursors, vec![None, Some("p2".to_string()), Some("p3".to_string())]);
    assert!(cap.recorded().iter().all(|r| r.client_token.is_none()));
    assert!(cap.recorded().iter().all(|r| r.operation == "list_instances"));
}

#[tokio::test(start_paused = true)]
async fn test_single_page_returns_provider_cursor() {
    let cap = Scripted::new(
        Service::Ec2,
        vec![page(&["i-1", "i-2"], Some("p2")), page(&["i-3"], None)],
    );
    let d = dispatcher(cap.clone(), static_provider());

    let first = d
        .execute(&OperationRequest::new("ec2", "list_instances").single_page())
        .await
        .unwrap();
    assert_eq!(first.items().len(), 2);
    assert_eq!(first.cursor.as_deref(), Some("p2"));

    let second = d
        .execute(&OperationRequest::new("ec2", "list_instances").single_page().cursor("p2"))
        .await
        .unwrap();
    assert_eq!(second.items().len(), 1);
    assert_eq!(second.cursor, None);
    assert_eq!(cap.recorded()[1].cursor.as_deref(), Some("p2"));
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_on_later_page_is_retried_in_place() {
    let cap = Scripted::new(
        Service::Ec2,
        vec![
            page(&["i-1", "i-2"], Some("p2")),
            server_fault(),
            page(&["i-3", "i-4"], None),
        ],
    );
    let d = dispatcher(cap.clone(), static_provider());

    let result = d.execute(&OperationRequest::new("ec2", "list_instances")).await.unwrap();

    assert_eq!(result.items().len(), 4);
    assert_eq!(result.calls, 3);
    assert_eq!(result.pages, 2);
    assert_eq!(cap.recorded()[2].cursor.as_deref(), Some("p2"));
}

#[tokio::test(start_paused = true)]
async fn test_attempt_cap_spans_every_page() {
    let cap = Scripted::new(
        Service::Ec2,
        vec![
            page(&["i-1"], Some("p2")),
            server_fault(),
            server_fault(),
            page(&["i-2"], Some("p3")),
            server_fault(),
            server_fault(),
            page(&["i-3"], None),
        ],
    );
    let d = dispatcher(cap.clone(), static_provider());

    let err = d.execute(&OperationRequest::new("ec2", "list_instances")).await.unwrap_err();

    // Each page alone stays under five attempts; together they do not.
    assert_eq!(err.kind, ErrorKind::RetryExhausted);
    assert_eq!(err.attempts, 5);
    assert_eq!(cap.count(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_budget_spans_every_page() {
    let cap = Scripted::new(
        Service::Ec2,
        vec![
            page(&["i-1"], Some("p2")),
            server_fault(),
            page(&["i-2"], Some("p3")),
            server_fault(),
            page(&["i-3"], None),
        ],
    );
    let policy = RetryPolicy {
        max_attempts: 10,
        max_total_backoff: Duration::from_millis(350),
        ..fixed_policy()
    };
    let d = Dispatcher::builder(static_provider())
        .capability(cap.clone())
        .retry_policy(policy)
        .build();
    let started = tokio::time::Instant::now();

    let err = d.execute(&OperationRequest::new("ec2", "list_instances")).await.unwrap_err();

    // 100ms after the first fault; the second would need 400ms more.
    assert_eq!(err.kind, ErrorKind::RetryExhausted);
    assert_eq!(cap.count(), 4);
    assert!(started.elapsed() < Duration::from_millis(350));
}

#[tokio::test(start_paused = true)]
async fn test_forced_refresh_is_spent_once_per_listing() {
    let issuer = CountingIssuer::new(Duration::ZERO);
    let cap = Scripted::new(
        Service::Ec2,
        vec![
            expired(),
            page(&["i-1"], Some("p2")),
            expired(),
            page(&["i-2"], None),
        ],
    );
    let d = dispatcher(cap.clone(), role_provider(issuer.clone()));

    let err = d.execute(&OperationRequest::new("ec2", "list_instances")).await.unwrap_err();

    assert_eq!(err.kind, ErrorKind::AuthExpired);
    assert_eq!(cap.count(), 3);
    assert_eq!(issuer.count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_cursor_aborts_as_pagination_loop() {
    let cap = Scripted::new(
        Service::Ec2,
        vec![
            page(&["i-1"], Some("p2")),
            page(&["i-2"], Some("p3")),
            page(&["i-3"], Some("p2")),
        ],
    );
    let d = dispatcher(cap.clone(), static_provider());

    let err = d.execute(&OperationRequest::new("ec2", "list_instances")).await.unwrap_err();

    assert_eq!(err.kind, ErrorKind::Permanent);
    assert_eq!(err.code, "PaginationLoop");
    assert_eq!(cap.count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_empty_cursor_ends_listing() {
    let cap = Scripted::new(Service::Iam, vec![Ok(ProviderResponse::page(vec![json!({"user_name": "a"})], Some(String::new())))]);
    let d = dispatcher(cap.clone(), static_provider());

    let result = d.execute(&OperationRequest::new("iam", "list_users")).await.unwrap();
    assert_eq!(result.items().len(), 1);
    assert_eq!(cap.count(), 1);
}

// ── Retry and classification ────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_throttled_create_bucket_succeeds_on_third_call() {
    let cap = Scripted::new(
        Service::S3,
        vec![throttle(), throttle(), Ok(ProviderResponse::new(json!({"location": "/my-bucket"})))],
    );
    let d = dispatcher(cap.clone(), static_provider());
    let started = tokio::time::Instant::now();

    let result = d.execute(&create_bucket("my-bucket")).await.unwrap();

    assert_eq!(result.calls, 3);
    assert_eq!(result.payload["location"], "/my-bucket");
    let waited = started.elapsed();
    assert!(waited < Duration::from_secs(30), "waited {:?}", waited);
    assert!(waited >= Duration::from_secs(1));

    let tokens: Vec<Option<String>> = cap.recorded().into_iter().map(|r| r.client_token).collect();
    assert!(tokens[0].is_some());
    assert!(tokens.iter().all(|t| t == &tokens[0]));
}

#[tokio::test(start_paused = true)]
async fn test_permanent_error_makes_exactly_one_call() {
    for code in ["AccessDenied", "NoSuchBucket", "InvalidParameterValue", "BucketAlreadyExists"] {
        let cap = Scripted::always(Service::S3, Err(ProviderError::new(code, "nope").with_status(403)));
        let d = dispatcher(cap.clone(), static_provider());

        let err = d.execute(&create_bucket("b")).await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::Permanent, "{}", code);
        assert_eq!(err.code, code);
        assert_eq!(err.attempts, 1);
        assert_eq!(err.operation.as_deref(), Some("s3:create_bucket"));
        assert_eq!(cap.count(), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn test_transient_calls_capped_by_max_attempts() {
    let cap = Scripted::always(Service::S3, server_fault());
    let d = dispatcher(cap.clone(), static_provider());

    let err = d.execute(&OperationRequest::new("s3", "list_buckets")).await.unwrap_err();

    assert_eq!(err.kind, ErrorKind::RetryExhausted);
    assert_eq!(err.last_kind, Some(ErrorKind::Transient));
    assert_eq!(err.code, "ServiceUnavailable");
    assert_eq!(err.attempts, 5);
    assert!(!err.throttled);
    assert_eq!(cap.count(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_transient_calls_capped_by_total_backoff() {
    let cap = Scripted::always(Service::S3, server_fault());
    let policy = RetryPolicy {
        max_attempts: 10,
        max_total_backoff: Duration::from_millis(350),
        ..fixed_policy()
    };
    let d = Dispatcher::builder(static_provider())
        .capability(cap.clone())
        .retry_policy(policy)
        .build();

    let err = d.execute(&OperationRequest::new("s3", "list_buckets")).await.unwrap_err();

    // Delays of 100ms and 200ms fit the budget; the next 400ms would not.
    assert_eq!(err.kind, ErrorKind::RetryExhausted);
    assert_eq!(cap.count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_throttling_exhaustion_is_flagged() {
    let cap = Scripted::always(Service::S3, throttle());
    let d = dispatcher(cap.clone(), static_provider());

    let err = d.execute(&create_bucket("b")).await.unwrap_err();

    assert_eq!(err.kind, ErrorKind::RetryExhausted);
    assert!(err.throttled);
    assert_eq!(cap.count(), 5);
}

struct Slow;

#[async_trait]
impl ServiceCapability for Slow {
    fn service(&self) -> Service {
        Service::Sts
    }

    async fn call(&self, _call: ProviderCall<'_>) -> Result<ProviderResponse, ProviderError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(ProviderResponse::default())
    }
}

#[tokio::test(start_paused = true)]
async fn test_attempt_timeout_counts_as_transient() {
    let d = Dispatcher::builder(static_provider())
        .capability(Arc::new(Slow))
        .retry_policy(fixed_policy().with_max_attempts(2))
        .attempt_timeout(Duration::from_secs(1))
        .build();

    let err = d
        .execute(&OperationRequest::new("sts", "caller_identity"))
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::RetryExhausted);
    assert_eq!(err.code, "RequestTimeout");
    assert_eq!(err.attempts, 2);
}

// ── Credentials ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_expiry_mid_operation_refreshes_once_then_succeeds() {
    let issuer = CountingIssuer::new(Duration::ZERO);
    let cap = Scripted::new(
        Service::Sts,
        vec![expired(), Ok(ProviderResponse::new(json!({"account": "123456789012"})))],
    );
    let d = dispatcher(cap.clone(), role_provider(issuer.clone()));

    let result = d
        .execute(&OperationRequest::new("sts", "caller_identity"))
        .await
        .unwrap();

    assert_eq!(result.calls, 2);
    assert_eq!(issuer.count(), 2);
    let keys: Vec<String> = cap.recorded().into_iter().map(|r| r.access_key_id).collect();
    assert_eq!(keys, vec!["ASIA1", "ASIA2"]);
}

#[tokio::test(start_paused = true)]
async fn test_expiry_after_refresh_returns_auth_expired() {
    let issuer = CountingIssuer::new(Duration::ZERO);
    let cap = Scripted::always(Service::Sts, expired());
    let d = dispatcher(cap.clone(), role_provider(issuer.clone()));

    let err = d
        .execute(&OperationRequest::new("sts", "caller_identity"))
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::AuthExpired);
    assert_eq!(err.attempts, 2);
    assert_eq!(cap.count(), 2);
    assert_eq!(issuer.count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_static_credentials_cannot_be_refreshed() {
    let cap = Scripted::always(Service::Sts, expired());
    let d = dispatcher(cap.clone(), static_provider());

    let err = d
        .execute(&OperationRequest::new("sts", "caller_identity"))
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::AuthExpired);
    assert_eq!(cap.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_missing_credentials_fail_before_any_call() {
    let cap = Scripted::always(Service::Sts, Ok(ProviderResponse::default()));
    let provider = CredentialProvider::from_static(Credentials::new("", "", "us-east-1"));
    let d = dispatcher(cap.clone(), provider);

    let err = d
        .execute(&OperationRequest::new("sts", "caller_identity"))
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::Auth);
    assert_eq!(err.attempts, 0);
    assert_eq!(cap.count(), 0);
}

/// Rejects the first issued credentials as expired.
struct RejectsFirstKeys {
    calls: AtomicU32,
}

#[async_trait]
impl ServiceCapability for RejectsFirstKeys {
    fn service(&self) -> Service {
        Service::Sts
    }

    async fn call(&self, call: ProviderCall<'_>) -> Result<ProviderResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if call.credentials.access_key_id == "ASIA1" {
            return Err(ProviderError::new("ExpiredTokenException", "expired").with_status(400));
        }
        Ok(ProviderResponse::new(json!({ "key": call.credentials.access_key_id })))
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_operations_share_one_refresh() {
    let issuer = CountingIssuer::new(Duration::from_millis(100));
    let provider = role_provider(issuer.clone());
    provider.resolve("us-east-1").await.unwrap();
    let cap = Arc::new(RejectsFirstKeys {
        calls: AtomicU32::new(0),
    });
    let d = Arc::new(
        Dispatcher::builder(provider.clone())
            .capability(cap.clone())
            .retry_policy(fixed_policy())
            .build(),
    );

    let mut handles = Vec::new();
    for _ in 0..12 {
        let d = Arc::clone(&d);
        handles.push(tokio::spawn(async move {
            d.execute(&OperationRequest::new("sts", "caller_identity")).await
        }));
    }
    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.payload["key"], "ASIA2");
    }

    // One initial load plus exactly one shared refresh.
    assert_eq!(issuer.count(), 2);
    assert_eq!(provider.load_count(), 2);
    assert_eq!(cap.calls.load(Ordering::SeqCst), 24);
}

// ── Mutations and idempotency ───────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_unexpected_state_is_permanent() {
    let cap = Scripted::new(
        Service::Ec2,
        vec![Ok(ProviderResponse::new(json!({"instances": []})).with_states(vec!["terminated".to_string()]))],
    );
    let d = dispatcher(cap.clone(), static_provider());
    let request = OperationRequest::new("ec2", "create_instance")
        .param("image_id", "ami-123")
        .param("instance_type", "t3.micro");

    let err = d.execute(&request).await.unwrap_err();

    assert_eq!(err.kind, ErrorKind::Permanent);
    assert_eq!(err.code, "StateTransitionRejected");
    assert_eq!(cap.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_partial_acceptance_is_not_success() {
    let cap = Scripted::new(
        Service::Ec2,
        vec![Ok(ProviderResponse::new(Value::Null).with_states(vec!["stopping".into(), "running".into()]))],
    );
    let d = dispatcher(cap.clone(), static_provider());

    let err = d
        .execute(&OperationRequest::new("ec2", "stop_instance").param("instance_id", json!(["i-1", "i-2"])))
        .await
        .unwrap_err();

    assert_eq!(err.code, "StateTransitionRejected");
}

#[tokio::test(start_paused = true)]
async fn test_accepted_state_is_reported() {
    let cap = Scripted::new(
        Service::Ec2,
        vec![Ok(ProviderResponse::new(json!({"instance_ids": ["i-9"]})).with_states(vec!["pending".into()]))],
    );
    let d = dispatcher(cap.clone(), static_provider());
    let request = OperationRequest::new("ec2", "create_instance")
        .param("image_id", "ami-123")
        .param("instance_type", "t3.micro")
        .idempotency_key("launch-1");

    let result = d.execute(&request).await.unwrap();

    assert_eq!(result.state.as_deref(), Some("pending"));
    assert_eq!(cap.recorded()[0].client_token.as_deref(), Some("launch-1"));
}

/// Bucket store that applies creates even when the response is lost.
struct LossyBucketStore {
    buckets: Mutex<HashMap<String, String>>,
    failures_left: AtomicU32,
    tokens: Mutex<Vec<String>>,
}

#[async_trait]
impl ServiceCapability for LossyBucketStore {
    fn service(&self) -> Service {
        Service::S3
    }

    async fn call(&self, call: ProviderCall<'_>) -> Result<ProviderResponse, ProviderError> {
        let name = call.params["name"].as_str().unwrap_or_default().to_string();
        let token = call.client_token.unwrap_or_default().to_string();
        self.tokens.lock().unwrap().push(token.clone());

        let mut buckets = self.buckets.lock().unwrap();
        if let Some(owner) = buckets.get(&name) {
            if owner == &token {
                return Err(ProviderError::new("BucketAlreadyOwnedByYou", "already owned").with_status(409));
            }
            return Err(ProviderError::new("BucketAlreadyExists", "taken").with_status(409));
        }
        buckets.insert(name.clone(), token);
        drop(buckets);

        if self.failures_left.load(Ordering::SeqCst) > 0 {
            self.failures_left.fetch_sub(1, Ordering::SeqCst);
            return Err(ProviderError::new("InternalError", "response lost").with_status(500));
        }
        Ok(ProviderResponse::new(json!({ "location": format!("/{}", name) })))
    }
}

#[tokio::test(start_paused = true)]
async fn test_keyed_retry_after_exhaustion_does_not_double_apply() {
    let store = Arc::new(LossyBucketStore {
        buckets: Mutex::new(HashMap::new()),
        failures_left: AtomicU32::new(1),
        tokens: Mutex::new(Vec::new()),
    });
    let d = Dispatcher::builder(static_provider())
        .capability(store.clone())
        .retry_policy(fixed_policy().with_max_attempts(1))
        .build();
    let request = create_bucket("my-bucket").idempotency_key("create-my-bucket");

    let err = d.execute(&request).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::RetryExhausted);
    assert_eq!(d.ledger().completed(), 0);

    let result = d.execute(&request).await.unwrap();
    assert_eq!(result.payload["already_applied"], true);
    assert_eq!(store.buckets.lock().unwrap().len(), 1);

    let replay = d.execute(&request).await.unwrap();
    assert!(replay.replayed);
    assert_eq!(replay.calls, 0);

    let tokens = store.tokens.lock().unwrap().clone();
    assert_eq!(tokens, vec!["create-my-bucket", "create-my-bucket"]);
}

#[tokio::test(start_paused = true)]
async fn test_already_owned_on_retry_without_key_is_success() {
    let store = Arc::new(LossyBucketStore {
        buckets: Mutex::new(HashMap::new()),
        failures_left: AtomicU32::new(1),
        tokens: Mutex::new(Vec::new()),
    });
    let d = Dispatcher::builder(static_provider())
        .capability(store.clone())
        .retry_policy(fixed_policy())
        .build();

    let result = d.execute(&create_bucket("fresh")).await.unwrap();

    assert_eq!(result.calls, 2);
    assert_eq!(result.payload["already_applied"], true);
    let tokens = store.tokens.lock().unwrap().clone();
    assert_eq!(tokens[0], tokens[1]);
    assert!(!tokens[0].is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_key_reused_for_different_request_is_rejected() {
    let cap = Scripted::always(Service::S3, Ok(ProviderResponse::new(json!({}))));
    let d = dispatcher(cap.clone(), static_provider());

    d.execute(&create_bucket("a").idempotency_key("k")).await.unwrap();
    let err = d
        .execute(&create_bucket("b").idempotency_key("k"))
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::Permanent);
    assert_eq!(err.code, "IdempotencyKeyMismatch");
    assert_eq!(cap.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_key_replays_across_operation_spellings() {
    let cap = Scripted::always(Service::S3, Ok(ProviderResponse::new(json!({}))));
    let d = dispatcher(cap.clone(), static_provider());

    d.execute(&create_bucket("a").idempotency_key("k")).await.unwrap();
    let again = d
        .execute(
            &OperationRequest::new("S3", "create-bucket")
                .param("name", "a")
                .idempotency_key("k"),
        )
        .await
        .unwrap();

    assert!(again.replayed);
    assert_eq!(cap.count(), 1);
}

// ── Cancellation and validation ─────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_cancel_during_backoff_stops_without_another_call() {
    let cap = Scripted::always(Service::S3, throttle());
    let policy = RetryPolicy {
        throttle_backoff: Duration::from_secs(10),
        ..fixed_policy()
    };
    let d = Arc::new(
        Dispatcher::builder(static_provider())
            .capability(cap.clone())
            .retry_policy(policy)
            .build(),
    );
    let token = CancellationToken::new();

    let task = {
        let d = Arc::clone(&d);
        let token = token.clone();
        tokio::spawn(async move { d.execute_with_cancel(&create_bucket("b"), &token).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    token.cancel();

    let err = task.await.unwrap().unwrap_err();
    assert_eq!(err.kind, ErrorKind::Cancelled);
    assert_eq!(err.attempts, 1);
    assert_eq!(cap.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_credential_load_invalidates_cache() {
    let issuer = CountingIssuer::new(Duration::from_secs(10));
    let provider = role_provider(issuer.clone());
    let cap = Scripted::always(Service::S3, Ok(ProviderResponse::default()));
    let d = Arc::new(dispatcher(cap.clone(), provider.clone()));
    let token = CancellationToken::new();

    let task = {
        let d = Arc::clone(&d);
        let token = token.clone();
        tokio::spawn(async move {
            d.execute_with_cancel(&OperationRequest::new("s3", "list_buckets"), &token)
                .await
        })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    token.cancel();

    let err = task.await.unwrap().unwrap_err();
    assert_eq!(err.kind, ErrorKind::Cancelled);
    assert_eq!(cap.count(), 0);
    assert!(provider.cached().is_none());

    // A later execution loads again rather than reusing the abandoned load.
    d.execute(&OperationRequest::new("s3", "list_buckets")).await.unwrap();
    assert_eq!(issuer.count(), 2);
    assert_eq!(provider.cached().unwrap().access_key_id, "ASIA2");
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_before_start_makes_no_call() {
    let cap = Scripted::always(Service::S3, Ok(ProviderResponse::default()));
    let d = dispatcher(cap.clone(), static_provider());
    let token = CancellationToken::new();
    token.cancel();

    let err = d
        .execute_with_cancel(&OperationRequest::new("s3", "list_buckets"), &token)
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::Cancelled);
    assert_eq!(cap.count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_operation_makes_no_call() {
    let cap = Scripted::always(Service::Ec2, Ok(ProviderResponse::default()));
    let d = dispatcher(cap.clone(), static_provider());

    let err = d
        .execute(&OperationRequest::new("ec2", "launch_rocket"))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Permanent);
    assert_eq!(err.attempts, 0);

    let err = d
        .execute(&OperationRequest::new("ec2", "terminate_instance"))
        .await
        .unwrap_err();
    assert_eq!(err.code, "ValidationError");

    assert_eq!(cap.count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_service_without_capability_is_permanent() {
    let cap = Scripted::always(Service::Ec2, Ok(ProviderResponse::default()));
    let d = dispatcher(cap, static_provider());

    let err = d
        .execute(&OperationRequest::new("rds", "list_instances"))
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::Permanent);
    assert_eq!(err.code, "ServiceNotConfigured");
}

#[tokio::test(start_paused = true)]
async fn test_region_override_reaches_capability() {
    struct RegionEcho;

    #[async_trait]
    impl ServiceCapability for RegionEcho {
        fn service(&self) -> Service {
            Service::Sts
        }

        async fn call(&self, call: ProviderCall<'_>) -> Result<ProviderResponse, ProviderError> {
            Ok(ProviderResponse::new(json!({
                "region": call.region,
                "credential_region": call.credentials.region,
            })))
        }
    }

    let d = Dispatcher::builder(static_provider())
        .capability(Arc::new(RegionEcho))
        .default_region("eu-west-1")
        .build();

    let default = d.execute(&OperationRequest::new("sts", "caller_identity")).await.unwrap();
    assert_eq!(default.payload["region"], "eu-west-1");

    let other = d
        .execute(&OperationRequest::new("sts", "caller_identity").region("ap-northeast-1"))
        .await
        .unwrap();
    assert_eq!(other.payload["region"], "ap-northeast-1");
    assert_eq!(other.payload["credential_region"], "ap-northeast-1");
}
