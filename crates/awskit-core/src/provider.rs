//! Credential provider with an in-memory cache and single-flight refresh.
//!
//! The provider owns the only copy of the active credentials. Concurrent
//! callers that need a load while one is already running await the same shared
//! future instead of starting another. A load that every caller abandons, or
//! that a caller cancels, leaves the cache empty.

use crate::capability::ProviderError;
use crate::credentials::{
    default_credentials_path, load_profile, AssumeRoleRequest, AssumeRoleSource, CredentialSource, Credentials,
};
use crate::error::{ErrorKind, ToolkitError};
use crate::retry::{retry_transient, RetryPolicy};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use std::future::Future;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Exchanges base credentials for temporary role credentials (STS AssumeRole).
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn assume_role(&self, source: &Credentials, request: &AssumeRoleRequest) -> Result<Credentials, ProviderError>;
}

type LoadFuture = BoxFuture<'static, Result<Credentials, ToolkitError>>;
type SharedLoad = Shared<LoadFuture>;

struct ProviderInner {
    source: CredentialSource,
    issuer: Option<Arc<dyn TokenIssuer>>,
    retry: RetryPolicy,
    default_region: String,
    cache: RwLock<Option<Credentials>>,
    /// Weak so that a load nobody awaits any more is dropped.
    inflight: Mutex<Option<WeakShared<LoadFuture>>>,
    loads: AtomicU64,
}

/// Lives inside a load future; invalidates if the load is dropped unfinished.
struct LoadGuard {
    inner: Arc<ProviderInner>,
    finished: bool,
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        log::debug!("credential load from {} abandoned, invalidating cache", self.inner.source.name());
        *self.inner.cache.write().unwrap_or_else(PoisonError::into_inner) = None;
        let mut slot = self.inner.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        // A newer load may already own the slot.
        let live = slot.as_ref().and_then(WeakShared::upgrade);
        if live.is_none() {
            *slot = None;
        }
        drop(slot);
        drop(live);
    }
}

/// Resolves, caches and refreshes credentials for one configured source.
#[derive(Clone)]
pub struct CredentialProvider {
    inner: Arc<ProviderInner>,
}

/// Builder for [`CredentialProvider`].
pub struct CredentialProviderBuilder {
    source: CredentialSource,
    issuer: Option<Arc<dyn TokenIssuer>>,
    retry: RetryPolicy,
    default_region: String,
}

impl CredentialProviderBuilder {
    pub fn token_issuer(mut self, issuer: Arc<dyn TokenIssuer>) -> Self {
        self.issuer = Some(issuer);
        self
    }

    /// Policy for transient failures of the token issuer.
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn default_region(mut self, region: &str) -> Self {
        self.default_region = region.to_string();
        self
    }

    pub fn build(self) -> CredentialProvider {
        CredentialProvider {
            inner: Arc::new(ProviderInner {
                source: self.source,
                issuer: self.issuer,
                retry: self.retry,
                default_region: self.default_region,
                cache: RwLock::new(None),
                inflight: Mutex::new(None),
                loads: AtomicU64::new(0),
            }),
        }
    }
}

impl CredentialProvider {
    pub fn builder(source: CredentialSource) -> CredentialProviderBuilder {
        CredentialProviderBuilder {
            source,
            issuer: None,
            retry: RetryPolicy::default(),
            default_region: "us-east-1".to_string(),
        }
    }

    pub fn new(source: CredentialSource) -> Self {
        Self::builder(source).build()
    }

    /// Provider over fixed keys.
    pub fn from_static(credentials: Credentials) -> Self {
        Self::new(CredentialSource::Static(credentials))
    }

    pub fn source(&self) -> &CredentialSource {
        &self.inner.source
    }

    /// Number of source loads performed so far.
    pub fn load_count(&self) -> u64 {
        self.inner.loads.load(Ordering::SeqCst)
    }

    pub fn cached(&self) -> Option<Credentials> {
        self.inner
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drop the cached credentials; the next call loads from the source.
    pub fn invalidate(&self) {
        *self.inner.cache.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Whether the source can ever produce different credentials.
    pub fn is_refreshable(&self) -> bool {
        refreshable(&self.inner.source)
    }

    /// Cached credentials, or a first load from the source.
    pub async fn resolve(&self, region: &str) -> Result<Credentials, ToolkitError> {
        if let Some(creds) = self.cached().filter(|c| !c.is_expired()) {
            return Ok(for_region(creds, region));
        }
        self.load_shared()
            .await
            .map(|c| for_region(c, region))
            .map_err(|e| match e.kind {
                ErrorKind::AuthExpired | ErrorKind::RetryExhausted | ErrorKind::Cancelled => e,
                _ => e.into_kind(ErrorKind::Auth),
            })
    }

    /// Replace `stale` with fresh credentials.
    ///
    /// If another caller already refreshed, the newer cached value is returned
    /// without a load.
    pub async fn refresh(&self, stale: &Credentials) -> Result<Credentials, ToolkitError> {
        if let Some(current) = self.cached() {
            if !same_keys(&current, stale) && !current.is_expired() {
                return Ok(for_region(current, &stale.region));
            }
        }
        if !self.is_refreshable() {
            self.invalidate();
            return Err(ToolkitError::auth_expired("static credentials cannot be refreshed"));
        }
        log::debug!("refreshing credentials from {} source", self.inner.source.name());
        let fresh = self.load_shared().await.map_err(|e| match e.kind {
            ErrorKind::RetryExhausted | ErrorKind::Cancelled => e,
            _ => e.into_kind(ErrorKind::AuthExpired),
        })?;
        if same_keys(&fresh, stale) && stale.is_expired() {
            self.invalidate();
            return Err(ToolkitError::auth_expired(
                "credential source returned the same expired credentials",
            ));
        }
        Ok(for_region(fresh, &stale.region))
    }

    /// Credentials valid for at least `margin`, refreshing when needed.
    pub async fn credentials(&self, region: &str, margin: Duration) -> Result<Credentials, ToolkitError> {
        match self.cached() {
            Some(creds) if !creds.expires_within(margin) => Ok(for_region(creds, region)),
            // Nothing to rotate to; keep using them until they actually expire.
            Some(creds) if !self.is_refreshable() && !creds.is_expired() => Ok(for_region(creds, region)),
            Some(stale) => {
                let fresh = self.refresh(&stale).await?;
                Ok(for_region(fresh, region))
            }
            None => self.resolve(region).await,
        }
    }

    /// [`CredentialProvider::credentials`], abandoned when `cancel` fires.
    pub async fn credentials_until(
        &self,
        region: &str,
        margin: Duration,
        cancel: &CancellationToken,
    ) -> Result<Credentials, ToolkitError> {
        self.until_cancelled(cancel, self.credentials(region, margin)).await
    }

    /// [`CredentialProvider::refresh`], abandoned when `cancel` fires.
    pub async fn refresh_until(&self, stale: &Credentials, cancel: &CancellationToken) -> Result<Credentials, ToolkitError> {
        self.until_cancelled(cancel, self.refresh(stale)).await
    }

    async fn until_cancelled<F>(&self, cancel: &CancellationToken, work: F) -> Result<Credentials, ToolkitError>
    where
        F: Future<Output = Result<Credentials, ToolkitError>>,
    {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                log::debug!("credential lookup cancelled, invalidating cache");
                self.invalidate();
                Err(ToolkitError::cancelled())
            }
            result = work => result,
        }
    }

    fn load_shared(&self) -> SharedLoad {
        let mut slot = self.inner.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pending) = slot.as_ref().and_then(WeakShared::upgrade) {
            return pending;
        }
        let mut guard = LoadGuard {
            inner: Arc::clone(&self.inner),
            finished: false,
        };
        let load = async move {
            let inner = Arc::clone(&guard.inner);
            inner.loads.fetch_add(1, Ordering::SeqCst);
            let result = load_source(&inner, &inner.source).await.and_then(|found| {
                let creds = found.ok_or_else(|| {
                    ToolkitError::auth(&format!(
                        "no credentials found from the {} source",
                        inner.source.name()
                    ))
                })?;
                if creds.is_expired() {
                    return Err(ToolkitError::auth_expired(&format!(
                        "credentials from {} are expired",
                        creds.provider_name
                    )));
                }
                Ok(creds)
            });
            {
                let mut cache = inner.cache.write().unwrap_or_else(PoisonError::into_inner);
                match &result {
                    Ok(creds) => {
                        log::debug!("loaded credentials from {}", creds.provider_name);
                        *cache = Some(creds.clone());
                    }
                    Err(err) => {
                        log::warn!("credential load failed: {}", err);
                        *cache = None;
                    }
                }
            }
            *inner.inflight.lock().unwrap_or_else(PoisonError::into_inner) = None;
            guard.finished = true;
            result
        }
        .boxed()
        .shared();
        *slot = load.downgrade();
        load
    }
}

impl fmt::Debug for CredentialProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialProvider")
            .field("source", &self.inner.source.name())
            .field("has_issuer", &self.inner.issuer.is_some())
            .field("cached", &self.cached())
            .finish()
    }
}

fn for_region(mut creds: Credentials, region: &str) -> Credentials {
    if !region.is_empty() {
        creds.region = region.to_string();
    }
    creds
}

fn same_keys(a: &Credentials, b: &Credentials) -> bool {
    a.access_key_id == b.access_key_id
        && a.secret_access_key == b.secret_access_key
        && a.session_token == b.session_token
        && a.expiration == b.expiration
}

fn refreshable(source: &CredentialSource) -> bool {
    match source {
        CredentialSource::Static(_) => false,
        CredentialSource::Chain(members) => members.iter().any(refreshable),
        _ => true,
    }
}

fn load_source<'a>(
    inner: &'a ProviderInner,
    source: &'a CredentialSource,
) -> BoxFuture<'a, Result<Option<Credentials>, ToolkitError>> {
    async move {
        let region = inner.default_region.as_str();
        match source {
            CredentialSource::Static(creds) => Ok(Some(creds.clone()).filter(|c| !c.is_empty())),
            CredentialSource::Environment => Ok(Credentials::from_environment(region)),
            CredentialSource::Profile { name, path } => {
                let Some(path) = path.clone().or_else(default_credentials_path) else {
                    return Ok(None);
                };
                load_profile(&path, name, region).map_err(|e| {
                    ToolkitError::auth(&format!("cannot read credentials file {}: {}", path.display(), e))
                })
            }
            CredentialSource::AssumeRole(role) => assume_role(inner, role).await.map(Some),
            CredentialSource::Chain(members) => {
                let mut last_err = None;
                for member in members {
                    match load_source(inner, member).await {
                        Ok(Some(creds)) => return Ok(Some(creds)),
                        Ok(None) => continue,
                        Err(err) => {
                            log::warn!("{} credential source failed: {}", member.name(), err.message);
                            last_err = Some(err);
                        }
                    }
                }
                match last_err {
                    Some(err) => Err(err),
                    None => Ok(None),
                }
            }
        }
    }
    .boxed()
}

async fn assume_role(inner: &ProviderInner, role: &AssumeRoleSource) -> Result<Credentials, ToolkitError> {
    let issuer = inner
        .issuer
        .as_ref()
        .ok_or_else(|| ToolkitError::auth("role assumption needs a token issuer"))?;
    let base = load_source(inner, &role.source).await?.ok_or_else(|| {
        ToolkitError::auth(&format!(
            "no base credentials to assume {} from the {} source",
            role.role_arn,
            role.source.name()
        ))
    })?;
    let request = role.request();
    let label = format!("sts:assume_role {}", role.role_arn);
    let creds = retry_transient(&inner.retry, None, &label, |_| {
        let issuer = Arc::clone(issuer);
        let base = base.clone();
        let request = request.clone();
        async move {
            issuer
                .assume_role(&base, &request)
                .await
                .map_err(|e| ToolkitError::from_provider(&e).with_operation("sts:assume_role"))
        }
    })
    .await?;
    Ok(creds.with_provider(&format!("assume_role:{}", role.role_arn)))
}
