//! Access-token handling for the notification stream.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::future::{self, BoxFuture};
use futures::FutureExt;
use tracing::{debug, info, warn};

use crate::error::CredentialError;

#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    /// `None` never expires.
    pub expires_at: Option<SystemTime>,
}

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires_at: None,
        }
    }

    pub fn expiring_in(token: impl Into<String>, ttl: Duration) -> Self {
        Self {
            token: token.into(),
            expires_at: Some(SystemTime::now() + ttl),
        }
    }

    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn is_usable(&self) -> bool {
        !self.token.is_empty() && !self.is_expired_at(SystemTime::now())
    }
}

// Never print the token itself.
impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Source of the bearer token for the notification stream.
pub trait CredentialProvider: Send + Sync + 'static {
    fn current(&self) -> Option<AccessToken>;

    /// Obtain a fresh token. `Ok(None)` means the provider has nothing to offer.
    fn refresh(&self) -> BoxFuture<'_, anyhow::Result<Option<AccessToken>>>;
}

/// A fixed token that is never refreshed.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    token: Option<AccessToken>,
}

impl StaticCredentials {
    pub fn new(token: AccessToken) -> Self {
        Self { token: Some(token) }
    }

    pub fn anonymous() -> Self {
        Self { token: None }
    }
}

impl CredentialProvider for StaticCredentials {
    fn current(&self) -> Option<AccessToken> {
        self.token.clone()
    }

    fn refresh(&self) -> BoxFuture<'_, anyhow::Result<Option<AccessToken>>> {
        future::ready(Ok(None)).boxed()
    }
}

type CurrentFn = dyn Fn() -> Option<AccessToken> + Send + Sync;
type RefreshFn = dyn Fn() -> BoxFuture<'static, anyhow::Result<Option<AccessToken>>> + Send + Sync;

/// Adapts a token accessor and an async refresh closure.
#[derive(Clone)]
pub struct FnCredentials {
    current: Arc<CurrentFn>,
    refresh: Arc<RefreshFn>,
}

impl FnCredentials {
    pub fn new<C, R, Fut>(current: C, refresh: R) -> Self
    where
        C: Fn() -> Option<AccessToken> + Send + Sync + 'static,
        R: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Option<AccessToken>>> + Send + 'static,
    {
        Self {
            current: Arc::new(current),
            refresh: Arc::new(move || refresh().boxed()),
        }
    }
}

impl fmt::Debug for FnCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnCredentials").finish_non_exhaustive()
    }
}

impl CredentialProvider for FnCredentials {
    fn current(&self) -> Option<AccessToken> {
        (self.current)()
    }

    fn refresh(&self) -> BoxFuture<'_, anyhow::Result<Option<AccessToken>>> {
        (self.refresh)()
    }
}

/// Current token if usable, otherwise the result of one refresh.
pub async fn resolve_access_token(
    provider: &dyn CredentialProvider,
) -> Result<AccessToken, CredentialError> {
    let current = provider.current();
    if let Some(token) = current.as_ref().filter(|t| t.is_usable()) {
        return Ok(token.clone());
    }

    debug!(
        component = "auth",
        event = "auth.refresh.started",
        had_token = current.is_some(),
        "Access token missing or expired, refreshing"
    );

    match provider.refresh().await {
        Ok(Some(token)) if token.is_usable() => {
            info!(
                component = "auth",
                event = "auth.refresh.succeeded",
                "Access token refreshed"
            );
            Ok(token)
        }
        Ok(_) => {
            warn!(
                component = "auth",
                event = "auth.refresh.empty",
                "Refresh produced no usable token"
            );
            if current.is_some() {
                Err(CredentialError::Expired)
            } else {
                Err(CredentialError::Missing)
            }
        }
        Err(e) => {
            warn!(
                component = "auth",
                event = "auth.refresh.failed",
                error = %e,
                "Token refresh failed"
            );
            Err(CredentialError::RefreshFailed(e.to_string()))
        }
    }
}
