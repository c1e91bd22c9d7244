//! Bearer credentials and their per-scope cache.
//!
//! [`CredentialCache`] keeps at most one credential per distinct scope set
//! and never hands out a token whose remaining lifetime is below the refresh
//! margin while the source can still produce a fresher one. Refreshes are
//! serialized per scope set: callers that find the token stale while another
//! caller is refreshing wait for that refresh instead of starting their own.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use itertools::Itertools;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Default minimum remaining lifetime of a served token.
pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(300);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("credential unavailable: {0}")]
    Unavailable(String),
}

/// The set of permission identifiers a credential is requested for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Scopes(BTreeSet<String>);

impl Scopes {
    pub fn new<I, S>(scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(scopes.into_iter().map(Into::into).collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for Scopes {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter)
    }
}

impl fmt::Display for Scopes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.iter().join(" "))
    }
}

/// A token as produced by a [`CredentialSource`].
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: SystemTime,
}

impl AccessToken {
    pub fn new(token: impl Into<String>, expires_at: SystemTime) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    /// A token valid for `lifetime` from now.
    pub fn expiring_in(token: impl Into<String>, lifetime: Duration) -> Self {
        Self::new(token, SystemTime::now() + lifetime)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// A cached credential.
#[derive(Clone)]
pub struct Credential {
    pub token: String,
    pub expires_at: SystemTime,
    pub scopes: Scopes,
}

impl Credential {
    /// Remaining lifetime, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.expires_at
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO)
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// Produces tokens for a scope set (an identity provider, a static key, ...).
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn acquire(&self, scopes: &Scopes) -> Result<AccessToken, CredentialError>;
}

/// A fixed bearer token reissued with a fixed lifetime on every acquisition.
#[derive(Clone)]
pub struct StaticToken {
    token: String,
    lifetime: Duration,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            lifetime: Duration::from_secs(24 * 60 * 60),
        }
    }

    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }
}

#[async_trait]
impl CredentialSource for StaticToken {
    async fn acquire(&self, _scopes: &Scopes) -> Result<AccessToken, CredentialError> {
        Ok(AccessToken::expiring_in(self.token.clone(), self.lifetime))
    }
}

/// OAuth2 client-credentials grant against a token endpoint.
pub struct ClientCredentials {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

impl ClientCredentials {
    pub fn new(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    /// Use a preconfigured HTTP client (proxy, timeouts, ...).
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }
}

#[async_trait]
impl CredentialSource for ClientCredentials {
    async fn acquire(&self, scopes: &Scopes) -> Result<AccessToken, CredentialError> {
        let scope = scopes.to_string();
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", scope.as_str()),
        ];

        debug!("Requesting token for scopes [{}] from {}", scopes, self.token_url);
        let response = self
            .http
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| CredentialError::Unavailable(format!("token request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CredentialError::Unavailable(format!(
                "token endpoint returned HTTP {}: {}",
                status, body
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| CredentialError::Unavailable(format!("invalid token response: {}", e)))?;

        Ok(AccessToken::expiring_in(
            token.access_token,
            Duration::from_secs(token.expires_in),
        ))
    }
}

type Slot = Arc<tokio::sync::Mutex<Option<Credential>>>;

/// Caches one credential per scope set and refreshes it before expiry.
pub struct CredentialCache {
    source: Arc<dyn CredentialSource>,
    refresh_margin: Duration,
    slots: Mutex<HashMap<Scopes, Slot>>,
}

impl CredentialCache {
    pub fn new<S: CredentialSource + 'static>(source: S) -> Self {
        Self::from_arc(Arc::new(source))
    }

    pub fn from_arc(source: Arc<dyn CredentialSource>) -> Self {
        Self {
            source,
            refresh_margin: DEFAULT_REFRESH_MARGIN,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = margin;
        self
    }

    pub fn refresh_margin(&self) -> Duration {
        self.refresh_margin
    }

    fn slot(&self, scopes: &Scopes) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.entry(scopes.clone()).or_default().clone()
    }

    /// Return a token for `scopes` valid for at least the refresh margin.
    ///
    /// If reacquisition fails while the cached token has not yet expired, that
    /// token is served; otherwise the slot is cleared and the error returned.
    pub async fn token(&self, scopes: &Scopes) -> Result<String, CredentialError> {
        let slot = self.slot(scopes);
        let mut cached = slot.lock().await;

        if let Some(credential) = cached.as_ref() {
            if credential.remaining() >= self.refresh_margin {
                trace!("Serving cached token for scopes [{}]", scopes);
                return Ok(credential.token.clone());
            }
            debug!(
                "Token for scopes [{}] has {:?} left, refreshing",
                scopes,
                credential.remaining()
            );
        }

        match self.source.acquire(scopes).await {
            Ok(fresh) => {
                let credential = Credential {
                    token: fresh.token,
                    expires_at: fresh.expires_at,
                    scopes: scopes.clone(),
                };
                if credential.remaining() < self.refresh_margin {
                    warn!(
                        "Source issued a token for scopes [{}] with only {:?} left",
                        scopes,
                        credential.remaining()
                    );
                }
                let token = credential.token.clone();
                *cached = Some(credential);
                Ok(token)
            }
            Err(e) => match cached.as_ref() {
                Some(stale) if !stale.is_expired() => {
                    warn!(
                        "Refresh for scopes [{}] failed ({}), serving token with {:?} left",
                        scopes,
                        e,
                        stale.remaining()
                    );
                    Ok(stale.token.clone())
                }
                _ => {
                    *cached = None;
                    Err(e)
                }
            },
        }
    }

    /// Drop the cached credential for `scopes` so the next call reacquires.
    pub async fn invalidate(&self, scopes: &Scopes) {
        let slot = self.slot(scopes);
        let mut cached = slot.lock().await;
        if cached.take().is_some() {
            debug!("Invalidated token for scopes [{}]", scopes);
        }
    }
}

impl fmt::Debug for CredentialCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialCache")
            .field("refresh_margin", &self.refresh_margin)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Issues `token-N` with a fixed lifetime; optionally slow or failing.
    struct CountingSource {
        calls: Arc<AtomicUsize>,
        lifetime: Duration,
        /// Lifetime of the very first token, if it differs.
        first_lifetime: Option<Duration>,
        delay: Duration,
        fail_after: Option<usize>,
    }

    impl CountingSource {
        fn new(lifetime: Duration) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let source = Self {
                calls: calls.clone(),
                lifetime,
                first_lifetime: None,
                delay: Duration::ZERO,
                fail_after: None,
            };
            (source, calls)
        }
    }

    #[async_trait]
    impl CredentialSource for CountingSource {
        async fn acquire(&self, scopes: &Scopes) -> Result<AccessToken, CredentialError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail_after.is_some_and(|limit| n > limit) {
                return Err(CredentialError::Unavailable("provider down".to_string()));
            }
            let lifetime = match self.first_lifetime {
                Some(first) if n == 1 => first,
                _ => self.lifetime,
            };
            Ok(AccessToken::expiring_in(
                format!("{}-token-{}", scopes, n),
                lifetime,
            ))
        }
    }

    fn scopes() -> Scopes {
        Scopes::new(["https://cognitiveservices.azure.com/.default"])
    }

    #[tokio::test]
    async fn test_cached_token_is_reused() {
        let (source, calls) = CountingSource::new(Duration::from_secs(3600));
        let cache = CredentialCache::new(source);

        let first = cache.token(&scopes()).await.unwrap();
        let second = cache.token(&scopes()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_token_inside_margin_is_refreshed_once() {
        // 200s of lifetime is below the 300s default margin.
        let (source, calls) = CountingSource::new(Duration::from_secs(200));
        let cache = CredentialCache::new(source);

        let first = cache.token(&scopes()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let second = cache.token(&scopes()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_acquisition() {
        let (mut source, calls) = CountingSource::new(Duration::from_secs(3600));
        source.delay = Duration::from_millis(50);
        let cache = Arc::new(CredentialCache::new(source));

        let tasks = (0..16).map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.token(&scopes()).await })
        });
        let tokens: Vec<String> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(tokens.iter().all(|t| t == &tokens[0]));
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let (mut source, calls) = CountingSource::new(Duration::from_secs(3600));
        source.first_lifetime = Some(Duration::from_secs(200));
        source.delay = Duration::from_millis(50);
        let cache = Arc::new(CredentialCache::new(source));

        let stale = cache.token(&scopes()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let tasks = (0..16).map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.token(&scopes()).await })
        });
        let tokens: Vec<String> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(tokens.iter().all(|t| t == &tokens[0]));
        assert_ne!(tokens[0], stale);
    }

    #[tokio::test]
    async fn test_failed_refresh_serves_unexpired_token() {
        let (mut source, calls) = CountingSource::new(Duration::from_secs(200));
        source.fail_after = Some(1);
        let cache = CredentialCache::new(source);

        let first = cache.token(&scopes()).await.unwrap();
        let second = cache.token(&scopes()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_without_token_propagates() {
        let (mut source, calls) = CountingSource::new(Duration::from_secs(3600));
        source.fail_after = Some(0);
        let cache = CredentialCache::new(source);

        let err = cache.token(&scopes()).await.unwrap_err();
        assert_eq!(err, CredentialError::Unavailable("provider down".to_string()));

        // Nothing was cached, so the next call tries the source again.
        assert!(cache.token(&scopes()).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_scope_sets_are_cached_separately() {
        let (source, calls) = CountingSource::new(Duration::from_secs(3600));
        let cache = CredentialCache::new(source);

        let a = cache.token(&Scopes::new(["read"])).await.unwrap();
        let b = cache.token(&Scopes::new(["read", "write"])).await.unwrap();
        let b_again = cache.token(&Scopes::new(["write", "read"])).await.unwrap();

        assert_ne!(a, b);
        assert_eq!(b, b_again);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_reacquisition() {
        let (source, calls) = CountingSource::new(Duration::from_secs(3600));
        let cache = CredentialCache::new(source);

        cache.token(&scopes()).await.unwrap();
        cache.invalidate(&scopes()).await;
        cache.token(&scopes()).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_custom_margin() {
        let (source, calls) = CountingSource::new(Duration::from_secs(200));
        let cache = CredentialCache::new(source).with_refresh_margin(Duration::from_secs(60));

        cache.token(&scopes()).await.unwrap();
        cache.token(&scopes()).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
