//! Authorization manager.
//!
//! Runs the OAuth2 authorization code flow with PKCE against the
//! provider, keeps the resulting [`Credential`] in the secure store, and
//! refreshes it when it runs out. The flow, end to end:
//!
//! 1. [`AuthManager::authorize`] creates a fresh [`Attempt`] and binds the
//!    one-shot loopback [`Listener`].
//! 2. The provider's authorization page opens through the [`UrlOpener`].
//! 3. The provider redirects back with `code` and `state`; the listener
//!    checks the state and hands over the code.
//! 4. The [`TokenExchanger`] redeems the code; the credential is persisted,
//!    then published to subscribers as [`AuthEvent::Changed`].
//!
//! Refreshes are single-flight: concurrent callers of
//! [`refresh_if_needed`](AuthManager::refresh_if_needed) share one
//! exchange with the provider and all observe its outcome.

pub mod browser;
pub mod exchange;
pub mod listener;

use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex, PoisonError, RwLock},
    time::{Duration, SystemTime},
};

use futures_util::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use thiserror::Error;
use tokio::sync::broadcast;

pub use browser::{SystemBrowser, UrlOpener};
pub use exchange::{EngineExchanger, TokenEndpoint, TokenExchanger};
pub use listener::Listener;

use crate::{
    config::Config,
    credential::{AccessToken, Credential},
    error::ErrorKind,
    pkce::Attempt,
    protocol::auth::Token,
    store::SecureStore,
};

#[derive(Clone, Debug, Error, PartialEq, Eq, Hash)]
pub enum AuthError {
    #[error("invalid redirect configuration: {0}")]
    InvalidRedirectConfiguration(String),

    #[error("failed to bind redirect listener: {0}")]
    ListenerBindFailed(String),

    #[error("redirect state does not match the pending authorization")]
    StateMismatch,

    #[error("invalid redirect: {0}")]
    InvalidRedirect(String),

    #[error("timed out waiting for the authorization redirect")]
    Timeout,

    #[error("another authorization is already in progress")]
    AttemptInProgress,

    #[error("token exchange failed: {0}")]
    ExchangeFailed(String),

    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("persisting credential failed: {0}")]
    PersistFailed(String),

    #[error("playback engine not initialized")]
    EngineNotInitialized,
}

/// Authorization state changes, published after the state is persisted.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AuthEvent {
    /// A credential was obtained or refreshed.
    Changed,
    /// The credential was erased.
    Deauthorized,
}

type SharedRefresh = Shared<BoxFuture<'static, Result<(), AuthError>>>;

/// Cheaply clonable handle; clones share one credential.
#[derive(Clone)]
pub struct AuthManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    store: Arc<dyn SecureStore>,
    exchanger: Arc<dyn TokenExchanger>,
    opener: Arc<dyn UrlOpener>,

    credential: RwLock<Option<Credential>>,
    /// Orders store writes against each other. Counts credential
    /// replacements, so a refresh can tell that the credential it started
    /// from is gone.
    persist: Mutex<u64>,
    refresh: Mutex<Option<SharedRefresh>>,
    attempt: tokio::sync::Mutex<()>,
    events: broadcast::Sender<AuthEvent>,
}

impl AuthManager {
    const EVENT_CAPACITY: usize = 16;

    /// Creates the manager and restores a previously stored credential.
    ///
    /// An unreadable or undecodable stored credential is logged and
    /// ignored. A restored credential that has expired is refreshed in the
    /// background when called within a tokio runtime.
    #[must_use]
    pub fn new(
        config: Config,
        store: Arc<dyn SecureStore>,
        exchanger: Arc<dyn TokenExchanger>,
        opener: Arc<dyn UrlOpener>,
    ) -> Self {
        let credential = match store.get(&config.store_key) {
            Ok(Some(bytes)) => match Credential::decode(&bytes) {
                Ok(credential) => {
                    debug!("restored {credential}");
                    Some(credential)
                }
                Err(e) => {
                    warn!("ignoring stored credential: {e}");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("failed reading secure store: {e}");
                None
            }
        };

        let (events, _) = broadcast::channel(Self::EVENT_CAPACITY);
        let manager = Self {
            inner: Arc::new(Inner {
                config,
                store,
                exchanger,
                opener,
                credential: RwLock::new(credential),
                persist: Mutex::new(0),
                refresh: Mutex::new(None),
                attempt: tokio::sync::Mutex::new(()),
                events,
            }),
        };

        let stale = manager.has_credential()
            && manager.access_token_is_expired(manager.inner.config.refresh_tolerance);
        if stale {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    info!("stored credential expired; refreshing");
                    let manager = manager.clone();
                    handle.spawn(async move {
                        if let Err(e) = manager.refresh_if_needed().await {
                            error!("{e}");
                        }
                    });
                }
                Err(_) => debug!("stored credential expired; no runtime to refresh on"),
            }
        }

        manager
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Subscribes to authorization changes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.inner.events.subscribe()
    }

    /// True iff a non-expired credential with a non-empty token exists.
    #[must_use]
    pub fn is_authorized(&self) -> bool {
        self.read(|credential| {
            credential.is_some_and(|credential| !credential.is_expired(Duration::ZERO))
        })
    }

    /// True if there is no credential, or `now + tolerance` has reached its
    /// expiry.
    #[must_use]
    pub fn access_token_is_expired(&self, tolerance: Duration) -> bool {
        self.read(|credential| credential.map_or(true, |c| c.is_expired(tolerance)))
    }

    /// Opaque handle to the current access token, expired or not.
    #[must_use]
    pub fn access_token(&self) -> Option<AccessToken> {
        self.read(|credential| credential.map(Credential::access_token))
    }

    #[must_use]
    pub fn expires_at(&self) -> Option<SystemTime> {
        self.read(|credential| credential.map(|c| c.expires_at))
    }

    #[must_use]
    pub fn scopes(&self) -> BTreeSet<String> {
        self.read(|credential| credential.map(|c| c.scopes.clone()).unwrap_or_default())
    }

    fn lock_persist(&self) -> std::sync::MutexGuard<'_, u64> {
        self.inner
            .persist
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn has_credential(&self) -> bool {
        self.read(|credential| credential.is_some())
    }

    fn read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(Option<&Credential>) -> R,
    {
        let credential = self
            .inner
            .credential
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        f(credential.as_ref())
    }

    /// Runs the authorization flow, waiting up to the configured listener
    /// timeout for the redirect.
    ///
    /// # Errors
    ///
    /// See [`authorize_with_timeout`](Self::authorize_with_timeout).
    pub async fn authorize(&self) -> Result<(), AuthError> {
        self.authorize_with_timeout(self.inner.config.listener_timeout)
            .await
    }

    /// Runs the authorization flow.
    ///
    /// # Errors
    ///
    /// * [`AuthError::AttemptInProgress`] if another attempt is live
    /// * [`AuthError::InvalidRedirectConfiguration`] for a bad redirect port
    ///   or path
    /// * [`AuthError::ListenerBindFailed`] if the loopback port is taken
    /// * [`AuthError::Timeout`], [`AuthError::StateMismatch`] or
    ///   [`AuthError::InvalidRedirect`] from the listener
    /// * [`AuthError::ExchangeFailed`] if the code cannot be redeemed
    /// * [`AuthError::PersistFailed`] if the credential cannot be stored
    pub async fn authorize_with_timeout(&self, timeout: Duration) -> Result<(), AuthError> {
        let _attempt_guard = self
            .inner
            .attempt
            .try_lock()
            .map_err(|_| AuthError::AttemptInProgress)?;

        let config = &self.inner.config;
        let redirect_uri = config.redirect_uri()?;
        let attempt = Attempt::new(redirect_uri, config.scopes.clone());

        // Bind before sending the user off, so the redirect cannot race us.
        let listener = Listener::bind(config.redirect_port, &config.redirect_path).await?;

        let url = attempt.authorize_url(&config.authorize_url, &config.client_id);
        debug!("authorization url: {url}");
        if let Err(e) = self.inner.opener.open(&url) {
            warn!("failed to open authorization page: {e}");
            info!("open this URL to log in: {url}");
        }

        let code = listener.accept(&attempt, timeout).await?;
        debug!("received authorization code");

        let token = self
            .inner
            .exchanger
            .exchange_code(&code, &attempt)
            .await
            .map_err(|e| AuthError::ExchangeFailed(e.to_string()))?;

        if token.access_token.is_empty() {
            return Err(AuthError::ExchangeFailed(
                "provider returned an empty access token".to_string(),
            ));
        }

        let scopes = token
            .scopes()
            .unwrap_or_else(|| attempt.scopes.iter().cloned().collect());
        let credential = Credential {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_at: SystemTime::now() + token.expires_in,
            scopes,
        };

        self.install(credential)?;
        info!("authorized");

        Ok(())
    }

    /// Persists a new credential, swaps it in and notifies subscribers.
    fn install(&self, credential: Credential) -> Result<(), AuthError> {
        let bytes = credential
            .encode()
            .map_err(|e| AuthError::PersistFailed(e.to_string()))?;

        {
            let mut generation = self.lock_persist();
            self.inner
                .store
                .set(&self.inner.config.store_key, &bytes)
                .map_err(|e| AuthError::PersistFailed(e.to_string()))?;
            *generation += 1;

            let mut slot = self
                .inner
                .credential
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(mut previous) = slot.replace(credential) {
                previous.erase();
            }
        }

        self.notify(AuthEvent::Changed);
        Ok(())
    }

    /// Refreshes the credential if it is expired (within the configured
    /// tolerance). Concurrent callers share a single refresh.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::RefreshFailed`] (or
    /// [`AuthError::EngineNotInitialized`] when the engine was asked to mint
    /// a token before it was ready) to every waiter when the shared refresh
    /// fails. The previous credential is left in place.
    pub async fn refresh_if_needed(&self) -> Result<(), AuthError> {
        let tolerance = self.inner.config.refresh_tolerance;
        if !self.access_token_is_expired(tolerance) {
            return Ok(());
        }

        let refresh = {
            let mut slot = self
                .inner
                .refresh
                .lock()
                .unwrap_or_else(PoisonError::into_inner);

            match slot.clone() {
                Some(refresh) => refresh,
                None => {
                    // A refresh may have settled between the check above and
                    // taking the lock.
                    if !self.access_token_is_expired(tolerance) {
                        return Ok(());
                    }

                    let manager = self.clone();
                    let task = tokio::spawn(async move {
                        let result = manager.refresh().await;
                        manager
                            .inner
                            .refresh
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .take();
                        result
                    });

                    let refresh = async move {
                        task.await
                            .unwrap_or_else(|e| Err(AuthError::RefreshFailed(e.to_string())))
                    }
                    .boxed()
                    .shared();

                    *slot = Some(refresh.clone());
                    refresh
                }
            }
        };

        refresh.await
    }

    async fn refresh(&self) -> Result<(), AuthError> {
        let generation = *self.lock_persist();
        let refresh_token = self
            .read(|credential| credential.map(|c| c.refresh_token.clone()))
            .ok_or_else(|| AuthError::RefreshFailed("not authorized".to_string()))?;

        debug!("refreshing access token");
        let token = match self
            .inner
            .exchanger
            .refresh(refresh_token.as_deref())
            .await
        {
            Ok(token) if !token.access_token.is_empty() => token,
            Ok(_) => {
                let e = AuthError::RefreshFailed("empty access token".to_string());
                error!("{e}");
                return Err(e);
            }
            Err(e) => {
                // Without a refresh token the engine session mints tokens;
                // it refuses until it has been logged in and initialized.
                let e = if refresh_token.is_none() && e.kind == ErrorKind::FailedPrecondition {
                    AuthError::EngineNotInitialized
                } else {
                    AuthError::RefreshFailed(e.to_string())
                };
                error!("{e}");
                return Err(e);
            }
        };

        let credential = {
            let persisted = self.lock_persist();

            // Deauthorized or replaced while the refresh was in flight: do
            // not resurrect the old credential, in memory or in the store.
            if *persisted != generation {
                return Err(AuthError::RefreshFailed(
                    "credential replaced during refresh".to_string(),
                ));
            }

            let credential = {
                let mut slot = self
                    .inner
                    .credential
                    .write()
                    .unwrap_or_else(PoisonError::into_inner);
                let Some(credential) = slot.as_mut() else {
                    return Err(AuthError::RefreshFailed(
                        "deauthorized during refresh".to_string(),
                    ));
                };

                apply(credential, token);
                credential.clone()
            };

            match credential.encode() {
                Ok(bytes) => {
                    if let Err(e) = self.inner.store.set(&self.inner.config.store_key, &bytes) {
                        error!("failed persisting refreshed credential: {e}");
                    }
                }
                Err(e) => error!("failed encoding refreshed credential: {e}"),
            }

            credential
        };

        debug!("refreshed {credential}");
        self.notify(AuthEvent::Changed);
        Ok(())
    }

    /// Erases the credential from the secure store and from memory.
    ///
    /// Memory is cleared and subscribers are notified even when the store
    /// fails.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::PersistFailed`] if the store could not delete
    /// the credential.
    pub fn deauthorize(&self) -> Result<(), AuthError> {
        let stored = {
            let mut generation = self.lock_persist();
            *generation += 1;
            let stored = self.inner.store.delete(&self.inner.config.store_key);

            let mut slot = self
                .inner
                .credential
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(mut credential) = slot.take() {
                credential.erase();
            }

            stored
        };

        info!("deauthorized");
        self.notify(AuthEvent::Deauthorized);

        stored.map_err(|e| AuthError::PersistFailed(e.to_string()))
    }

    fn notify(&self, event: AuthEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }
}

/// Folds a refresh response into an existing credential.
fn apply(credential: &mut Credential, token: Token) {
    let scopes = token
        .scopes()
        .unwrap_or_else(|| credential.scopes.clone());
    let refresh_token = token
        .refresh_token
        .or_else(|| credential.refresh_token.clone());

    let refreshed = Credential {
        access_token: token.access_token,
        refresh_token,
        expires_at: SystemTime::now() + token.expires_in,
        scopes,
    };

    let mut previous = std::mem::replace(credential, refreshed);
    previous.erase();
}
