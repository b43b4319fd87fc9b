//! Session coordination.
//!
//! A [`Session`] ties the authorization manager to the playback engine:
//! while the user is authorized it keeps the engine logged in and a
//! [`Synchronizer`] running, and it tears the synchronizer down once the
//! credential is gone or has expired. It also refreshes the credential
//! shortly before it expires.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::SystemTime,
};

use tokio::{
    sync::{broadcast, watch},
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::{
    auth::{AuthEvent, AuthManager},
    engine::Engine,
    metadata::MetadataSource,
    player::Synchronizer,
};

/// Cheaply clonable handle to the running coordinator.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

struct Inner {
    auth: AuthManager,
    engine: Arc<dyn Engine>,
    source: Arc<dyn MetadataSource>,

    authorized: watch::Sender<bool>,
    synchronizer: Mutex<Option<Synchronizer>>,
    shutdown: CancellationToken,
}

impl Session {
    /// Starts coordinating. A credential restored from the secure store
    /// yields a running synchronizer before this returns.
    ///
    /// Must be called within a tokio runtime.
    pub async fn start(
        auth: AuthManager,
        engine: Arc<dyn Engine>,
        source: Arc<dyn MetadataSource>,
    ) -> Self {
        // Subscribe first so no change slips in between reconciling and
        // following events.
        let events = auth.subscribe();

        let (authorized, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            auth,
            engine,
            source,
            authorized,
            synchronizer: Mutex::new(None),
            shutdown: CancellationToken::new(),
        });

        inner.reconcile().await;
        tokio::spawn(Arc::clone(&inner).run(events));

        Self { inner }
    }

    #[must_use]
    pub fn auth(&self) -> &AuthManager {
        &self.inner.auth
    }

    #[must_use]
    pub fn is_authorized(&self) -> bool {
        *self.inner.authorized.borrow()
    }

    #[must_use]
    pub fn watch_authorized(&self) -> watch::Receiver<bool> {
        self.inner.authorized.subscribe()
    }

    /// The running synchronizer, if authorized.
    #[must_use]
    pub fn synchronizer(&self) -> Option<Synchronizer> {
        self.inner.lock_synchronizer().clone()
    }

    /// Stops following authorization changes and tears the synchronizer
    /// down. The credential itself is left alone.
    pub fn stop(&self) {
        self.inner.shutdown.cancel();
        self.inner.tear_down();
    }
}

impl Inner {
    fn lock_synchronizer(&self) -> std::sync::MutexGuard<'_, Option<Synchronizer>> {
        self.synchronizer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn run(self: Arc<Self>, mut events: broadcast::Receiver<AuthEvent>) {
        let mut last_attempt = None;

        loop {
            let deadline = self.next_deadline(last_attempt);

            tokio::select! {
                biased;

                () = self.shutdown.cancelled() => break,

                event = events.recv() => match event {
                    Ok(event) => debug!("authorization event: {event:?}"),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Reconciling below catches up with the latest state.
                        warn!("missed {skipped} authorization events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },

                () = sleep_until(deadline) => {
                    last_attempt = Some(Instant::now());
                    tokio::select! {
                        biased;

                        () = self.shutdown.cancelled() => break,

                        result = self.auth.refresh_if_needed() => {
                            if let Err(e) = result {
                                error!("{e}");
                            }
                        }
                    }
                }
            }

            self.reconcile().await;
        }

        debug!("session coordinator stopped");
    }

    /// When to wake up next for refreshing or expiring the credential.
    fn next_deadline(&self, last_attempt: Option<Instant>) -> Option<Instant> {
        let expires_at = self.auth.expires_at()?;
        let config = self.auth.config();
        let tolerance = config.refresh_tolerance;

        let now = Instant::now();
        let time_to_live = expires_at
            .duration_since(SystemTime::now())
            .unwrap_or_default();
        let expiry = now + time_to_live;
        let refresh = now + time_to_live.saturating_sub(tolerance);

        let deadline = match last_attempt {
            Some(last_attempt) => refresh.max(last_attempt + config.refresh_retry_interval),
            None => refresh,
        };

        // Back off, but still wake at expiry to tear down.
        Some(if expiry > now {
            deadline.min(expiry)
        } else {
            deadline
        })
    }

    /// Brings the synchronizer in line with the authorization state.
    /// Idempotent.
    async fn reconcile(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }

        if !self.auth.is_authorized() {
            self.tear_down();
            return;
        }

        let running = self
            .lock_synchronizer()
            .as_ref()
            .is_some_and(|synchronizer| !synchronizer.is_stopped());
        if running {
            return;
        }

        let Some(token) = self.auth.access_token() else {
            return;
        };

        let login = self.engine.login(token.secret()).await;
        if !login.ok {
            error!("engine login failed: {}", login.message);
            self.set_authorized(false);
            return;
        }
        debug!("engine logged in");

        let synchronizer = match Synchronizer::start(
            Arc::clone(&self.engine),
            Arc::clone(&self.source),
            self.auth.config(),
        ) {
            Ok(synchronizer) => synchronizer,
            Err(e) => {
                error!("failed starting playback: {e}");
                self.set_authorized(false);
                return;
            }
        };

        {
            let mut slot = self.lock_synchronizer();
            // Stopped while logging in.
            if self.shutdown.is_cancelled() {
                synchronizer.stop();
                return;
            }

            if let Some(previous) = slot.replace(synchronizer) {
                previous.stop();
            }
        }

        info!("session authorized");
        self.set_authorized(true);
    }

    fn tear_down(&self) {
        if let Some(synchronizer) = self.lock_synchronizer().take() {
            synchronizer.stop();
            info!("session deauthorized");
        }

        self.set_authorized(false);
    }

    fn set_authorized(&self, authorized: bool) {
        self.authorized.send_if_modified(|current| {
            let changed = *current != authorized;
            *current = authorized;
            changed
        });
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
