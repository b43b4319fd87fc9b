//! Playback state synchronization.
//!
//! The [`Synchronizer`] consumes the engine's event stream and folds it
//! into a [`PlaybackState`] that observers can watch. Between sparse
//! engine updates, a ticker extrapolates the position while playing.
//! Track metadata is resolved as the current track changes, with at most
//! one fetch in flight per track and stale results discarded.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use thiserror::Error;
use tokio::{
    sync::watch,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    engine::Engine,
    error::{Error, Result},
    events::{PlaybackEvent, TrackId},
    metadata::{MetadataSource, TrackMetadata},
};

#[derive(Clone, Debug, Error, PartialEq, Eq, Hash)]
pub enum PlaybackError {
    #[error("metadata fetch for {track_id} failed: {reason}")]
    MetadataFetchFailed { track_id: TrackId, reason: String },
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Status {
    #[default]
    Stopped,
    Loading,
    Playing,
    Paused,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Loading => write!(f, "loading"),
            Self::Playing => write!(f, "playing"),
            Self::Paused => write!(f, "paused"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlaybackState {
    pub track_id: Option<TrackId>,
    pub status: Status,
    pub position_ms: u32,
    /// Zero while unknown.
    pub duration_ms: u32,
    /// When `position_ms` was last set by an event, a seek or the ticker.
    pub last_synced_at: Instant,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            track_id: None,
            status: Status::default(),
            position_ms: 0,
            duration_ms: 0,
            last_synced_at: Instant::now(),
        }
    }
}

impl PlaybackState {
    /// Folds an engine event into the state. Returns `false` for events
    /// that do not affect it.
    pub fn apply(&mut self, event: &PlaybackEvent, now: Instant) -> bool {
        match event {
            PlaybackEvent::Stopped { track_id } => {
                self.set_track(track_id);
                self.status = Status::Stopped;
                self.duration_ms = 0;
                self.set_position(0, now);
            }

            PlaybackEvent::Started {
                track_id,
                position_ms,
            } => {
                self.set_track(track_id);
                self.set_position(*position_ms, now);
            }

            PlaybackEvent::Changed { new_track_id, .. } => {
                self.set_track(new_track_id);
            }

            PlaybackEvent::Loading {
                track_id,
                position_ms,
            } => {
                self.set_track(track_id);
                self.status = Status::Loading;
                self.set_position(*position_ms, now);
            }

            PlaybackEvent::Playing {
                track_id,
                position_ms,
                duration_ms,
            } => {
                self.set_track(track_id);
                self.status = Status::Playing;
                self.duration_ms = *duration_ms;
                self.set_position(*position_ms, now);
            }

            PlaybackEvent::Paused {
                track_id,
                position_ms,
                duration_ms,
            } => {
                self.set_track(track_id);
                self.status = Status::Paused;
                self.duration_ms = *duration_ms;
                self.set_position(*position_ms, now);
            }

            // Position only: the track is whatever the last transition said.
            PlaybackEvent::Seeked { position_ms, .. }
            | PlaybackEvent::PositionCorrection { position_ms, .. } => {
                self.set_position(*position_ms, now);
            }

            // Preloading concerns the next track, not this one.
            PlaybackEvent::Preloading { .. }
            | PlaybackEvent::TimeToPreloadNextTrack { .. }
            | PlaybackEvent::EndOfTrack { .. }
            | PlaybackEvent::Unavailable { .. }
            | PlaybackEvent::VolumeSet { .. }
            | PlaybackEvent::SessionConnected { .. }
            | PlaybackEvent::SessionDisconnected { .. }
            | PlaybackEvent::Unknown => return false,
        }

        true
    }

    /// Sets the position, clamped to the duration when it is known.
    pub fn set_position(&mut self, position_ms: u32, now: Instant) {
        self.position_ms = self.clamp(position_ms);
        self.last_synced_at = now;
    }

    /// Moves the position forward by the time elapsed since it was last
    /// synced. Returns `true` if it moved.
    pub fn advance(&mut self, now: Instant) -> bool {
        if self.status != Status::Playing {
            return false;
        }

        let elapsed = now.saturating_duration_since(self.last_synced_at);
        let elapsed_ms = u32::try_from(elapsed.as_millis()).unwrap_or(u32::MAX);
        if elapsed_ms == 0 {
            return false;
        }

        // Carry sub-millisecond remainders over to the next tick.
        self.last_synced_at += Duration::from_millis(elapsed_ms.into());

        let position_ms = self.clamp(self.position_ms.saturating_add(elapsed_ms));
        if position_ms == self.position_ms {
            return false;
        }

        self.position_ms = position_ms;
        true
    }

    fn clamp(&self, position_ms: u32) -> u32 {
        if self.duration_ms > 0 {
            position_ms.min(self.duration_ms)
        } else {
            position_ms
        }
    }

    fn set_track(&mut self, track_id: &str) {
        self.track_id = (!track_id.is_empty()).then(|| track_id.to_owned());
    }
}

/// Handle to a running synchronizer. Clones share the same instance.
#[derive(Clone)]
pub struct Synchronizer {
    inner: Arc<Inner>,
}

struct Inner {
    engine: Arc<dyn Engine>,
    source: Arc<dyn MetadataSource>,
    position_tick: Duration,

    state: watch::Sender<PlaybackState>,
    metadata: watch::Sender<Option<TrackMetadata>>,

    resolver: Mutex<Resolver>,
    ticker: Mutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
}

#[derive(Default)]
struct Resolver {
    current: Option<TrackId>,
    cache: HashMap<TrackId, TrackMetadata>,
    in_flight: HashMap<TrackId, Fetch>,
    next_fetch: u64,
}

struct Fetch {
    id: u64,
    cancel: CancellationToken,
}

impl Synchronizer {
    const CACHE_CAPACITY: usize = 256;

    /// Initializes the engine's player and starts consuming its events.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the engine refuses to initialize its player.
    pub fn start(
        engine: Arc<dyn Engine>,
        source: Arc<dyn MetadataSource>,
        config: &Config,
    ) -> Result<Self> {
        engine.init_player()?;

        let (state, _) = watch::channel(PlaybackState::default());
        let (metadata, _) = watch::channel(None);

        let inner = Arc::new(Inner {
            engine,
            source,
            position_tick: config.position_tick,
            state,
            metadata,
            resolver: Mutex::new(Resolver::default()),
            ticker: Mutex::new(None),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(Arc::clone(&inner).run());
        debug!("synchronizer started");

        Ok(Self { inner })
    }

    /// A snapshot of the current playback state.
    #[must_use]
    pub fn state(&self) -> PlaybackState {
        self.inner.state.borrow().clone()
    }

    #[must_use]
    pub fn watch(&self) -> watch::Receiver<PlaybackState> {
        self.inner.state.subscribe()
    }

    /// Metadata of the current track, once resolved.
    #[must_use]
    pub fn metadata(&self) -> Option<TrackMetadata> {
        self.inner.metadata.borrow().clone()
    }

    #[must_use]
    pub fn watch_metadata(&self) -> watch::Receiver<Option<TrackMetadata>> {
        self.inner.metadata.subscribe()
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// # Errors
    ///
    /// Returns error if the synchronizer was stopped or the engine rejects
    /// the command.
    pub fn load_track(&self, track_id: &str) -> Result<()> {
        self.ensure_running()?;
        self.inner.engine.load_track(track_id)
    }

    /// # Errors
    ///
    /// Returns error if the synchronizer was stopped or the engine rejects
    /// the command.
    pub fn play(&self) -> Result<()> {
        self.ensure_running()?;
        self.inner.engine.play()
    }

    /// # Errors
    ///
    /// Returns error if the synchronizer was stopped or the engine rejects
    /// the command.
    pub fn pause(&self) -> Result<()> {
        self.ensure_running()?;
        self.inner.engine.pause()
    }

    /// Seeks and moves the local position right away; the engine confirms
    /// with a `Seeked` event later.
    ///
    /// # Errors
    ///
    /// Returns error if the synchronizer was stopped or the engine rejects
    /// the command.
    pub fn seek(&self, position_ms: u32) -> Result<()> {
        self.ensure_running()?;
        self.inner.engine.seek(position_ms)?;

        let now = Instant::now();
        self.inner
            .state
            .send_modify(|state| state.set_position(position_ms, now));

        Ok(())
    }

    /// Stops consuming events, cancels the ticker and any metadata fetch.
    /// Fetches that complete afterwards are discarded.
    pub fn stop(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }

        self.inner.shutdown.cancel();
        self.inner.stop_ticker();

        // Fetches check for shutdown under this lock before publishing.
        self.inner.lock_resolver().in_flight.clear();

        debug!("synchronizer stopped");
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::failed_precondition("synchronizer stopped"));
        }

        Ok(())
    }
}

impl Inner {
    async fn run(self: Arc<Self>) {
        loop {
            let event = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                event = self.engine.next_event() => event,
            };

            self.handle(event);
        }

        self.stop_ticker();
    }

    fn handle(self: &Arc<Self>, event: PlaybackEvent) {
        let now = Instant::now();
        let applied = self
            .state
            .send_if_modified(|state| state.apply(&event, now));

        if applied {
            debug!("{event}");
        } else {
            debug!("ignoring {event}");
        }

        match &event {
            PlaybackEvent::Stopped { track_id }
            | PlaybackEvent::Started { track_id, .. }
            | PlaybackEvent::Loading { track_id, .. }
            | PlaybackEvent::Playing { track_id, .. }
            | PlaybackEvent::Paused { track_id, .. }
            | PlaybackEvent::Changed {
                new_track_id: track_id,
                ..
            } => self.resolve(track_id),

            PlaybackEvent::Preloading { track_id } => self.prefetch(track_id),

            _ => {}
        }

        if matches!(event, PlaybackEvent::Playing { .. }) {
            self.start_ticker();
        } else if self.state.borrow().status != Status::Playing {
            self.stop_ticker();
        }
    }

    fn lock_resolver(&self) -> std::sync::MutexGuard<'_, Resolver> {
        self.resolver.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes `track_id` the current track and publishes its metadata,
    /// fetching it unless cached or already being fetched.
    fn resolve(self: &Arc<Self>, track_id: &str) {
        if track_id.is_empty() {
            return;
        }

        let mut resolver = self.lock_resolver();
        if resolver.current.as_deref() == Some(track_id) {
            return;
        }

        if let Some(previous) = resolver.current.replace(track_id.to_owned()) {
            if let Some(fetch) = resolver.in_flight.remove(&previous) {
                trace!("cancelling metadata fetch for {previous}");
                fetch.cancel.cancel();
            }
        }

        if let Some(metadata) = resolver.cache.get(track_id) {
            self.metadata.send_replace(Some(metadata.clone()));
            return;
        }

        self.metadata.send_replace(None);
        if !resolver.in_flight.contains_key(track_id) {
            self.fetch(&mut resolver, track_id);
        }
    }

    /// Warms the cache for an upcoming track.
    fn prefetch(self: &Arc<Self>, track_id: &str) {
        if track_id.is_empty() {
            return;
        }

        let mut resolver = self.lock_resolver();
        if resolver.current.as_deref() == Some(track_id)
            || resolver.cache.contains_key(track_id)
            || resolver.in_flight.contains_key(track_id)
        {
            return;
        }

        self.fetch(&mut resolver, track_id);
    }

    fn fetch(self: &Arc<Self>, resolver: &mut Resolver, track_id: &str) {
        if self.shutdown.is_cancelled() {
            return;
        }

        let id = resolver.next_fetch;
        resolver.next_fetch = resolver.next_fetch.wrapping_add(1);

        let cancel = self.shutdown.child_token();
        resolver.in_flight.insert(
            track_id.to_owned(),
            Fetch {
                id,
                cancel: cancel.clone(),
            },
        );

        trace!("fetching metadata for {track_id}");
        let inner = Arc::clone(self);
        let track_id = track_id.to_owned();
        tokio::spawn(async move {
            let result = tokio::select! {
                () = cancel.cancelled() => return,
                result = inner.source.track(&track_id) => result,
            };
            inner.complete(&track_id, id, result);
        });
    }

    fn complete(&self, track_id: &str, fetch_id: u64, result: Result<TrackMetadata>) {
        let mut resolver = self.lock_resolver();
        if self.shutdown.is_cancelled() {
            return;
        }

        if resolver
            .in_flight
            .get(track_id)
            .is_some_and(|fetch| fetch.id == fetch_id)
        {
            resolver.in_flight.remove(track_id);
        }

        let is_current = resolver.current.as_deref() == Some(track_id);
        match result {
            Ok(metadata) => {
                if is_current {
                    self.metadata.send_replace(Some(metadata.clone()));
                } else {
                    trace!("caching metadata for {track_id}");
                }

                if resolver.cache.len() >= Synchronizer::CACHE_CAPACITY {
                    resolver.cache.clear();
                }
                resolver.cache.insert(track_id.to_owned(), metadata);
            }
            Err(e) => {
                let e = PlaybackError::MetadataFetchFailed {
                    track_id: track_id.to_owned(),
                    reason: e.to_string(),
                };
                warn!("{e}");

                // Allow the next event for this track to try again.
                if is_current {
                    resolver.current = None;
                }
            }
        }
    }

    fn start_ticker(self: &Arc<Self>) {
        let mut ticker = self.ticker.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = ticker.take() {
            previous.cancel();
        }

        if self.shutdown.is_cancelled() {
            return;
        }

        let cancel = self.shutdown.child_token();
        *ticker = Some(cancel.clone());

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = time::interval(inner.position_tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;

            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    now = interval.tick() => {
                        inner.state.send_if_modified(|state| state.advance(now));
                    }
                }
            }
        });
    }

    fn stop_ticker(&self) {
        if let Some(ticker) = self
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            ticker.cancel();
        }
    }
}
