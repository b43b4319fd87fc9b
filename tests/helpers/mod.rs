//! Test doubles for the external collaborators: a scripted playback
//! engine, a metadata source, a token exchanger and a browser that follows
//! the redirect on its own.

#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    net::TcpListener as StdTcpListener,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
};
use url::Url;

use speck::{
    auth::{exchange::TokenExchanger, AuthManager, UrlOpener},
    config::Config,
    credential::Credential,
    engine::{Engine, EngineToken, LoginResult},
    error::{Error, Result},
    events::PlaybackEvent,
    metadata::{MetadataSource, TrackMetadata},
    pkce::Attempt,
    protocol::auth::Token,
    store::{MemoryStore, SecureStore},
};

/// The only code [`FakeExchanger`] accepts.
pub const CODE: &str = "fake-code";

/// A port that was free a moment ago.
pub fn free_port() -> u16 {
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

pub fn config() -> Config {
    Config {
        redirect_port: free_port(),
        ..Config::default()
    }
}

pub fn credential(expires_in: Duration) -> Credential {
    let mut credential = Credential::new("stored-access".to_owned(), expires_in);
    credential.refresh_token = Some("stored-refresh".to_owned());
    credential.scopes = ["streaming".to_owned()].into();
    credential
}

/// A credential that ran out `ago`.
pub fn expired_credential(ago: Duration) -> Credential {
    let mut credential = credential(Duration::ZERO);
    credential.expires_at -= ago;
    credential
}

pub fn store_with(config: &Config, credential: &Credential) -> Arc<MemoryStore> {
    let store = MemoryStore::new();
    store
        .set(&config.store_key, &credential.encode().unwrap())
        .unwrap();
    Arc::new(store)
}

pub fn manager(
    config: Config,
    store: Arc<MemoryStore>,
    exchanger: Arc<FakeExchanger>,
    browser: Arc<RedirectingBrowser>,
) -> AuthManager {
    AuthManager::new(config, store, exchanger, browser)
}

pub struct FakeExchanger {
    delay: Duration,
    expires_in: Duration,
    fail: AtomicBool,
    exchanges: AtomicUsize,
    refreshes: AtomicUsize,
}

impl FakeExchanger {
    pub fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            expires_in: Duration::from_secs(3600),
            fail: AtomicBool::new(false),
            exchanges: AtomicUsize::new(0),
            refreshes: AtomicUsize::new(0),
        })
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn exchanges(&self) -> usize {
        self.exchanges.load(Ordering::SeqCst)
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    fn token(&self, access_token: String) -> Token {
        Token {
            access_token,
            token_type: Some("Bearer".to_owned()),
            scope: None,
            expires_in: self.expires_in,
            refresh_token: Some("fresh-refresh".to_owned()),
        }
    }
}

#[async_trait]
impl TokenExchanger for FakeExchanger {
    async fn exchange_code(&self, code: &str, _attempt: &Attempt) -> Result<Token> {
        let n = self.exchanges.fetch_add(1, Ordering::SeqCst) + 1;
        if code != CODE {
            return Err(Error::unauthenticated("invalid_grant"));
        }

        Ok(self.token(format!("exchanged-{n}")))
    }

    async fn refresh(&self, refresh_token: Option<&str>) -> Result<Token> {
        let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::unavailable("token endpoint unavailable"));
        }
        if refresh_token.is_none() {
            return Err(Error::failed_precondition("no refresh token"));
        }

        Ok(self.token(format!("refreshed-{n}")))
    }
}

/// Follows the authorization URL by sending the redirect straight to the
/// loopback listener, like a browser would after the user consents.
#[derive(Default)]
pub struct RedirectingBrowser {
    forged_state: Option<String>,
    report_failure: bool,
    response: Arc<Mutex<Option<String>>>,
}

impl RedirectingBrowser {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Redirects with a state other than the one it was given.
    pub fn forging(state: &str) -> Arc<Self> {
        Arc::new(Self {
            forged_state: Some(state.to_owned()),
            ..Self::default()
        })
    }

    /// Follows the redirect, yet reports that it could not open the page,
    /// like a user pasting the logged URL by hand.
    pub fn reporting_failure() -> Arc<Self> {
        Arc::new(Self {
            report_failure: true,
            ..Self::default()
        })
    }

    /// The raw HTTP response the listener sent back.
    pub async fn response(&self) -> String {
        for _ in 0..200 {
            if let Some(response) = self.response.lock().unwrap().clone() {
                return response;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        panic!("no response from redirect listener");
    }
}

impl UrlOpener for RedirectingBrowser {
    fn open(&self, url: &Url) -> Result<()> {
        let query: HashMap<String, String> = url.query_pairs().into_owned().collect();
        let redirect_uri = Url::parse(&query["redirect_uri"])?;
        let state = self
            .forged_state
            .clone()
            .unwrap_or_else(|| query["state"].clone());

        let port = redirect_uri.port().unwrap_or(80);
        let path = redirect_uri.path().to_owned();
        let response = Arc::clone(&self.response);

        tokio::spawn(async move {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            let request = format!(
                "GET {path}?code={CODE}&state={state} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n"
            );
            stream.write_all(request.as_bytes()).await.unwrap();

            let mut buffer = String::new();
            stream.read_to_string(&mut buffer).await.unwrap();
            *response.lock().unwrap() = Some(buffer);
        });

        if self.report_failure {
            return Err(Error::unavailable("no browser"));
        }
        Ok(())
    }
}

/// Playback engine whose event stream is fed by the test.
pub struct FakeEngine {
    sender: mpsc::UnboundedSender<PlaybackEvent>,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<PlaybackEvent>>,
    login_ok: bool,
    initialized: bool,
    logins: AtomicUsize,
    inits: AtomicUsize,
    commands: Mutex<Vec<String>>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Self::build(true, true)
    }

    pub fn refusing_login() -> Arc<Self> {
        Self::build(false, true)
    }

    /// An engine that cannot mint tokens yet.
    pub fn uninitialized() -> Arc<Self> {
        Self::build(true, false)
    }

    fn build(login_ok: bool, initialized: bool) -> Arc<Self> {
        let (sender, events) = mpsc::unbounded_channel();
        Arc::new(Self {
            sender,
            events: tokio::sync::Mutex::new(events),
            login_ok,
            initialized,
            logins: AtomicUsize::new(0),
            inits: AtomicUsize::new(0),
            commands: Mutex::new(Vec::new()),
        })
    }

    pub fn emit(&self, event: PlaybackEvent) {
        self.sender.send(event).unwrap();
    }

    pub fn logins(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    pub fn inits(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    fn record(&self, command: String) {
        self.commands.lock().unwrap().push(command);
    }
}

#[async_trait]
impl Engine for FakeEngine {
    async fn login(&self, access_token: &str) -> LoginResult {
        self.logins.fetch_add(1, Ordering::SeqCst);
        if self.login_ok && !access_token.is_empty() {
            LoginResult::ok()
        } else {
            LoginResult::failed("bad credentials")
        }
    }

    async fn get_token(&self) -> Result<EngineToken> {
        if !self.initialized {
            return Err(Error::failed_precondition("player not initialized"));
        }

        Ok(EngineToken {
            access_token: "engine-access".to_owned(),
            expires_in: Duration::from_secs(3600),
        })
    }

    fn init_player(&self) -> Result<()> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load_track(&self, track_id: &str) -> Result<()> {
        self.record(format!("load {track_id}"));
        Ok(())
    }

    fn play(&self) -> Result<()> {
        self.record("play".to_owned());
        Ok(())
    }

    fn pause(&self) -> Result<()> {
        self.record("pause".to_owned());
        Ok(())
    }

    fn seek(&self, position_ms: u32) -> Result<()> {
        self.record(format!("seek {position_ms}"));
        Ok(())
    }

    async fn next_event(&self) -> PlaybackEvent {
        let mut events = self.events.lock().await;
        match events.recv().await {
            Some(event) => event,
            None => std::future::pending().await,
        }
    }
}

/// Metadata source with per-track latency and failures.
#[derive(Default)]
pub struct FakeMetadata {
    delays: HashMap<String, Duration>,
    failing: HashSet<String>,
    fetches: Mutex<HashMap<String, usize>>,
}

impl FakeMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_delay(mut self, track_id: &str, delay: Duration) -> Self {
        self.delays.insert(track_id.to_owned(), delay);
        self
    }

    #[must_use]
    pub fn failing(mut self, track_id: &str) -> Self {
        self.failing.insert(track_id.to_owned());
        self
    }

    pub fn fetches(&self, track_id: &str) -> usize {
        self.fetches
            .lock()
            .unwrap()
            .get(track_id)
            .copied()
            .unwrap_or_default()
    }
}

pub fn track(track_id: &str) -> TrackMetadata {
    TrackMetadata {
        id: track_id.to_owned(),
        title: format!("Title of {track_id}"),
        artists: vec!["Artist".to_owned()],
        album_name: "Album".to_owned(),
        artwork_ref: None,
        duration_ms: 180_000,
    }
}

#[async_trait]
impl MetadataSource for FakeMetadata {
    async fn track(&self, track_id: &str) -> Result<TrackMetadata> {
        *self
            .fetches
            .lock()
            .unwrap()
            .entry(track_id.to_owned())
            .or_default() += 1;

        if let Some(delay) = self.delays.get(track_id) {
            tokio::time::sleep(*delay).await;
        }

        if self.failing.contains(track_id) {
            return Err(Error::unavailable(format!("{track_id} not found")));
        }

        Ok(track(track_id))
    }
}

pub fn playing(track_id: &str, position_ms: u32, duration_ms: u32) -> PlaybackEvent {
    PlaybackEvent::Playing {
        track_id: track_id.to_owned(),
        position_ms,
        duration_ms,
    }
}

pub fn paused(track_id: &str, position_ms: u32, duration_ms: u32) -> PlaybackEvent {
    PlaybackEvent::Paused {
        track_id: track_id.to_owned(),
        position_ms,
        duration_ms,
    }
}

pub fn loading(track_id: &str, position_ms: u32) -> PlaybackEvent {
    PlaybackEvent::Loading {
        track_id: track_id.to_owned(),
        position_ms,
    }
}
