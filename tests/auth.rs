//! Authorization manager: browser flow, coalesced refresh, persistence.

mod helpers;

use std::{
    net::TcpListener,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_util::future::join_all;

use speck::{
    auth::{AuthError, AuthEvent, AuthManager, EngineExchanger, TokenEndpoint},
    credential::Credential,
    error::Result,
    store::{MemoryStore, SecureStore},
};

use helpers::{FakeEngine, FakeExchanger, RedirectingBrowser};

/// Memory store whose first write stalls.
#[derive(Default)]
struct SlowStore {
    entries: MemoryStore,
    stalled: AtomicBool,
}

impl SecureStore for SlowStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.entries.get(key)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        if !self.stalled.swap(true, Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(300));
        }
        self.entries.set(key, value)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries.delete(key)
    }
}

/// A manager refreshing through the engine, holding a credential without a
/// refresh token that expired a second ago.
fn engine_manager(engine: Arc<FakeEngine>) -> AuthManager {
    let config = helpers::config();
    let mut credential = helpers::expired_credential(Duration::from_secs(1));
    credential.refresh_token = None;

    let endpoint = TokenEndpoint::new(&config).unwrap();
    AuthManager::new(
        config.clone(),
        helpers::store_with(&config, &credential),
        Arc::new(EngineExchanger::new(endpoint, engine)),
        RedirectingBrowser::new(),
    )
}

#[tokio::test]
async fn authorize_stores_credential_and_releases_port() {
    let config = helpers::config();
    let port = config.redirect_port;
    let store = Arc::new(MemoryStore::new());
    let exchanger = FakeExchanger::new();
    let browser = RedirectingBrowser::new();
    let auth = helpers::manager(
        config.clone(),
        Arc::clone(&store),
        Arc::clone(&exchanger),
        Arc::clone(&browser),
    );
    let mut events = auth.subscribe();

    assert!(!auth.is_authorized());
    auth.authorize_with_timeout(Duration::from_secs(5))
        .await
        .unwrap();

    assert!(auth.is_authorized());
    assert_eq!(exchanger.exchanges(), 1);
    assert_eq!(auth.access_token().unwrap().secret(), "exchanged-1");
    assert!(store.get(&config.store_key).unwrap().is_some());
    assert_eq!(events.recv().await.unwrap(), AuthEvent::Changed);

    let response = browser.response().await;
    assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");

    // The listener is gone.
    assert!(TcpListener::bind(("127.0.0.1", port)).is_ok());
}

#[tokio::test]
async fn state_mismatch_yields_no_credential() {
    let config = helpers::config();
    let port = config.redirect_port;
    let store = Arc::new(MemoryStore::new());
    let exchanger = FakeExchanger::new();
    let browser = RedirectingBrowser::forging("c3RhdGUtZnJvbS1lbHNld2hlcmU");
    let auth = helpers::manager(
        config.clone(),
        Arc::clone(&store),
        Arc::clone(&exchanger),
        Arc::clone(&browser),
    );

    let result = auth.authorize_with_timeout(Duration::from_secs(5)).await;
    assert_eq!(result, Err(AuthError::StateMismatch));

    assert!(!auth.is_authorized());
    assert_eq!(exchanger.exchanges(), 0);
    assert!(store.get(&config.store_key).unwrap().is_none());

    let response = browser.response().await;
    assert!(response.starts_with("HTTP/1.1 400"), "{response}");
    assert!(TcpListener::bind(("127.0.0.1", port)).is_ok());
}

#[tokio::test]
async fn port_in_use_fails_attempt() {
    let config = helpers::config();
    let _squatter = TcpListener::bind(("127.0.0.1", config.redirect_port)).unwrap();

    let auth = helpers::manager(
        config,
        Arc::new(MemoryStore::new()),
        FakeExchanger::new(),
        RedirectingBrowser::new(),
    );

    let result = auth.authorize_with_timeout(Duration::from_secs(1)).await;
    assert!(matches!(result, Err(AuthError::ListenerBindFailed(_))));
}

#[tokio::test]
async fn browser_failure_falls_back_to_logged_url() {
    let config = helpers::config();
    let exchanger = FakeExchanger::new();
    let auth = helpers::manager(
        config,
        Arc::new(MemoryStore::new()),
        Arc::clone(&exchanger),
        RedirectingBrowser::reporting_failure(),
    );

    // The attempt keeps waiting for the redirect.
    auth.authorize_with_timeout(Duration::from_secs(5))
        .await
        .unwrap();
    assert!(auth.is_authorized());
    assert_eq!(exchanger.exchanges(), 1);
}

#[tokio::test]
async fn bad_redirect_configuration_is_rejected() {
    let mut config = helpers::config();
    config.redirect_path = "login".to_owned();

    let auth = helpers::manager(
        config,
        Arc::new(MemoryStore::new()),
        FakeExchanger::new(),
        RedirectingBrowser::new(),
    );

    let result = auth.authorize_with_timeout(Duration::from_secs(1)).await;
    assert!(matches!(
        result,
        Err(AuthError::InvalidRedirectConfiguration(_))
    ));
}

#[tokio::test]
async fn expired_credential_is_refreshed() {
    let config = helpers::config();
    let credential = helpers::expired_credential(Duration::from_secs(1));
    let store = helpers::store_with(&config, &credential);
    let exchanger = FakeExchanger::new();
    let auth = helpers::manager(
        config.clone(),
        Arc::clone(&store),
        Arc::clone(&exchanger),
        RedirectingBrowser::new(),
    );

    assert!(auth.access_token_is_expired(Duration::ZERO));
    assert!(!auth.is_authorized());

    auth.refresh_if_needed().await.unwrap();

    assert!(!auth.access_token_is_expired(Duration::ZERO));
    assert!(auth.is_authorized());
    assert_eq!(exchanger.refreshes(), 1);

    // The refreshed credential was persisted.
    let stored = store.get(&config.store_key).unwrap().unwrap();
    let stored = speck::credential::Credential::decode(&stored).unwrap();
    assert_eq!(stored.access_token, "refreshed-1");
    assert_eq!(stored.refresh_token.as_deref(), Some("fresh-refresh"));
}

#[tokio::test]
async fn fresh_credential_is_not_refreshed() {
    let config = helpers::config();
    let credential = helpers::credential(Duration::from_secs(3600));
    let exchanger = FakeExchanger::new();
    let auth = helpers::manager(
        config.clone(),
        helpers::store_with(&config, &credential),
        Arc::clone(&exchanger),
        RedirectingBrowser::new(),
    );

    assert!(auth.is_authorized());
    auth.refresh_if_needed().await.unwrap();
    assert_eq!(exchanger.refreshes(), 0);
    assert_eq!(auth.access_token().unwrap().secret(), "stored-access");
}

#[tokio::test]
async fn concurrent_refreshes_share_one_exchange() {
    let config = helpers::config();
    let credential = helpers::expired_credential(Duration::from_secs(1));
    let exchanger = FakeExchanger::with_delay(Duration::from_millis(50));
    let auth = helpers::manager(
        config.clone(),
        helpers::store_with(&config, &credential),
        Arc::clone(&exchanger),
        RedirectingBrowser::new(),
    );

    let results = join_all((0..8).map(|_| auth.refresh_if_needed())).await;

    assert_eq!(exchanger.refreshes(), 1);
    assert!(results.iter().all(std::result::Result::is_ok));
    assert!(auth.is_authorized());
}

#[tokio::test]
async fn failed_refresh_reaches_every_waiter_and_keeps_credential() {
    let config = helpers::config();
    let credential = helpers::expired_credential(Duration::from_secs(1));
    let exchanger = FakeExchanger::with_delay(Duration::from_millis(50));
    exchanger.fail(true);
    let auth = helpers::manager(
        config.clone(),
        helpers::store_with(&config, &credential),
        Arc::clone(&exchanger),
        RedirectingBrowser::new(),
    );

    let results = join_all((0..8).map(|_| auth.refresh_if_needed())).await;

    assert_eq!(exchanger.refreshes(), 1);
    let first = results[0].clone();
    assert!(matches!(first, Err(AuthError::RefreshFailed(_))));
    assert!(results.iter().all(|result| *result == first));

    // The stale credential is still there, not deauthorized.
    assert_eq!(auth.access_token().unwrap().secret(), "stored-access");

    // A later call tries again.
    exchanger.fail(false);
    auth.refresh_if_needed().await.unwrap();
    assert_eq!(exchanger.refreshes(), 2);
    assert!(auth.is_authorized());
}

#[tokio::test]
async fn deauthorize_survives_restart() {
    let config = helpers::config();
    let credential = helpers::credential(Duration::from_secs(3600));
    let store = helpers::store_with(&config, &credential);
    let auth = helpers::manager(
        config.clone(),
        Arc::clone(&store),
        FakeExchanger::new(),
        RedirectingBrowser::new(),
    );
    let mut events = auth.subscribe();

    assert!(auth.is_authorized());
    auth.deauthorize().unwrap();

    assert!(!auth.is_authorized());
    assert!(auth.access_token().is_none());
    assert_eq!(events.recv().await.unwrap(), AuthEvent::Deauthorized);

    let restarted = helpers::manager(
        config,
        store,
        FakeExchanger::new(),
        RedirectingBrowser::new(),
    );
    assert!(!restarted.is_authorized());
    assert!(restarted.expires_at().is_none());
}

#[tokio::test]
async fn undecodable_stored_credential_is_ignored() {
    let config = helpers::config();
    let store = Arc::new(MemoryStore::new());
    store.set(&config.store_key, b"not json").unwrap();

    let auth = helpers::manager(
        config,
        store,
        FakeExchanger::new(),
        RedirectingBrowser::new(),
    );
    assert!(!auth.is_authorized());
    assert!(auth.access_token().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deauthorize_wins_over_refresh_in_flight() {
    let config = helpers::config();
    let credential = helpers::expired_credential(Duration::from_secs(1));
    let store = Arc::new(SlowStore::default());
    store
        .entries
        .set(&config.store_key, &credential.encode().unwrap())
        .unwrap();

    // Restoring the expired credential starts a refresh whose write stalls.
    let auth = AuthManager::new(
        config.clone(),
        Arc::clone(&store) as _,
        FakeExchanger::new(),
        RedirectingBrowser::new(),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    auth.deauthorize().unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(!auth.is_authorized());
    assert!(store.get(&config.store_key).unwrap().is_none());

    let restarted = AuthManager::new(
        config,
        store,
        FakeExchanger::new(),
        RedirectingBrowser::new(),
    );
    assert!(!restarted.is_authorized());
    assert!(restarted.expires_at().is_none());
}

#[tokio::test]
async fn refresh_is_discarded_when_credential_is_replaced() {
    let config = helpers::config();
    let credential = helpers::expired_credential(Duration::from_secs(1));
    let store = helpers::store_with(&config, &credential);
    let exchanger = FakeExchanger::with_delay(Duration::from_millis(200));
    let auth = helpers::manager(
        config.clone(),
        Arc::clone(&store),
        Arc::clone(&exchanger),
        RedirectingBrowser::new(),
    );

    let refresh = tokio::spawn({
        let auth = auth.clone();
        async move { auth.refresh_if_needed().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    auth.authorize_with_timeout(Duration::from_secs(5))
        .await
        .unwrap();
    assert!(refresh.await.unwrap().is_err());

    assert_eq!(auth.access_token().unwrap().secret(), "exchanged-1");
    let stored = store.get(&config.store_key).unwrap().unwrap();
    assert_eq!(Credential::decode(&stored).unwrap().access_token, "exchanged-1");
}

#[tokio::test]
async fn uninitialized_engine_cannot_mint_tokens() {
    let auth = engine_manager(FakeEngine::uninitialized());

    let result = auth.refresh_if_needed().await;
    assert_eq!(result, Err(AuthError::EngineNotInitialized));
    assert!(!auth.is_authorized());
    assert!(auth.access_token().is_some());
}

#[tokio::test]
async fn engine_mints_token_without_refresh_token() {
    let auth = engine_manager(FakeEngine::new());

    auth.refresh_if_needed().await.unwrap();
    assert!(auth.is_authorized());
    assert_eq!(auth.access_token().unwrap().secret(), "engine-access");
}
