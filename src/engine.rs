//! Contract of the playback engine.
//!
//! The engine performs the actual audio transport and owns its own
//! session with the streaming service. This crate only drives it through
//! the [`Engine`] trait and observes it through its event stream.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use veil::Redact;

use crate::{error::Result, events::PlaybackEvent};

/// Outcome of an engine login.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize)]
pub struct LoginResult {
    pub ok: bool,
    pub message: String,
}

impl LoginResult {
    #[must_use]
    pub fn ok() -> Self {
        Self {
            ok: true,
            message: String::new(),
        }
    }

    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}

/// A token minted by the engine's own session.
#[derive(Clone, PartialEq, Eq, Redact)]
pub struct EngineToken {
    #[redact]
    pub access_token: String,
    pub expires_in: Duration,
}

/// Playback engine facade.
///
/// Commands are fire-and-forget: success only means the engine accepted
/// the command. Their effects come back through
/// [`next_event`](Engine::next_event). Commands issued before
/// [`init_player`](Engine::init_player) should fail with
/// [`ErrorKind::FailedPrecondition`](crate::error::ErrorKind::FailedPrecondition).
#[async_trait]
pub trait Engine: Send + Sync {
    /// Logs the engine in with a bearer token.
    async fn login(&self, access_token: &str) -> LoginResult;

    /// Mints a fresh token from the logged-in engine session.
    async fn get_token(&self) -> Result<EngineToken>;

    fn init_player(&self) -> Result<()>;
    fn load_track(&self, track_id: &str) -> Result<()>;
    fn play(&self) -> Result<()>;
    fn pause(&self) -> Result<()>;
    fn seek(&self, position_ms: u32) -> Result<()>;

    /// Waits for the next event. Never returns empty-handed: when nothing
    /// happens, the future stays pending.
    async fn next_event(&self) -> PlaybackEvent;
}
