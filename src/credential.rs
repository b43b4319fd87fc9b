//! Access credentials obtained from the authorization provider.
//!
//! A [`Credential`] never leaves the authorization manager. Other
//! components receive an [`AccessToken`]: an opaque handle that redacts
//! itself in debug output and can only be read explicitly.

use std::{
    collections::BTreeSet,
    fmt,
    time::{Duration, SystemTime},
};

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, TimestampSeconds};
use veil::Redact;

use crate::error::{Error, Result};

/// Opaque handle to a bearer token.
#[derive(Clone, PartialEq, Eq, Hash, Redact)]
pub struct AccessToken(#[redact] String);

impl AccessToken {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Reveals the token. Do not log the result.
    #[must_use]
    pub fn secret(&self) -> &str {
        &self.0
    }
}

#[serde_as]
#[derive(Clone, PartialEq, Eq, Redact, Serialize, Deserialize)]
pub struct Credential {
    #[redact]
    pub access_token: String,

    #[redact]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    #[serde_as(as = "TimestampSeconds<i64>")]
    pub expires_at: SystemTime,

    #[serde(default)]
    pub scopes: BTreeSet<String>,
}

impl Credential {
    #[must_use]
    pub fn new(access_token: String, expires_in: Duration) -> Self {
        Self {
            access_token,
            refresh_token: None,
            expires_at: SystemTime::now() + expires_in,
            scopes: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn time_to_live(&self) -> Duration {
        self.expires_at
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO)
    }

    /// True when `now + tolerance` has reached `expires_at`, or there is no
    /// token to speak of.
    #[must_use]
    pub fn is_expired(&self, tolerance: Duration) -> bool {
        if self.access_token.is_empty() {
            return true;
        }

        match SystemTime::now().checked_add(tolerance) {
            Some(deadline) => deadline >= self.expires_at,
            None => true,
        }
    }

    #[must_use]
    pub fn access_token(&self) -> AccessToken {
        AccessToken::new(self.access_token.clone())
    }

    /// Serializes the credential for the secure store.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(Into::into)
    }

    /// Decodes a credential previously written by [`encode`](Self::encode).
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let credential = serde_json::from_slice::<Self>(bytes)?;
        if credential.access_token.is_empty() {
            return Err(Error::data_loss("stored credential has an empty token"));
        }

        Ok(credential)
    }

    /// Overwrites the secrets in memory before they are released.
    pub fn erase(&mut self) {
        wipe(&mut self.access_token);
        if let Some(ref mut token) = self.refresh_token {
            wipe(token);
        }
        self.refresh_token = None;
        self.scopes.clear();
        self.expires_at = SystemTime::UNIX_EPOCH;
    }
}

fn wipe(secret: &mut String) {
    let mut bytes = std::mem::take(secret).into_bytes();
    bytes.fill(0);
    std::hint::black_box(&bytes);
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "credential with {} scopes, expires in {}s",
            self.scopes.len(),
            self.time_to_live().as_secs()
        )
    }
}
