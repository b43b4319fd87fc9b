//! Proof Key for Code Exchange (RFC 7636).
//!
//! An [`Attempt`] bundles everything one run of the authorization code
//! flow needs: the secret verifier, its S256 challenge, the anti-CSRF
//! state nonce and the redirect URI the provider will call back on.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use url::Url;
use veil::Redact;

/// Number of random bytes behind a code verifier. Encodes to 64 characters,
/// within the 43..=128 range the RFC allows.
const VERIFIER_BYTES: usize = 48;

/// Number of random bytes behind a state nonce (128 bits).
const STATE_BYTES: usize = 16;

fn random_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Generates a random code verifier from the operating system CSPRNG.
#[must_use]
pub fn code_verifier() -> String {
    random_token(VERIFIER_BYTES)
}

/// Derives the S256 code challenge: `BASE64URL(SHA256(verifier))`.
#[must_use]
pub fn code_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Generates a random state nonce.
#[must_use]
pub fn state() -> String {
    random_token(STATE_BYTES)
}

/// One pending authorization.
#[derive(Clone, PartialEq, Eq, Redact)]
pub struct Attempt {
    #[redact]
    pub code_verifier: String,
    pub code_challenge: String,
    #[redact]
    pub state: String,
    pub redirect_uri: Url,
    pub scopes: Vec<String>,
}

impl Attempt {
    /// Starts a fresh attempt with a new verifier and state nonce.
    #[must_use]
    pub fn new(redirect_uri: Url, scopes: Vec<String>) -> Self {
        let code_verifier = code_verifier();
        let code_challenge = code_challenge(&code_verifier);

        Self {
            code_verifier,
            code_challenge,
            state: state(),
            redirect_uri,
            scopes,
        }
    }

    /// Builds the provider URL the user agent should be sent to.
    #[must_use]
    pub fn authorize_url(&self, authorize_url: &Url, client_id: &str) -> Url {
        let mut url = authorize_url.clone();
        url.query_pairs_mut()
            .append_pair("client_id", client_id)
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", self.redirect_uri.as_str())
            .append_pair("code_challenge_method", "S256")
            .append_pair("code_challenge", &self.code_challenge)
            .append_pair("state", &self.state)
            .append_pair("scope", &self.scopes.join(" "));
        url
    }

    /// Compares a returned state with the nonce of this attempt.
    ///
    /// Runs in time independent of where the strings first differ.
    #[must_use]
    pub fn state_matches(&self, state: &str) -> bool {
        let expected = self.state.as_bytes();
        let actual = state.as_bytes();
        if expected.len() != actual.len() {
            return false;
        }

        expected
            .iter()
            .zip(actual)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}
