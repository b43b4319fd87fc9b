//! Token endpoint responses.
//!
//! Both the `authorization_code` and the `refresh_token` grant answer with
//! the same shape:
//!
//! ```json
//! {
//!     "access_token": "BQD...",
//!     "token_type": "Bearer",
//!     "scope": "streaming user-read-email",
//!     "expires_in": 3600,
//!     "refresh_token": "AQB..."
//! }
//! ```
//!
//! A refresh response may omit `refresh_token`, in which case the previous
//! one stays valid. Failures come back as
//! `{"error": "invalid_grant", "error_description": "..."}`.

use std::{collections::BTreeSet, fmt, time::Duration};

use serde::Deserialize;
use serde_with::{formats::Flexible, serde_as, DurationSeconds};
use veil::Redact;

#[serde_as]
#[derive(Clone, Eq, PartialEq, Deserialize, Redact)]
pub struct Token {
    #[redact]
    pub access_token: String,

    #[serde(default)]
    pub token_type: Option<String>,

    /// Space separated scope list.
    #[serde(default)]
    pub scope: Option<String>,

    #[serde_as(as = "DurationSeconds<u64, Flexible>")]
    pub expires_in: Duration,

    #[redact]
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl Token {
    #[must_use]
    pub fn scopes(&self) -> Option<BTreeSet<String>> {
        self.scope.as_ref().map(|scope| {
            scope
                .split_whitespace()
                .map(ToString::to_string)
                .collect()
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error_description {
            Some(description) => write!(f, "{}: {description}", self.error),
            None => write!(f, "{}", self.error),
        }
    }
}
