//! Wire types of the web services this crate talks to.
//!
//! * [`auth`] - token endpoint responses of the accounts service
//! * [`tracks`] - track objects of the web API
//!
//! Responses are decoded through [`json`], which logs what it parsed at
//! `trace` level and the raw body when the shape does not match.

pub mod auth;
pub mod tracks;

use crate::error::Result;
use serde::Deserialize;
use std::fmt::Debug;

/// Parses and logs a JSON response body.
///
/// # Errors
///
/// Returns error if the body is not valid JSON or does not match `T`.
pub fn json<T>(body: &str, origin: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de> + Debug,
{
    match serde_json::from_str(body) {
        Ok(result) => {
            trace!("{origin}: {result:#?}");
            Ok(result)
        }
        Err(e) => {
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
                debug!("{origin}: unexpected response shape ({e})");
                trace!("{origin}: {json:#?}");
            } else {
                error!("{origin}: failed parsing response ({e})");
            }
            Err(e.into())
        }
    }
}
