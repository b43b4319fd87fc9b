//! Runtime configuration.
//!
//! Defaults target the Spotify accounts service with the public client id
//! of the desktop app. Any subset of fields can be overridden from a TOML
//! file:
//!
//! ```toml
//! client_id = "0123456789abcdef0123456789abcdef"
//! redirect_port = 8898
//! listener_timeout = 120
//! ```

use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds, DurationSecondsWithFrac};
use url::Url;

use crate::{
    auth::AuthError,
    error::{Error, Result},
};

/// Scopes requested from the authorization provider.
pub const DEFAULT_SCOPES: [&str; 26] = [
    "app-remote-control",
    "playlist-modify",
    "playlist-modify-private",
    "playlist-modify-public",
    "playlist-read",
    "playlist-read-collaborative",
    "playlist-read-private",
    "streaming",
    "ugc-image-upload",
    "user-follow-modify",
    "user-follow-read",
    "user-library-modify",
    "user-library-read",
    "user-modify",
    "user-modify-playback-state",
    "user-modify-private",
    "user-personalized",
    "user-read-birthdate",
    "user-read-currently-playing",
    "user-read-email",
    "user-read-play-history",
    "user-read-playback-position",
    "user-read-playback-state",
    "user-read-private",
    "user-read-recently-played",
    "user-top-read",
];

#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    #[serde(skip)]
    pub app_name: String,
    #[serde(skip)]
    pub app_version: String,
    #[serde(skip)]
    pub user_agent: String,

    pub client_id: String,
    pub authorize_url: Url,
    pub token_url: Url,
    pub api_url: Url,

    pub redirect_port: u16,
    pub redirect_path: String,
    pub scopes: Vec<String>,

    /// How long `authorize()` waits for the provider to redirect back.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub listener_timeout: Duration,

    /// Safety margin before `expiresAt` at which a token counts as expired.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub refresh_tolerance: Duration,

    /// Minimum spacing between timer-driven refresh attempts.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub refresh_retry_interval: Duration,

    /// Interval of the position extrapolation ticker.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub position_tick: Duration,

    pub store_key: String,
}

impl Config {
    /// Upper bound on the configuration file size.
    const MAX_FILE_SIZE: u64 = 64 * 1024;

    /// Loads a configuration file, falling back to defaults for any field it
    /// does not set.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the file cannot be read, is larger than 64 KiB,
    /// or is not valid TOML for this structure.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        // Prevent out-of-memory condition: config file should be small.
        let file_size = fs::metadata(path)?.len();
        if file_size > Self::MAX_FILE_SIZE {
            return Err(Error::out_of_range(format!(
                "{} is too large ({file_size} bytes)",
                path.display()
            )));
        }

        let contents = fs::read_to_string(path)?;
        let config = toml::from_str::<Self>(&contents)?;
        trace!("config: {config:#?}");

        Ok(config)
    }

    /// The loopback URI the provider redirects to after authorization.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the port is zero or the path does not start
    /// with a `/`.
    pub fn redirect_uri(&self) -> std::result::Result<Url, AuthError> {
        if self.redirect_port == 0 {
            return Err(AuthError::InvalidRedirectConfiguration(
                "redirect port must not be zero".to_string(),
            ));
        }

        if !self.redirect_path.starts_with('/') {
            return Err(AuthError::InvalidRedirectConfiguration(format!(
                "redirect path \"{}\" must start with '/'",
                self.redirect_path
            )));
        }

        let uri = format!(
            "http://127.0.0.1:{}{}",
            self.redirect_port, self.redirect_path
        );
        Url::parse(&uri).map_err(|e| AuthError::InvalidRedirectConfiguration(e.to_string()))
    }
}

impl Default for Config {
    fn default() -> Self {
        let app_name = env!("CARGO_PKG_NAME").to_owned();
        let app_version = env!("CARGO_PKG_VERSION").to_owned();

        let os_name = match std::env::consts::OS {
            "macos" => "osx",
            other => other,
        };
        let os_version = sysinfo::System::os_version().unwrap_or_else(|| String::from("0"));
        let user_agent = format!("{app_name}/{app_version} (Rust; {os_name}/{os_version})");

        Self {
            app_name,
            app_version,
            user_agent,

            client_id: "65b708073fc0480ea92a077233ca87bd".to_owned(),
            authorize_url: Url::parse("https://accounts.spotify.com/authorize")
                .expect("invalid authorize url"),
            token_url: Url::parse("https://accounts.spotify.com/api/token")
                .expect("invalid token url"),
            api_url: Url::parse("https://api.spotify.com/v1/").expect("invalid api url"),

            redirect_port: 5165,
            redirect_path: "/login".to_owned(),
            scopes: DEFAULT_SCOPES.iter().map(ToString::to_string).collect(),

            listener_timeout: Duration::from_secs(300),
            refresh_tolerance: Duration::from_secs(60),
            refresh_retry_interval: Duration::from_secs(30),
            position_tick: Duration::from_secs(1),

            store_key: "authorizationManager".to_owned(),
        }
    }
}
