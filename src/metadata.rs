//! Track metadata lookup.

use async_trait::async_trait;
use url::Url;

use crate::{
    auth::AuthManager,
    error::{Error, Result},
    http,
    protocol::{self, tracks},
};

/// What the presentation layer shows for a track.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TrackMetadata {
    pub id: String,
    pub title: String,
    pub artists: Vec<String>,
    pub album_name: String,
    /// URL of the largest album image, if any.
    pub artwork_ref: Option<String>,
    pub duration_ms: u32,
}

impl From<tracks::Track> for TrackMetadata {
    fn from(track: tracks::Track) -> Self {
        let artwork_ref = track
            .album
            .images
            .iter()
            .max_by_key(|image| image.width.unwrap_or_default())
            .map(|image| image.url.clone());

        Self {
            id: track.id,
            title: track.name,
            artists: track.artists.into_iter().map(|artist| artist.name).collect(),
            album_name: track.album.name,
            artwork_ref,
            duration_ms: track.duration_ms,
        }
    }
}

#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn track(&self, track_id: &str) -> Result<TrackMetadata>;
}

/// Looks tracks up in the web API with the session's access token.
pub struct WebApi {
    http_client: http::Client,
    api_url: Url,
    auth: AuthManager,
}

impl WebApi {
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built.
    pub fn new(auth: AuthManager) -> Result<Self> {
        let config = auth.config();
        Ok(Self {
            http_client: http::Client::new(config)?,
            api_url: config.api_url.clone(),
            auth,
        })
    }
}

#[async_trait]
impl MetadataSource for WebApi {
    async fn track(&self, track_id: &str) -> Result<TrackMetadata> {
        if track_id.is_empty() || !track_id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(Error::invalid_argument(format!(
                "invalid track id \"{track_id}\""
            )));
        }

        self.auth
            .refresh_if_needed()
            .await
            .map_err(Error::unauthenticated)?;
        let token = self
            .auth
            .access_token()
            .ok_or_else(|| Error::unauthenticated("not authorized"))?;

        let url = self.api_url.join(&format!("tracks/{track_id}"))?;
        let request = self.http_client.get_authorized(url, &token)?;
        let response = self.http_client.execute(request).await?;
        let body = response.error_for_status()?.text().await?;

        let track = protocol::json::<tracks::Track>(&body, "tracks")?;
        Ok(track.into())
    }
}
