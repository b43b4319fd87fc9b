//! Turning authorization codes and refresh tokens into access tokens.

use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

use crate::{
    config::Config,
    engine::Engine,
    error::{Error, Result},
    http,
    pkce::Attempt,
    protocol::{self, auth::Token},
};

/// A source of access tokens.
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    /// Redeems an authorization code captured by the redirect listener.
    async fn exchange_code(&self, code: &str, attempt: &Attempt) -> Result<Token>;

    /// Mints a new access token, with the refresh token when one is held.
    async fn refresh(&self, refresh_token: Option<&str>) -> Result<Token>;
}

/// The provider's token endpoint, used as a public PKCE client: no secret,
/// the code verifier proves possession instead.
pub struct TokenEndpoint {
    http_client: http::Client,
    token_url: Url,
    client_id: String,
}

impl TokenEndpoint {
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            http_client: http::Client::new(config)?,
            token_url: config.token_url.clone(),
            client_id: config.client_id.clone(),
        })
    }

    async fn request(&self, form: &[(&str, &str)], origin: &str) -> Result<Token> {
        let request = self.http_client.post_form(self.token_url.clone(), form)?;
        let response = self.http_client.execute(request).await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let reason = serde_json::from_str::<protocol::auth::ErrorResponse>(&body)
                .map_or_else(|_| format!("HTTP {status}"), |e| e.to_string());
            return Err(match status.as_u16() {
                400 | 401 => Error::unauthenticated(reason),
                403 => Error::permission_denied(reason),
                429 => Error::resource_exhausted(reason),
                500..=599 => Error::unavailable(reason),
                _ => Error::unknown(reason),
            });
        }

        protocol::json::<Token>(&body, origin)
    }
}

#[async_trait]
impl TokenExchanger for TokenEndpoint {
    async fn exchange_code(&self, code: &str, attempt: &Attempt) -> Result<Token> {
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", attempt.redirect_uri.as_str()),
            ("client_id", self.client_id.as_str()),
            ("code_verifier", attempt.code_verifier.as_str()),
        ];
        self.request(&form, "authorization_code").await
    }

    async fn refresh(&self, refresh_token: Option<&str>) -> Result<Token> {
        let refresh_token = refresh_token
            .ok_or_else(|| Error::failed_precondition("no refresh token held"))?;

        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
        ];
        self.request(&form, "refresh_token").await
    }
}

/// Redeems codes at the token endpoint but lets the logged-in playback
/// engine mint tokens when there is no refresh token to use.
pub struct EngineExchanger {
    endpoint: TokenEndpoint,
    engine: Arc<dyn Engine>,
}

impl EngineExchanger {
    #[must_use]
    pub fn new(endpoint: TokenEndpoint, engine: Arc<dyn Engine>) -> Self {
        Self { endpoint, engine }
    }
}

#[async_trait]
impl TokenExchanger for EngineExchanger {
    async fn exchange_code(&self, code: &str, attempt: &Attempt) -> Result<Token> {
        self.endpoint.exchange_code(code, attempt).await
    }

    async fn refresh(&self, refresh_token: Option<&str>) -> Result<Token> {
        if refresh_token.is_some() {
            return self.endpoint.refresh(refresh_token).await;
        }

        let token = self.engine.get_token().await?;
        Ok(Token {
            access_token: token.access_token,
            token_type: Some("Bearer".to_owned()),
            scope: None,
            expires_in: token.expires_in,
            refresh_token: None,
        })
    }
}
