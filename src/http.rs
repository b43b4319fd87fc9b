//! HTTP client with rate limiting for the accounts service and web API.
//!
//! Wraps `reqwest::Client` to add:
//! * Request rate limiting so a misbehaving caller cannot hammer the
//!   provider (and get the client id throttled)
//! * Consistent timeouts and `User-Agent`

use std::{future::Future, num::NonZeroU32, time::Duration};

use futures_util::{FutureExt, TryFutureExt};
use governor::{DefaultDirectRateLimiter, Quota};
use reqwest::{
    self,
    header::{HeaderValue, ACCEPT, AUTHORIZATION},
    Method, Url,
};

use crate::{config::Config, credential::AccessToken, error::Result};

pub struct Client {
    /// Direct access to the underlying client without rate limiting.
    pub unlimited: reqwest::Client,

    rate_limiter: DefaultDirectRateLimiter,
}

impl Client {
    /// Rolling window for the request quota.
    const RATE_LIMIT_INTERVAL: Duration = Duration::from_secs(5);

    /// Maximum requests per window. Requests beyond this are delayed.
    const RATE_LIMIT_CALLS_PER_INTERVAL: u8 = 25;

    const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Upper bound on one request, connection setup included.
    const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built, e.g. when no TLS
    /// roots are available.
    ///
    /// # Panics
    ///
    /// Panics if rate limit parameters are zero.
    pub fn new(config: &Config) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let http_client = reqwest::Client::builder()
            .tcp_keepalive(Self::KEEPALIVE_TIMEOUT)
            .timeout(Self::REQUEST_TIMEOUT)
            .default_headers(headers)
            .user_agent(&config.user_agent)
            .build()?;

        let replenish_interval =
            Self::RATE_LIMIT_INTERVAL / u32::from(Self::RATE_LIMIT_CALLS_PER_INTERVAL);
        let quota = Quota::with_period(replenish_interval)
            .expect("quota time interval is zero")
            .allow_burst(
                NonZeroU32::new(Self::RATE_LIMIT_CALLS_PER_INTERVAL.into())
                    .expect("calls per interval is zero"),
            );

        Ok(Self {
            unlimited: http_client,
            rate_limiter: governor::RateLimiter::direct(quota),
        })
    }

    /// Builds a form-encoded POST request, as token endpoints expect.
    ///
    /// # Errors
    ///
    /// Returns error if the form cannot be encoded.
    pub fn post_form<T>(&self, url: Url, form: &T) -> Result<reqwest::Request>
    where
        T: serde::Serialize + ?Sized,
    {
        self.unlimited
            .request(Method::POST, url)
            .form(form)
            .build()
            .map_err(Into::into)
    }

    /// Builds a GET request authorized with a bearer token.
    ///
    /// # Errors
    ///
    /// Returns error if the token is not a valid header value.
    pub fn get_authorized(&self, url: Url, token: &AccessToken) -> Result<reqwest::Request> {
        let mut bearer = HeaderValue::from_str(&format!("Bearer {}", token.secret()))
            .map_err(|e| crate::error::Error::invalid_argument(e.to_string()))?;
        bearer.set_sensitive(true);

        self.unlimited
            .request(Method::GET, url)
            .header(AUTHORIZATION, bearer)
            .build()
            .map_err(Into::into)
    }

    /// Executes a request once the rate limiter allows it.
    pub fn execute(
        &self,
        request: reqwest::Request,
    ) -> impl Future<Output = Result<reqwest::Response>> + '_ {
        let throttle = self.rate_limiter.until_ready();
        throttle.then(|()| self.unlimited.execute(request).map_err(Into::into))
    }
}
