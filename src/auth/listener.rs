//! One-shot loopback listener for the authorization redirect.
//!
//! The provider sends the user agent back to
//! `http://127.0.0.1:{port}{path}?code=...&state=...`. The listener
//! accepts exactly one connection, answers it, and closes the socket
//! whatever the outcome, so a second (replayed or forged) redirect never
//! reaches us.

use std::{net::SocketAddr, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use url::Url;

use super::AuthError;
use crate::pkce::Attempt;

/// Body shown in the browser once the code has been captured.
const CONFIRMATION: &str = "Authorization complete. You can close this window and return to speck.";

pub struct Listener {
    listener: TcpListener,
    path: String,
}

impl Listener {
    /// Upper bound on the request head; a redirect is a single short line.
    const MAX_REQUEST_SIZE: usize = 8 * 1024;

    /// How long the accepted connection may take to send its request.
    const READ_TIMEOUT: Duration = Duration::from_secs(10);

    /// Binds the listener on the loopback interface.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::ListenerBindFailed`] if the port is taken or
    /// cannot be bound.
    pub async fn bind(port: u16, path: &str) -> Result<Self, AuthError> {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| AuthError::ListenerBindFailed(format!("{addr}: {e}")))?;
        debug!("redirect listener bound on {addr}");

        Ok(Self {
            listener,
            path: path.to_owned(),
        })
    }

    /// The port actually bound; differs from the requested one for port 0.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::ListenerBindFailed`] if the socket has no local
    /// address.
    pub fn port(&self) -> Result<u16, AuthError> {
        self.listener
            .local_addr()
            .map(|addr| addr.port())
            .map_err(|e| AuthError::ListenerBindFailed(e.to_string()))
    }

    /// Waits for the redirect and returns the authorization code.
    ///
    /// Consumes the listener: the port is released before this returns,
    /// on every path.
    ///
    /// # Errors
    ///
    /// * [`AuthError::Timeout`] when nothing connects within `timeout`
    /// * [`AuthError::StateMismatch`] when the state does not match `attempt`
    /// * [`AuthError::InvalidRedirect`] for anything else that is not a
    ///   well-formed redirect
    pub async fn accept(self, attempt: &Attempt, timeout: Duration) -> Result<String, AuthError> {
        let Self { listener, path } = self;

        let accepted = tokio::time::timeout(timeout, listener.accept()).await;
        drop(listener);

        let (mut stream, peer) = match accepted {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => return Err(AuthError::InvalidRedirect(format!("accept failed: {e}"))),
            Err(_) => {
                warn!("no redirect received within {}s", timeout.as_secs());
                return Err(AuthError::Timeout);
            }
        };
        debug!("redirect connection from {peer}");

        let outcome = match tokio::time::timeout(Self::READ_TIMEOUT, read_head(&mut stream)).await {
            Ok(Ok(head)) => validate(&head, &path, attempt),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(AuthError::InvalidRedirect("request timed out".to_string())),
        };

        let (status, body) = match &outcome {
            Ok(_) => ("200 OK", CONFIRMATION.to_string()),
            Err(AuthError::InvalidRedirect(reason)) if reason.starts_with("unexpected path") => {
                ("404 Not Found", "Not found.".to_string())
            }
            Err(e) => ("400 Bad Request", format!("Authorization failed: {e}")),
        };

        if let Err(e) = respond(&mut stream, status, &body).await {
            debug!("failed answering redirect: {e}");
        }

        outcome
    }
}

async fn read_head(stream: &mut TcpStream) -> Result<String, AuthError> {
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let read = stream
            .read(&mut chunk)
            .await
            .map_err(|e| AuthError::InvalidRedirect(format!("read failed: {e}")))?;
        if read == 0 {
            break;
        }

        buffer.extend_from_slice(&chunk[..read]);
        if buffer.windows(4).any(|window| window == b"\r\n\r\n") {
            break;
        }

        if buffer.len() > Listener::MAX_REQUEST_SIZE {
            return Err(AuthError::InvalidRedirect(
                "request head too large".to_string(),
            ));
        }
    }

    String::from_utf8(buffer)
        .map_err(|_| AuthError::InvalidRedirect("request is not valid UTF-8".to_string()))
}

fn validate(head: &str, path: &str, attempt: &Attempt) -> Result<String, AuthError> {
    let request_line = head.lines().next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        return Err(AuthError::InvalidRedirect("malformed request line".to_string()));
    };

    if method != "GET" {
        return Err(AuthError::InvalidRedirect(format!("unexpected method {method}")));
    }

    let url = Url::parse("http://127.0.0.1/")
        .and_then(|base| base.join(target))
        .map_err(|e| AuthError::InvalidRedirect(format!("malformed target: {e}")))?;

    if url.path() != path {
        return Err(AuthError::InvalidRedirect(format!(
            "unexpected path {}",
            url.path()
        )));
    }

    let mut code = None;
    let mut state = None;
    let mut error = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            "error" => error = Some(value.into_owned()),
            _ => {}
        }
    }

    let Some(state) = state else {
        return Err(AuthError::InvalidRedirect("missing state".to_string()));
    };

    if !attempt.state_matches(&state) {
        warn!("redirect state does not match the pending attempt");
        return Err(AuthError::StateMismatch);
    }

    if let Some(error) = error {
        return Err(AuthError::InvalidRedirect(format!(
            "provider denied authorization: {error}"
        )));
    }

    match code {
        Some(code) if !code.is_empty() => Ok(code),
        _ => Err(AuthError::InvalidRedirect("missing code".to_string())),
    }
}

async fn respond(stream: &mut TcpStream, status: &str, body: &str) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}
