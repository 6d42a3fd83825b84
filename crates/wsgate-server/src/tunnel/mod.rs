//! Tunnel sessions: `/proxy/{destination}` requests.
//!
//! A session authenticates the caller, resolves the destination through the
//! map, dials the upstream and only then upgrades the client connection. Any
//! failure before the upgrade is answered with a plain-text HTTP error.
//! After the upgrade the session runs its [`bridge`] in a background task and
//! logs a final record once both sides are closed.

pub mod bridge;

use axum::extract::{ConnectInfo, Path, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{field, info, info_span, warn, Instrument, Span};

use crate::config::ServerConfig;
use crate::server::AppState;
use crate::transport::websocket;
use bridge::BridgeConfig;

/// Identity asserted by a trusted front proxy, used when token
/// authentication is disabled.
pub const IDENTITY_HEADER: &str = "x-goog-authenticated-user-email";

/// Lifecycle status reported in session log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Connected,
    Succeeded,
    Failed,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionStatus::Connected => "Connected",
            SessionStatus::Succeeded => "Succeeded",
            SessionStatus::Failed => "Failed",
        })
    }
}

/// Per-session timeouts and bridge settings.
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    pub bridge: BridgeConfig,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            bridge: BridgeConfig::default(),
        }
    }
}

impl TunnelSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            dial_timeout: config.dial_timeout,
            handshake_timeout: config.handshake_timeout,
            bridge: BridgeConfig {
                capture_level: config.capture_level,
                write_timeout: config.write_timeout,
                ..BridgeConfig::default()
            },
        }
    }
}

/// Handler for `/proxy/{destination}`.
pub async fn proxy(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    Path(destination): Path<String>,
    req: Request,
) -> Response {
    let seq = state.next_seq();
    let span = info_span!(
        "tunnel",
        seq,
        x_forwarded_for = header_str(req.headers(), "x-forwarded-for"),
        remote_addr = %remote_addr,
        destination = %destination,
        user_email = field::Empty,
        upstream = field::Empty,
    );

    async move {
        let Some(guard) = state.drain.try_acquire() else {
            warn!("rejecting session, server is shutting down");
            return text_response(StatusCode::SERVICE_UNAVAILABLE, "Server is shutting down");
        };

        let (response, session) = match open(&state, req, &destination).await {
            Ok(opened) => opened,
            Err(response) => return response,
        };

        let settings = state.settings.clone();
        let span = Span::current();
        tokio::spawn(
            async move {
                // Counted until the bridge has fully stopped.
                let _guard = guard;
                let Session { pending, upstream } = session;

                let client = match pending.accept(settings.handshake_timeout).await {
                    Ok(client) => client,
                    Err(e) => {
                        drop(upstream);
                        warn!(status = %SessionStatus::Failed, error = %e, "failed to upgrade");
                        return;
                    }
                };
                info!(status = %SessionStatus::Connected, "session connected");

                let outcome = bridge::run(client, upstream, &settings.bridge).await;
                info!(
                    status = %outcome.status(),
                    read = outcome.read,
                    write = outcome.written,
                    disconnect_at = outcome.disconnect_at.map_or("", |s| s.as_str()),
                    "session closed"
                );
            }
            .instrument(span),
        );
        response
    }
    .instrument(span)
    .await
}

/// A dialed upstream waiting for the client upgrade to complete.
struct Session {
    pending: websocket::PendingUpgrade,
    upstream: TcpStream,
}

/// Authenticate, resolve, dial and negotiate the upgrade.
async fn open(state: &AppState, mut req: Request, destination: &str) -> Result<(Response, Session), Response> {
    let span = Span::current();

    if state.verifier.enabled() {
        let header = header_str(req.headers(), AUTHORIZATION.as_str());
        match state.verifier.verify(header) {
            Ok(subject) => {
                span.record("user_email", subject.as_str());
            }
            Err(e) => {
                warn!(error = %e, "failed to authorize");
                return Err(text_response(StatusCode::UNAUTHORIZED, &e.to_string()));
            }
        }
    } else if let Some(subject) = req.headers().get(IDENTITY_HEADER).and_then(|v| v.to_str().ok()) {
        span.record("user_email", subject);
    }

    let Some(address) = state.mapping.get(destination) else {
        warn!("no map entry for destination");
        return Err(text_response(StatusCode::NOT_FOUND, &format!("Not found: {destination}")));
    };
    span.record("upstream", address);

    let upstream = match dial(address, state.settings.dial_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "failed to connect upstream");
            return Err(text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("Could not connect upstream: {e}"),
            ));
        }
    };

    match websocket::negotiate(&mut req) {
        Ok((response, pending)) => Ok((response, Session { pending, upstream })),
        Err(e) => {
            // Dropping the stream closes the upstream connection.
            drop(upstream);
            warn!(status = %SessionStatus::Failed, error = %e, "failed to upgrade");
            Err(e.into_response())
        }
    }
}

/// Connect to `address` within `limit`, with Nagle's algorithm disabled.
async fn dial(address: &str, limit: Duration) -> io::Result<TcpStream> {
    let stream = tokio::time::timeout(limit, TcpStream::connect(address))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("dial tcp {address}: i/o timeout")))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or_default()
}

fn text_response(status: StatusCode, body: &str) -> Response {
    (status, format!("{body}\n")).into_response()
}
