//! WebSocket upgrade on top of the HTTP router.
//!
//! The tunnel handler dials its upstream *before* switching protocols, so the
//! upgrade is split in two steps: [`negotiate`] validates the handshake
//! headers and builds the `101 Switching Protocols` response, and
//! [`PendingUpgrade::accept`] waits for hyper to hand over the raw
//! connection, which is then framed by tokio-tungstenite.

use axum::body::Body;
use axum::extract::Request;
use axum::http::header::{
    CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION, UPGRADE,
};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use hyper::upgrade::{OnUpgrade, Upgraded};
use hyper_util::rt::TokioIo;
use std::time::Duration;
use thiserror::Error;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;

/// The client side of a tunnel once the upgrade has completed.
pub type ClientChannel = WebSocketStream<TokioIo<Upgraded>>;

/// Reasons an upgrade request is rejected before switching protocols.
#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("websocket: request method is not GET")]
    MethodNotAllowed,

    #[error("websocket: 'upgrade' token not found in 'Connection' header")]
    MissingConnectionUpgrade,

    #[error("websocket: 'websocket' token not found in 'Upgrade' header")]
    MissingUpgradeWebsocket,

    #[error("websocket: unsupported version: 13 not found in 'Sec-Websocket-Version' header")]
    UnsupportedVersion,

    #[error("websocket: 'Sec-WebSocket-Key' header is missing or blank")]
    MissingKey,

    #[error("websocket: connection cannot be upgraded")]
    NotUpgradable,
}

impl UpgradeError {
    pub fn status(&self) -> StatusCode {
        match self {
            UpgradeError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            UpgradeError::NotUpgradable => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for UpgradeError {
    fn into_response(self) -> Response {
        let mut response = (self.status(), format!("{self}\n")).into_response();
        if matches!(self, UpgradeError::UnsupportedVersion) {
            response
                .headers_mut()
                .insert(SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
        }
        response
    }
}

/// Failures after the `101` response has been sent.
#[derive(Debug, Error)]
pub enum AcceptError {
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("upgrade failed: {0}")]
    Upgrade(#[from] hyper::Error),
}

/// An accepted handshake whose connection has not been handed over yet.
#[derive(Debug)]
pub struct PendingUpgrade {
    on_upgrade: OnUpgrade,
}

impl PendingUpgrade {
    /// Wait for the upgraded connection and wrap it as a WebSocket channel.
    pub async fn accept(self, handshake_timeout: Duration) -> Result<ClientChannel, AcceptError> {
        let upgraded = tokio::time::timeout(handshake_timeout, self.on_upgrade)
            .await
            .map_err(|_| AcceptError::Timeout(handshake_timeout))??;
        Ok(WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await)
    }
}

/// Validate a WebSocket upgrade request and build the `101` response.
///
/// The caller must return the response to the HTTP layer for the upgrade to
/// proceed.
pub fn negotiate(req: &mut Request) -> Result<(Response, PendingUpgrade), UpgradeError> {
    if req.method() != Method::GET {
        return Err(UpgradeError::MethodNotAllowed);
    }

    let headers = req.headers();
    if !header_has_token(headers, CONNECTION, "upgrade") {
        return Err(UpgradeError::MissingConnectionUpgrade);
    }
    if !header_has_token(headers, UPGRADE, "websocket") {
        return Err(UpgradeError::MissingUpgradeWebsocket);
    }
    if !header_has_token(headers, SEC_WEBSOCKET_VERSION, "13") {
        return Err(UpgradeError::UnsupportedVersion);
    }

    let key = headers
        .get(SEC_WEBSOCKET_KEY)
        .map(HeaderValue::as_bytes)
        .filter(|k| !k.is_empty())
        .ok_or(UpgradeError::MissingKey)?;
    let accept = HeaderValue::try_from(derive_accept_key(key))
        .map_err(|_| UpgradeError::MissingKey)?;

    let on_upgrade = req
        .extensions_mut()
        .remove::<OnUpgrade>()
        .ok_or(UpgradeError::NotUpgradable)?;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let response_headers = response.headers_mut();
    response_headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
    response_headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    response_headers.insert(SEC_WEBSOCKET_ACCEPT, accept);

    Ok((response, PendingUpgrade { on_upgrade }))
}

/// Whether a comma-separated header contains `token` (case-insensitive).
fn header_has_token(headers: &HeaderMap, name: HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upgrade_request(method: Method) -> Request {
        axum::http::Request::builder()
            .method(method)
            .uri("/proxy/echo")
            .header(CONNECTION, "keep-alive, Upgrade")
            .header(UPGRADE, "websocket")
            .header(SEC_WEBSOCKET_VERSION, "13")
            .header(SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn header_tokens_are_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        assert!(header_has_token(&headers, CONNECTION, "upgrade"));
        assert!(!header_has_token(&headers, CONNECTION, "close"));
        assert!(!header_has_token(&headers, UPGRADE, "websocket"));
    }

    #[test]
    fn rejects_non_get() {
        let err = negotiate(&mut upgrade_request(Method::POST)).unwrap_err();
        assert!(matches!(err, UpgradeError::MethodNotAllowed));
        assert_eq!(err.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[test]
    fn rejects_missing_headers() {
        let mut req = upgrade_request(Method::GET);
        req.headers_mut().remove(UPGRADE);
        assert!(matches!(
            negotiate(&mut req).unwrap_err(),
            UpgradeError::MissingUpgradeWebsocket
        ));

        let mut req = upgrade_request(Method::GET);
        req.headers_mut().insert(CONNECTION, HeaderValue::from_static("close"));
        assert!(matches!(
            negotiate(&mut req).unwrap_err(),
            UpgradeError::MissingConnectionUpgrade
        ));

        let mut req = upgrade_request(Method::GET);
        req.headers_mut().remove(SEC_WEBSOCKET_KEY);
        assert!(matches!(negotiate(&mut req).unwrap_err(), UpgradeError::MissingKey));
    }

    #[test]
    fn rejects_unsupported_version() {
        let mut req = upgrade_request(Method::GET);
        req.headers_mut()
            .insert(SEC_WEBSOCKET_VERSION, HeaderValue::from_static("8"));
        let err = negotiate(&mut req).unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        let response = err.into_response();
        assert_eq!(response.headers()[SEC_WEBSOCKET_VERSION], "13");
    }

    #[test]
    fn requires_upgradable_connection() {
        // A request that did not come through hyper has no upgrade handle.
        let err = negotiate(&mut upgrade_request(Method::GET)).unwrap_err();
        assert!(matches!(err, UpgradeError::NotUpgradable));
    }
}
