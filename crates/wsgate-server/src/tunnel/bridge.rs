//! Bidirectional byte pump between a client WebSocket and an upstream TCP
//! connection.
//!
//! Two tasks run per session, one per direction. Whichever finishes first
//! wakes the controller, which marks the bridge as closing, signals the other
//! task to stop and waits for it. Both tasks hand their socket halves back so
//! the controller can close each connection exactly once.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinError;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, warn, Instrument, Span};
use wsgate_core::{Capture, CaptureLevel, Direction};

use super::SessionStatus;

/// Size of the upstream read buffer, and so the largest message sent to the
/// client.
pub const BUFFER_SIZE: usize = 256 * 1024;

/// How often capture buffers are flushed to the log.
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(300);

/// The operation during which a session first observed termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectStage {
    ClientRead,
    UpstreamWrite,
    UpstreamRead,
    ClientWrite,
}

impl DisconnectStage {
    pub fn as_str(self) -> &'static str {
        match self {
            DisconnectStage::ClientRead => "client-read",
            DisconnectStage::UpstreamWrite => "upstream-write",
            DisconnectStage::UpstreamRead => "upstream-read",
            DisconnectStage::ClientWrite => "client-write",
        }
    }
}

impl fmt::Display for DisconnectStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub capture_level: CaptureLevel,
    /// Upper bound on a single write to the client.
    pub write_timeout: Duration,
    pub flush_interval: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            capture_level: CaptureLevel::OFF,
            write_timeout: Duration::from_secs(10),
            flush_interval: FLUSH_INTERVAL,
        }
    }
}

/// Final accounting of a bridged session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeOutcome {
    /// Bytes received from the client and written upstream.
    pub read: u64,
    /// Bytes read from upstream and sent to the client.
    pub written: u64,
    pub failed: bool,
    pub disconnect_at: Option<DisconnectStage>,
}

impl BridgeOutcome {
    pub fn status(&self) -> SessionStatus {
        if self.failed {
            SessionStatus::Failed
        } else {
            SessionStatus::Succeeded
        }
    }
}

/// State shared by both directions of one bridge.
#[derive(Debug, Default)]
struct BridgeState {
    read: AtomicU64,
    written: AtomicU64,
    failed: AtomicBool,
    /// Set once the controller starts tearing the bridge down. Errors seen
    /// after this point are a consequence of the teardown.
    closing: AtomicBool,
    /// First writer wins.
    stage: OnceLock<DisconnectStage>,
}

impl BridgeState {
    fn record_stage(&self, stage: DisconnectStage) {
        let _ = self.stage.set(stage);
    }

    fn fail(&self, stage: DisconnectStage, what: &str, err: impl fmt::Display) {
        if !self.closing.load(Ordering::Acquire) {
            warn!(disconnect_at = %stage, error = %err, "{what}");
            self.failed.store(true, Ordering::Release);
        }
        self.record_stage(stage);
    }

    fn outcome(&self) -> BridgeOutcome {
        BridgeOutcome {
            read: self.read.load(Ordering::Acquire),
            written: self.written.load(Ordering::Acquire),
            failed: self.failed.load(Ordering::Acquire),
            disconnect_at: self.stage.get().copied(),
        }
    }
}

type ClientReader<S> = SplitStream<WebSocketStream<S>>;
type ClientWriter<S> = SplitSink<WebSocketStream<S>, Message>;

/// Pump bytes both ways until either side stops, then close both sides.
///
/// Every failure is absorbed into the returned outcome.
pub async fn run<S>(client: WebSocketStream<S>, upstream: TcpStream, config: &BridgeConfig) -> BridgeOutcome
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let state = Arc::new(BridgeState::default());
    let capture = Arc::new(Capture::new(config.capture_level));
    let (close_tx, close_rx) = watch::channel(false);
    let span = Span::current();

    let (client_tx, client_rx) = client.split();
    let (upstream_rx, upstream_tx) = upstream.into_split();

    let flusher = capture.level().is_enabled().then(|| {
        tokio::spawn(
            flush_periodically(Arc::clone(&capture), config.flush_interval, close_rx.clone())
                .instrument(span.clone()),
        )
    });

    let mut inbound = tokio::spawn({
        let state = Arc::clone(&state);
        let capture = Arc::clone(&capture);
        let mut closed = close_rx.clone();
        async move {
            let (mut client_rx, mut upstream_tx) = (client_rx, upstream_tx);
            tokio::select! {
                _ = client_to_upstream(&mut client_rx, &mut upstream_tx, &state, &capture) => {}
                _ = wait_closed(&mut closed) => {}
            }
            (client_rx, upstream_tx)
        }
        .instrument(span.clone())
    });

    let write_timeout = config.write_timeout;
    let mut outbound = tokio::spawn({
        let state = Arc::clone(&state);
        let capture = Arc::clone(&capture);
        let mut closed = close_rx;
        async move {
            let (mut upstream_rx, mut client_tx) = (upstream_rx, client_tx);
            tokio::select! {
                _ = upstream_to_client(&mut upstream_rx, &mut client_tx, &state, &capture, write_timeout) => {}
                _ = wait_closed(&mut closed) => {}
            }
            (upstream_rx, client_tx)
        }
        .instrument(span)
    });

    let (inbound, outbound) = tokio::select! {
        res = &mut inbound => {
            begin_close(&state, &close_tx);
            (res, outbound.await)
        }
        res = &mut outbound => {
            begin_close(&state, &close_tx);
            (inbound.await, res)
        }
    };

    let (client_rx, upstream_tx) = unpack(&state, inbound).unzip();
    let (upstream_rx, client_tx) = unpack(&state, outbound).unzip();

    if let (Some(rx), Some(tx)) = (client_rx, client_tx) {
        if let Ok(mut ws) = rx.reunite(tx) {
            match tokio::time::timeout(write_timeout, ws.close(None)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "client close"),
                Err(_) => debug!("client close timed out"),
            }
        }
    }
    if let (Some(rx), Some(tx)) = (upstream_rx, upstream_tx) {
        if let Ok(mut tcp) = rx.reunite(tx) {
            if let Err(e) = tcp.shutdown().await {
                debug!(error = %e, "upstream shutdown");
            }
        }
    }

    if let Some(flusher) = flusher {
        let _ = flusher.await;
    }
    capture.flush();

    state.outcome()
}

fn begin_close(state: &BridgeState, close_tx: &watch::Sender<bool>) {
    state.closing.store(true, Ordering::Release);
    close_tx.send_replace(true);
}

fn unpack<T>(state: &BridgeState, res: Result<T, JoinError>) -> Option<T> {
    match res {
        Ok(halves) => Some(halves),
        Err(e) => {
            error!(error = %e, "bridge task failed");
            state.failed.store(true, Ordering::Release);
            None
        }
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|c| *c).await;
}

async fn flush_periodically(capture: Arc<Capture>, interval: Duration, mut closed: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => capture.flush(),
            _ = wait_closed(&mut closed) => {
                capture.flush();
                return;
            }
        }
    }
}

/// Client → upstream. Only binary messages carry payload.
async fn client_to_upstream<S>(
    client: &mut ClientReader<S>,
    upstream: &mut OwnedWriteHalf,
    state: &BridgeState,
    capture: &Capture,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let msg = match client.next().await {
            Some(Ok(msg)) => msg,
            None => {
                debug!("client stream ended");
                state.record_stage(DisconnectStage::ClientRead);
                return;
            }
            Some(Err(e)) if is_peer_gone(&e) => {
                debug!(error = %e, "client went away");
                state.record_stage(DisconnectStage::ClientRead);
                return;
            }
            Some(Err(e)) => {
                state.fail(DisconnectStage::ClientRead, "failed to read from client", e);
                return;
            }
        };

        let payload = match msg {
            Message::Binary(data) => data,
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(frame) => {
                if is_normal_close(frame.as_ref()) {
                    debug!("client closed");
                    state.record_stage(DisconnectStage::ClientRead);
                } else {
                    state.fail(DisconnectStage::ClientRead, "client closed abnormally", describe_close(frame.as_ref()));
                }
                return;
            }
            Message::Text(_) | Message::Frame(_) => {
                warn!(disconnect_at = %DisconnectStage::ClientRead, "client sent a non-binary message");
                state.failed.store(true, Ordering::Release);
                state.record_stage(DisconnectStage::ClientRead);
                return;
            }
        };

        capture.record(Direction::ClientToUpstream, &payload);
        if let Err(e) = upstream.write_all(&payload).await {
            state.fail(DisconnectStage::UpstreamWrite, "failed to write upstream", e);
            return;
        }
        state.read.fetch_add(payload.len() as u64, Ordering::AcqRel);
    }
}

/// Upstream → client. Each read becomes one binary message.
async fn upstream_to_client<S>(
    upstream: &mut OwnedReadHalf,
    client: &mut ClientWriter<S>,
    state: &BridgeState,
    capture: &Capture,
    write_timeout: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = match upstream.read(&mut buf).await {
            Ok(0) => {
                debug!("upstream closed");
                state.record_stage(DisconnectStage::UpstreamRead);
                return;
            }
            Ok(n) => n,
            Err(e) => {
                state.fail(DisconnectStage::UpstreamRead, "failed to read from upstream", e);
                return;
            }
        };

        let chunk = &buf[..n];
        capture.record(Direction::UpstreamToClient, chunk);
        match tokio::time::timeout(write_timeout, client.send(Message::Binary(chunk.to_vec()))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if is_peer_gone(&e) => {
                debug!(error = %e, "client went away");
                state.record_stage(DisconnectStage::ClientWrite);
                return;
            }
            Ok(Err(e)) => {
                state.fail(DisconnectStage::ClientWrite, "failed to write to client", e);
                return;
            }
            Err(_) => {
                state.fail(
                    DisconnectStage::ClientWrite,
                    "failed to write to client",
                    format_args!("no progress within {write_timeout:?}"),
                );
                return;
            }
        }
        state.written.fetch_add(n as u64, Ordering::AcqRel);
    }
}

/// The client closed the connection, with or without a handshake.
fn is_peer_gone(err: &WsError) -> bool {
    matches!(
        err,
        WsError::ConnectionClosed
            | WsError::AlreadyClosed
            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake)
            | WsError::Protocol(ProtocolError::SendAfterClosing)
    )
}

fn is_normal_close(frame: Option<&CloseFrame<'_>>) -> bool {
    match frame {
        None => true,
        Some(frame) => matches!(frame.code, CloseCode::Normal | CloseCode::Abnormal),
    }
}

fn describe_close(frame: Option<&CloseFrame<'_>>) -> String {
    match frame {
        Some(frame) => format!("close {}: {}", u16::from(frame.code), frame.reason),
        None => "close".to_string(),
    }
}
