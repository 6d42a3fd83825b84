//! HTTP front: routing, shared state and the serve/shutdown lifecycle.

use axum::routing::{any, get};
use axum::Router;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{info, warn};
use wsgate_core::{Mapping, TokenVerifier};

use crate::drain::{DrainCoordinator, DrainOutcome};
use crate::tunnel::{self, TunnelSettings};

/// State shared by every request handler.
pub struct AppState {
    pub mapping: Mapping,
    pub verifier: TokenVerifier,
    pub drain: DrainCoordinator,
    pub settings: TunnelSettings,
    seq: AtomicU64,
}

impl AppState {
    pub fn new(mapping: Mapping, verifier: TokenVerifier, settings: TunnelSettings) -> Self {
        Self {
            mapping,
            verifier,
            drain: DrainCoordinator::new(),
            settings,
            seq: AtomicU64::new(0),
        }
    }

    /// Allocate the next session sequence number, starting at 1.
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Number of sessions started so far.
    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::Relaxed)
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(live))
        .route("/live", get(live))
        .route("/proxy/{destination}", any(tunnel::proxy))
        .with_state(state)
}

async fn live() -> &'static str {
    "OK\n"
}

/// Serve until `shutdown` resolves, then drain in-flight sessions for at
/// most `shutdown_timeout`.
///
/// The listener stops accepting as soon as shutdown begins. Sessions still
/// running when the drain times out are abandoned.
pub async fn serve<F>(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown_timeout: Duration,
    shutdown: F,
) -> io::Result<DrainOutcome>
where
    F: Future<Output = ()> + Send,
{
    let addr = listener.local_addr()?;
    let drain = state.drain.clone();
    let totals = Arc::clone(&state);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = stop_rx.await;
            })
            .await
    });
    info!(addr = %addr, "wsgate-server listening");

    tokio::select! {
        res = &mut server => {
            return match res {
                Ok(Ok(())) => Ok(DrainOutcome::Drained),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(io::Error::other(e)),
            };
        }
        _ = shutdown => {}
    }

    info!(active = drain.active(), "shutting down");
    drain.begin_shutdown();
    let _ = stop_tx.send(());

    let outcome = drain.wait(shutdown_timeout).await;
    match outcome {
        DrainOutcome::Drained => info!(sessions = totals.seq(), "all sessions drained"),
        DrainOutcome::TimedOut { remaining } => {
            warn!(remaining, timeout = ?shutdown_timeout, "drain timed out, abandoning sessions")
        }
    }
    // Connections that outlive the drain are not waited for.
    server.abort();
    let _ = server.await;
    Ok(outcome)
}
