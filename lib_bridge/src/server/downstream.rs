use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;

use crate::core::hub::ClientHandle;
use crate::server::state::AppState;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health_handler))
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

/// Binds `0.0.0.0:port`. A bind failure is a startup error.
pub async fn bind(port: u16) -> Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding downstream listener on {}", addr))
}

/// Serves health and WebSocket routes until the state's shutdown token fires.
pub async fn serve(listener: TcpListener, state: AppState) -> Result<()> {
    let addr = listener.local_addr()?;
    log::info!("Downstream server listening on {}", addr);

    let shutdown = state.shutdown.clone();
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.cancelled().await;
        log::info!("Downstream server shutting down.");
    })
    .await
    .context("downstream server failed")?;
    Ok(())
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.health())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, addr))
}

/// Why a session ended. Logged, never escalated.
#[derive(Debug)]
enum SessionEnd {
    ClosedByClient,
    ReadError(axum::Error),
    WriteError(axum::Error),
    WriteTimedOut,
    DroppedByHub,
    Shutdown,
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEnd::ClosedByClient => write!(f, "closed by client"),
            SessionEnd::ReadError(e) => write!(f, "read error: {}", e),
            SessionEnd::WriteError(e) => write!(f, "write error: {}", e),
            SessionEnd::WriteTimedOut => write!(f, "write timed out"),
            SessionEnd::DroppedByHub => write!(f, "dropped by hub"),
            SessionEnd::Shutdown => write!(f, "server shutting down"),
        }
    }
}

/// One streaming client, from upgrade to unregister.
///
/// Payloads from the hub are written to the socket, each write bounded by the
/// hub's send timeout. Inbound frames carry no meaning and are drained so the
/// connection never stalls on unread data.
async fn handle_socket(socket: WebSocket, state: AppState, peer: SocketAddr) {
    let id = state.hub.next_client_id();
    let (handle, mut rx) = ClientHandle::channel(id, peer.to_string(), state.client_buffer_size);
    state.hub.register(handle);

    let send_timeout = state.hub.send_timeout();
    let (mut sink, mut stream) = socket.split();

    let end = loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                let close = Message::Close(Some(CloseFrame {
                    code: close_code::AWAY,
                    reason: "server shutting down".into(),
                }));
                let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.send(close)).await;
                break SessionEnd::Shutdown;
            }
            frame = rx.recv() => match frame {
                Some(payload) => {
                    let write = sink.send(Message::Text(payload.as_str().into()));
                    match tokio::time::timeout(send_timeout, write).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => break SessionEnd::WriteError(e),
                        Err(_) => break SessionEnd::WriteTimedOut,
                    }
                }
                None => break SessionEnd::DroppedByHub,
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Close(_))) | None => break SessionEnd::ClosedByClient,
                Some(Ok(_)) => {}
                Some(Err(e)) => break SessionEnd::ReadError(e),
            },
        }
    };

    state.hub.unregister(id);
    log::info!("{} ({}) session ended: {}", id, peer, end);
}
