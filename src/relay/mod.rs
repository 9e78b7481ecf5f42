//! Signaling relay
//!
//! A pure fan-out router: each WebSocket channel binds to the identifier in
//! its URL path, and envelopes addressed `to: X` are forwarded to X's channel
//! with `from` stamped by the relay. The routing table is the only state;
//! there is no per-pair state and no negotiation logic here. The relay never
//! inspects or mutates `type` or payload fields.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, info, warn};

use crate::peer::identity;
use crate::peer::Envelope;

/// Queue depth per bound channel.
const CHANNEL_CAPACITY: usize = 100;

struct RouteEntry {
    generation: u64,
    tx: mpsc::Sender<Message>,
    evict: Arc<Notify>,
}

/// Routing table: identifier -> rendezvous channel. At most one binding per
/// identifier; rebinds evict the stale channel (logged as a warning).
#[derive(Clone, Default)]
pub struct RelayState {
    routes: Arc<RwLock<HashMap<String, RouteEntry>>>,
    next_generation: Arc<AtomicU64>,
}

impl RelayState {
    pub async fn peer_ids(&self) -> Vec<String> {
        self.routes.read().await.keys().cloned().collect()
    }
}

/// Relay handle for address lookup and graceful shutdown.
pub struct RelayHandle {
    pub addr: SocketAddr,
    state: RelayState,
    shutdown: Arc<Notify>,
}

impl RelayHandle {
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    pub fn state(&self) -> RelayState {
        self.state.clone()
    }
}

/// Bind and serve the relay on `addr` (port 0 picks a free port).
pub async fn start_relay(addr: SocketAddr) -> anyhow::Result<RelayHandle> {
    let state = RelayState::default();
    let shutdown = Arc::new(Notify::new());

    let app = Router::new()
        .route("/peers", get(list_peers))
        .route("/:id", any(ws_handler))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    info!("Signaling relay listening on {}", bound_addr);

    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        let serve = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown_signal.notified().await });
        if let Err(e) = serve.await {
            warn!("Relay server error: {}", e);
        }
    });

    Ok(RelayHandle {
        addr: bound_addr,
        state,
        shutdown,
    })
}

/// Discovery query: the currently bound peer identifiers.
async fn list_peers(State(state): State<RelayState>) -> Json<Vec<String>> {
    Json(state.peer_ids().await)
}

async fn ws_handler(
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
    State(state): State<RelayState>,
) -> Response {
    if !identity::validate(&id) {
        debug!("Rejecting channel with invalid identifier: {:?}", id);
        return (StatusCode::BAD_REQUEST, "invalid peer identifier").into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, id, state))
}

async fn handle_socket(socket: WebSocket, id: String, state: RelayState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(CHANNEL_CAPACITY);
    let evict = Arc::new(Notify::new());
    let generation = state.next_generation.fetch_add(1, Ordering::Relaxed);

    {
        let mut routes = state.routes.write().await;
        let entry = RouteEntry {
            generation,
            tx: tx.clone(),
            evict: evict.clone(),
        };
        if let Some(stale) = routes.insert(id.clone(), entry) {
            warn!("Identifier {} rebound; evicting stale channel", id);
            let _ = stale.tx.try_send(Message::Close(None));
            stale.evict.notify_one();
        }
    }

    info!("Channel open: {}", id);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sink.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = evict.notified() => {
                break;
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_message(&state, &id, &text, &tx).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("Channel {} error: {}", id, e);
                        break;
                    }
                }
            }
        }
    }

    // Generation-checked unbind: a stale channel's teardown must not evict
    // its replacement.
    {
        let mut routes = state.routes.write().await;
        if routes.get(&id).is_some_and(|e| e.generation == generation) {
            routes.remove(&id);
        }
    }
    send_task.abort();

    info!("Channel closed: {}", id);
}

/// Route one envelope. The payload is forwarded verbatim; only the
/// addressing keys change hands (`to` is stripped, `from` is stamped with
/// the sender's bound identifier, overriding anything the sender supplied).
async fn handle_message(state: &RelayState, from: &str, text: &str, reply: &mpsc::Sender<Message>) {
    let mut envelope = match serde_json::from_str::<serde_json::Value>(text) {
        Ok(serde_json::Value::Object(map)) => map,
        _ => {
            debug!("Dropping malformed envelope from {}", from);
            return;
        }
    };

    let to = match envelope.remove("to") {
        Some(serde_json::Value::String(to)) => to,
        _ => {
            debug!("Dropping envelope from {} without target", from);
            return;
        }
    };

    let target_tx = if to == from {
        None
    } else {
        state.routes.read().await.get(&to).map(|e| e.tx.clone())
    };

    let Some(target_tx) = target_tx else {
        debug!("No route to {}; notifying {}", to, from);
        notify_peer_not_found(reply, &to).await;
        return;
    };

    envelope.insert(
        "from".to_string(),
        serde_json::Value::String(from.to_string()),
    );

    let forwarded = serde_json::Value::Object(envelope).to_string();
    if target_tx.send(Message::Text(forwarded)).await.is_err() {
        debug!("Channel {} gone mid-forward; notifying {}", to, from);
        notify_peer_not_found(reply, &to).await;
    }
}

async fn notify_peer_not_found(reply: &mpsc::Sender<Message>, peer: &str) {
    let notice = Envelope::PeerNotFound {
        peer: peer.to_string(),
    };
    if let Ok(text) = serde_json::to_string(&notice) {
        let _ = reply.send(Message::Text(text)).await;
    }
}
