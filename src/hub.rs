use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use axum::extract::ws::{Message as Frame, WebSocket, WebSocketUpgrade};
use axum::extract::{RawQuery, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{extract_token, ApiError, AppState};

/// Outbound queue depth per client; a client that falls this far behind
/// is evicted rather than allowed to block a broadcast.
const CLIENT_QUEUE_DEPTH: usize = 256;

/// A typed message fanned out to every connected dashboard client.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub data: Value,
}

impl Message {
    pub fn new(kind: &'static str, session_id: Option<String>, data: Value) -> Self {
        Self {
            kind,
            session_id,
            data,
        }
    }
}

/// WebSocket fan-out hub. Holds one bounded sender per connected client;
/// dropping a client's sender is what closes its outbound queue, so the
/// unregister path closes it exactly once.
pub struct Hub {
    clients: Mutex<HashMap<u64, mpsc::Sender<String>>>,
    next_id: AtomicU64,
}

impl Hub {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn register(&self) -> (u64, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_DEPTH);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut clients = self.clients.lock().expect("hub poisoned");
        clients.insert(id, tx);
        debug!(total = clients.len(), "ws client connected");
        (id, rx)
    }

    pub fn unregister(&self, id: u64) {
        let mut clients = self.clients.lock().expect("hub poisoned");
        if clients.remove(&id).is_some() {
            debug!(total = clients.len(), "ws client disconnected");
        }
    }

    /// Marshal once, then enqueue without blocking. Clients with a full
    /// queue are evicted after the sweep.
    pub fn broadcast(&self, msg: Message) {
        let payload = match serde_json::to_string(&msg) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(%err, kind = msg.kind, "failed to marshal broadcast");
                return;
            }
        };

        let stale: Vec<u64> = {
            let clients = self.clients.lock().expect("hub poisoned");
            clients
                .iter()
                .filter_map(|(id, tx)| tx.try_send(payload.clone()).err().map(|_| *id))
                .collect()
        };
        for id in stale {
            warn!(client = id, "evicting slow ws client");
            self.unregister(id);
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().expect("hub poisoned").len()
    }
}

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    State(state): State<AppState>,
) -> Response {
    let authorized = extract_token(&headers, query.as_deref())
        .map(|token| state.config().validate_token(&token))
        .unwrap_or(false);
    if !authorized {
        return ApiError::unauthorized().into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let hub = state.hub();
    let (id, mut outbound) = hub.register();
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(payload) = outbound.recv().await {
            if sink.send(Frame::Text(payload)).await.is_err() {
                break;
            }
        }
    });

    // Reader exists only to observe the close; inbound frames carry
    // nothing the server acts on.
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Frame::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        }
    }

    hub.unregister(id);
    let _ = writer.await;
}
