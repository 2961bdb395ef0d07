use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, decrement_gauge, gauge, increment_gauge};
use tidepool_sync::{ConnectionId, Dispatch, Peer, PeerHandle};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::server::AppState;

/// Outbound half of one WebSocket, as seen by the sync engine.
///
/// Frames are queued on an unbounded channel drained by the socket's writer
/// task. Once that task ends the channel closes and the peer reports itself
/// closed; rooms keep the handle and simply skip it.
pub struct WsPeer {
    id: ConnectionId,
    outbox: mpsc::UnboundedSender<Message>,
}

impl WsPeer {
    pub fn new(id: ConnectionId, outbox: mpsc::UnboundedSender<Message>) -> Self {
        Self { id, outbox }
    }
}

impl Peer for WsPeer {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send(&self, text: &str) {
        let _ = self.outbox.send(Message::Text(text.to_owned()));
    }

    fn is_open(&self) -> bool {
        !self.outbox.is_closed()
    }
}

pub async fn ws_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, remote_addr))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, remote_addr: SocketAddr) {
    let connection_id = Uuid::new_v4();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let peer: PeerHandle = Arc::new(WsPeer::new(connection_id, tx));

    counter!("tidepool_connections_total", 1);
    increment_gauge!("tidepool_connections_active", 1.0);
    info!(%connection_id, %remote_addr, "connection opened");

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
        debug!(%connection_id, "writer task finished");
    });

    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => handle_frame(&state, &peer, &text),
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => handle_frame(&state, &peer, &text),
                Err(_) => debug!(%connection_id, "ignoring non-UTF-8 binary frame"),
            },
            Ok(Message::Close(frame)) => {
                debug!(
                    %connection_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
            Ok(_) => continue,
            Err(err) => {
                warn!(%connection_id, error = %err, "error receiving message");
                break;
            }
        }
    }

    // Dropping the writer drops the outbox receiver, which marks the peer as
    // closed for every room still holding it.
    writer.abort();
    decrement_gauge!("tidepool_connections_active", 1.0);
    info!(%connection_id, %remote_addr, "connection closed");
}

fn handle_frame(state: &AppState, peer: &PeerHandle, text: &str) {
    let (dispatch, rooms) = {
        let mut engine = state.engine.lock();
        let dispatch = engine.dispatch(peer, text);
        (dispatch, engine.registry().len())
    };

    match dispatch {
        Dispatch::Ignored => {
            counter!("tidepool_frames_total", 1, "command" => "ignored");
        }
        Dispatch::Joined { .. } => {
            counter!("tidepool_frames_total", 1, "command" => "join");
            gauge!("tidepool_rooms_active", rooms as f64);
        }
        Dispatch::Updated { broadcast, .. } => {
            counter!("tidepool_frames_total", 1, "command" => "update");
            counter!(
                "tidepool_state_broadcasts_total",
                broadcast.delivered as u64
            );
        }
        Dispatch::Rejected { command, error } => {
            counter!("tidepool_frames_total", 1, "command" => command);
            counter!(
                "tidepool_frames_rejected_total",
                1,
                "reason" => error.metric_label()
            );
        }
    }
}
