//! WebSocket attach endpoint.
//!
//! One WebSocket per attached viewer. Binary frames carry raw terminal
//! bytes both ways; text frames carry JSON control frames, and any text
//! that is not a control frame is typed into the terminal.
//!
//! The session side never touches the socket: it queues [`Outbound`]
//! messages on the connection's channel and this module drains them.

use crate::server::AppState;
use crate::session::{ConnectionHandle, Outbound, SessionManager};
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use ptyhub_core::{
    clamp_idle_threshold, clamp_size, decode_client_text, ClientFrame, ClientText, ServerFrame,
    CLOSE_SESSION_NOT_FOUND,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Query string of an attach request.
#[derive(Debug, Default, Deserialize)]
pub struct AttachQuery {
    /// Last stream offset the client saw. Unparseable values count as 0.
    #[serde(default)]
    pub cursor: Option<String>,
}

impl AttachQuery {
    pub fn cursor(&self) -> u64 {
        self.cursor
            .as_deref()
            .and_then(|c| c.trim().parse().ok())
            .unwrap_or(0)
    }
}

/// `GET /ws/:id?cursor=N`
pub async fn attach(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    Query(query): Query<AttachQuery>,
    State(state): State<AppState>,
) -> Response {
    let cursor = query.cursor();
    ws.on_upgrade(move |socket| serve_connection(socket, state.sessions, session_id, cursor))
}

/// Run one attached connection until either side goes away.
async fn serve_connection(
    socket: WebSocket,
    sessions: Arc<SessionManager>,
    session_id: String,
    cursor: u64,
) {
    let (conn, mut outbound) = ConnectionHandle::new();
    let (mut sink, mut stream) = socket.split();

    if !sessions.attach(&session_id, &conn, cursor).await {
        debug!(session_id = %session_id, "attach to unknown session");
        let _ = sink
            .send(close_message(CLOSE_SESSION_NOT_FOUND, "session not found"))
            .await;
        return;
    }

    loop {
        tokio::select! {
            msg = outbound.recv() => {
                match msg {
                    Some(Outbound::Close { code, reason }) => {
                        let _ = sink.send(close_message(code, reason)).await;
                        break;
                    }
                    Some(msg) => {
                        let Some(frame) = to_message(msg) else { continue };
                        if let Err(e) = sink.send(frame).await {
                            debug!(session_id = %session_id, error = %e, "WebSocket send failed");
                            break;
                        }
                    }
                    None => break,
                }
            }

            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Binary(data))) => {
                        sessions.write(&session_id, &data).await;
                    }
                    Some(Ok(Message::Text(text))) => {
                        handle_text(&sessions, &session_id, &conn, &text).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(session_id = %session_id, "WebSocket closed by peer");
                        break;
                    }
                    // Ping/pong are answered by the WebSocket layer.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(session_id = %session_id, error = %e, "WebSocket receive failed");
                        break;
                    }
                }
            }
        }
    }

    sessions.detach(&session_id, conn.id()).await;
}

/// Apply one inbound text frame.
async fn handle_text(
    sessions: &SessionManager,
    session_id: &str,
    conn: &ConnectionHandle,
    text: &str,
) {
    match decode_client_text(text) {
        ClientText::Control(ClientFrame::Resize { cols, rows }) => {
            let (cols, rows) = clamp_size(cols, rows);
            sessions.resize(session_id, cols, rows).await;
        }
        ClientText::Control(ClientFrame::Ping) => {
            conn.send(Outbound::Control(ServerFrame::Pong));
        }
        ClientText::Control(ClientFrame::Configure { idle_threshold_ms }) => {
            sessions
                .configure_idle(session_id, clamp_idle_threshold(idle_threshold_ms))
                .await;
        }
        ClientText::Malformed { kind, reason } => {
            debug!(session_id = %session_id, kind = %kind, error = %reason, "dropping malformed control frame");
        }
        ClientText::Input(input) => {
            sessions.write(session_id, input.as_bytes()).await;
        }
    }
}

fn to_message(msg: Outbound) -> Option<Message> {
    match msg {
        Outbound::Data(data) => Some(Message::Binary(data)),
        Outbound::Control(frame) => match frame.to_json() {
            Ok(json) => Some(Message::Text(json)),
            Err(e) => {
                warn!(error = %e, "failed to encode control frame");
                None
            }
        },
        Outbound::Close { code, reason } => Some(close_message(code, reason)),
    }
}

fn close_message(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}
