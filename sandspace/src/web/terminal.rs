use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use serde::Deserialize;
use tracing::debug;

use super::AppState;
use crate::terminal::{Inbound, Outbound, TerminalChannel, TerminalSize};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/spaces/{name}/terminal", get(terminal_upgrade))
}

#[derive(Deserialize)]
struct TerminalQuery {
    cols: Option<u16>,
    rows: Option<u16>,
}

async fn terminal_upgrade(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<TerminalQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let size = TerminalSize::from_query(query.cols, query.rows);
    ws.on_upgrade(move |socket| async move {
        let summary = state
            .terminal
            .run(&name, size, WsChannel { socket })
            .await;
        debug!(
            space = %name,
            bytes_in = summary.bytes_in,
            bytes_out = summary.bytes_out,
            "terminal websocket finished"
        );
    })
}

/// A terminal client over an axum WebSocket.
struct WsChannel {
    socket: WebSocket,
}

#[async_trait]
impl TerminalChannel for WsChannel {
    async fn recv(&mut self) -> Option<Inbound> {
        match self.socket.recv().await? {
            Ok(Message::Text(text)) => Some(Inbound::Text(text.as_str().to_string())),
            Ok(Message::Binary(bytes)) => Some(Inbound::Binary(bytes)),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => Some(Inbound::Ping),
            Ok(Message::Close(_)) => Some(Inbound::Close),
            Err(e) => {
                debug!(error = %e, "terminal websocket receive failed");
                None
            }
        }
    }

    async fn send(&mut self, msg: Outbound) -> bool {
        let msg = match msg {
            Outbound::Text(text) => Message::Text(text.into()),
            Outbound::Binary(bytes) => Message::Binary(bytes),
        };
        self.socket.send(msg).await.is_ok()
    }

    async fn close(&mut self) {
        // Already closed by the peer is fine.
        let _ = self.socket.send(Message::Close(None)).await;
    }
}
