//! Upload route
//!
//! `GET /api/ws` upgrades to a WebSocket. Each connection gets its own pumps
//! and session on the background pool, all under one `upload` span carrying a
//! connection id.

use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use uuid::Uuid;

use crate::channel::{self, websocket, ChannelConfig};
use crate::state::AppState;
use crate::upload::UploadSession;

/// Create the upload router
pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(upload_socket))
}

async fn upload_socket(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let max_message = state.config().limits.max_message_bytes;

    ws.max_message_size(max_message)
        .max_frame_size(max_message)
        .on_upgrade(move |socket| async move { start_session(state, socket) })
}

/// Wire a fresh socket to a new upload session
fn start_session(state: AppState, socket: WebSocket) {
    let conn_id = Uuid::new_v4();
    let span = tracing::info_span!("upload", %conn_id);
    let _entered = span.enter();

    let limits = &state.config().limits;
    let (stream, sink) = websocket::split(socket);

    let config = ChannelConfig::from(limits);
    let conn = match channel::open(stream, sink, config, state.background_pool()) {
        Ok(conn) => conn,
        Err(e) => {
            tracing::warn!(error = %e, "Refusing upload connection");
            return;
        }
    };
    tracing::debug!("Upload connection opened");

    let close = conn.close.clone();
    let session = UploadSession::new(
        state.store().clone(),
        state.blobs().clone(),
        limits.clone(),
        state.config().server.public_url.clone(),
    );

    if let Err(e) = state.background_pool().spawn("upload_session", async move {
        session.run(conn).await;
    }) {
        tracing::warn!(error = %e, "Refusing upload session");
        close.cancel();
    }
}
