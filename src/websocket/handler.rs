use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures::{future, SinkExt, StreamExt};
use serde::Deserialize;

use crate::error::{AppError, StreamError};
use crate::server::AppState;
use crate::session::AdmissionError;

use super::frame::Frame;

/// Header carrying the display name chosen by the client
pub const DISPLAY_NAME_HEADER: &str = "x-display-name";

const ANONYMOUS: &str = "anonymous";
const MAX_DISPLAY_NAME_LEN: usize = 64;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub name: Option<String>,
}

/// WebSocket upgrade handler
#[tracing::instrument(
    name = "ws.upgrade",
    skip(ws, state, query, headers),
    fields(has_query_name = query.name.is_some())
)]
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Response {
    if state.broadcaster.is_shutting_down() {
        return AppError::ShuttingDown.into_response();
    }

    let display_name = extract_display_name(&query, &headers);
    tracing::debug!(display_name = %display_name, "WebSocket upgrade requested");

    let max_frame_bytes = state.settings.websocket.max_frame_bytes;
    ws.max_message_size(max_frame_bytes)
        .max_frame_size(max_frame_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state, display_name))
}

/// Display name from the header first, then the query string
fn extract_display_name(query: &WsQuery, headers: &HeaderMap) -> String {
    let from_header = headers
        .get(DISPLAY_NAME_HEADER)
        .and_then(|v| v.to_str().ok());

    from_header
        .or(query.name.as_deref())
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| name.chars().take(MAX_DISPLAY_NAME_LEN).collect())
        .unwrap_or_else(|| ANONYMOUS.to_string())
}

/// Hand an upgraded socket to the broadcaster and wait for its session to end
async fn handle_socket(socket: WebSocket, state: AppState, display_name: String) {
    let (sink, stream) = socket.split();

    let outbound = sink
        .sink_map_err(StreamError::from)
        .with(|frame: Frame| future::ready(Ok::<Message, StreamError>(frame.into())));
    let inbound = stream.map(|result| result.map(Frame::from).map_err(StreamError::from));

    let session = match state.broadcaster.admit(display_name, inbound, Box::pin(outbound)) {
        Ok(session) => session,
        Err(AdmissionError::ShuttingDown) => {
            tracing::debug!("Rejected WebSocket admission during shutdown");
            return;
        }
        Err(e) => {
            tracing::error!(error = %e, "WebSocket admission failed");
            return;
        }
    };

    let summary = session.join().await;
    tracing::debug!(
        connection_id = %summary.connection_id,
        reason = %summary.reason,
        "WebSocket connection finished"
    );
}
