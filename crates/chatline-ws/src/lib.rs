mod commands;
mod handler;
mod session;

use axum::{
    extract::{ws::WebSocketUpgrade, OriginalUri, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use chatline_core::credentials::Authentication;
use chatline_core::AppState;

pub const WEBSOCKET_PATH: &str = "/api/chat/websocket";

pub fn gateway_router() -> Router<AppState> {
    Router::new().route(WEBSOCKET_PATH, get(ws_upgrade))
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Response {
    if state.shutdown.is_cancelled() {
        return (StatusCode::SERVICE_UNAVAILABLE, "gateway is shutting down").into_response();
    }
    let target = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    // Upgrades are never refused for a missing identity; the session simply
    // runs without subscriptions.
    let credential = match state.credentials.authenticate(target, &headers) {
        Authentication::Authenticated(credential) => Some(credential),
        Authentication::Whitelisted | Authentication::Absent => None,
    };
    let tracker = state.sessions.clone();
    ws.on_upgrade(move |socket| {
        tracker.track_future(handler::handle_connection(socket, state, credential))
    })
}
