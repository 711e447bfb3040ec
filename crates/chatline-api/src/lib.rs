use axum::{
    extract::State,
    http::{Method, StatusCode},
    middleware::from_fn_with_state,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chatline_core::{AppState, SERVICE_NAME};
use serde_json::json;
use tower::ServiceBuilder;

pub mod error;
pub mod middleware;
pub mod routes;

/// Plain HTTP routes. Everything under `/api/chat` goes through the
/// credential middleware; `/health` stays open for load balancers.
pub fn build_router(state: &AppState) -> Router<AppState> {
    let protected = Router::new()
        .route(
            "/api/chat/unread-messages",
            get(routes::chat::unread_messages),
        )
        .route_layer(from_fn_with_state(
            state.clone(),
            middleware::require_credential,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(
            ServiceBuilder::new()
                .layer(tower_http::trace::TraceLayer::new_for_http())
                .layer(build_cors_layer()),
        )
}

fn build_cors_layer() -> tower_http::cors::CorsLayer {
    // Browsers reach the gateway through the authenticating proxy, which owns
    // the origin policy.
    tower_http::cors::CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "service": SERVICE_NAME,
            "connections": state.connections.active(),
        })),
    )
}
