use axum::{
    extract::{FromRequestParts, Request, State},
    http::{request::Parts, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chatline_core::credentials::Authentication;
use chatline_core::AppState;
use chatline_models::credential::Credential;
use serde_json::json;

use crate::error::ApiError;

/// Runs the credential extractor for every protected route. Whitelisted
/// requests pass untouched, authenticated ones carry their `Credential` as a
/// request extension.
pub async fn require_credential(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let authentication = {
        let uri = req.uri();
        let target = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or_else(|| uri.path());
        state.credentials.authenticate(target, req.headers())
    };
    match authentication {
        Authentication::Whitelisted => next.run(req).await,
        Authentication::Absent => {
            tracing::debug!(path = %req.uri().path(), "request without credential");
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "status": "unauthorized" })),
            )
                .into_response()
        }
        Authentication::Authenticated(credential) => {
            req.extensions_mut().insert(credential);
            next.run(req).await
        }
    }
}

pub struct AuthUser {
    pub user_id: i64,
}

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        // Whitelisted requests reach handlers without a credential.
        let credential = parts
            .extensions
            .get::<Credential>()
            .ok_or(ApiError::Unauthorized)?;
        Ok(AuthUser {
            user_id: credential.user_id,
        })
    }
}
