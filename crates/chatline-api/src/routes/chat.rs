use axum::{extract::State, Json};
use chatline_core::{rpc, AppState};
use chatline_models::rpc::AllUnreadMessages;

use crate::error::ApiError;
use crate::middleware::AuthUser;

pub async fn unread_messages(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<AllUnreadMessages>, ApiError> {
    let unread = rpc::check_for_new_messages(&state.db, auth.user_id).await?;
    Ok(Json(unread))
}
