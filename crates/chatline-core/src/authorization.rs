use chatline_db::{participants, DbPool};
use chatline_models::channel::{Channel, ChannelParseError};

use crate::error::CoreError;

/// Per-subscription features granted at subscribe time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscribeOptions {
    pub presence: bool,
    pub join_leave: bool,
    pub recover: bool,
}

impl SubscribeOptions {
    pub fn full() -> Self {
        Self {
            presence: true,
            join_leave: true,
            recover: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionGrant {
    pub channel: Channel,
    pub options: SubscribeOptions,
}

/// Decide whether `user_id` may subscribe to `raw` on a client request.
///
/// Personal channels are only ever subscribed server side. Chat channels need
/// the user in the chat's participant list; a failing store denies.
pub async fn authorize_subscribe(
    db: &DbPool,
    user_id: i64,
    raw: &str,
) -> Result<SubscriptionGrant, CoreError> {
    let channel = Channel::parse(raw)?;
    match channel {
        Channel::Personal(_) => Err(ChannelParseError::ServerSideOnly(raw.to_string()).into()),
        Channel::ChatMessages(chat_id) => {
            let participant_ids = match participants::get_participant_ids(db, chat_id).await {
                Ok(ids) => ids,
                Err(err) => {
                    tracing::error!(user_id, chat_id, error = %err, "participant lookup failed");
                    return Err(CoreError::AuthorizationDenied);
                }
            };
            if !participant_ids.iter().any(|id| *id == user_id) {
                tracing::info!(user_id, chat_id, "subscribe denied: not a participant");
                return Err(CoreError::AuthorizationDenied);
            }
            Ok(SubscriptionGrant {
                channel,
                options: SubscribeOptions::full(),
            })
        }
    }
}
