use chatline_db::{message_reads, messages, participants, DbPool};
use chatline_models::rpc::{
    AllUnreadMessages, MessageRead, RPC_CHECK_FOR_NEW_MESSAGES, RPC_MESSAGE_READ,
};
use serde_json::Value;

use crate::error::CoreError;

/// Route an RPC call by method name.
pub async fn dispatch(
    db: &DbPool,
    user_id: i64,
    method: &str,
    data: &Value,
) -> Result<AllUnreadMessages, CoreError> {
    match method {
        RPC_CHECK_FOR_NEW_MESSAGES => check_for_new_messages(db, user_id).await,
        RPC_MESSAGE_READ => {
            let read = decode_message_read(data)?;
            message_read(db, user_id, read).await
        }
        other => {
            tracing::info!(user_id, method = other, "unknown rpc method");
            Err(CoreError::UnknownMethod(other.to_string()))
        }
    }
}

pub async fn check_for_new_messages(
    db: &DbPool,
    user_id: i64,
) -> Result<AllUnreadMessages, CoreError> {
    let all_unread_messages = messages::get_all_unread_messages_count(db, user_id)
        .await
        .map_err(|err| {
            tracing::error!(user_id, error = %err, "unread count failed");
            CoreError::from(err)
        })?;
    Ok(AllUnreadMessages {
        all_unread_messages,
    })
}

pub async fn message_read(
    db: &DbPool,
    user_id: i64,
    read: MessageRead,
) -> Result<AllUnreadMessages, CoreError> {
    match participants::is_participant(db, user_id, read.chat_id).await {
        Ok(true) => {}
        Ok(false) => {
            tracing::info!(user_id, chat_id = read.chat_id, "message_read by non-participant");
            return Err(CoreError::NotParticipant);
        }
        Err(err) => {
            tracing::error!(
                user_id,
                chat_id = read.chat_id,
                error = %err,
                "participant check failed"
            );
            return Err(CoreError::NotParticipant);
        }
    }

    message_reads::add_message_read(db, read.message_id, user_id, read.chat_id)
        .await
        .map_err(|err| {
            tracing::error!(
                user_id,
                chat_id = read.chat_id,
                message_id = read.message_id,
                error = %err,
                "recording read receipt failed"
            );
            CoreError::from(err)
        })?;

    check_for_new_messages(db, user_id).await
}

/// Clients send the payload either as an object or as a JSON string.
fn decode_message_read(data: &Value) -> Result<MessageRead, CoreError> {
    let parsed = match data {
        Value::String(raw) => serde_json::from_str(raw),
        other => serde_json::from_value(other.clone()),
    };
    parsed.map_err(|err| CoreError::Payload(format!("invalid message_read payload: {err}")))
}
