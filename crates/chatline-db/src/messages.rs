use crate::{DbError, DbPool};

/// Messages in the user's chats, written by someone else and not yet read.
pub async fn get_all_unread_messages_count(pool: &DbPool, user_id: i64) -> Result<i64, DbError> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*)
         FROM messages m
         INNER JOIN chat_participants p ON p.chat_id = m.chat_id AND p.user_id = $1
         WHERE m.owner_id <> $1
           AND NOT EXISTS (
               SELECT 1 FROM message_reads r
               WHERE r.user_id = $1 AND r.chat_id = m.chat_id AND r.message_id = m.id
           )",
    )
    .bind(user_id)
    .fetch_one(pool)
    .await?;
    Ok(count)
}
