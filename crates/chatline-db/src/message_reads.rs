use crate::{DbError, DbPool};

/// Record that `user_id` has read `message_id`. Repeated calls for the same
/// key leave exactly one row behind and succeed.
pub async fn add_message_read(
    pool: &DbPool,
    message_id: i64,
    user_id: i64,
    chat_id: i64,
) -> Result<(), DbError> {
    let result = sqlx::query(
        "INSERT INTO message_reads (user_id, chat_id, message_id)
         VALUES ($1, $2, $3)
         ON CONFLICT (user_id, chat_id, message_id) DO NOTHING",
    )
    .bind(user_id)
    .bind(chat_id)
    .bind(message_id)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        tracing::debug!(user_id, chat_id, message_id, "message read already recorded");
    }
    Ok(())
}

pub async fn count_message_reads(
    pool: &DbPool,
    message_id: i64,
    user_id: i64,
    chat_id: i64,
) -> Result<i64, DbError> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM message_reads
         WHERE user_id = $1 AND chat_id = $2 AND message_id = $3",
    )
    .bind(user_id)
    .bind(chat_id)
    .bind(message_id)
    .fetch_one(pool)
    .await?;
    Ok(count)
}
