use crate::{DbError, DbPool};

/// Participant ids of a chat in ascending order. An unknown chat has none.
pub async fn get_participant_ids(pool: &DbPool, chat_id: i64) -> Result<Vec<i64>, DbError> {
    let ids = sqlx::query_scalar::<_, i64>(
        "SELECT user_id FROM chat_participants WHERE chat_id = $1 ORDER BY user_id",
    )
    .bind(chat_id)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

pub async fn is_participant(pool: &DbPool, user_id: i64, chat_id: i64) -> Result<bool, DbError> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM chat_participants WHERE user_id = $1 AND chat_id = $2",
    )
    .bind(user_id)
    .bind(chat_id)
    .fetch_one(pool)
    .await?;
    Ok(count > 0)
}
