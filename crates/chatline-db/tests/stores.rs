use chatline_db::{message_reads, messages, participants, DbPool};

async fn migrated_pool() -> anyhow::Result<DbPool> {
    let pool = chatline_db::create_pool("sqlite::memory:", 1).await?;
    chatline_db::run_migrations(&pool).await?;
    Ok(pool)
}

async fn seed_chat(pool: &DbPool, chat_id: i64, participants: &[i64]) -> anyhow::Result<()> {
    for user_id in participants {
        sqlx::query("INSERT INTO chat_participants (chat_id, user_id) VALUES ($1, $2)")
            .bind(chat_id)
            .bind(*user_id)
            .execute(pool)
            .await?;
    }
    Ok(())
}

async fn seed_message(pool: &DbPool, id: i64, chat_id: i64, owner_id: i64) -> anyhow::Result<()> {
    sqlx::query("INSERT INTO messages (id, chat_id, owner_id) VALUES ($1, $2, $3)")
        .bind(id)
        .bind(chat_id)
        .bind(owner_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[tokio::test]
async fn participant_lookups_follow_membership() -> anyhow::Result<()> {
    let pool = migrated_pool().await?;
    seed_chat(&pool, 5, &[2, 1]).await?;

    assert_eq!(participants::get_participant_ids(&pool, 5).await?, vec![1, 2]);
    assert!(participants::get_participant_ids(&pool, 6).await?.is_empty());
    assert!(participants::is_participant(&pool, 1, 5).await?);
    assert!(!participants::is_participant(&pool, 3, 5).await?);
    Ok(())
}

#[tokio::test]
async fn unread_count_is_zero_without_messages() -> anyhow::Result<()> {
    let pool = migrated_pool().await?;
    seed_chat(&pool, 5, &[1, 2]).await?;
    assert_eq!(messages::get_all_unread_messages_count(&pool, 1).await?, 0);
    assert_eq!(messages::get_all_unread_messages_count(&pool, 99).await?, 0);
    Ok(())
}

#[tokio::test]
async fn unread_count_skips_own_and_read_messages() -> anyhow::Result<()> {
    let pool = migrated_pool().await?;
    seed_chat(&pool, 5, &[1, 2]).await?;
    seed_chat(&pool, 6, &[2, 3]).await?;
    seed_message(&pool, 41, 5, 1).await?;
    seed_message(&pool, 42, 5, 2).await?;
    seed_message(&pool, 43, 5, 2).await?;
    seed_message(&pool, 50, 6, 3).await?;

    assert_eq!(messages::get_all_unread_messages_count(&pool, 1).await?, 2);

    message_reads::add_message_read(&pool, 42, 1, 5).await?;
    assert_eq!(messages::get_all_unread_messages_count(&pool, 1).await?, 1);

    // User 2 sees message 41 in chat 5 and message 50 in chat 6.
    assert_eq!(messages::get_all_unread_messages_count(&pool, 2).await?, 2);
    message_reads::add_message_read(&pool, 50, 2, 6).await?;
    assert_eq!(messages::get_all_unread_messages_count(&pool, 2).await?, 1);
    Ok(())
}

#[tokio::test]
async fn duplicate_message_read_is_idempotent() -> anyhow::Result<()> {
    let pool = migrated_pool().await?;
    seed_chat(&pool, 5, &[1, 2]).await?;
    seed_message(&pool, 42, 5, 2).await?;

    message_reads::add_message_read(&pool, 42, 1, 5).await?;
    let first = messages::get_all_unread_messages_count(&pool, 1).await?;
    message_reads::add_message_read(&pool, 42, 1, 5).await?;
    let second = messages::get_all_unread_messages_count(&pool, 1).await?;

    assert_eq!(first, 0);
    assert_eq!(first, second);
    assert_eq!(message_reads::count_message_reads(&pool, 42, 1, 5).await?, 1);
    Ok(())
}

#[tokio::test]
async fn queries_fail_without_migrations() -> anyhow::Result<()> {
    let pool = chatline_db::create_pool("sqlite::memory:", 1).await?;
    assert!(participants::get_participant_ids(&pool, 5).await.is_err());
    assert!(message_reads::add_message_read(&pool, 42, 1, 5).await.is_err());
    Ok(())
}
