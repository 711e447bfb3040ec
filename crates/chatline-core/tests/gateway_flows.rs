use std::sync::Arc;
use std::time::Duration;

use chatline_core::authorization::{authorize_subscribe, SubscribeOptions};
use chatline_core::broker::{BrokerBackend, MemoryBroker};
use chatline_core::enrichment::publish_enriched;
use chatline_core::hub::{ChannelEvent, Hub, SessionSink};
use chatline_core::presence::{channel_presence_stats, SubscriptionEvent};
use chatline_core::{rpc, AppConfig, CoreError};
use chatline_db::DbPool;
use chatline_models::channel::{Channel, ChannelParseError};
use chatline_models::presence::ClientInfo;
use serde_json::json;

async fn seeded_pool() -> anyhow::Result<DbPool> {
    let pool = chatline_db::create_pool("sqlite::memory:", 1).await?;
    chatline_db::run_migrations(&pool).await?;
    for user_id in [1_i64, 2] {
        sqlx::query("INSERT INTO chat_participants (chat_id, user_id) VALUES ($1, $2)")
            .bind(5_i64)
            .bind(user_id)
            .execute(&pool)
            .await?;
    }
    sqlx::query("INSERT INTO messages (id, chat_id, owner_id) VALUES ($1, $2, $3)")
        .bind(42_i64)
        .bind(5_i64)
        .bind(2_i64)
        .execute(&pool)
        .await?;
    Ok(pool)
}

fn memory_broker() -> (Arc<Hub>, BrokerBackend) {
    let hub = Arc::new(Hub::new());
    let broker = BrokerBackend::Memory(MemoryBroker::new(
        hub.clone(),
        Duration::from_secs(60),
        Duration::from_secs(3600),
    ));
    (hub, broker)
}

#[tokio::test]
async fn participants_may_subscribe_to_their_chat() -> anyhow::Result<()> {
    let pool = seeded_pool().await?;
    let grant = authorize_subscribe(&pool, 1, "chat_messages:5").await?;
    assert_eq!(grant.channel, Channel::ChatMessages(5));
    assert_eq!(grant.options, SubscribeOptions::full());

    assert!(matches!(
        authorize_subscribe(&pool, 3, "chat_messages:5").await,
        Err(CoreError::AuthorizationDenied)
    ));
    assert!(matches!(
        authorize_subscribe(&pool, 1, "chat_messages:6").await,
        Err(CoreError::AuthorizationDenied)
    ));
    Ok(())
}

#[tokio::test]
async fn unrecognized_and_personal_channels_are_rejected() -> anyhow::Result<()> {
    let pool = seeded_pool().await?;
    for raw in ["aux:5", "chat_messages:", "chat_messages:-5", "chat_messages: 5", ""] {
        assert!(
            matches!(authorize_subscribe(&pool, 1, raw).await, Err(CoreError::ChannelParse(_))),
            "{raw}"
        );
    }
    assert!(matches!(
        authorize_subscribe(&pool, 1, "personal:1").await,
        Err(CoreError::ChannelParse(ChannelParseError::ServerSideOnly(_)))
    ));
    Ok(())
}

#[tokio::test]
async fn store_failure_denies_subscription() -> anyhow::Result<()> {
    let pool = chatline_db::create_pool("sqlite::memory:", 1).await?;
    assert!(matches!(
        authorize_subscribe(&pool, 1, "chat_messages:5").await,
        Err(CoreError::AuthorizationDenied)
    ));
    Ok(())
}

#[tokio::test]
async fn denied_subscribe_leaves_presence_unchanged() -> anyhow::Result<()> {
    let pool = seeded_pool().await?;
    let (_hub, broker) = memory_broker();
    let info = ClientInfo {
        user: "1".to_string(),
        client: "session-1".to_string(),
        conn_info: None,
    };
    broker.add_presence("chat_messages:5", "session-1", &info).await?;
    let event = SubscriptionEvent::Subscribe {
        channel: "chat_messages:5".to_string(),
    };
    let before = channel_presence_stats(&broker, "session-1", 1, &event).await;

    assert!(authorize_subscribe(&pool, 3, "chat_messages:5").await.is_err());
    let after = channel_presence_stats(&broker, "session-3", 3, &event).await;
    assert_eq!(before, after);
    Ok(())
}

#[tokio::test]
async fn published_envelope_carries_session_identity() -> anyhow::Result<()> {
    let (hub, broker) = memory_broker();
    let (sink, mut queue) = SessionSink::channel(8);
    hub.subscribe("chat_messages:5", "session-2", sink);

    let info = ClientInfo {
        user: "1".to_string(),
        client: "session-1".to_string(),
        conn_info: Some(json!({ "login": "nikita" })),
    };
    let position = publish_enriched(
        &broker,
        AppConfig::default().history(),
        "chat_messages:5",
        &json!({ "payload": { "text": "hi" }, "metadata": { "originatorUserId": "2" } }),
        &info,
    )
    .await?;
    assert_eq!(position.offset, 1);

    let delivery = queue.deliveries.recv().await.expect("delivery");
    let ChannelEvent::Publication(publication) = &delivery.event else {
        panic!("expected publication, got {:?}", delivery.event);
    };
    assert_eq!(
        publication.data,
        json!({
            "payload": { "text": "hi" },
            "metadata": { "originatorUserId": "1", "originatorClientId": "session-1" }
        })
    );
    assert_eq!(publication.info.as_ref(), Some(&info));

    let rejected = publish_enriched(
        &broker,
        AppConfig::default().history(),
        "chat_messages:5",
        &json!("not an envelope"),
        &info,
    )
    .await;
    assert!(matches!(rejected, Err(CoreError::Payload(_))));
    assert!(queue.deliveries.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn check_for_new_messages_counts_unread() -> anyhow::Result<()> {
    let pool = seeded_pool().await?;
    let unread = rpc::dispatch(&pool, 1, "check_for_new_messages", &json!(null)).await?;
    assert_eq!(unread.all_unread_messages, 1);
    let unread = rpc::dispatch(&pool, 2, "check_for_new_messages", &json!(null)).await?;
    assert_eq!(unread.all_unread_messages, 0);
    Ok(())
}

#[tokio::test]
async fn message_read_twice_is_idempotent() -> anyhow::Result<()> {
    let pool = seeded_pool().await?;
    let payload = json!({ "chatId": 5, "messageId": 42 });
    let first = rpc::dispatch(&pool, 1, "message_read", &payload).await?;
    let second = rpc::dispatch(&pool, 1, "message_read", &payload).await?;
    assert_eq!(first, second);
    assert_eq!(first.all_unread_messages, 0);
    assert_eq!(
        chatline_db::message_reads::count_message_reads(&pool, 42, 1, 5).await?,
        1
    );
    Ok(())
}

#[tokio::test]
async fn message_read_requires_membership() -> anyhow::Result<()> {
    let pool = seeded_pool().await?;
    let payload = json!({ "chatId": 5, "messageId": 42 });
    assert!(matches!(
        rpc::dispatch(&pool, 3, "message_read", &payload).await,
        Err(CoreError::NotParticipant)
    ));
    assert_eq!(
        chatline_db::message_reads::count_message_reads(&pool, 42, 3, 5).await?,
        0
    );
    assert!(matches!(
        rpc::dispatch(&pool, 1, "message_read", &json!({ "chatId": 5 })).await,
        Err(CoreError::Payload(_))
    ));
    Ok(())
}

#[tokio::test]
async fn unknown_rpc_method_is_reported() -> anyhow::Result<()> {
    let pool = seeded_pool().await?;
    let err = rpc::dispatch(&pool, 1, "delete_everything", &json!({}))
        .await
        .expect_err("unknown method");
    assert!(matches!(err, CoreError::UnknownMethod(ref m) if m == "delete_everything"));
    assert_eq!(err.code(), 104);
    Ok(())
}

#[tokio::test]
async fn unread_count_store_failure_is_internal() -> anyhow::Result<()> {
    let pool = chatline_db::create_pool("sqlite::memory:", 1).await?;
    let err = rpc::dispatch(&pool, 1, "check_for_new_messages", &json!(null))
        .await
        .expect_err("store has no tables");
    assert!(matches!(err, CoreError::Database(_)));
    assert_eq!(err.code(), 100);
    assert_eq!(err.client_message(), "internal error");
    Ok(())
}

#[tokio::test]
async fn participant_store_failure_denies_message_read() -> anyhow::Result<()> {
    let pool = seeded_pool().await?;
    sqlx::query("DROP TABLE chat_participants").execute(&pool).await?;
    let payload = json!({ "chatId": 5, "messageId": 42 });
    let err = rpc::dispatch(&pool, 1, "message_read", &payload)
        .await
        .expect_err("participant lookup fails");
    assert!(matches!(err, CoreError::NotParticipant));
    assert_eq!(err.code(), 103);
    assert_eq!(err.client_message(), "not authorized");
    assert_eq!(
        chatline_db::message_reads::count_message_reads(&pool, 42, 1, 5).await?,
        0
    );
    Ok(())
}
