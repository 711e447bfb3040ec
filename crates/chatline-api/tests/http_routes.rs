use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use chatline_core::broker::BrokerConfig;
use chatline_core::{AppConfig, Gateway};
use serde_json::{json, Value};
use tower::ServiceExt;

struct TestContext {
    app: Router,
    _gateway: Gateway,
}

impl TestContext {
    async fn new(config: AppConfig) -> anyhow::Result<Self> {
        let db = chatline_db::create_pool("sqlite::memory:", 1).await?;
        chatline_db::run_migrations(&db).await?;
        sqlx::query("INSERT INTO chat_participants (chat_id, user_id) VALUES ($1, $2)")
            .bind(5_i64)
            .bind(1_i64)
            .execute(&db)
            .await?;
        sqlx::query("INSERT INTO messages (id, chat_id, owner_id) VALUES ($1, $2, $3)")
            .bind(42_i64)
            .bind(5_i64)
            .bind(2_i64)
            .execute(&db)
            .await?;

        let gateway = Gateway::start(config, &BrokerConfig::default(), db).await?;
        let state = gateway.state();
        let app = chatline_api::build_router(&state).with_state(state);
        Ok(Self {
            app,
            _gateway: gateway,
        })
    }

    async fn get(&self, path: &str, user_id: Option<i64>) -> anyhow::Result<(StatusCode, Value)> {
        let mut builder = Request::builder().uri(path);
        if let Some(user_id) = user_id {
            builder = builder
                .header("x-auth-userid", user_id.to_string())
                .header("x-auth-username", format!("user{user_id}"))
                .header("x-auth-expiresin", "2030-01-01T00:00:00Z");
        }
        let response = self.app.clone().oneshot(builder.body(Body::empty())?).await?;
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await?;
        let payload = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body)?
        };
        Ok((status, payload))
    }
}

#[tokio::test]
async fn health_reports_connections() -> anyhow::Result<()> {
    let ctx = TestContext::new(AppConfig::default()).await?;
    let (status, body) = ctx.get("/health", None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({ "status": "ok", "service": "chatline", "connections": 0 })
    );
    Ok(())
}

#[tokio::test]
async fn missing_credential_is_rejected() -> anyhow::Result<()> {
    let ctx = TestContext::new(AppConfig::default()).await?;
    let (status, body) = ctx.get("/api/chat/unread-messages", None).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, json!({ "status": "unauthorized" }));
    Ok(())
}

#[tokio::test]
async fn unread_count_for_authenticated_user() -> anyhow::Result<()> {
    let ctx = TestContext::new(AppConfig::default()).await?;
    let (status, body) = ctx.get("/api/chat/unread-messages", Some(1)).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "allUnreadMessages": 1 }));

    let (status, body) = ctx.get("/api/chat/unread-messages", Some(7)).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "allUnreadMessages": 0 }));
    Ok(())
}

#[tokio::test]
async fn whitelisted_request_reaches_handler_without_identity() -> anyhow::Result<()> {
    let ctx = TestContext::new(AppConfig {
        auth_exclude: vec!["^/api/chat/unread-messages".to_string()],
        ..AppConfig::default()
    })
    .await?;
    // The middleware lets it through, the handler still needs a user.
    let (status, body) = ctx.get("/api/chat/unread-messages", None).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");
    Ok(())
}
