use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chatline_db::DbPool;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::broker::{BrokerBackend, BrokerConfig};
use crate::credentials::CredentialExtractor;
use crate::error::CoreError;
use crate::hub::Hub;
use crate::limits::{CommandRateLimiter, ConnectionRegistry};
use crate::notifications::NotificationPublisher;
use crate::{AppConfig, AppState};

const RATE_LIMIT_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);
const MIN_BROKER_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Owns the gateway's shared state from startup until the broker is closed.
pub struct Gateway {
    state: AppState,
    broker_closed: AtomicBool,
}

impl Gateway {
    pub async fn start(
        config: AppConfig,
        broker_config: &BrokerConfig,
        db: DbPool,
    ) -> Result<Self, CoreError> {
        let credentials = CredentialExtractor::new(&config.auth_exclude)
            .map_err(|err| CoreError::Config(format!("invalid auth exclude pattern: {err}")))?;

        let hub = Arc::new(Hub::new());
        let broker = BrokerBackend::connect(broker_config, hub.clone()).await?;
        tracing::info!(broker = broker.kind(), "broker ready");

        let state = AppState {
            db,
            broker: Arc::new(broker),
            hub,
            connections: Arc::new(ConnectionRegistry::new(
                config.max_connections,
                config.max_connections_per_user,
            )),
            rate_limits: Arc::new(CommandRateLimiter::per_minute(
                config.max_commands_per_minute,
            )),
            credentials: Arc::new(credentials),
            config,
            shutdown: CancellationToken::new(),
            sessions: TaskTracker::new(),
        };

        spawn_rate_limit_cleanup(state.rate_limits.clone(), state.shutdown.clone());
        if matches!(*state.broker, BrokerBackend::Memory(_)) {
            let period = broker_config.presence_ttl.max(MIN_BROKER_SWEEP_INTERVAL);
            spawn_broker_sweep(state.broker.clone(), period, state.shutdown.clone());
        }

        Ok(Self {
            state,
            broker_closed: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    pub fn notifications(&self) -> NotificationPublisher {
        NotificationPublisher::new(self.state.broker.clone())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.shutdown.is_cancelled()
    }

    /// Stop accepting upgrades and tell every session to close.
    pub fn begin_shutdown(&self) {
        if !self.state.shutdown.is_cancelled() {
            tracing::info!(
                connections = self.state.connections.active(),
                "gateway shutting down"
            );
        }
        self.state.shutdown.cancel();
    }

    /// Shut down, wait up to `deadline` for sessions to finish, then close
    /// the broker. Safe to call more than once.
    pub async fn shutdown(&self, deadline: Duration) {
        self.begin_shutdown();
        self.state.sessions.close();
        if tokio::time::timeout(deadline, self.state.sessions.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                remaining = self.state.sessions.len(),
                "sessions did not drain before the shutdown deadline"
            );
        }
        self.close_broker().await;
    }

    async fn close_broker(&self) {
        if self.broker_closed.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.state.broker.close().await {
            Ok(()) => tracing::info!("broker closed"),
            Err(err) => tracing::error!(error = %err, "broker close failed"),
        }
    }
}

fn spawn_rate_limit_cleanup(limiter: Arc<CommandRateLimiter>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(RATE_LIMIT_CLEANUP_INTERVAL);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    limiter.retain_recent();
                    tracing::trace!("rate limiter cleanup: pruned stale entries");
                }
            }
        }
    });
}

fn spawn_broker_sweep(broker: Arc<BrokerBackend>, period: Duration, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => broker.sweep_expired(),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerError;
    use serde_json::json;

    async fn gateway(config: AppConfig) -> anyhow::Result<Gateway> {
        let db = chatline_db::create_pool("sqlite::memory:", 1).await?;
        Ok(Gateway::start(config, &BrokerConfig::default(), db).await?)
    }

    #[tokio::test]
    async fn rejects_invalid_whitelist() -> anyhow::Result<()> {
        let config = AppConfig {
            auth_exclude: vec!["(".to_string()],
            ..AppConfig::default()
        };
        let db = chatline_db::create_pool("sqlite::memory:", 1).await?;
        let result = Gateway::start(config, &BrokerConfig::default(), db).await;
        assert!(matches!(result, Err(CoreError::Config(_))));
        Ok(())
    }

    #[tokio::test]
    async fn memory_broker_is_swept_in_the_background() -> anyhow::Result<()> {
        let db = chatline_db::create_pool("sqlite::memory:", 1).await?;
        let broker_config = BrokerConfig {
            presence_ttl: Duration::from_millis(10),
            ..BrokerConfig::default()
        };
        let gateway = Gateway::start(AppConfig::default(), &broker_config, db).await?;
        let state = gateway.state();
        let info = chatline_models::presence::ClientInfo {
            user: "1".to_string(),
            client: "a".to_string(),
            conn_info: None,
        };
        state.broker.add_presence("chat_messages:5", "a", &info).await?;

        // Sweeps run at least once a second.
        tokio::time::sleep(Duration::from_millis(2_200)).await;
        match &*state.broker {
            BrokerBackend::Memory(memory) => assert_eq!(memory.num_presence_channels(), 0),
            BrokerBackend::Redis(_) => panic!("expected memory broker"),
        }
        gateway.shutdown(Duration::from_millis(10)).await;
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_cancels_sessions_and_closes_broker_once() -> anyhow::Result<()> {
        let gateway = gateway(AppConfig::default()).await?;
        let state = gateway.state();
        let token = state.shutdown.clone();
        state.sessions.spawn(async move {
            token.cancelled().await;
        });

        gateway.shutdown(Duration::from_secs(1)).await;
        assert!(gateway.is_shutting_down());
        assert!(state.sessions.is_empty());
        assert!(matches!(
            state.broker.stream_top("personal:1").await,
            Err(BrokerError::Closed)
        ));

        gateway.shutdown(Duration::from_millis(10)).await;
        gateway.notifications().publish("personal:1", &json!({})).await;
        Ok(())
    }
}
