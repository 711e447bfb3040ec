pub mod authorization;
pub mod broker;
pub mod credentials;
pub mod enrichment;
pub mod error;
pub mod hub;
pub mod lifecycle;
pub mod limits;
pub mod notifications;
pub mod presence;
pub mod rpc;

use std::sync::Arc;
use std::time::Duration;

use chatline_db::DbPool;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use broker::{BrokerBackend, HistoryOptions};
use credentials::CredentialExtractor;
use hub::Hub;
use limits::{CommandRateLimiter, ConnectionRegistry};

pub use error::CoreError;
pub use lifecycle::Gateway;

pub const SERVICE_NAME: &str = "chatline";

#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Connection lifetime granted at connect and by each refresh.
    pub session_ttl: Duration,
    /// Lifetime of a client subscription, extended by sub-refresh.
    pub subscription_ttl: Duration,
    pub heartbeat_interval: Duration,
    /// The connection is dropped when no heartbeat arrives within this window.
    pub heartbeat_timeout: Duration,
    pub presence_ttl: Duration,
    pub history_size: usize,
    pub history_ttl: Duration,
    pub outbound_queue_size: usize,
    pub max_connections: usize,
    pub max_connections_per_user: usize,
    pub max_commands_per_minute: u32,
    /// URI patterns that skip credential extraction.
    pub auth_exclude: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(600),
            subscription_ttl: Duration::from_secs(600),
            heartbeat_interval: Duration::from_secs(25),
            heartbeat_timeout: Duration::from_secs(60),
            presence_ttl: Duration::from_secs(60),
            history_size: 300,
            history_ttl: Duration::from_secs(60),
            outbound_queue_size: 256,
            max_connections: 10_000,
            max_connections_per_user: 16,
            max_commands_per_minute: 240,
            auth_exclude: Vec::new(),
        }
    }
}

impl AppConfig {
    pub fn history(&self) -> HistoryOptions {
        HistoryOptions {
            size: self.history_size,
            ttl: self.history_ttl,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub broker: Arc<BrokerBackend>,
    /// Local fan-out of broker deliveries to subscribed sessions.
    pub hub: Arc<Hub>,
    pub config: AppConfig,
    pub credentials: Arc<CredentialExtractor>,
    pub connections: Arc<ConnectionRegistry>,
    pub rate_limits: Arc<CommandRateLimiter>,
    /// Cancelled when the gateway starts shutting down.
    pub shutdown: CancellationToken,
    /// Tracks live connection tasks so shutdown can wait for them.
    pub sessions: TaskTracker,
}
