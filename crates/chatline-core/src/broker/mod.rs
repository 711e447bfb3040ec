//! Channel broker: publication fan-out, bounded history with recovery, and
//! presence. The in-memory backend serves single-instance deployments and
//! tests; the Redis backend lets several gateway instances share channels.

pub mod memory;
pub mod redis;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chatline_models::gateway::{Publication, StreamPosition};
use chatline_models::presence::{ClientInfo, PresenceStats};
use serde_json::Value;
use thiserror::Error;

use crate::hub::Hub;
pub use self::memory::MemoryBroker;
pub use self::redis::{RedisBroker, RedisConfig};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("payload encoding error: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("broker operation timed out")]
    Timeout,
    #[error("broker is closed")]
    Closed,
    #[error("unexpected broker reply: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryOptions {
    pub size: usize,
    pub ttl: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Retain the publication in the channel stream. Without it the
    /// publication is fanned out with offset 0 and forgotten.
    pub history: Option<HistoryOptions>,
    pub info: Option<ClientInfo>,
}

/// Result of reading a channel stream from a client's last known position.
#[derive(Debug, Clone, PartialEq)]
pub struct Recovery {
    pub publications: Vec<Publication>,
    pub position: StreamPosition,
    /// False when the epoch changed or history no longer covers the gap.
    pub recovered: bool,
}

impl Recovery {
    pub(crate) fn from_stream(
        since: &StreamPosition,
        position: StreamPosition,
        retained: Vec<Publication>,
    ) -> Self {
        if since.epoch != position.epoch {
            return Self {
                publications: Vec::new(),
                position,
                recovered: false,
            };
        }
        let publications: Vec<Publication> = retained
            .into_iter()
            .filter(|p| p.offset > since.offset)
            .collect();
        let recovered = since.offset == position.offset
            || publications
                .first()
                .is_some_and(|p| p.offset == since.offset + 1);
        Self {
            publications,
            position,
            recovered,
        }
    }
}

#[allow(async_fn_in_trait)]
pub trait Broker: Send + Sync {
    async fn publish(
        &self,
        channel: &str,
        data: &Value,
        opts: &PublishOptions,
    ) -> Result<StreamPosition, BrokerError>;
    async fn publish_join(&self, channel: &str, info: &ClientInfo) -> Result<(), BrokerError>;
    async fn publish_leave(&self, channel: &str, info: &ClientInfo) -> Result<(), BrokerError>;
    async fn history_since(
        &self,
        channel: &str,
        since: &StreamPosition,
    ) -> Result<Recovery, BrokerError>;
    async fn stream_top(&self, channel: &str) -> Result<StreamPosition, BrokerError>;
    async fn add_presence(
        &self,
        channel: &str,
        client_id: &str,
        info: &ClientInfo,
    ) -> Result<(), BrokerError>;
    async fn remove_presence(&self, channel: &str, client_id: &str) -> Result<(), BrokerError>;
    async fn presence(&self, channel: &str) -> Result<HashMap<String, ClientInfo>, BrokerError>;
    async fn close(&self) -> Result<(), BrokerError>;

    async fn presence_stats(&self, channel: &str) -> Result<PresenceStats, BrokerError> {
        let entries = self.presence(channel).await?;
        Ok(presence_stats_of(&entries))
    }
}

pub fn presence_stats_of(entries: &HashMap<String, ClientInfo>) -> PresenceStats {
    let users: HashSet<&str> = entries.values().map(|info| info.user.as_str()).collect();
    PresenceStats {
        num_clients: entries.len() as u64,
        num_users: users.len() as u64,
    }
}

/// New stream epoch. Changes whenever a channel's history is lost.
pub(crate) fn new_epoch() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[derive(Debug, Clone)]
pub enum BackendConfig {
    Memory,
    Redis(RedisConfig),
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub backend: BackendConfig,
    /// Key and pub/sub channel prefix for the Redis backend.
    pub prefix: String,
    pub presence_ttl: Duration,
    pub history_meta_ttl: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::Memory,
            prefix: "centrifuge".to_string(),
            presence_ttl: Duration::from_secs(60),
            history_meta_ttl: Duration::from_secs(86_400),
        }
    }
}

/// Concrete broker selected at startup.
pub enum BrokerBackend {
    Memory(MemoryBroker),
    Redis(RedisBroker),
}

impl BrokerBackend {
    pub async fn connect(config: &BrokerConfig, hub: Arc<Hub>) -> Result<Self, BrokerError> {
        match &config.backend {
            BackendConfig::Memory => Ok(BrokerBackend::Memory(MemoryBroker::new(
                hub,
                config.presence_ttl,
                config.history_meta_ttl,
            ))),
            BackendConfig::Redis(redis) => {
                let broker = RedisBroker::connect(
                    redis,
                    &config.prefix,
                    config.presence_ttl,
                    config.history_meta_ttl,
                    hub,
                )
                .await?;
                Ok(BrokerBackend::Redis(broker))
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BrokerBackend::Memory(_) => "memory",
            BrokerBackend::Redis(_) => "redis",
        }
    }

    /// Drop expired in-process state. Redis expires its keys by itself.
    pub fn sweep_expired(&self) {
        match self {
            BrokerBackend::Memory(b) => b.sweep_expired(),
            BrokerBackend::Redis(_) => {}
        }
    }

    pub async fn publish(
        &self,
        channel: &str,
        data: &Value,
        opts: &PublishOptions,
    ) -> Result<StreamPosition, BrokerError> {
        match self {
            BrokerBackend::Memory(b) => b.publish(channel, data, opts).await,
            BrokerBackend::Redis(b) => b.publish(channel, data, opts).await,
        }
    }

    pub async fn publish_join(&self, channel: &str, info: &ClientInfo) -> Result<(), BrokerError> {
        match self {
            BrokerBackend::Memory(b) => b.publish_join(channel, info).await,
            BrokerBackend::Redis(b) => b.publish_join(channel, info).await,
        }
    }

    pub async fn publish_leave(&self, channel: &str, info: &ClientInfo) -> Result<(), BrokerError> {
        match self {
            BrokerBackend::Memory(b) => b.publish_leave(channel, info).await,
            BrokerBackend::Redis(b) => b.publish_leave(channel, info).await,
        }
    }

    pub async fn history_since(
        &self,
        channel: &str,
        since: &StreamPosition,
    ) -> Result<Recovery, BrokerError> {
        match self {
            BrokerBackend::Memory(b) => b.history_since(channel, since).await,
            BrokerBackend::Redis(b) => b.history_since(channel, since).await,
        }
    }

    pub async fn stream_top(&self, channel: &str) -> Result<StreamPosition, BrokerError> {
        match self {
            BrokerBackend::Memory(b) => b.stream_top(channel).await,
            BrokerBackend::Redis(b) => b.stream_top(channel).await,
        }
    }

    pub async fn add_presence(
        &self,
        channel: &str,
        client_id: &str,
        info: &ClientInfo,
    ) -> Result<(), BrokerError> {
        match self {
            BrokerBackend::Memory(b) => b.add_presence(channel, client_id, info).await,
            BrokerBackend::Redis(b) => b.add_presence(channel, client_id, info).await,
        }
    }

    pub async fn remove_presence(&self, channel: &str, client_id: &str) -> Result<(), BrokerError> {
        match self {
            BrokerBackend::Memory(b) => b.remove_presence(channel, client_id).await,
            BrokerBackend::Redis(b) => b.remove_presence(channel, client_id).await,
        }
    }

    pub async fn presence(
        &self,
        channel: &str,
    ) -> Result<HashMap<String, ClientInfo>, BrokerError> {
        match self {
            BrokerBackend::Memory(b) => b.presence(channel).await,
            BrokerBackend::Redis(b) => b.presence(channel).await,
        }
    }

    pub async fn presence_stats(&self, channel: &str) -> Result<PresenceStats, BrokerError> {
        match self {
            BrokerBackend::Memory(b) => b.presence_stats(channel).await,
            BrokerBackend::Redis(b) => b.presence_stats(channel).await,
        }
    }

    pub async fn close(&self) -> Result<(), BrokerError> {
        match self {
            BrokerBackend::Memory(b) => b.close().await,
            BrokerBackend::Redis(b) => b.close().await,
        }
    }
}
