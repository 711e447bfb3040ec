use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{Client, IntoConnectionInfo, RedisResult, Script};
use chatline_models::gateway::{Publication, StreamPosition};
use chatline_models::presence::ClientInfo;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;

use super::{new_epoch, Broker, BrokerError, PublishOptions, Recovery};
use crate::hub::{ChannelEvent, Hub};

const PUBLISH_SCRIPT: &str = r#"
local epoch = redis.call("hget", KEYS[2], "e")
if epoch == false then
  epoch = ARGV[6]
  redis.call("hset", KEYS[2], "e", epoch)
end
local offset = redis.call("hincrby", KEYS[2], "s", 1)
redis.call("expire", KEYS[2], ARGV[4])
local entry = offset .. ":" .. ARGV[1]
redis.call("lpush", KEYS[1], entry)
redis.call("ltrim", KEYS[1], 0, ARGV[2] - 1)
redis.call("expire", KEYS[1], ARGV[3])
redis.call("publish", ARGV[5], "p:" .. entry)
return {offset, epoch}
"#;

const STREAM_SCRIPT: &str = r#"
local epoch = redis.call("hget", KEYS[2], "e")
if epoch == false then
  epoch = ARGV[2]
  redis.call("hset", KEYS[2], "e", epoch)
  redis.call("expire", KEYS[2], ARGV[1])
end
local top = redis.call("hget", KEYS[2], "s")
if top == false then
  top = "0"
end
local entries = {}
if ARGV[3] == "1" then
  entries = redis.call("lrange", KEYS[1], 0, -1)
end
return {top, epoch, entries}
"#;

const PRESENCE_SCRIPT: &str = r#"
local expired = redis.call("zrangebyscore", KEYS[1], "0", ARGV[1])
for i = 1, #expired do
  redis.call("hdel", KEYS[2], expired[i])
end
redis.call("zremrangebyscore", KEYS[1], "0", ARGV[1])
return redis.call("hgetall", KEYS[2])
"#;

#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// `host:port` or a full `redis://` URL.
    pub address: String,
    pub password: Option<String>,
    pub db: i64,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:6379".to_string(),
            password: None,
            db: 0,
            connect_timeout: Duration::from_secs(1),
            command_timeout: Duration::from_secs(1),
        }
    }
}

impl RedisConfig {
    pub fn client(&self) -> Result<Client, BrokerError> {
        let url = if self.address.contains("://") {
            self.address.clone()
        } else {
            format!("redis://{}", self.address)
        };
        let mut info = url.as_str().into_connection_info()?;
        info.redis.db = self.db;
        if let Some(password) = self.password.as_ref().filter(|p| !p.is_empty()) {
            info.redis.password = Some(password.clone());
        }
        Ok(Client::open(info)?)
    }
}

/// Body of a stream entry, stored after the `offset:` prefix.
#[derive(Serialize, Deserialize)]
struct EntryBody {
    data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    info: Option<ClientInfo>,
}

fn decode_entry(raw: &str) -> Result<Publication, BrokerError> {
    let (offset, body) = raw
        .split_once(':')
        .ok_or_else(|| BrokerError::Protocol(format!("malformed entry '{raw}'")))?;
    let offset = offset
        .parse::<u64>()
        .map_err(|_| BrokerError::Protocol(format!("bad offset '{offset}'")))?;
    let body: EntryBody = serde_json::from_str(body)?;
    Ok(Publication {
        offset,
        data: body.data,
        info: body.info,
    })
}

/// Pub/sub payloads: `p:<offset>:<json>`, `j:<json>` and `l:<json>`.
fn decode_event(raw: &str) -> Result<ChannelEvent, BrokerError> {
    match raw.split_once(':') {
        Some(("p", entry)) => Ok(ChannelEvent::Publication(decode_entry(entry)?)),
        Some(("j", info)) => Ok(ChannelEvent::Join(serde_json::from_str(info)?)),
        Some(("l", info)) => Ok(ChannelEvent::Leave(serde_json::from_str(info)?)),
        _ => Err(BrokerError::Protocol(format!("unknown event '{raw}'"))),
    }
}

/// Broker shared across gateway instances. Publications travel through Redis
/// pub/sub and come back to the local hub through a pattern subscription.
pub struct RedisBroker {
    conn: ConnectionManager,
    prefix: String,
    presence_ttl: Duration,
    meta_ttl: Duration,
    command_timeout: Duration,
    publish_script: Script,
    stream_script: Script,
    presence_script: Script,
    listener: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl RedisBroker {
    pub async fn connect(
        config: &RedisConfig,
        prefix: &str,
        presence_ttl: Duration,
        meta_ttl: Duration,
        hub: Arc<Hub>,
    ) -> Result<Self, BrokerError> {
        let client = config.client()?;
        let conn = tokio::time::timeout(
            config.connect_timeout,
            ConnectionManager::new(client.clone()),
        )
        .await
        .map_err(|_| BrokerError::Timeout)??;

        let pattern = format!("{prefix}.pub.*");
        let listener = tokio::spawn(listen(client, pattern, format!("{prefix}.pub."), hub));
        tracing::info!(address = %config.address, db = config.db, "redis broker connected");

        Ok(Self {
            conn,
            prefix: prefix.to_string(),
            presence_ttl,
            meta_ttl,
            command_timeout: config.command_timeout,
            publish_script: Script::new(PUBLISH_SCRIPT),
            stream_script: Script::new(STREAM_SCRIPT),
            presence_script: Script::new(PRESENCE_SCRIPT),
            listener: Mutex::new(Some(listener)),
            closed: AtomicBool::new(false),
        })
    }

    async fn run<T, F>(&self, fut: F) -> Result<T, BrokerError>
    where
        F: Future<Output = RedisResult<T>>,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        Ok(tokio::time::timeout(self.command_timeout, fut)
            .await
            .map_err(|_| BrokerError::Timeout)??)
    }

    fn pub_channel(&self, channel: &str) -> String {
        format!("{}.pub.{channel}", self.prefix)
    }

    fn history_key(&self, channel: &str) -> String {
        format!("{}.history.list.{channel}", self.prefix)
    }

    fn meta_key(&self, channel: &str) -> String {
        format!("{}.history.meta.{channel}", self.prefix)
    }

    fn presence_expire_key(&self, channel: &str) -> String {
        format!("{}.presence.expire.{channel}", self.prefix)
    }

    fn presence_data_key(&self, channel: &str) -> String {
        format!("{}.presence.data.{channel}", self.prefix)
    }

    async fn publish_raw(&self, channel: &str, payload: String) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .run(
                ::redis::cmd("PUBLISH")
                    .arg(self.pub_channel(channel))
                    .arg(payload)
                    .query_async(&mut conn),
            )
            .await?;
        Ok(())
    }

    async fn read_stream(
        &self,
        channel: &str,
        with_entries: bool,
    ) -> Result<(StreamPosition, Vec<String>), BrokerError> {
        let mut conn = self.conn.clone();
        let (top, epoch, entries): (u64, String, Vec<String>) = self
            .run(
                self.stream_script
                    .key(self.history_key(channel))
                    .key(self.meta_key(channel))
                    .arg(self.meta_ttl.as_secs())
                    .arg(new_epoch())
                    .arg(if with_entries { "1" } else { "0" })
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok((StreamPosition { offset: top, epoch }, entries))
    }
}

impl Broker for RedisBroker {
    async fn publish(
        &self,
        channel: &str,
        data: &Value,
        opts: &PublishOptions,
    ) -> Result<StreamPosition, BrokerError> {
        let body = serde_json::to_string(&EntryBody {
            data: data.clone(),
            info: opts.info.clone(),
        })?;
        let Some(history) = opts.history else {
            self.publish_raw(channel, format!("p:0:{body}")).await?;
            return Ok(StreamPosition::default());
        };

        let mut conn = self.conn.clone();
        let (offset, epoch): (u64, String) = self
            .run(
                self.publish_script
                    .key(self.history_key(channel))
                    .key(self.meta_key(channel))
                    .arg(body)
                    .arg(history.size.max(1))
                    .arg(history.ttl.as_secs().max(1))
                    .arg(self.meta_ttl.as_secs().max(1))
                    .arg(self.pub_channel(channel))
                    .arg(new_epoch())
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(StreamPosition { offset, epoch })
    }

    async fn publish_join(&self, channel: &str, info: &ClientInfo) -> Result<(), BrokerError> {
        let payload = format!("j:{}", serde_json::to_string(info)?);
        self.publish_raw(channel, payload).await
    }

    async fn publish_leave(&self, channel: &str, info: &ClientInfo) -> Result<(), BrokerError> {
        let payload = format!("l:{}", serde_json::to_string(info)?);
        self.publish_raw(channel, payload).await
    }

    async fn history_since(
        &self,
        channel: &str,
        since: &StreamPosition,
    ) -> Result<Recovery, BrokerError> {
        let (position, entries) = self.read_stream(channel, true).await?;
        // Entries are stored newest first.
        let retained = entries
            .iter()
            .rev()
            .map(|raw| decode_entry(raw))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Recovery::from_stream(since, position, retained))
    }

    async fn stream_top(&self, channel: &str) -> Result<StreamPosition, BrokerError> {
        let (position, _) = self.read_stream(channel, false).await?;
        Ok(position)
    }

    async fn add_presence(
        &self,
        channel: &str,
        client_id: &str,
        info: &ClientInfo,
    ) -> Result<(), BrokerError> {
        let ttl = self.presence_ttl.as_secs().max(1) as i64;
        let expire_at = chrono::Utc::now().timestamp() + ttl;
        let expire_key = self.presence_expire_key(channel);
        let data_key = self.presence_data_key(channel);
        let info = serde_json::to_string(info)?;
        let mut conn = self.conn.clone();
        let _: () = self
            .run(
                ::redis::pipe()
                    .atomic()
                    .zadd(&expire_key, client_id, expire_at)
                    .ignore()
                    .hset(&data_key, client_id, info)
                    .ignore()
                    .expire(&expire_key, ttl)
                    .ignore()
                    .expire(&data_key, ttl)
                    .ignore()
                    .query_async(&mut conn),
            )
            .await?;
        Ok(())
    }

    async fn remove_presence(&self, channel: &str, client_id: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: () = self
            .run(
                ::redis::pipe()
                    .atomic()
                    .hdel(self.presence_data_key(channel), client_id)
                    .ignore()
                    .zrem(self.presence_expire_key(channel), client_id)
                    .ignore()
                    .query_async(&mut conn),
            )
            .await?;
        Ok(())
    }

    async fn presence(&self, channel: &str) -> Result<HashMap<String, ClientInfo>, BrokerError> {
        let mut conn = self.conn.clone();
        let raw: HashMap<String, String> = self
            .run(
                self.presence_script
                    .key(self.presence_expire_key(channel))
                    .key(self.presence_data_key(channel))
                    .arg(chrono::Utc::now().timestamp())
                    .invoke_async(&mut conn),
            )
            .await?;
        raw.into_iter()
            .map(|(client, info)| Ok((client, serde_json::from_str(&info)?)))
            .collect()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::Release);
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(listener) = listener {
            listener.abort();
        }
        tracing::info!("redis broker closed");
        Ok(())
    }
}

/// Forward every message published under the prefix into the local hub,
/// reconnecting after a short pause when the subscription drops.
async fn listen(client: Client, pattern: String, channel_prefix: String, hub: Arc<Hub>) {
    loop {
        match client.get_async_pubsub().await {
            Ok(mut pubsub) => {
                if let Err(err) = pubsub.psubscribe(&pattern).await {
                    tracing::warn!(error = %err, "redis psubscribe failed");
                } else {
                    tracing::debug!(pattern = %pattern, "redis listener subscribed");
                    let mut messages = pubsub.on_message();
                    while let Some(msg) = messages.next().await {
                        let Some(channel) = msg.get_channel_name().strip_prefix(&channel_prefix)
                        else {
                            continue;
                        };
                        let payload: String = match msg.get_payload() {
                            Ok(payload) => payload,
                            Err(err) => {
                                tracing::warn!(channel, error = %err, "unreadable redis payload");
                                continue;
                            }
                        };
                        match decode_event(&payload) {
                            Ok(event) => {
                                hub.deliver(channel, event);
                            }
                            Err(err) => {
                                tracing::warn!(
                                    channel,
                                    error = %err,
                                    "dropping malformed broker event"
                                );
                            }
                        }
                    }
                    tracing::warn!("redis pub/sub stream ended");
                }
            }
            Err(err) => tracing::warn!(error = %err, "redis pub/sub connection failed"),
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}
