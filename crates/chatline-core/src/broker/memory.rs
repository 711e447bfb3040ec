use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chatline_models::gateway::{Publication, StreamPosition};
use chatline_models::presence::ClientInfo;
use dashmap::DashMap;
use serde_json::Value;

use super::{new_epoch, Broker, BrokerError, PublishOptions, Recovery};
use crate::hub::{ChannelEvent, Hub};

struct StreamItem {
    publication: Publication,
    expires_at: Instant,
}

struct Stream {
    epoch: String,
    top: u64,
    items: VecDeque<StreamItem>,
    meta_expires_at: Instant,
}

impl Stream {
    fn new(epoch: String, meta_ttl: Duration) -> Self {
        Self {
            epoch,
            top: 0,
            items: VecDeque::new(),
            meta_expires_at: Instant::now() + meta_ttl,
        }
    }

    /// Drop expired items; a stream whose metadata expired starts over with
    /// a fresh epoch.
    fn prune(&mut self, now: Instant, meta_ttl: Duration) {
        if now >= self.meta_expires_at {
            *self = Stream::new(new_epoch(), meta_ttl);
            return;
        }
        while self.items.front().is_some_and(|item| item.expires_at <= now) {
            self.items.pop_front();
        }
    }

    fn position(&self) -> StreamPosition {
        StreamPosition {
            offset: self.top,
            epoch: self.epoch.clone(),
        }
    }
}

struct PresenceEntry {
    info: ClientInfo,
    expires_at: Instant,
}

/// Single-process broker. Streams and presence live in memory and are lost on
/// restart, which shows up to clients as an epoch change.
pub struct MemoryBroker {
    hub: Arc<Hub>,
    streams: DashMap<String, Arc<Mutex<Stream>>>,
    /// Epoch reported for channels without a stream, and given to the next
    /// stream created. Rotated whenever a sweep evicts a stream.
    base_epoch: Mutex<String>,
    presence: DashMap<String, HashMap<String, PresenceEntry>>,
    presence_ttl: Duration,
    meta_ttl: Duration,
    closed: AtomicBool,
}

impl MemoryBroker {
    pub fn new(hub: Arc<Hub>, presence_ttl: Duration, meta_ttl: Duration) -> Self {
        Self {
            hub,
            streams: DashMap::new(),
            base_epoch: Mutex::new(new_epoch()),
            presence: DashMap::new(),
            presence_ttl,
            meta_ttl,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }

    fn base_epoch(&self) -> String {
        self.base_epoch
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn stream(&self, channel: &str) -> Arc<Mutex<Stream>> {
        self.streams
            .entry(channel.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Stream::new(self.base_epoch(), self.meta_ttl))))
            .clone()
    }

    /// Existing stream only; reads never create one.
    fn existing_stream(&self, channel: &str) -> Option<Arc<Mutex<Stream>>> {
        self.streams.get(channel).map(|entry| entry.value().clone())
    }

    fn empty_position(&self) -> StreamPosition {
        StreamPosition {
            offset: 0,
            epoch: self.base_epoch(),
        }
    }

    fn lock_stream(stream: &Mutex<Stream>) -> MutexGuard<'_, Stream> {
        stream.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn num_streams(&self) -> usize {
        self.streams.len()
    }

    pub fn num_presence_channels(&self) -> usize {
        self.presence.len()
    }

    /// Evict streams whose metadata expired and presence entries past their
    /// TTL, dropping channels left empty.
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        let mut evicted = 0usize;
        self.streams.retain(|_, stream| {
            let mut stream = Self::lock_stream(stream);
            if now >= stream.meta_expires_at {
                evicted += 1;
                return false;
            }
            stream.prune(now, self.meta_ttl);
            true
        });
        if evicted > 0 {
            // Recreated streams must not reuse the epoch of an evicted one.
            *self
                .base_epoch
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = new_epoch();
        }

        let before = self.presence.len();
        self.presence.retain(|_, entries| {
            entries.retain(|_, entry| entry.expires_at > now);
            !entries.is_empty()
        });
        tracing::trace!(
            evicted_streams = evicted,
            dropped_presence_channels = before.saturating_sub(self.presence.len()),
            "memory broker sweep"
        );
    }
}

impl Broker for MemoryBroker {
    async fn publish(
        &self,
        channel: &str,
        data: &Value,
        opts: &PublishOptions,
    ) -> Result<StreamPosition, BrokerError> {
        self.ensure_open()?;
        let Some(history) = opts.history else {
            self.hub.deliver(
                channel,
                ChannelEvent::Publication(Publication {
                    offset: 0,
                    data: data.clone(),
                    info: opts.info.clone(),
                }),
            );
            return Ok(StreamPosition::default());
        };

        let stream = self.stream(channel);
        let mut stream = Self::lock_stream(&stream);
        let now = Instant::now();
        stream.prune(now, self.meta_ttl);
        stream.top += 1;
        stream.meta_expires_at = now + self.meta_ttl;
        let publication = Publication {
            offset: stream.top,
            data: data.clone(),
            info: opts.info.clone(),
        };
        stream.items.push_back(StreamItem {
            publication: publication.clone(),
            expires_at: now + history.ttl,
        });
        while stream.items.len() > history.size {
            stream.items.pop_front();
        }
        // Deliver under the stream lock so subscribers see offsets in order.
        self.hub
            .deliver(channel, ChannelEvent::Publication(publication));
        Ok(stream.position())
    }

    async fn publish_join(&self, channel: &str, info: &ClientInfo) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.hub.deliver(channel, ChannelEvent::Join(info.clone()));
        Ok(())
    }

    async fn publish_leave(&self, channel: &str, info: &ClientInfo) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.hub.deliver(channel, ChannelEvent::Leave(info.clone()));
        Ok(())
    }

    async fn history_since(
        &self,
        channel: &str,
        since: &StreamPosition,
    ) -> Result<Recovery, BrokerError> {
        self.ensure_open()?;
        let Some(stream) = self.existing_stream(channel) else {
            return Ok(Recovery::from_stream(since, self.empty_position(), Vec::new()));
        };
        let mut stream = Self::lock_stream(&stream);
        stream.prune(Instant::now(), self.meta_ttl);
        let retained = stream
            .items
            .iter()
            .map(|item| item.publication.clone())
            .collect();
        Ok(Recovery::from_stream(since, stream.position(), retained))
    }

    async fn stream_top(&self, channel: &str) -> Result<StreamPosition, BrokerError> {
        self.ensure_open()?;
        let Some(stream) = self.existing_stream(channel) else {
            return Ok(self.empty_position());
        };
        let mut stream = Self::lock_stream(&stream);
        stream.prune(Instant::now(), self.meta_ttl);
        Ok(stream.position())
    }

    async fn add_presence(
        &self,
        channel: &str,
        client_id: &str,
        info: &ClientInfo,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.presence.entry(channel.to_string()).or_default().insert(
            client_id.to_string(),
            PresenceEntry {
                info: info.clone(),
                expires_at: Instant::now() + self.presence_ttl,
            },
        );
        Ok(())
    }

    async fn remove_presence(&self, channel: &str, client_id: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        if let Some(mut entries) = self.presence.get_mut(channel) {
            entries.remove(client_id);
        }
        self.presence.remove_if(channel, |_, entries| entries.is_empty());
        Ok(())
    }

    async fn presence(&self, channel: &str) -> Result<HashMap<String, ClientInfo>, BrokerError> {
        self.ensure_open()?;
        let now = Instant::now();
        let live = {
            let Some(mut entries) = self.presence.get_mut(channel) else {
                return Ok(HashMap::new());
            };
            entries.retain(|_, entry| entry.expires_at > now);
            entries
                .iter()
                .map(|(client, entry)| (client.clone(), entry.info.clone()))
                .collect::<HashMap<_, _>>()
        };
        if live.is_empty() {
            self.presence.remove_if(channel, |_, entries| entries.is_empty());
        }
        Ok(live)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::Release);
        self.streams.clear();
        self.presence.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::HistoryOptions;
    use crate::hub::SessionSink;
    use serde_json::json;

    fn broker() -> (Arc<Hub>, MemoryBroker) {
        let hub = Arc::new(Hub::new());
        let broker =
            MemoryBroker::new(hub.clone(), Duration::from_secs(60), Duration::from_secs(3600));
        (hub, broker)
    }

    fn with_history(size: usize) -> PublishOptions {
        PublishOptions {
            history: Some(HistoryOptions {
                size,
                ttl: Duration::from_secs(60),
            }),
            info: None,
        }
    }

    fn info(user: &str, client: &str) -> ClientInfo {
        ClientInfo {
            user: user.to_string(),
            client: client.to_string(),
            conn_info: None,
        }
    }

    #[tokio::test]
    async fn publish_assigns_sequential_offsets_and_fans_out() {
        let (hub, broker) = broker();
        let (sink, mut queue) = SessionSink::channel(8);
        hub.subscribe("chat_messages:5", "s1", sink);

        let first = broker
            .publish("chat_messages:5", &json!({ "n": 1 }), &with_history(10))
            .await
            .expect("publish");
        let second = broker
            .publish("chat_messages:5", &json!({ "n": 2 }), &with_history(10))
            .await
            .expect("publish");
        assert_eq!(first.offset, 1);
        assert_eq!(second.offset, 2);
        assert_eq!(first.epoch, second.epoch);

        for expected in [1, 2] {
            let delivery = queue.deliveries.recv().await.expect("delivery");
            match &delivery.event {
                ChannelEvent::Publication(p) => assert_eq!(p.offset, expected),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn history_is_bounded_and_recoverable() {
        let (_hub, broker) = broker();
        for n in 1..=5 {
            broker
                .publish("chat_messages:5", &json!({ "n": n }), &with_history(3))
                .await
                .expect("publish");
        }
        let top = broker.stream_top("chat_messages:5").await.expect("top");
        assert_eq!(top.offset, 5);

        let recent = StreamPosition {
            offset: 3,
            epoch: top.epoch.clone(),
        };
        let recovery = broker
            .history_since("chat_messages:5", &recent)
            .await
            .expect("history");
        assert!(recovery.recovered);
        assert_eq!(
            recovery.publications.iter().map(|p| p.offset).collect::<Vec<_>>(),
            vec![4, 5]
        );

        let stale = StreamPosition {
            offset: 1,
            epoch: top.epoch,
        };
        let recovery = broker
            .history_since("chat_messages:5", &stale)
            .await
            .expect("history");
        assert!(!recovery.recovered);
    }

    #[tokio::test]
    async fn publish_without_history_is_not_retained() {
        let (_hub, broker) = broker();
        let position = broker
            .publish("personal:1", &json!({}), &PublishOptions::default())
            .await
            .expect("publish");
        assert_eq!(position, StreamPosition::default());
        assert_eq!(broker.stream_top("personal:1").await.expect("top").offset, 0);
    }

    #[tokio::test]
    async fn presence_tracks_clients_and_users() {
        let (_hub, broker) = broker();
        broker.add_presence("chat_messages:5", "a", &info("1", "a")).await.expect("add");
        broker.add_presence("chat_messages:5", "b", &info("1", "b")).await.expect("add");
        broker.add_presence("chat_messages:5", "c", &info("2", "c")).await.expect("add");

        let stats = broker.presence_stats("chat_messages:5").await.expect("stats");
        assert_eq!((stats.num_clients, stats.num_users), (3, 2));

        broker.remove_presence("chat_messages:5", "a").await.expect("remove");
        let entries = broker.presence("chat_messages:5").await.expect("presence");
        assert_eq!(entries.len(), 2);
        assert!(!entries.contains_key("a"));
    }

    #[tokio::test]
    async fn expired_presence_is_dropped() {
        let hub = Arc::new(Hub::new());
        let broker = MemoryBroker::new(hub, Duration::from_millis(10), Duration::from_secs(60));
        broker.add_presence("chat_messages:5", "a", &info("1", "a")).await.expect("add");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(broker.presence("chat_messages:5").await.expect("presence").is_empty());
    }

    #[tokio::test]
    async fn reads_do_not_create_streams() {
        let (_hub, broker) = broker();
        let top = broker.stream_top("personal:1").await.expect("top");
        assert_eq!(top.offset, 0);
        let recovery = broker.history_since("personal:1", &top).await.expect("history");
        assert!(recovery.recovered);
        assert_eq!(broker.num_streams(), 0);

        // The first publication keeps the epoch handed out before it.
        let position = broker
            .publish("personal:1", &json!({}), &with_history(10))
            .await
            .expect("publish");
        assert_eq!(position.epoch, top.epoch);
        assert_eq!(broker.num_streams(), 1);
    }

    #[tokio::test]
    async fn sweep_evicts_expired_streams_and_presence() {
        let hub = Arc::new(Hub::new());
        let broker = MemoryBroker::new(hub, Duration::from_millis(10), Duration::from_millis(10));
        for n in 0..100 {
            let channel = format!("chat_messages:{n}");
            broker.publish(&channel, &json!({}), &with_history(10)).await.expect("publish");
            broker.add_presence(&channel, "a", &info("1", "a")).await.expect("add");
        }
        let old_epoch = broker.stream_top("chat_messages:0").await.expect("top").epoch;
        assert_eq!(broker.num_streams(), 100);
        assert_eq!(broker.num_presence_channels(), 100);

        tokio::time::sleep(Duration::from_millis(50)).await;
        broker.sweep_expired();
        assert_eq!(broker.num_streams(), 0);
        assert_eq!(broker.num_presence_channels(), 0);

        let fresh = broker.stream_top("chat_messages:0").await.expect("top");
        assert_eq!(fresh.offset, 0);
        assert_ne!(fresh.epoch, old_epoch);
    }

    #[tokio::test]
    async fn empty_presence_channel_is_dropped_on_read() {
        let hub = Arc::new(Hub::new());
        let broker = MemoryBroker::new(hub, Duration::from_millis(10), Duration::from_secs(60));
        broker.add_presence("chat_messages:5", "a", &info("1", "a")).await.expect("add");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(broker.presence("chat_messages:5").await.expect("presence").is_empty());
        assert_eq!(broker.num_presence_channels(), 0);
    }

    #[tokio::test]
    async fn closed_broker_rejects_operations() {
        let (_hub, broker) = broker();
        broker.close().await.expect("close");
        assert!(matches!(
            broker.publish("personal:1", &json!({}), &PublishOptions::default()).await,
            Err(BrokerError::Closed)
        ));
    }
}
