use std::collections::HashMap;
use std::sync::Arc;

use chatline_models::gateway::Publication;
use chatline_models::presence::ClientInfo;
use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Publication(Publication),
    Join(ClientInfo),
    Leave(ClientInfo),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub channel: String,
    pub event: ChannelEvent,
}

/// Sending half of a session's outbound queue, registered with the hub for
/// every channel the session subscribes to.
#[derive(Clone)]
pub struct SessionSink {
    tx: mpsc::Sender<Arc<Delivery>>,
    overflow: Arc<Notify>,
}

/// Receiving half, owned by the session's event loop.
pub struct SessionQueue {
    pub deliveries: mpsc::Receiver<Arc<Delivery>>,
    pub overflow: Arc<Notify>,
}

impl SessionSink {
    pub fn channel(capacity: usize) -> (Self, SessionQueue) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let overflow = Arc::new(Notify::new());
        (
            Self {
                tx,
                overflow: overflow.clone(),
            },
            SessionQueue {
                deliveries: rx,
                overflow,
            },
        )
    }

    fn deliver(&self, delivery: Arc<Delivery>) {
        match self.tx.try_send(delivery) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => self.overflow.notify_one(),
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

/// Local fan-out: channel -> subscribed sessions on this instance.
#[derive(Default)]
pub struct Hub {
    channels: DashMap<String, HashMap<String, SessionSink>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the session was already subscribed.
    pub fn subscribe(&self, channel: &str, session_id: &str, sink: SessionSink) -> bool {
        let mut subscribers = self.channels.entry(channel.to_string()).or_default();
        if subscribers.contains_key(session_id) {
            return false;
        }
        subscribers.insert(session_id.to_string(), sink);
        true
    }

    pub fn unsubscribe(&self, channel: &str, session_id: &str) -> bool {
        let removed = match self.channels.get_mut(channel) {
            Some(mut subscribers) => subscribers.remove(session_id).is_some(),
            None => false,
        };
        self.channels.remove_if(channel, |_, subscribers| subscribers.is_empty());
        removed
    }

    pub fn remove_session<'a>(
        &self,
        session_id: &str,
        channels: impl IntoIterator<Item = &'a str>,
    ) {
        for channel in channels {
            self.unsubscribe(channel, session_id);
        }
    }

    pub fn num_subscribers(&self, channel: &str) -> usize {
        self.channels.get(channel).map(|s| s.len()).unwrap_or(0)
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Hand an event to every local subscriber of the channel. Sessions whose
    /// queue is full get their overflow signal fired instead.
    pub fn deliver(&self, channel: &str, event: ChannelEvent) -> usize {
        let Some(subscribers) = self.channels.get(channel) else {
            return 0;
        };
        let delivery = Arc::new(Delivery {
            channel: channel.to_string(),
            event,
        });
        for sink in subscribers.values() {
            sink.deliver(delivery.clone());
        }
        subscribers.len()
    }
}
