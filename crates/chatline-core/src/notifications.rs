use std::sync::Arc;

use chatline_models::channel::Channel;
use chatline_models::envelope::{
    Notification, NOTIFICATION_CHAT_CREATED, NOTIFICATION_MESSAGE_CREATED,
};
use serde::Serialize;
use serde_json::Value;

use crate::broker::{BrokerBackend, PublishOptions};

/// Server-side publisher used by services that create chats and messages.
/// Publications are fire-and-forget: failures are logged, never retried.
#[derive(Clone)]
pub struct NotificationPublisher {
    broker: Arc<BrokerBackend>,
}

impl NotificationPublisher {
    pub fn new(broker: Arc<BrokerBackend>) -> Self {
        Self { broker }
    }

    pub async fn publish(&self, channel: &str, payload: &Value) {
        if let Err(err) = self
            .broker
            .publish(channel, payload, &PublishOptions::default())
            .await
        {
            tracing::warn!(channel, error = %err, "notification publish failed");
        }
    }

    pub async fn notify_chat_created<T: Serialize>(&self, participant_ids: &[i64], chat: &T) {
        let Some(payload) = notification_value(NOTIFICATION_CHAT_CREATED, chat) else {
            return;
        };
        for user_id in participant_ids {
            self.publish(&Channel::personal(*user_id).name(), &payload).await;
        }
    }

    pub async fn notify_message_created<T: Serialize>(&self, chat_id: i64, message: &T) {
        let Some(payload) = notification_value(NOTIFICATION_MESSAGE_CREATED, message) else {
            return;
        };
        self.publish(&Channel::chat_messages(chat_id).name(), &payload)
            .await;
    }
}

fn notification_value<T: Serialize>(event_type: &str, payload: &T) -> Option<Value> {
    let notification = Notification {
        payload,
        event_type: event_type.to_string(),
    };
    match serde_json::to_value(&notification) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(event_type, error = %err, "notification not serializable");
            None
        }
    }
}
