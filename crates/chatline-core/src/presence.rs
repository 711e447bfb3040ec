use chatline_models::presence::PresenceStats;

use crate::broker::BrokerBackend;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    Subscribe { channel: String },
    Unsubscribe { channel: String },
}

impl SubscriptionEvent {
    pub fn channel(&self) -> &str {
        match self {
            SubscriptionEvent::Subscribe { channel }
            | SubscriptionEvent::Unsubscribe { channel } => channel,
        }
    }

    fn action(&self) -> &'static str {
        match self {
            SubscriptionEvent::Subscribe { .. } => "subscribe",
            SubscriptionEvent::Unsubscribe { .. } => "unsubscribe",
        }
    }
}

/// Log the channel's presence stats after a subscription change. Broker
/// failures are logged and yield `None`; they never fail the subscription.
pub async fn channel_presence_stats(
    broker: &BrokerBackend,
    client_id: &str,
    user_id: i64,
    event: &SubscriptionEvent,
) -> Option<PresenceStats> {
    let channel = event.channel();
    match broker.presence_stats(channel).await {
        Ok(stats) => {
            tracing::info!(
                session_id = %client_id,
                user_id,
                channel,
                action = event.action(),
                num_users = stats.num_users,
                num_clients = stats.num_clients,
                "channel presence"
            );
            Some(stats)
        }
        Err(err) => {
            tracing::warn!(
                session_id = %client_id,
                user_id,
                channel,
                action = event.action(),
                error = %err,
                "presence stats unavailable"
            );
            None
        }
    }
}
