use std::collections::HashMap;
use std::time::Duration;

use chatline_core::authorization::SubscribeOptions;
use chatline_models::credential::Credential;
use chatline_models::presence::ClientInfo;
use chrono::{DateTime, Utc};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct Subscription {
    pub options: SubscribeOptions,
    /// `None` for server-side subscriptions, which live as long as the
    /// connection.
    pub expires_at: Option<Instant>,
}

pub struct ConnectionSession {
    pub session_id: String,
    pub credential: Option<Credential>,
    pub state: ConnectionState,
    expires_at: Option<DateTime<Utc>>,
    deadline: Option<Instant>,
    subscriptions: HashMap<String, Subscription>,
}

impl ConnectionSession {
    /// Anonymous sessions never expire; authenticated ones live for `ttl`
    /// unless refreshed.
    pub fn new(credential: Option<Credential>, ttl: Duration) -> Self {
        let mut session = Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            credential,
            state: ConnectionState::Connecting,
            expires_at: None,
            deadline: None,
            subscriptions: HashMap::new(),
        };
        if session.credential.is_some() {
            session.refresh(ttl);
        }
        session
    }

    pub fn user_id(&self) -> Option<i64> {
        self.credential.as_ref().map(|c| c.user_id)
    }

    pub fn client_info(&self) -> Option<ClientInfo> {
        self.credential.as_ref().map(|c| ClientInfo {
            user: c.user_id.to_string(),
            client: self.session_id.clone(),
            conn_info: Some(c.info()),
        })
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Push the connection expiry to `now + ttl`, credential included.
    pub fn refresh(&mut self, ttl: Duration) -> Option<DateTime<Utc>> {
        let credential = self.credential.as_mut()?;
        let expires_at = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();
        credential.expires_at = expires_at;
        self.expires_at = Some(expires_at);
        self.deadline = Some(Instant::now() + ttl);
        self.expires_at
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.subscriptions.contains_key(channel)
    }

    pub fn subscription(&self, channel: &str) -> Option<&Subscription> {
        self.subscriptions.get(channel)
    }

    /// Returns false, changing nothing, when the channel is already subscribed.
    pub fn add_subscription(
        &mut self,
        channel: &str,
        options: SubscribeOptions,
        ttl: Option<Duration>,
    ) -> bool {
        if self.subscriptions.contains_key(channel) {
            return false;
        }
        self.subscriptions.insert(
            channel.to_string(),
            Subscription {
                options,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        true
    }

    pub fn remove_subscription(&mut self, channel: &str) -> Option<Subscription> {
        self.subscriptions.remove(channel)
    }

    pub fn refresh_subscription(&mut self, channel: &str, ttl: Duration) -> bool {
        match self.subscriptions.get_mut(channel) {
            Some(sub) => {
                if sub.expires_at.is_some() {
                    sub.expires_at = Some(Instant::now() + ttl);
                }
                true
            }
            None => false,
        }
    }

    pub fn expired_subscriptions(&self, now: Instant) -> Vec<String> {
        self.subscriptions
            .iter()
            .filter(|(_, sub)| sub.expires_at.is_some_and(|at| at <= now))
            .map(|(channel, _)| channel.clone())
            .collect()
    }

    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.subscriptions.keys().map(String::as_str)
    }

    pub fn channels_with(&self, wanted: impl Fn(&SubscribeOptions) -> bool) -> Vec<String> {
        self.subscriptions
            .iter()
            .filter(|(_, sub)| wanted(&sub.options))
            .map(|(channel, _)| channel.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential() -> Credential {
        Credential::new(1, "nikita", Utc::now())
    }

    #[test]
    fn anonymous_sessions_have_no_expiry() {
        let session = ConnectionSession::new(None, Duration::from_secs(600));
        assert!(session.user_id().is_none());
        assert!(session.client_info().is_none());
        assert!(session.expires_at().is_none());
        assert!(session.deadline().is_none());
        assert_eq!(session.state, ConnectionState::Connecting);
    }

    #[test]
    fn refresh_extends_connection_and_credential() {
        let mut session = ConnectionSession::new(Some(credential()), Duration::from_secs(1));
        let before = session.expires_at().expect("expiry");
        let after = session.refresh(Duration::from_secs(600)).expect("refreshed");
        assert!(after > before);
        assert_eq!(session.credential.as_ref().map(|c| c.expires_at), Some(after));
        let info = session.client_info().expect("info");
        assert_eq!(info.user, "1");
        assert_eq!(info.client, session.session_id);
    }

    #[test]
    fn duplicate_subscription_changes_nothing() {
        let mut session = ConnectionSession::new(Some(credential()), Duration::from_secs(600));
        assert!(session.add_subscription("chat_messages:5", SubscribeOptions::full(), None));
        assert!(!session.add_subscription(
            "chat_messages:5",
            SubscribeOptions::default(),
            Some(Duration::ZERO)
        ));
        let sub = session.subscription("chat_messages:5").expect("subscribed");
        assert_eq!(sub.options, SubscribeOptions::full());
        assert!(sub.expires_at.is_none());
    }

    #[tokio::test]
    async fn client_subscriptions_expire_unless_refreshed() {
        let mut session = ConnectionSession::new(Some(credential()), Duration::from_secs(600));
        session.add_subscription("personal:1", SubscribeOptions::full(), None);
        session.add_subscription("chat_messages:5", SubscribeOptions::full(), Some(Duration::ZERO));
        session.add_subscription("chat_messages:6", SubscribeOptions::full(), Some(Duration::ZERO));

        assert!(session.refresh_subscription("chat_messages:6", Duration::from_secs(600)));
        assert!(!session.refresh_subscription("chat_messages:7", Duration::from_secs(600)));

        let expired = session.expired_subscriptions(Instant::now());
        assert_eq!(expired, vec!["chat_messages:5".to_string()]);
        assert_eq!(session.channels().count(), 3);
        assert!(session.remove_subscription("chat_messages:5").is_some());
        assert_eq!(session.channels_with(|o| o.join_leave).len(), 2);
    }
}
