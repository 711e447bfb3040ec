use std::fmt;
use std::str::FromStr;

use thiserror::Error;

pub const PERSONAL_CHANNEL_PREFIX: &str = "personal:";
pub const CHAT_MESSAGES_CHANNEL_PREFIX: &str = "chat_messages:";

/// A pub/sub channel the gateway knows how to route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Per-user private channel, subscribed by the server at connect time.
    Personal(i64),
    /// Message stream of a single chat, subscribed by clients.
    ChatMessages(i64),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelParseError {
    #[error("unknown channel '{0}'")]
    Unknown(String),
    #[error("invalid id in channel '{0}'")]
    InvalidId(String),
    #[error("channel '{0}' is subscribed by the server only")]
    ServerSideOnly(String),
}

impl Channel {
    pub fn parse(raw: &str) -> Result<Self, ChannelParseError> {
        if let Some(rest) = raw.strip_prefix(CHAT_MESSAGES_CHANNEL_PREFIX) {
            return parse_id(rest)
                .map(Channel::ChatMessages)
                .ok_or_else(|| ChannelParseError::InvalidId(raw.to_string()));
        }
        if let Some(rest) = raw.strip_prefix(PERSONAL_CHANNEL_PREFIX) {
            return parse_id(rest)
                .map(Channel::Personal)
                .ok_or_else(|| ChannelParseError::InvalidId(raw.to_string()));
        }
        Err(ChannelParseError::Unknown(raw.to_string()))
    }

    pub fn personal(user_id: i64) -> Self {
        Channel::Personal(user_id)
    }

    pub fn chat_messages(chat_id: i64) -> Self {
        Channel::ChatMessages(chat_id)
    }

    pub fn name(&self) -> String {
        self.to_string()
    }

    pub fn is_personal(&self) -> bool {
        matches!(self, Channel::Personal(_))
    }
}

/// Only plain ASCII digits are accepted: no sign, no whitespace, no empty id.
fn parse_id(raw: &str) -> Option<i64> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse::<i64>().ok()
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Personal(id) => write!(f, "{PERSONAL_CHANNEL_PREFIX}{id}"),
            Channel::ChatMessages(id) => write!(f, "{CHAT_MESSAGES_CHANNEL_PREFIX}{id}"),
        }
    }
}

impl FromStr for Channel {
    type Err = ChannelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Channel::parse(s)
    }
}
