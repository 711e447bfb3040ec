use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::presence::ClientInfo;

// Client -> Server opcodes
pub const OP_HEARTBEAT: u8 = 1;
pub const OP_SUBSCRIBE: u8 = 2;
pub const OP_UNSUBSCRIBE: u8 = 3;
pub const OP_PUBLISH: u8 = 4;
pub const OP_PRESENCE: u8 = 5;
pub const OP_PRESENCE_STATS: u8 = 6;
pub const OP_RPC: u8 = 7;
pub const OP_REFRESH: u8 = 8;
pub const OP_SUB_REFRESH: u8 = 9;

// Server -> Client opcodes
pub const OP_DISPATCH: u8 = 0;
pub const OP_CONNECTED: u8 = 10;
pub const OP_HEARTBEAT_ACK: u8 = 11;
pub const OP_REPLY: u8 = 12;

// Dispatch event names
pub const EVENT_PUBLICATION: &str = "PUBLICATION";
pub const EVENT_JOIN: &str = "JOIN";
pub const EVENT_LEAVE: &str = "LEAVE";
pub const EVENT_UNSUBSCRIBED: &str = "UNSUBSCRIBED";

// Reply error codes
pub const ERROR_INTERNAL: u32 = 100;
pub const ERROR_UNAUTHORIZED: u32 = 101;
pub const ERROR_PERMISSION_DENIED: u32 = 103;
pub const ERROR_METHOD_NOT_FOUND: u32 = 104;
pub const ERROR_ALREADY_SUBSCRIBED: u32 = 105;
pub const ERROR_LIMIT_EXCEEDED: u32 = 106;
pub const ERROR_BAD_REQUEST: u32 = 107;

// Close codes
pub const CLOSE_USER_CAPACITY: u16 = 1008;
pub const CLOSE_GLOBAL_CAPACITY: u16 = 1013;
pub const CLOSE_SHUTDOWN: u16 = 3001;
pub const CLOSE_EXPIRED: u16 = 3005;
pub const CLOSE_SLOW: u16 = 3008;

/// A frame in either direction. Clients send `id`, `op` and `d`; the server
/// adds `t` on dispatches and `error` on failed replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayMessage {
    pub op: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl GatewayMessage {
    pub fn dispatch(event: &str, d: Value) -> Self {
        Self {
            op: OP_DISPATCH,
            id: None,
            d: Some(d),
            t: Some(event.to_string()),
            error: None,
        }
    }

    pub fn connected(d: Value) -> Self {
        Self {
            op: OP_CONNECTED,
            id: None,
            d: Some(d),
            t: None,
            error: None,
        }
    }

    pub fn heartbeat_ack() -> Self {
        Self {
            op: OP_HEARTBEAT_ACK,
            id: None,
            d: None,
            t: None,
            error: None,
        }
    }

    pub fn reply(id: Option<u64>, d: Value) -> Self {
        Self {
            op: OP_REPLY,
            id,
            d: Some(d),
            t: None,
            error: None,
        }
    }

    pub fn error_reply(id: Option<u64>, code: u32, message: impl Into<String>) -> Self {
        Self {
            op: OP_REPLY,
            id,
            d: None,
            t: None,
            error: Some(ErrorBody {
                code,
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: u32,
    pub message: String,
}

/// Position of a publication inside a channel's history stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamPosition {
    pub offset: u64,
    pub epoch: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Publication {
    pub offset: u64,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<ClientInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelRequest {
    pub channel: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscribeRequest {
    pub channel: String,
    #[serde(default)]
    pub recover: bool,
    #[serde(default)]
    pub offset: Option<u64>,
    #[serde(default)]
    pub epoch: Option<String>,
}

impl SubscribeRequest {
    /// Position the client last saw, when it asked for recovery.
    pub fn recovery_position(&self) -> Option<StreamPosition> {
        if !self.recover {
            return None;
        }
        Some(StreamPosition {
            offset: self.offset.unwrap_or(0),
            epoch: self.epoch.clone().unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublishRequest {
    pub channel: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub data: Value,
}

/// Decoded client command, dispatched by the connection's event loop.
#[derive(Debug, Clone)]
pub enum ClientCommand {
    Heartbeat,
    Subscribe(SubscribeRequest),
    Unsubscribe(ChannelRequest),
    Publish(PublishRequest),
    Presence(ChannelRequest),
    PresenceStats(ChannelRequest),
    Rpc(RpcRequest),
    Refresh,
    SubRefresh(ChannelRequest),
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),
    #[error("invalid command payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
}

impl ClientCommand {
    pub fn decode(op: u8, d: Option<Value>) -> Result<Self, CommandError> {
        let d = d.unwrap_or(Value::Null);
        let command = match op {
            OP_HEARTBEAT => ClientCommand::Heartbeat,
            OP_SUBSCRIBE => ClientCommand::Subscribe(serde_json::from_value(d)?),
            OP_UNSUBSCRIBE => ClientCommand::Unsubscribe(serde_json::from_value(d)?),
            OP_PUBLISH => ClientCommand::Publish(serde_json::from_value(d)?),
            OP_PRESENCE => ClientCommand::Presence(serde_json::from_value(d)?),
            OP_PRESENCE_STATS => ClientCommand::PresenceStats(serde_json::from_value(d)?),
            OP_RPC => ClientCommand::Rpc(serde_json::from_value(d)?),
            OP_REFRESH => ClientCommand::Refresh,
            OP_SUB_REFRESH => ClientCommand::SubRefresh(serde_json::from_value(d)?),
            other => return Err(CommandError::UnknownOpcode(other)),
        };
        Ok(command)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientCommand::Heartbeat => "heartbeat",
            ClientCommand::Subscribe(_) => "subscribe",
            ClientCommand::Unsubscribe(_) => "unsubscribe",
            ClientCommand::Publish(_) => "publish",
            ClientCommand::Presence(_) => "presence",
            ClientCommand::PresenceStats(_) => "presence_stats",
            ClientCommand::Rpc(_) => "rpc",
            ClientCommand::Refresh => "refresh",
            ClientCommand::SubRefresh(_) => "sub_refresh",
        }
    }
}
