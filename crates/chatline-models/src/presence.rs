use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who is behind a publication, presence entry or join/leave event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub user: String,
    pub client: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conn_info: Option<Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceStats {
    pub num_clients: u64,
    pub num_users: u64,
}
