use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Identity asserted by the authenticating proxy in front of the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub user_id: i64,
    pub login: String,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(user_id: i64, login: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            user_id,
            login: login.into(),
            expires_at,
        }
    }

    /// Opaque connection info attached to presence entries and publications.
    pub fn info(&self) -> Value {
        json!({ "login": self.login })
    }
}
