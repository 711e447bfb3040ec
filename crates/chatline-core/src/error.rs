use chatline_models::channel::ChannelParseError;
use chatline_models::gateway::{
    ERROR_ALREADY_SUBSCRIBED, ERROR_BAD_REQUEST, ERROR_INTERNAL, ERROR_LIMIT_EXCEEDED,
    ERROR_METHOD_NOT_FOUND, ERROR_PERMISSION_DENIED, ERROR_UNAUTHORIZED,
};
use thiserror::Error;

use crate::broker::BrokerError;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("authentication required")]
    AuthenticationAbsent,
    #[error(transparent)]
    ChannelParse(#[from] ChannelParseError),
    #[error("permission denied")]
    AuthorizationDenied,
    #[error("not authorized")]
    NotParticipant,
    #[error("bad payload: {0}")]
    Payload(String),
    #[error("broker error: {0}")]
    Backend(#[from] BrokerError),
    #[error("database error: {0}")]
    Database(#[from] chatline_db::DbError),
    #[error("unknown method '{0}'")]
    UnknownMethod(String),
    #[error("already subscribed")]
    AlreadySubscribed,
    #[error("not subscribed")]
    NotSubscribed,
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("operation cancelled")]
    Cancelled,
    #[error("configuration error: {0}")]
    Config(String),
}

impl CoreError {
    /// Reply error code sent to gateway clients.
    pub fn code(&self) -> u32 {
        match self {
            CoreError::AuthenticationAbsent => ERROR_UNAUTHORIZED,
            CoreError::AuthorizationDenied
            | CoreError::NotParticipant
            | CoreError::NotSubscribed => ERROR_PERMISSION_DENIED,
            CoreError::Payload(_) => ERROR_BAD_REQUEST,
            CoreError::UnknownMethod(_) => ERROR_METHOD_NOT_FOUND,
            CoreError::AlreadySubscribed => ERROR_ALREADY_SUBSCRIBED,
            CoreError::RateLimited { .. } => ERROR_LIMIT_EXCEEDED,
            CoreError::ChannelParse(_)
            | CoreError::Backend(_)
            | CoreError::Database(_)
            | CoreError::Cancelled
            | CoreError::Config(_) => ERROR_INTERNAL,
        }
    }

    /// Message shown to clients. Store and broker details stay in the logs.
    pub fn client_message(&self) -> String {
        match self {
            CoreError::Backend(_) | CoreError::Database(_) | CoreError::Config(_) => {
                "internal error".to_string()
            }
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_parse_errors_are_internal_class() {
        let err = CoreError::from(ChannelParseError::Unknown("aux".into()));
        assert_eq!(err.code(), ERROR_INTERNAL);
        assert_eq!(err.client_message(), "unknown channel 'aux'");
    }

    #[test]
    fn store_failures_hide_details() {
        let err = CoreError::Database(sqlx::Error::RowNotFound.into());
        assert_eq!(err.code(), ERROR_INTERNAL);
        assert_eq!(err.client_message(), "internal error");
        assert_eq!(CoreError::NotParticipant.client_message(), "not authorized");
        assert_eq!(CoreError::NotParticipant.code(), ERROR_PERMISSION_DENIED);
    }
}
