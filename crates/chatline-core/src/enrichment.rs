use chatline_models::envelope::{EnvelopeMetadata, InboundEnvelope, MessageEnvelope};
use chatline_models::gateway::StreamPosition;
use chatline_models::presence::ClientInfo;
use serde::Deserialize;
use serde_json::Value;

use crate::broker::{BrokerBackend, HistoryOptions, PublishOptions};
use crate::error::CoreError;

/// Replace whatever metadata the client sent with the session's identity.
pub fn enrich(data: &Value, user_id: i64, client_id: &str) -> Result<MessageEnvelope, CoreError> {
    let inbound = InboundEnvelope::deserialize(data)
        .map_err(|err| CoreError::Payload(format!("invalid publication: {err}")))?;
    Ok(MessageEnvelope {
        payload: inbound.payload,
        metadata: EnvelopeMetadata {
            originator_user_id: user_id.to_string(),
            originator_client_id: client_id.to_string(),
        },
    })
}

/// Enrich a client publication and hand it to the broker with history.
pub async fn publish_enriched(
    broker: &BrokerBackend,
    history: HistoryOptions,
    channel: &str,
    data: &Value,
    info: &ClientInfo,
) -> Result<StreamPosition, CoreError> {
    let user_id: i64 = info
        .user
        .parse()
        .map_err(|_| CoreError::Payload(format!("invalid publisher '{}'", info.user)))?;
    let envelope = enrich(data, user_id, &info.client)?;
    let data = serde_json::to_value(&envelope)
        .map_err(|err| CoreError::Payload(format!("unencodable publication: {err}")))?;
    let opts = PublishOptions {
        history: Some(history),
        info: Some(info.clone()),
    };
    match broker.publish(channel, &data, &opts).await {
        Ok(position) => Ok(position),
        Err(err) => {
            tracing::error!(
                channel,
                user_id,
                session_id = %info.client,
                error = %err,
                "publish failed"
            );
            Err(err.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_metadata_is_replaced() {
        let envelope = enrich(
            &json!({
                "payload": { "text": "hi" },
                "metadata": { "originatorUserId": "999", "originatorClientId": "forged" }
            }),
            1,
            "session-a",
        )
        .expect("enrich");
        assert_eq!(envelope.metadata.originator_user_id, "1");
        assert_eq!(envelope.metadata.originator_client_id, "session-a");
        assert_eq!(
            serde_json::to_value(&envelope).expect("serialize"),
            json!({
                "payload": { "text": "hi" },
                "metadata": { "originatorUserId": "1", "originatorClientId": "session-a" }
            })
        );
    }

    #[test]
    fn null_or_missing_payload_is_allowed() {
        assert!(enrich(&json!({}), 1, "s").expect("empty").payload.is_none());
        assert!(enrich(&json!({ "payload": null }), 1, "s").expect("null").payload.is_none());
    }

    #[test]
    fn malformed_publications_are_payload_errors() {
        for data in [json!("text"), json!([1, 2]), json!({ "payload": "text" }), Value::Null] {
            let err = enrich(&data, 1, "s").expect_err("should fail");
            assert!(matches!(err, CoreError::Payload(_)), "{data}");
        }
    }
}
