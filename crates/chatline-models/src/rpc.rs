use serde::{Deserialize, Serialize};

pub const RPC_CHECK_FOR_NEW_MESSAGES: &str = "check_for_new_messages";
pub const RPC_MESSAGE_READ: &str = "message_read";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRead {
    pub chat_id: i64,
    pub message_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllUnreadMessages {
    #[serde(rename = "allUnreadMessages")]
    pub all_unread_messages: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_are_camel_case() {
        let read: MessageRead =
            serde_json::from_str(r#"{"chatId":5,"messageId":42}"#).expect("parse");
        assert_eq!(read, MessageRead { chat_id: 5, message_id: 42 });

        let count = serde_json::to_value(AllUnreadMessages { all_unread_messages: 3 })
            .expect("serialize");
        assert_eq!(count, serde_json::json!({ "allUnreadMessages": 3 }));
    }
}
