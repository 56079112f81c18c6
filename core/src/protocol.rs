/// Push channel frames
///
/// Server frames carry a `type` discriminator; their payload fields are
/// either flat on the frame or nested under `data`/`payload`.
use crate::error::{RealtimeError, Result};
use crate::models::{Message, Notification, RecordId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Dispatch key of a push frame
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Notification,
    NotificationRead,
    Message,
    /// Frame without a `type`
    Default,
    /// Frame with a `type` this client does not model
    Named(String),
}

impl Topic {
    pub fn from_kind(kind: Option<&str>) -> Self {
        match kind {
            None => Topic::Default,
            Some("notification") => Topic::Notification,
            Some("notification_read") => Topic::NotificationRead,
            Some("message") => Topic::Message,
            Some(other) => Topic::Named(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Topic::Notification => "notification",
            Topic::NotificationRead => "notification_read",
            Topic::Message => "message",
            Topic::Default => "default",
            Topic::Named(name) => name,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A server-to-client frame
#[derive(Debug, Clone, PartialEq)]
pub enum PushFrame {
    Notification(Notification),
    /// Another client marked a notification read; `None` means all of them
    NotificationRead { id: Option<RecordId> },
    Message(Message),
    Other { kind: Option<String>, payload: Value },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadWire {
    id: Option<RecordId>,
    notification_id: Option<RecordId>,
    #[serde(rename = "notification_id")]
    notification_id_snake: Option<RecordId>,
}

impl PushFrame {
    /// Parse a text frame from the push channel
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut fields) = value else {
            return Err(RealtimeError::Protocol("push frame is not a JSON object".to_string()));
        };

        let kind = match fields.remove("type") {
            Some(Value::String(kind)) => Some(kind),
            Some(Value::Null) | None => None,
            Some(other) => {
                return Err(RealtimeError::Protocol(format!("invalid frame type: {}", other)));
            }
        };

        let frame = match kind.as_deref() {
            Some("notification") => {
                let payload = take_payload(fields, &["notification"]);
                PushFrame::Notification(serde_json::from_value(payload)?)
            }
            Some("notification_read") => {
                let payload = take_payload(fields, &["notification"]);
                let read: ReadWire = serde_json::from_value(payload)?;
                PushFrame::NotificationRead {
                    id: read.id.or(read.notification_id).or(read.notification_id_snake),
                }
            }
            Some("message") => {
                let payload = take_payload(fields, &["message"]);
                PushFrame::Message(serde_json::from_value(payload)?)
            }
            _ => PushFrame::Other {
                kind,
                payload: take_payload(fields, &[]),
            },
        };
        Ok(frame)
    }

    pub fn topic(&self) -> Topic {
        match self {
            PushFrame::Notification(_) => Topic::Notification,
            PushFrame::NotificationRead { .. } => Topic::NotificationRead,
            PushFrame::Message(_) => Topic::Message,
            PushFrame::Other { kind, .. } => Topic::from_kind(kind.as_deref()),
        }
    }
}

/// Pick the nested payload object if there is one, else the flat fields.
fn take_payload(mut fields: Map<String, Value>, extra_keys: &[&str]) -> Value {
    for key in ["data", "payload"].iter().chain(extra_keys) {
        if matches!(fields.get(*key), Some(Value::Object(_))) {
            if let Some(nested) = fields.remove(*key) {
                return nested;
            }
        }
    }
    Value::Object(fields)
}

/// A client-to-server frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Personal notification channel
    SubscribeNotifications {
        #[serde(rename = "userId")]
        user_id: RecordId,
    },
    Subscribe {
        #[serde(rename = "conversationId")]
        conversation_id: RecordId,
    },
}

impl ClientFrame {
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SenderRole;
    use serde_json::json;

    #[test]
    fn test_flat_notification_frame() {
        let frame = PushFrame::parse(
            r#"{"type":"notification","id":5,"message":"Item matched","read":false,
                "createdAt":"2024-01-01T10:00:00Z","notificationType":"MATCH"}"#,
        )
        .unwrap();
        match frame {
            PushFrame::Notification(n) => {
                assert_eq!(n.id, RecordId::from(5));
                assert_eq!(n.kind.as_deref(), Some("MATCH"));
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_nested_message_frame() {
        let frame = PushFrame::parse(
            r#"{"type":"message","message":{"id":9,"conversationId":3,"senderType":"staff",
                "content":"hi","createdAt":"2024-01-01T10:00:00Z"}}"#,
        )
        .unwrap();
        assert_eq!(frame.topic(), Topic::Message);
        match frame {
            PushFrame::Message(m) => {
                assert_eq!(m.conversation_id, RecordId::from(3));
                assert_eq!(m.sender_role, SenderRole::Staff);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_notification_read_frame() {
        let frame = PushFrame::parse(r#"{"type":"notification_read","notificationId":4}"#).unwrap();
        assert_eq!(frame, PushFrame::NotificationRead { id: Some(RecordId::from(4)) });

        let all = PushFrame::parse(r#"{"type":"notification_read","data":{}}"#).unwrap();
        assert_eq!(all, PushFrame::NotificationRead { id: None });
    }

    #[test]
    fn test_frames_with_both_spellings() {
        let read = PushFrame::parse(
            r#"{"type":"notification_read","notificationId":4,"notification_id":4}"#,
        )
        .unwrap();
        assert_eq!(read, PushFrame::NotificationRead { id: Some(RecordId::from(4)) });

        let pushed = PushFrame::parse(
            r#"{"type":"notification","data":{"notificationId":6,"notification_id":6,
                "content":"Claim approved","created_at":"2024-01-01T10:00:00Z",
                "createdAt":"2024-01-01T10:00:00Z"}}"#,
        )
        .unwrap();
        assert_eq!(pushed.topic(), Topic::Notification);
    }

    #[test]
    fn test_untyped_and_unknown_frames() {
        let untyped = PushFrame::parse(r#"{"hello":"world"}"#).unwrap();
        assert_eq!(untyped.topic(), Topic::Default);

        let unknown = PushFrame::parse(r#"{"type":"typing","conversationId":1}"#).unwrap();
        assert_eq!(unknown.topic(), Topic::Named("typing".to_string()));
    }

    #[test]
    fn test_malformed_frames_are_errors() {
        assert!(PushFrame::parse("not json").is_err());
        assert!(PushFrame::parse("[1,2]").is_err());
        assert!(PushFrame::parse(r#"{"type":"notification","message":"no id"}"#).is_err());
    }

    #[test]
    fn test_client_frames() {
        let sub = ClientFrame::SubscribeNotifications { user_id: RecordId::from(7) };
        let value: Value = serde_json::from_str(&sub.to_text().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "subscribe_notifications", "userId": 7}));

        let conv = ClientFrame::Subscribe { conversation_id: RecordId::from("c-1") };
        let value: Value = serde_json::from_str(&conv.to_text().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "subscribe", "conversationId": "c-1"}));
    }
}
