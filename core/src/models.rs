/// Notification, conversation and message records
///
/// The backend is inconsistent about field naming: the same record may
/// arrive as camelCase or snake_case, and some fields have two names
/// (`id`/`notificationId`, `read`/`isRead`). Every record is therefore
/// read through a permissive wire struct and normalized into a domain
/// type before it reaches a store.
// TODO: drop the snake_case and alternate-name fields once the backend
// settles on a single serializer for push frames and REST bodies.
use crate::error::{RealtimeError, Result};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

// ─── Identifiers ─────────────────────────────────────────────────────────────

/// Server-assigned identifier. The backend sends numbers for most records
/// but strings are accepted too; numeric ids are written back as numbers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<i64> for RecordId {
    fn from(n: i64) -> Self {
        Self(n.to_string())
    }
}

impl Serialize for RecordId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self.0.parse::<i64>() {
            Ok(n) => serializer.serialize_i64(n),
            Err(_) => serializer.serialize_str(&self.0),
        }
    }
}

impl<'de> Deserialize<'de> for RecordId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(i64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Int(n) => Ok(RecordId(n.to_string())),
            Raw::Text(s) if !s.trim().is_empty() => Ok(RecordId(s)),
            Raw::Text(_) => Err(serde::de::Error::custom("empty identifier")),
        }
    }
}

// ─── Roles ───────────────────────────────────────────────────────────────────

/// Which side of a conversation a participant is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderRole {
    User,
    Staff,
}

impl SenderRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SenderRole::User => "user",
            SenderRole::Staff => "staff",
        }
    }
}

impl fmt::Display for SenderRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SenderRole {
    type Err = RealtimeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(SenderRole::User),
            "staff" | "admin" => Ok(SenderRole::Staff),
            other => Err(RealtimeError::Validation(format!("Unknown sender role: {}", other))),
        }
    }
}

impl<'de> Deserialize<'de> for SenderRole {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// The person looking at the stores
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewer {
    pub id: RecordId,
    pub role: SenderRole,
}

impl Viewer {
    pub fn new(id: impl Into<RecordId>, role: SenderRole) -> Self {
        Self { id: id.into(), role }
    }

    pub fn is_user(&self) -> bool {
        self.role == SenderRole::User
    }
}

// ─── Timestamps ──────────────────────────────────────────────────────────────

const LOCAL_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Parse a backend timestamp.
///
/// Accepts RFC 3339 strings, zone-less ISO date-times (read as UTC), epoch
/// milliseconds and the `[y, m, d, h, min, s, nanos]` arrays some JSON
/// serializers emit for local date-times.
pub fn parse_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            LOCAL_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .map(|naive| Utc.from_utc_datetime(&naive))
        }
        serde_json::Value::Number(n) => n
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        serde_json::Value::Array(parts) => {
            let nums: Vec<i64> = parts.iter().filter_map(|p| p.as_i64()).collect();
            if nums.len() < 3 || nums.len() != parts.len() {
                return None;
            }
            let part = |i: usize| nums.get(i).copied().unwrap_or(0);
            let date = chrono::NaiveDate::from_ymd_opt(part(0) as i32, part(1) as u32, part(2) as u32)?;
            let naive = date.and_hms_nano_opt(part(3) as u32, part(4) as u32, part(5) as u32, part(6) as u32)?;
            Some(Utc.from_utc_datetime(&naive))
        }
        _ => None,
    }
}

fn de_timestamp<'de, D>(deserializer: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    let parsed = raw.as_ref().and_then(parse_timestamp);
    if parsed.is_none() {
        if let Some(raw) = raw.filter(|v| !v.is_null()) {
            debug!("Unparseable timestamp {}, using receipt time", raw);
        }
    }
    Ok(parsed)
}

/// Normalize a list of raw records, skipping the ones that cannot be read.
pub fn normalize_list<T: DeserializeOwned>(values: Vec<serde_json::Value>, what: &str) -> Vec<T> {
    values
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<T>(value) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Skipping malformed {} record: {}", what, e);
                None
            }
        })
        .collect()
}

// ─── Notification ────────────────────────────────────────────────────────────

/// One event directed at a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "NotificationWire")]
pub struct Notification {
    pub id: RecordId,
    pub message: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
    /// Type tag used for click-navigation
    #[serde(rename = "notificationType")]
    pub kind: Option<String>,
    pub related_id: Option<RecordId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotificationWire {
    id: Option<RecordId>,
    notification_id: Option<RecordId>,
    #[serde(rename = "notification_id")]
    notification_id_snake: Option<RecordId>,
    message: Option<String>,
    content: Option<String>,
    read: Option<bool>,
    is_read: Option<bool>,
    #[serde(rename = "is_read")]
    is_read_snake: Option<bool>,
    #[serde(default, deserialize_with = "de_timestamp")]
    created_at: Option<DateTime<Utc>>,
    #[serde(default, rename = "created_at", deserialize_with = "de_timestamp")]
    created_at_snake: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "de_timestamp")]
    timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "type")]
    kind: Option<String>,
    notification_type: Option<String>,
    #[serde(rename = "notification_type")]
    notification_type_snake: Option<String>,
    related_id: Option<RecordId>,
    #[serde(rename = "related_id")]
    related_id_snake: Option<RecordId>,
    related_entity_id: Option<RecordId>,
    #[serde(rename = "related_entity_id")]
    related_entity_id_snake: Option<RecordId>,
}

impl TryFrom<NotificationWire> for Notification {
    type Error = RealtimeError;

    fn try_from(wire: NotificationWire) -> Result<Self> {
        let id = wire
            .id
            .or(wire.notification_id)
            .or(wire.notification_id_snake)
            .ok_or_else(|| RealtimeError::Validation("notification without id".to_string()))?;
        Ok(Self {
            id,
            message: wire.message.or(wire.content).unwrap_or_default(),
            read: wire.read.or(wire.is_read).or(wire.is_read_snake).unwrap_or(false),
            created_at: wire
                .created_at
                .or(wire.created_at_snake)
                .or(wire.timestamp)
                .unwrap_or_else(Utc::now),
            kind: wire
                .notification_type
                .or(wire.notification_type_snake)
                .or(wire.kind),
            related_id: wire
                .related_id
                .or(wire.related_id_snake)
                .or(wire.related_entity_id)
                .or(wire.related_entity_id_snake),
        })
    }
}

// ─── Conversation ────────────────────────────────────────────────────────────

/// A thread between one end user and one staff member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "ConversationWire")]
pub struct Conversation {
    pub id: RecordId,
    pub user_id: Option<RecordId>,
    pub user_name: Option<String>,
    pub staff_id: Option<RecordId>,
    pub staff_name: Option<String>,
    pub last_message: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread_count: u32,
}

impl Conversation {
    /// Display name of the other participant from the viewer's side
    pub fn counterpart_name(&self, viewer: SenderRole) -> &str {
        let name = match viewer {
            SenderRole::Staff => self.user_name.as_deref(),
            SenderRole::User => self.staff_name.as_deref(),
        };
        name.unwrap_or("Unknown")
    }

    pub fn counterpart_id(&self, viewer: SenderRole) -> Option<&RecordId> {
        match viewer {
            SenderRole::Staff => self.user_id.as_ref(),
            SenderRole::User => self.staff_id.as_ref(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConversationWire {
    id: Option<RecordId>,
    conversation_id: Option<RecordId>,
    #[serde(rename = "conversation_id")]
    conversation_id_snake: Option<RecordId>,
    user_id: Option<RecordId>,
    #[serde(rename = "user_id")]
    user_id_snake: Option<RecordId>,
    user_name: Option<String>,
    #[serde(rename = "user_name")]
    user_name_snake: Option<String>,
    staff_id: Option<RecordId>,
    #[serde(rename = "staff_id")]
    staff_id_snake: Option<RecordId>,
    staff_name: Option<String>,
    #[serde(rename = "staff_name")]
    staff_name_snake: Option<String>,
    last_message: Option<String>,
    #[serde(rename = "last_message")]
    last_message_snake: Option<String>,
    #[serde(default, deserialize_with = "de_timestamp")]
    last_message_at: Option<DateTime<Utc>>,
    #[serde(default, rename = "last_message_at", deserialize_with = "de_timestamp")]
    last_message_at_snake: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "de_timestamp")]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default, rename = "updated_at", deserialize_with = "de_timestamp")]
    updated_at_snake: Option<DateTime<Utc>>,
    unread_count: Option<i64>,
    #[serde(rename = "unread_count")]
    unread_count_snake: Option<i64>,
}

impl TryFrom<ConversationWire> for Conversation {
    type Error = RealtimeError;

    fn try_from(wire: ConversationWire) -> Result<Self> {
        let id = wire
            .id
            .or(wire.conversation_id)
            .or(wire.conversation_id_snake)
            .ok_or_else(|| RealtimeError::Validation("conversation without id".to_string()))?;
        let unread = wire.unread_count.or(wire.unread_count_snake).unwrap_or(0);
        Ok(Self {
            id,
            user_id: wire.user_id.or(wire.user_id_snake),
            user_name: wire.user_name.or(wire.user_name_snake),
            staff_id: wire.staff_id.or(wire.staff_id_snake),
            staff_name: wire.staff_name.or(wire.staff_name_snake),
            last_message: wire.last_message.or(wire.last_message_snake),
            last_message_at: wire
                .last_message_at
                .or(wire.last_message_at_snake)
                .or(wire.updated_at)
                .or(wire.updated_at_snake),
            unread_count: unread.clamp(0, u32::MAX as i64) as u32,
        })
    }
}

// ─── Message ─────────────────────────────────────────────────────────────────

/// Delivery state of a message from the sender's side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    /// Local echo, server has not confirmed yet
    Pending,
    Sent,
    /// Server rejected or never received it
    Unsent,
}

/// One message inside a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "MessageWire")]
pub struct Message {
    /// Server-assigned id, `None` until confirmed
    pub id: Option<RecordId>,
    /// Set on messages that started as a local echo
    pub local_id: Option<Uuid>,
    pub conversation_id: RecordId,
    #[serde(rename = "senderType")]
    pub sender_role: SenderRole,
    pub sender_id: Option<RecordId>,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub read: bool,
    pub delivery: Delivery,
}

impl Message {
    /// Provisional record shown before the server confirms a send
    pub fn local_echo(conversation_id: RecordId, viewer: &Viewer, content: String) -> Self {
        Self {
            id: None,
            local_id: Some(Uuid::new_v4()),
            conversation_id,
            sender_role: viewer.role,
            sender_id: Some(viewer.id.clone()),
            content,
            timestamp: Utc::now(),
            read: false,
            delivery: Delivery::Pending,
        }
    }

    pub fn is_local_echo(&self) -> bool {
        self.id.is_none() && self.local_id.is_some()
    }

    /// Whether `self`, a server record, is the confirmation of the local echo `echo`.
    ///
    /// Unsent echoes match too: a send that timed out may still have been stored.
    pub fn confirms_echo(&self, echo: &Message, window: Duration) -> bool {
        if !echo.is_local_echo() {
            return false;
        }
        let gap = (self.timestamp - echo.timestamp).num_milliseconds().unsigned_abs();
        self.sender_role == echo.sender_role
            && self.sender_id == echo.sender_id
            && self.content == echo.content
            && gap <= window.as_millis() as u64
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageWire {
    id: Option<RecordId>,
    message_id: Option<RecordId>,
    #[serde(rename = "message_id")]
    message_id_snake: Option<RecordId>,
    local_id: Option<Uuid>,
    #[serde(rename = "local_id")]
    local_id_snake: Option<Uuid>,
    conversation_id: Option<RecordId>,
    #[serde(rename = "conversation_id")]
    conversation_id_snake: Option<RecordId>,
    sender_type: Option<SenderRole>,
    #[serde(rename = "sender_type")]
    sender_type_snake: Option<SenderRole>,
    sender_role: Option<SenderRole>,
    #[serde(rename = "sender_role")]
    sender_role_snake: Option<SenderRole>,
    sender_id: Option<RecordId>,
    #[serde(rename = "sender_id")]
    sender_id_snake: Option<RecordId>,
    content: Option<String>,
    message: Option<String>,
    text: Option<String>,
    #[serde(default, deserialize_with = "de_timestamp")]
    created_at: Option<DateTime<Utc>>,
    #[serde(default, rename = "created_at", deserialize_with = "de_timestamp")]
    created_at_snake: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "de_timestamp")]
    sent_at: Option<DateTime<Utc>>,
    #[serde(default, rename = "sent_at", deserialize_with = "de_timestamp")]
    sent_at_snake: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "de_timestamp")]
    timestamp: Option<DateTime<Utc>>,
    read: Option<bool>,
    is_read: Option<bool>,
    #[serde(rename = "is_read")]
    is_read_snake: Option<bool>,
    delivery: Option<Delivery>,
}

impl TryFrom<MessageWire> for Message {
    type Error = RealtimeError;

    fn try_from(wire: MessageWire) -> Result<Self> {
        let id = wire.id.or(wire.message_id).or(wire.message_id_snake);
        let local_id = wire.local_id.or(wire.local_id_snake);
        if id.is_none() && local_id.is_none() {
            return Err(RealtimeError::Validation("message without id".to_string()));
        }
        let conversation_id = wire
            .conversation_id
            .or(wire.conversation_id_snake)
            .ok_or_else(|| RealtimeError::Validation("message without conversation id".to_string()))?;
        let sender_role = wire
            .sender_type
            .or(wire.sender_type_snake)
            .or(wire.sender_role)
            .or(wire.sender_role_snake)
            .ok_or_else(|| RealtimeError::Validation("message without sender type".to_string()))?;
        let delivery = match (&id, wire.delivery) {
            (_, Some(delivery)) => delivery,
            (Some(_), None) => Delivery::Sent,
            (None, None) => Delivery::Pending,
        };
        Ok(Self {
            id,
            local_id,
            conversation_id,
            sender_role,
            sender_id: wire.sender_id.or(wire.sender_id_snake),
            content: wire.content.or(wire.message).or(wire.text).unwrap_or_default(),
            timestamp: wire
                .created_at
                .or(wire.created_at_snake)
                .or(wire.sent_at)
                .or(wire.sent_at_snake)
                .or(wire.timestamp)
                .unwrap_or_else(Utc::now),
            read: wire.read.or(wire.is_read).or(wire.is_read_snake).unwrap_or(false),
            delivery,
        })
    }
}

/// Body of `POST /conversations/{id}/messages`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub sender_id: RecordId,
    pub sender_type: SenderRole,
    pub content: String,
}
