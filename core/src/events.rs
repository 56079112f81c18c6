/// Store change events for UI collaborators
use crate::models::RecordId;
use crate::transport::ConnectionState;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Where the router should go after a notification is opened
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigationTarget {
    /// Section of the app: `claims`, `messages`, `reports` or `notifications`
    pub section: String,
    pub related_id: Option<RecordId>,
}

impl NavigationTarget {
    /// Route for a notification type tag. `None` when there is nothing to follow.
    pub fn for_notification(kind: Option<&str>, related_id: Option<&RecordId>) -> Option<Self> {
        if kind.is_none() && related_id.is_none() {
            return None;
        }
        let kind = kind.unwrap_or_default().to_ascii_uppercase();
        let section = if kind.contains("CLAIM") {
            "claims"
        } else if kind.contains("MESSAGE") || kind.contains("CONVERSATION") {
            "messages"
        } else if kind.contains("MATCH") || kind.contains("REPORT") || kind.contains("ITEM") {
            "reports"
        } else {
            "notifications"
        };
        Some(Self {
            section: section.to_string(),
            related_id: related_id.cloned(),
        })
    }
}

/// Change broadcast by the stores and the session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEvent {
    /// Notification list changed
    NotificationsChanged { unread: usize },
    /// Conversation list, selection or previews changed
    ConversationsChanged,
    /// Message array of a conversation changed
    MessagesChanged { conversation_id: RecordId },
    ConnectionChanged { state: ConnectionState },
    /// Side effect of opening a notification
    Navigate { target: NavigationTarget },
}

/// Broadcast channel shared by every store of a session
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.tx.subscribe()
    }

    /// Publish `event`; having no listener is not an error.
    pub fn emit(&self, event: StoreEvent) {
        if self.tx.send(event).is_err() {
            trace!("No store event listeners");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
