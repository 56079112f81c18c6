/// Lost & Found realtime core
///
/// Push notifications and staff/user messaging for the lost-and-found
/// client: a reconnecting push transport, a topic multiplexer, the
/// notification and conversation stores, and a polling fallback.

pub mod error;
pub mod config;
pub mod models;
pub mod protocol;
pub mod multiplexer;
pub mod transport;
pub mod rest;
pub mod events;
pub mod notification_store;
pub mod conversation_store;
pub mod polling;
pub mod session;

pub use config::Config;
pub use conversation_store::ConversationStore;
pub use error::{RealtimeError, Result};
pub use events::{EventBus, NavigationTarget, StoreEvent};
pub use models::{Conversation, Delivery, Message, Notification, RecordId, SenderRole, Viewer};
pub use notification_store::NotificationStore;
pub use rest::{HttpRestClient, RestApi};
pub use session::Session;
