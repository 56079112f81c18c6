/// Push transport: one reconnecting connection per session
pub mod backoff;
pub mod connection;
pub mod memory;
pub mod ws;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use backoff::ReconnectPolicy;
pub use connection::ConnectionManager;
pub use memory::{MemoryConnector, MemoryServer};
pub use ws::WsConnector;

/// Lifecycle of the push connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Retries exhausted; polling is the only source of truth until the
    /// next explicit connect
    Unavailable,
}

/// Opens links to the push endpoint
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn PushLink>>;
}

/// One open, text-framed connection
#[async_trait]
pub trait PushLink: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Next inbound text frame, `None` once the peer has closed.
    async fn next_text(&mut self) -> Option<Result<String>>;

    async fn close(&mut self);
}
