/// WebSocket push transport
use super::{Connector, PushLink};
use crate::error::{RealtimeError, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// Connects to the push endpoint over a WebSocket
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn PushLink>> {
        let (stream, response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| RealtimeError::Transport(format!("WebSocket connect to {} failed: {}", self.url, e)))?;
        debug!("WebSocket upgraded ({}) at {}", response.status(), self.url);
        Ok(Box::new(WsLink { stream }))
    }
}

struct WsLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl PushLink for WsLink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.stream
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|e| RealtimeError::Transport(format!("WebSocket send failed: {}", e)))
    }

    async fn next_text(&mut self) -> Option<Result<String>> {
        loop {
            match self.stream.next().await? {
                Ok(WsMessage::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                Ok(WsMessage::Close(frame)) => {
                    debug!("WebSocket closed by server: {:?}", frame);
                    return None;
                }
                // Ping/pong are answered by tungstenite; binary frames carry nothing for us
                Ok(_) => continue,
                Err(e) => {
                    return Some(Err(RealtimeError::Transport(format!(
                        "WebSocket read failed: {}",
                        e
                    ))))
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!("WebSocket close: {}", e);
        }
    }
}
