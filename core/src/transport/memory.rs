/// In-memory push transport for tests and offline contexts
use super::{Connector, PushLink};
use crate::error::{RealtimeError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::mpsc;

enum Scripted {
    Fail(String),
    Accept(MemoryLink),
}

/// Connector that replays a script of connection outcomes. Once the
/// script runs out every attempt fails.
#[derive(Default)]
pub struct MemoryConnector {
    script: Mutex<VecDeque<Scripted>>,
    attempts: AtomicU32,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next connection attempt fails with `reason`
    pub fn fail_next(&self, reason: &str) {
        self.script.lock().push_back(Scripted::Fail(reason.to_string()));
    }

    /// The next connection attempt succeeds; the returned handle plays the server
    pub fn accept_next(&self) -> MemoryServer {
        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        self.script
            .lock()
            .push_back(Scripted::Accept(MemoryLink { inbound, outbound }));
        MemoryServer {
            to_client,
            from_client,
        }
    }

    /// Connection attempts made so far
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Box<dyn PushLink>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().pop_front() {
            Some(Scripted::Accept(link)) => Ok(Box::new(link)),
            Some(Scripted::Fail(reason)) => Err(RealtimeError::Transport(reason)),
            None => Err(RealtimeError::Transport("connection refused".to_string())),
        }
    }
}

struct MemoryLink {
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl PushLink for MemoryLink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.outbound
            .send(text)
            .map_err(|_| RealtimeError::Transport("server side closed".to_string()))
    }

    async fn next_text(&mut self) -> Option<Result<String>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.inbound.close();
    }
}

/// Server end of an accepted in-memory link. Dropping it closes the link.
pub struct MemoryServer {
    to_client: mpsc::UnboundedSender<String>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl MemoryServer {
    /// Push a raw text frame to the client
    pub fn push(&self, text: impl Into<String>) -> bool {
        self.to_client.send(text.into()).is_ok()
    }

    pub fn push_json(&self, frame: &serde_json::Value) -> bool {
        self.push(frame.to_string())
    }

    /// Next frame the client sent, `None` once the client side is gone
    pub async fn recv(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    pub async fn recv_json(&mut self) -> Option<serde_json::Value> {
        let text = self.recv().await?;
        serde_json::from_str(&text).ok()
    }
}
