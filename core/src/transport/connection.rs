/// Push connection manager
///
/// Owns the single push connection of a session: handshake and
/// subscribe, inbound frame dispatch into the multiplexer, and capped
/// exponential reconnection. Nothing here is fatal to the host; every
/// failure ends up in the log and in the published [`ConnectionState`].
use super::{ConnectionState, Connector, PushLink, ReconnectPolicy};
use crate::error::{RealtimeError, Result};
use crate::models::RecordId;
use crate::multiplexer::TopicMultiplexer;
use crate::protocol::{ClientFrame, PushFrame};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const OUTBOUND_CAPACITY: usize = 64;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Live connection task of the current session
struct Running {
    user_id: RecordId,
    cancel: CancellationToken,
    outbound: mpsc::Sender<String>,
    task: JoinHandle<()>,
}

struct Shared {
    connector: Arc<dyn Connector>,
    multiplexer: TopicMultiplexer,
    policy: ReconnectPolicy,
    connect_timeout: Duration,
    state: watch::Sender<ConnectionState>,
    attempts: AtomicU32,
    /// Bumped on every connect/disconnect so a superseded task cannot
    /// overwrite the state of its successor
    generation: AtomicU64,
    /// Subscribe frames replayed after every (re)connect: the user's
    /// channel and at most one conversation
    topics: Mutex<Vec<ClientFrame>>,
    running: Mutex<Option<Running>>,
}

/// Handle to the session's push connection. Clones share the connection.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

enum LinkEnd {
    Cancelled,
    Closed,
    Failed(RealtimeError),
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        multiplexer: TopicMultiplexer,
        policy: ReconnectPolicy,
        connect_timeout: Duration,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                connector,
                multiplexer,
                policy,
                connect_timeout,
                state,
                attempts: AtomicU32::new(0),
                generation: AtomicU64::new(0),
                topics: Mutex::new(Vec::new()),
                running: Mutex::new(None),
            }),
        }
    }

    /// Open the push connection for `user_id` and subscribe to the user's
    /// channel. A no-op while a connection for the same user is alive.
    pub fn connect(&self, user_id: RecordId) {
        let mut running = self.shared.running.lock();

        if let Some(current) = running.as_ref() {
            if current.user_id == user_id && !current.task.is_finished() {
                debug!("Push connection for user {} already active", user_id);
                return;
            }
            current.cancel.cancel();
            if current.user_id != user_id {
                self.shared.topics.lock().clear();
            }
        }

        {
            let mut topics = self.shared.topics.lock();
            topics.retain(|t| !matches!(t, ClientFrame::SubscribeNotifications { .. }));
            topics.insert(0, ClientFrame::SubscribeNotifications { user_id: user_id.clone() });
        }

        let cancel = CancellationToken::new();
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        self.shared.attempts.store(0, Ordering::SeqCst);
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let shared = self.shared.clone();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            shared.run(generation, task_cancel, outbound_rx).await;
        });

        info!("Starting push connection for user {}", user_id);
        *running = Some(Running {
            user_id,
            cancel,
            outbound,
            task,
        });
    }

    /// Close the connection, cancel any pending reconnect and drop all
    /// multiplexer subscriptions.
    pub async fn disconnect(&self) {
        let running = self.shared.running.lock().take();
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(running) = running {
            running.cancel.cancel();
            let mut task = running.task;
            if timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                warn!("Push connection task did not stop in time, aborting");
                task.abort();
            }
            info!("Push connection for user {} closed", running.user_id);
        }
        self.shared.topics.lock().clear();
        self.shared.multiplexer.clear();
        self.shared.set_state(ConnectionState::Disconnected);
    }

    /// Cancel the connection task without waiting for it to wind down.
    pub fn abort(&self) {
        let running = self.shared.running.lock().take();
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(running) = running {
            running.cancel.cancel();
            debug!("Push connection for user {} aborted", running.user_id);
        }
        self.shared.topics.lock().clear();
        self.shared.multiplexer.clear();
        self.shared.set_state(ConnectionState::Disconnected);
    }

    /// Best-effort send. Dropped with a warning when not connected.
    pub fn send(&self, frame: &ClientFrame) -> bool {
        if self.state() != ConnectionState::Connected {
            warn!("Push channel not connected, dropping outbound {:?}", frame);
            return false;
        }
        let text = match frame.to_text() {
            Ok(text) => text,
            Err(e) => {
                warn!("Could not encode outbound frame: {}", e);
                return false;
            }
        };
        let running = self.shared.running.lock();
        match running.as_ref().map(|r| r.outbound.try_send(text)) {
            Some(Ok(())) => true,
            Some(Err(e)) => {
                warn!("Outbound push frame dropped: {}", e);
                false
            }
            None => false,
        }
    }

    /// Follow a conversation's channel, replacing the previously watched
    /// one. Replayed after every reconnect.
    pub fn watch_conversation(&self, conversation_id: &RecordId) {
        let frame = ClientFrame::Subscribe {
            conversation_id: conversation_id.clone(),
        };
        {
            let mut topics = self.shared.topics.lock();
            if topics.contains(&frame) {
                return;
            }
            topics.retain(|t| !matches!(t, ClientFrame::Subscribe { .. }));
            topics.push(frame.clone());
        }
        if self.state() == ConnectionState::Connected {
            self.send(&frame);
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Consecutive failed attempts since the last successful handshake
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    pub fn multiplexer(&self) -> &TopicMultiplexer {
        &self.shared.multiplexer
    }
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                debug!("Push connection {:?} -> {:?}", *state, next);
                *state = next;
                true
            }
        });
    }

    fn set_state_from(&self, generation: u64, next: ConnectionState) {
        if self.generation.load(Ordering::SeqCst) == generation {
            self.set_state(next);
        }
    }

    async fn run(&self, generation: u64, cancel: CancellationToken, mut outbound: mpsc::Receiver<String>) {
        let mut attempt: u32 = 0;

        loop {
            self.set_state_from(generation, ConnectionState::Connecting);

            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                result = timeout(self.connect_timeout, self.connector.connect()) => result,
            };

            match connected {
                Ok(Ok(mut link)) => match self.handshake(link.as_mut(), &mut outbound).await {
                    Ok(sent) => {
                        attempt = 0;
                        self.attempts.store(0, Ordering::SeqCst);
                        self.set_state_from(generation, ConnectionState::Connected);
                        info!("Push channel connected");

                        // Topics watched while the handshake was running
                        let late: Vec<ClientFrame> = self
                            .topics
                            .lock()
                            .iter()
                            .filter(|t| !sent.contains(t))
                            .cloned()
                            .collect();
                        for frame in late {
                            if let Ok(text) = frame.to_text() {
                                if let Err(e) = link.send_text(text).await {
                                    warn!("Late subscribe failed: {}", e);
                                }
                            }
                        }

                        match self.pump(link.as_mut(), &mut outbound, &cancel).await {
                            LinkEnd::Cancelled => {
                                link.close().await;
                                break;
                            }
                            LinkEnd::Closed => warn!("Push channel closed by server"),
                            LinkEnd::Failed(e) => warn!("Push channel lost: {}", e),
                        }
                        self.set_state_from(generation, ConnectionState::Disconnected);
                        let stale = drain(&mut outbound);
                        if stale > 0 {
                            debug!("Dropped {} frame(s) queued for the lost link", stale);
                        }
                    }
                    Err(e) => {
                        warn!("Push handshake failed: {}", e);
                        link.close().await;
                    }
                },
                Ok(Err(e)) => warn!("Push connect failed: {}", e),
                Err(_) => warn!("Push connect timed out after {:?}", self.connect_timeout),
            }

            attempt += 1;
            self.attempts.store(attempt, Ordering::SeqCst);
            let Some(delay) = self.policy.delay_for(attempt) else {
                error!(
                    "Push channel unavailable after {} reconnect attempts, relying on polling",
                    attempt - 1
                );
                self.set_state_from(generation, ConnectionState::Unavailable);
                return;
            };

            self.set_state_from(generation, ConnectionState::Disconnected);
            debug!("Reconnecting in {:?} (attempt {})", delay, attempt);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        self.set_state_from(generation, ConnectionState::Disconnected);
    }

    /// Send the subscribe frames; returns the frames sent.
    ///
    /// Anything still queued outbound belongs to an earlier link and is
    /// covered by the replay.
    async fn handshake(
        &self,
        link: &mut dyn PushLink,
        outbound: &mut mpsc::Receiver<String>,
    ) -> Result<Vec<ClientFrame>> {
        drain(outbound);
        let frames = self.topics.lock().clone();
        for frame in &frames {
            link.send_text(frame.to_text()?).await?;
        }
        Ok(frames)
    }

    async fn pump(
        &self,
        link: &mut dyn PushLink,
        outbound: &mut mpsc::Receiver<String>,
        cancel: &CancellationToken,
    ) -> LinkEnd {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return LinkEnd::Cancelled,
                next = outbound.recv() => match next {
                    Some(text) => {
                        if let Err(e) = link.send_text(text).await {
                            return LinkEnd::Failed(e);
                        }
                    }
                    None => return LinkEnd::Cancelled,
                },
                incoming = link.next_text() => match incoming {
                    Some(Ok(text)) => self.dispatch(&text),
                    Some(Err(e)) => return LinkEnd::Failed(e),
                    None => return LinkEnd::Closed,
                },
            }
        }
    }

    fn dispatch(&self, text: &str) {
        match PushFrame::parse(text) {
            Ok(frame) => {
                let delivered = self.multiplexer.publish(&frame);
                debug!("Push frame {} delivered to {} subscriber(s)", frame.topic(), delivered);
            }
            Err(e) => warn!("Dropping malformed push frame: {}", e),
        }
    }
}

fn drain(outbound: &mut mpsc::Receiver<String>) -> usize {
    let mut dropped = 0;
    while outbound.try_recv().is_ok() {
        dropped += 1;
    }
    dropped
}
