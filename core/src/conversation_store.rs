/// Conversation and message store
///
/// Holds the conversation list of the viewer and the message array of the
/// active conversation only. Pushes for other conversations update their
/// list preview. Every fetch started for a selection carries that
/// selection's token and is discarded if the user moved on before it
/// resolved.
use crate::error::{RealtimeError, Result};
use crate::events::{EventBus, StoreEvent};
use crate::models::{Conversation, Delivery, Message, NewMessage, RecordId, Viewer};
use crate::multiplexer::{Subscription, TopicMultiplexer};
use crate::protocol::{PushFrame, Topic};
use crate::rest::RestApi;
use crate::transport::ConnectionManager;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Hook told which conversation is open so its push channel can be followed
pub trait ConversationWatcher: Send + Sync {
    fn watch(&self, conversation_id: &RecordId);
}

impl ConversationWatcher for ConnectionManager {
    fn watch(&self, conversation_id: &RecordId) {
        self.watch_conversation(conversation_id);
    }
}

#[derive(Default)]
struct State {
    /// Most recent first
    conversations: Vec<Conversation>,
    active: Option<RecordId>,
    /// Bumped on every selection
    selection: u64,
    list_generation: u64,
    /// Messages of the active conversation, oldest first
    messages: Vec<Message>,
    /// Counterpart to open on the next list load
    staged: Option<RecordId>,
    last_error: Option<String>,
}

impl State {
    fn conversation_mut(&mut self, id: &RecordId) -> Option<&mut Conversation> {
        self.conversations.iter_mut().find(|c| &c.id == id)
    }

    fn sort_conversations(&mut self) {
        self.conversations
            .sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
    }

    fn sort_messages(&mut self) {
        self.messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    }

    fn is_current(&self, conversation_id: &RecordId, token: u64) -> bool {
        self.selection == token && self.active.as_ref() == Some(conversation_id)
    }

    fn update_preview(&mut self, message: &Message) -> bool {
        let Some(conversation) = self.conversation_mut(&message.conversation_id) else {
            return false;
        };
        if conversation.last_message_at.is_some_and(|at| at > message.timestamp) {
            return false;
        }
        conversation.last_message = Some(message.content.clone());
        conversation.last_message_at = Some(message.timestamp);
        self.sort_conversations();
        true
    }
}

struct Inner {
    rest: Arc<dyn RestApi>,
    events: EventBus,
    viewer: Viewer,
    echo_window: Duration,
    watcher: Option<Arc<dyn ConversationWatcher>>,
    state: Mutex<State>,
}

#[derive(Clone)]
pub struct ConversationStore {
    inner: Arc<Inner>,
}

impl ConversationStore {
    pub fn new(rest: Arc<dyn RestApi>, events: EventBus, viewer: Viewer, echo_window: Duration) -> Self {
        Self::build(rest, events, viewer, echo_window, None)
    }

    /// Store that follows the active conversation's push channel through `watcher`
    pub fn with_watcher(
        rest: Arc<dyn RestApi>,
        events: EventBus,
        viewer: Viewer,
        echo_window: Duration,
        watcher: Arc<dyn ConversationWatcher>,
    ) -> Self {
        Self::build(rest, events, viewer, echo_window, Some(watcher))
    }

    fn build(
        rest: Arc<dyn RestApi>,
        events: EventBus,
        viewer: Viewer,
        echo_window: Duration,
        watcher: Option<Arc<dyn ConversationWatcher>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                rest,
                events,
                viewer,
                echo_window,
                watcher,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Route `message` frames into this store.
    pub fn attach(&self, multiplexer: &TopicMultiplexer) -> Subscription {
        let store = self.clone();
        multiplexer.subscribe(Topic::Message, move |frame| {
            if let PushFrame::Message(message) = frame {
                store.on_push(message.clone());
            }
        })
    }

    pub fn viewer(&self) -> &Viewer {
        &self.inner.viewer
    }

    // ─── Conversation list ───────────────────────────────────────────────

    /// Open the conversation with `counterpart_id` on the next
    /// `load_conversations`, creating it if needed.
    pub fn stage_open_with(&self, counterpart_id: RecordId) {
        debug!("Staged conversation with {}", counterpart_id);
        self.inner.state.lock().staged = Some(counterpart_id);
    }

    /// Fetch the viewer's conversations and select one: the staged
    /// counterpart's, else the current one if still listed, else the most
    /// recent.
    pub async fn load_conversations(&self) -> Result<()> {
        let generation = {
            let mut state = self.inner.state.lock();
            state.list_generation += 1;
            state.list_generation
        };

        let fetched = self.inner.rest.fetch_conversations(&self.inner.viewer).await;

        let role = self.inner.viewer.role;
        let (staged, target) = {
            let mut state = self.inner.state.lock();
            if state.list_generation != generation {
                debug!("Discarding superseded conversation list");
                return Ok(());
            }
            let mut list = match fetched {
                Ok(list) => list,
                Err(e) => {
                    warn!("Conversation list for {} failed: {}", self.inner.viewer.id, e);
                    state.last_error = Some(e.to_string());
                    return Err(e);
                }
            };
            let mut seen = HashSet::new();
            list.retain(|c| seen.insert(c.id.clone()));
            state.conversations = list;
            state.sort_conversations();
            state.last_error = None;

            let staged = state.staged.take();
            let staged_match = staged.as_ref().and_then(|who| {
                state
                    .conversations
                    .iter()
                    .find(|c| c.counterpart_id(role) == Some(who))
                    .map(|c| c.id.clone())
            });
            let target = match (&staged, staged_match) {
                (_, Some(id)) => Some(id),
                (Some(_), None) => None,
                (None, None) => state
                    .active
                    .clone()
                    .filter(|id| state.conversations.iter().any(|c| &c.id == id))
                    .or_else(|| state.conversations.first().map(|c| c.id.clone())),
            };
            let staged_missing = if target.is_none() { staged } else { None };
            (staged_missing, target)
        };
        info!("Loaded conversations for {} {}", role, self.inner.viewer.id);
        self.inner.events.emit(StoreEvent::ConversationsChanged);

        let target = match staged {
            Some(counterpart) => self.create_with(&counterpart).await?,
            None => match target {
                Some(id) => id,
                None => return Ok(()),
            },
        };
        self.select_conversation(&target).await
    }

    async fn create_with(&self, counterpart: &RecordId) -> Result<RecordId> {
        let viewer = &self.inner.viewer;
        let (user_id, staff_id) = if viewer.is_user() {
            (&viewer.id, counterpart)
        } else {
            (counterpart, &viewer.id)
        };
        let created = match self.inner.rest.open_conversation(user_id, staff_id).await {
            Ok(created) => created,
            Err(e) => {
                warn!("Opening conversation with {} failed: {}", counterpart, e);
                self.inner.state.lock().last_error = Some(e.to_string());
                return Err(e);
            }
        };
        info!("Opened conversation {} with {}", created.id, counterpart);
        let id = created.id.clone();
        {
            let mut state = self.inner.state.lock();
            if state.conversation_mut(&id).is_none() {
                state.conversations.insert(0, created);
            }
        }
        self.inner.events.emit(StoreEvent::ConversationsChanged);
        Ok(id)
    }

    // ─── Selection and history ───────────────────────────────────────────

    /// Make `conversation_id` active, load its history and mark it read.
    pub async fn select_conversation(&self, conversation_id: &RecordId) -> Result<()> {
        let token = {
            let mut state = self.inner.state.lock();
            if state.conversation_mut(conversation_id).is_none() {
                return Err(RealtimeError::NotFound(format!("conversation {}", conversation_id)));
            }
            state.selection += 1;
            if state.active.as_ref() != Some(conversation_id) {
                state.messages.clear();
            }
            state.active = Some(conversation_id.clone());
            state.selection
        };
        debug!("Selected conversation {}", conversation_id);
        self.inner.events.emit(StoreEvent::ConversationsChanged);
        if let Some(watcher) = &self.inner.watcher {
            watcher.watch(conversation_id);
        }
        self.fetch_messages(conversation_id, token).await
    }

    /// Refresh the history of the active conversation.
    pub async fn load_messages(&self, conversation_id: &RecordId) -> Result<()> {
        let token = {
            let state = self.inner.state.lock();
            if state.active.as_ref() != Some(conversation_id) {
                return Err(RealtimeError::Validation(format!(
                    "conversation {} is not open",
                    conversation_id
                )));
            }
            state.selection
        };
        self.fetch_messages(conversation_id, token).await
    }

    async fn fetch_messages(&self, conversation_id: &RecordId, token: u64) -> Result<()> {
        let fetched = self.inner.rest.fetch_messages(conversation_id).await;
        {
            let mut state = self.inner.state.lock();
            if !state.is_current(conversation_id, token) {
                debug!("Discarding stale history of conversation {}", conversation_id);
                return Ok(());
            }
            let history = match fetched {
                Ok(history) => history,
                Err(e) => {
                    warn!("History of conversation {} failed: {}", conversation_id, e);
                    state.last_error = Some(e.to_string());
                    return Err(e);
                }
            };
            let window = self.inner.echo_window;
            let ids: HashSet<RecordId> = history.iter().filter_map(|m| m.id.clone()).collect();
            // Keep what the snapshot cannot know about: pushes that raced the
            // fetch and echoes it does not confirm.
            let kept: Vec<Message> = state
                .messages
                .drain(..)
                .filter(|m| match &m.id {
                    Some(id) => !ids.contains(id),
                    None => !history.iter().any(|h| h.confirms_echo(m, window)),
                })
                .collect();
            state.messages = history;
            state.messages.extend(kept);
            state.sort_messages();
        }
        self.inner.events.emit(StoreEvent::MessagesChanged {
            conversation_id: conversation_id.clone(),
        });

        if let Err(e) = self.mark_conversation_read(conversation_id).await {
            debug!("Viewing conversation {} left it unread: {}", conversation_id, e);
        }
        Ok(())
    }

    /// Zero the local unread badge and confirm with the server. Idempotent.
    pub async fn mark_conversation_read(&self, conversation_id: &RecordId) -> Result<()> {
        let changed = {
            let mut state = self.inner.state.lock();
            let mut changed = match state.conversation_mut(conversation_id) {
                Some(c) if c.unread_count > 0 => {
                    c.unread_count = 0;
                    true
                }
                _ => false,
            };
            if state.active.as_ref() == Some(conversation_id) {
                let role = self.inner.viewer.role;
                for m in state.messages.iter_mut().filter(|m| m.sender_role != role && !m.read) {
                    m.read = true;
                    changed = true;
                }
            }
            changed
        };
        if changed {
            self.inner.events.emit(StoreEvent::ConversationsChanged);
        }

        let is_user = self.inner.viewer.is_user();
        if let Err(e) = self.inner.rest.mark_conversation_read(conversation_id, is_user).await {
            warn!("Read state of conversation {} not confirmed: {}", conversation_id, e);
            self.inner.state.lock().last_error = Some(e.to_string());
            return Err(e);
        }
        Ok(())
    }

    // ─── Sending ─────────────────────────────────────────────────────────

    /// Append a local echo to the active conversation and send it.
    ///
    /// On failure the echo stays in the list marked [`Delivery::Unsent`].
    pub async fn send_message(&self, text: &str) -> Result<Message> {
        let content = text.trim();
        if content.is_empty() {
            return Err(RealtimeError::Validation("message text is empty".to_string()));
        }
        let echo = {
            let mut state = self.inner.state.lock();
            let active = state
                .active
                .clone()
                .ok_or_else(|| RealtimeError::Validation("no active conversation".to_string()))?;
            let echo = Message::local_echo(active, &self.inner.viewer, content.to_string());
            state.messages.push(echo.clone());
            state.sort_messages();
            echo
        };
        self.inner.events.emit(StoreEvent::MessagesChanged {
            conversation_id: echo.conversation_id.clone(),
        });
        self.deliver(echo).await
    }

    /// Send an unsent echo again. Echoes a push has since confirmed are
    /// no longer unsent and report `NotFound`.
    pub async fn retry_message(&self, local_id: Uuid) -> Result<Message> {
        let echo = {
            let mut state = self.inner.state.lock();
            let echo = state
                .messages
                .iter_mut()
                .find(|m| m.local_id == Some(local_id) && m.delivery == Delivery::Unsent)
                .ok_or_else(|| RealtimeError::NotFound(format!("unsent message {}", local_id)))?;
            echo.delivery = Delivery::Pending;
            echo.clone()
        };
        self.inner.events.emit(StoreEvent::MessagesChanged {
            conversation_id: echo.conversation_id.clone(),
        });
        self.deliver(echo).await
    }

    /// Drop an unsent echo. Returns whether one was removed.
    pub fn discard_message(&self, local_id: Uuid) -> bool {
        let removed = {
            let mut state = self.inner.state.lock();
            let position = state
                .messages
                .iter()
                .position(|m| m.local_id == Some(local_id) && m.delivery == Delivery::Unsent);
            position.map(|i| state.messages.remove(i))
        };
        match removed {
            Some(echo) => {
                self.inner.events.emit(StoreEvent::MessagesChanged {
                    conversation_id: echo.conversation_id,
                });
                true
            }
            None => false,
        }
    }

    async fn deliver(&self, echo: Message) -> Result<Message> {
        let conversation_id = echo.conversation_id.clone();
        let body = NewMessage {
            sender_id: self.inner.viewer.id.clone(),
            sender_type: self.inner.viewer.role,
            content: echo.content.clone(),
        };

        let result = self.inner.rest.send_message(&conversation_id, &body).await;

        let outcome = {
            let mut state = self.inner.state.lock();
            match result {
                Ok(server) => {
                    let mut confirmed = server;
                    confirmed.local_id = echo.local_id;
                    confirmed.delivery = Delivery::Sent;
                    if let Some(position) = state.messages.iter().position(|m| m.local_id == echo.local_id) {
                        state.messages[position] = confirmed.clone();
                        // A push may have delivered the server copy first
                        let server_id = confirmed.id.clone();
                        let mut kept_one = false;
                        state.messages.retain(|m| {
                            if server_id.is_none() || m.id != server_id {
                                return true;
                            }
                            let keep = !kept_one;
                            kept_one = true;
                            keep
                        });
                        state.sort_messages();
                    }
                    state.update_preview(&confirmed);
                    Ok(confirmed)
                }
                Err(e) => {
                    let position = state.messages.iter().position(|m| m.local_id == echo.local_id);
                    match position {
                        // The push channel already delivered the server copy
                        Some(i) if state.messages[i].id.is_some() => {
                            debug!("Send to conversation {} failed after push confirmed it: {}", conversation_id, e);
                            Ok(state.messages[i].clone())
                        }
                        _ => {
                            warn!("Message to conversation {} not sent: {}", conversation_id, e);
                            if let Some(i) = position {
                                state.messages[i].delivery = Delivery::Unsent;
                            }
                            state.last_error = Some(e.to_string());
                            Err(e)
                        }
                    }
                }
            }
        };

        self.inner.events.emit(StoreEvent::MessagesChanged {
            conversation_id: conversation_id.clone(),
        });
        if outcome.is_ok() {
            self.inner.events.emit(StoreEvent::ConversationsChanged);
        }
        outcome
    }

    // ─── Push ────────────────────────────────────────────────────────────

    /// Merge a pushed message. Only the active conversation's array grows;
    /// other conversations get a preview update and an unread bump.
    pub fn on_push(&self, message: Message) {
        let role = self.inner.viewer.role;
        let from_counterpart = message.sender_role != role;
        let conversation_id = message.conversation_id.clone();

        let (known, active, messages_changed) = {
            let mut state = self.inner.state.lock();
            let known = state.update_preview(&message) || state.conversation_mut(&conversation_id).is_some();
            let active = state.active.as_ref() == Some(&conversation_id);

            if !active {
                if from_counterpart {
                    if let Some(c) = state.conversation_mut(&conversation_id) {
                        c.unread_count = c.unread_count.saturating_add(1);
                    }
                }
                (known, false, false)
            } else {
                let window = self.inner.echo_window;
                let by_id = message
                    .id
                    .as_ref()
                    .and_then(|id| state.messages.iter().position(|m| m.id.as_ref() == Some(id)));
                let by_echo = || state.messages.iter().position(|m| message.confirms_echo(m, window));
                match by_id.or_else(by_echo) {
                    Some(i) => {
                        let local_id = state.messages[i].local_id;
                        state.messages[i] = Message {
                            local_id,
                            delivery: Delivery::Sent,
                            ..message
                        };
                    }
                    None => state.messages.push(message),
                }
                if from_counterpart {
                    if let Some(c) = state.conversation_mut(&conversation_id) {
                        c.unread_count = 0;
                    }
                }
                state.sort_messages();
                (known, true, true)
            }
        };

        if messages_changed {
            self.inner.events.emit(StoreEvent::MessagesChanged {
                conversation_id: conversation_id.clone(),
            });
        }
        self.inner.events.emit(StoreEvent::ConversationsChanged);

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime to follow up push for conversation {}", conversation_id);
            return;
        };
        if active && from_counterpart {
            let store = self.clone();
            runtime.spawn(async move {
                let _ = store.mark_conversation_read(&conversation_id).await;
            });
        } else if !known {
            debug!("Push for unknown conversation {}, refreshing list", conversation_id);
            let store = self.clone();
            runtime.spawn(async move {
                let _ = store.load_conversations().await;
            });
        }
    }

    // ─── Reads ───────────────────────────────────────────────────────────

    pub fn conversations(&self) -> Vec<Conversation> {
        self.inner.state.lock().conversations.clone()
    }

    pub fn active_conversation(&self) -> Option<RecordId> {
        self.inner.state.lock().active.clone()
    }

    /// Messages of the active conversation, oldest first
    pub fn messages(&self) -> Vec<Message> {
        self.inner.state.lock().messages.clone()
    }

    pub fn total_unread(&self) -> u32 {
        self.inner
            .state
            .lock()
            .conversations
            .iter()
            .map(|c| c.unread_count)
            .fold(0u32, u32::saturating_add)
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.state.lock().last_error.clone()
    }
}
