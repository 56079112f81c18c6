/// Notification store: the session's cache of the user's notifications
///
/// The list is kept newest first and the unread count is always derived
/// from it. Mutations are optimistic: the local flag flips first, the REST
/// confirmation follows, and a failed confirmation is logged and left for
/// the next `load` to reconcile.
use crate::error::{RealtimeError, Result};
use crate::events::{EventBus, NavigationTarget, StoreEvent};
use crate::models::{Notification, RecordId};
use crate::multiplexer::{Subscription, TopicMultiplexer};
use crate::protocol::{PushFrame, Topic};
use crate::rest::RestApi;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Local change recorded while a `load` is in flight, replayed over the
/// snapshot when it lands
#[derive(Debug, Clone)]
enum Mutation {
    Upsert(Notification),
    MarkRead(Option<RecordId>),
    Remove(RecordId),
}

#[derive(Default)]
struct State {
    user_id: Option<RecordId>,
    items: Vec<Notification>,
    last_error: Option<String>,
    load_generation: u64,
    journal: Option<Vec<Mutation>>,
}

impl State {
    fn unread(&self) -> usize {
        self.items.iter().filter(|n| !n.read).count()
    }

    fn record(&mut self, mutation: Mutation) {
        if let Some(journal) = self.journal.as_mut() {
            journal.push(mutation);
        }
    }

    fn apply(&mut self, mutation: Mutation) -> bool {
        match mutation {
            Mutation::Upsert(notification) => {
                match self.items.iter_mut().find(|n| n.id == notification.id) {
                    Some(existing) => *existing = notification,
                    None => self.items.insert(0, notification),
                }
                true
            }
            Mutation::MarkRead(Some(id)) => match self.items.iter_mut().find(|n| n.id == id) {
                Some(n) if !n.read => {
                    n.read = true;
                    true
                }
                _ => false,
            },
            Mutation::MarkRead(None) => {
                let mut changed = false;
                for n in self.items.iter_mut().filter(|n| !n.read) {
                    n.read = true;
                    changed = true;
                }
                changed
            }
            Mutation::Remove(id) => {
                let before = self.items.len();
                self.items.retain(|n| n.id != id);
                self.items.len() != before
            }
        }
    }

    /// Apply a local change and journal it for an in-flight load.
    fn commit(&mut self, mutation: Mutation) -> bool {
        self.record(mutation.clone());
        self.apply(mutation)
    }
}

struct Inner {
    rest: Arc<dyn RestApi>,
    events: EventBus,
    state: Mutex<State>,
}

#[derive(Clone)]
pub struct NotificationStore {
    inner: Arc<Inner>,
}

impl NotificationStore {
    pub fn new(rest: Arc<dyn RestApi>, events: EventBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                rest,
                events,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Route `notification` and `notification_read` frames into this store.
    pub fn attach(&self, multiplexer: &TopicMultiplexer) -> Vec<Subscription> {
        let pushes = self.clone();
        let reads = self.clone();
        vec![
            multiplexer.subscribe(Topic::Notification, move |frame| {
                if let PushFrame::Notification(n) = frame {
                    pushes.on_push(n.clone());
                }
            }),
            multiplexer.subscribe(Topic::NotificationRead, move |frame| {
                if let PushFrame::NotificationRead { id } = frame {
                    reads.apply_remote_read(id.as_ref());
                }
            }),
        ]
    }

    // ─── Loading ─────────────────────────────────────────────────────────

    /// Replace local state with the server snapshot for `user_id`.
    ///
    /// On failure the previous list is kept and `last_error` is set.
    pub async fn load(&self, user_id: &RecordId) -> Result<()> {
        let generation = {
            let mut state = self.inner.state.lock();
            if state.user_id.as_ref() != Some(user_id) {
                state.items.clear();
            }
            state.user_id = Some(user_id.clone());
            state.load_generation += 1;
            state.journal = Some(Vec::new());
            state.load_generation
        };

        let fetched = self.inner.rest.fetch_notifications(user_id).await;

        let unread = {
            let mut state = self.inner.state.lock();
            if state.load_generation != generation {
                debug!("Discarding superseded notification load for user {}", user_id);
                return Ok(());
            }
            let journal = state.journal.take().unwrap_or_default();
            match fetched {
                Ok(list) => {
                    let mut seen = HashSet::new();
                    let mut items: Vec<Notification> =
                        list.into_iter().filter(|n| seen.insert(n.id.clone())).collect();
                    items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                    state.items = items;
                    if !journal.is_empty() {
                        debug!("Replaying {} local notification changes over snapshot", journal.len());
                    }
                    for mutation in journal {
                        state.apply(mutation);
                    }
                    state.last_error = None;
                    state.unread()
                }
                Err(e) => {
                    warn!("Notification load for user {} failed: {}", user_id, e);
                    state.last_error = Some(e.to_string());
                    return Err(e);
                }
            }
        };

        info!("Loaded notifications for user {}, {} unread", user_id, unread);
        self.notify(unread);
        Ok(())
    }

    // ─── Push ────────────────────────────────────────────────────────────

    /// Insert a pushed notification at the head, or replace the entry with
    /// the same id in place.
    pub fn on_push(&self, notification: Notification) {
        debug!("Push notification {}", notification.id);
        let unread = {
            let mut state = self.inner.state.lock();
            state.commit(Mutation::Upsert(notification));
            state.unread()
        };
        self.notify(unread);
    }

    /// Another client marked `id` read (`None`: all of them).
    pub fn apply_remote_read(&self, id: Option<&RecordId>) {
        let (changed, unread) = {
            let mut state = self.inner.state.lock();
            let changed = state.commit(Mutation::MarkRead(id.cloned()));
            (changed, state.unread())
        };
        if changed {
            self.notify(unread);
        }
    }

    // ─── Mutations ───────────────────────────────────────────────────────

    /// Flip the local read flag, then confirm with the server.
    ///
    /// The confirmation is sent even when the flag was already set so a
    /// caller can retry a failed one.
    pub async fn mark_read(&self, id: &RecordId) -> Result<()> {
        let user_id = self.flip_read(id)?;
        self.confirm_read(id, &user_id).await
    }

    pub async fn mark_all_read(&self) -> Result<()> {
        let (user_id, changed, unread) = {
            let mut state = self.inner.state.lock();
            let user_id = state
                .user_id
                .clone()
                .ok_or_else(|| RealtimeError::Validation("no notifications loaded".to_string()))?;
            let changed = state.commit(Mutation::MarkRead(None));
            (user_id, changed, state.unread())
        };
        if changed {
            self.notify(unread);
        }

        if let Err(e) = self.inner.rest.mark_all_notifications_read(&user_id).await {
            warn!("Mark-all-read for user {} not confirmed: {}", user_id, e);
            self.inner.state.lock().last_error = Some(e.to_string());
            return Err(e);
        }
        Ok(())
    }

    /// Delete on the server, then drop the local entry.
    pub async fn remove(&self, id: &RecordId) -> Result<()> {
        if let Err(e) = self.inner.rest.delete_notification(id).await {
            warn!("Deleting notification {} failed: {}", id, e);
            self.inner.state.lock().last_error = Some(e.to_string());
            return Err(e);
        }
        let (changed, unread) = {
            let mut state = self.inner.state.lock();
            let changed = state.commit(Mutation::Remove(id.clone()));
            (changed, state.unread())
        };
        if changed {
            self.notify(unread);
        }
        Ok(())
    }

    /// Click-navigation: mark `id` read in the background and tell the
    /// router where to go.
    pub async fn open(&self, id: &RecordId) -> Result<Option<NavigationTarget>> {
        let (target, was_unread) = {
            let state = self.inner.state.lock();
            let n = state
                .items
                .iter()
                .find(|n| &n.id == id)
                .ok_or_else(|| RealtimeError::NotFound(format!("notification {}", id)))?;
            (
                NavigationTarget::for_notification(n.kind.as_deref(), n.related_id.as_ref()),
                !n.read,
            )
        };

        if was_unread {
            let user_id = self.flip_read(id)?;
            let store = self.clone();
            let id = id.clone();
            tokio::spawn(async move {
                // Failure is already logged and recorded in last_error
                let _ = store.confirm_read(&id, &user_id).await;
            });
        }
        if let Some(target) = &target {
            self.inner.events.emit(StoreEvent::Navigate { target: target.clone() });
        }
        Ok(target)
    }

    /// Polling hook: reload when the server's unread count disagrees with
    /// the local one. Returns whether a reload happened.
    pub async fn reconcile_unread(&self, server_count: u64) -> Result<bool> {
        let (user_id, local) = {
            let state = self.inner.state.lock();
            (state.user_id.clone(), state.unread())
        };
        let Some(user_id) = user_id else {
            return Ok(false);
        };
        if server_count == local as u64 {
            return Ok(false);
        }
        info!("Unread count drifted (local {}, server {}), reloading", local, server_count);
        self.load(&user_id).await?;
        Ok(true)
    }

    // ─── Reads ───────────────────────────────────────────────────────────

    pub fn notifications(&self) -> Vec<Notification> {
        self.inner.state.lock().items.clone()
    }

    pub fn get(&self, id: &RecordId) -> Option<Notification> {
        self.inner.state.lock().items.iter().find(|n| &n.id == id).cloned()
    }

    pub fn unread_count(&self) -> usize {
        self.inner.state.lock().unread()
    }

    pub fn user_id(&self) -> Option<RecordId> {
        self.inner.state.lock().user_id.clone()
    }

    /// Error of the last failed load or mutation, cleared by a successful load
    pub fn last_error(&self) -> Option<String> {
        self.inner.state.lock().last_error.clone()
    }

    // ─── Internals ───────────────────────────────────────────────────────

    fn flip_read(&self, id: &RecordId) -> Result<RecordId> {
        let (user_id, changed, unread) = {
            let mut state = self.inner.state.lock();
            if !state.items.iter().any(|n| &n.id == id) {
                return Err(RealtimeError::NotFound(format!("notification {}", id)));
            }
            let user_id = state
                .user_id
                .clone()
                .ok_or_else(|| RealtimeError::Validation("no notifications loaded".to_string()))?;
            let changed = state.commit(Mutation::MarkRead(Some(id.clone())));
            (user_id, changed, state.unread())
        };
        if changed {
            self.notify(unread);
        }
        Ok(user_id)
    }

    async fn confirm_read(&self, id: &RecordId, user_id: &RecordId) -> Result<()> {
        match self.inner.rest.mark_notification_read(id, user_id).await {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("Mark-read of notification {} not confirmed: {}", id, e);
                self.inner.state.lock().last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    fn notify(&self, unread: usize) {
        self.inner.events.emit(StoreEvent::NotificationsChanged { unread });
    }
}
