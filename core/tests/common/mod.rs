//! In-memory backend shared by the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use lostfound_realtime::models::NewMessage;
use lostfound_realtime::{Conversation, Delivery, Message, Notification, RealtimeError, RecordId, RestApi, Result, SenderRole, Viewer};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_704_103_200 + secs, 0).unwrap()
}

pub fn notification(id: i64, message: &str, read: bool, secs: i64) -> Notification {
    Notification {
        id: RecordId::from(id),
        message: message.to_string(),
        read,
        created_at: at(secs),
        kind: None,
        related_id: None,
    }
}

pub fn conversation(id: i64, user_id: i64, staff_id: i64, last_secs: Option<i64>, unread: u32) -> Conversation {
    Conversation {
        id: RecordId::from(id),
        user_id: Some(RecordId::from(user_id)),
        user_name: Some(format!("user-{}", user_id)),
        staff_id: Some(RecordId::from(staff_id)),
        staff_name: Some(format!("staff-{}", staff_id)),
        last_message: None,
        last_message_at: last_secs.map(at),
        unread_count: unread,
    }
}

pub fn message(id: i64, conversation_id: i64, role: SenderRole, sender: i64, content: &str, time: DateTime<Utc>) -> Message {
    Message {
        id: Some(RecordId::from(id)),
        local_id: None,
        conversation_id: RecordId::from(conversation_id),
        sender_role: role,
        sender_id: Some(RecordId::from(sender)),
        content: content.to_string(),
        timestamp: time,
        read: false,
        delivery: Delivery::Sent,
    }
}

pub fn staff() -> Viewer {
    Viewer::new(2, SenderRole::Staff)
}

pub fn user() -> Viewer {
    Viewer::new(7, SenderRole::User)
}

/// Scriptable backend. Calls are recorded as `"op:arg"` strings.
#[derive(Default)]
pub struct FakeRest {
    pub notifications: Mutex<Vec<Notification>>,
    pub unread_count: Mutex<Option<u64>>,
    pub conversations: Mutex<Vec<Conversation>>,
    pub messages: Mutex<HashMap<RecordId, Vec<Message>>>,
    pub calls: Mutex<Vec<String>>,
    pub next_id: AtomicI64,
    failing: Mutex<HashSet<String>>,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
}

impl FakeRest {
    pub fn new() -> Arc<Self> {
        let fake = Self::default();
        fake.next_id.store(1000, Ordering::SeqCst);
        Arc::new(fake)
    }

    /// Make `op` fail with a 500 until `heal` is called.
    pub fn fail(&self, op: &str) {
        self.failing.lock().insert(op.to_string());
    }

    pub fn heal(&self, op: &str) {
        self.failing.lock().remove(op);
    }

    /// Hold the next call to `key` until the returned gate is notified.
    pub fn gate(&self, key: &str) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.gates.lock().insert(key.to_string(), notify.clone());
        notify
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.starts_with(prefix)).count()
    }

    /// Wait until `prefix` has been called `n` times.
    pub async fn wait_for_calls(&self, prefix: &str, n: usize) {
        for _ in 0..1000 {
            if self.count(prefix) >= n {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("{} not called {} times, calls: {:?}", prefix, n, self.calls());
    }

    async fn enter(&self, op: &str, arg: &str) -> Result<()> {
        let key = format!("{}:{}", op, arg);
        self.calls.lock().push(key.clone());
        let gate = self.gates.lock().remove(&key);
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.failing.lock().contains(op) {
            return Err(RealtimeError::Http {
                status: 500,
                body: format!("{} failed", op),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RestApi for FakeRest {
    async fn fetch_notifications(&self, user_id: &RecordId) -> Result<Vec<Notification>> {
        let snapshot = self.notifications.lock().clone();
        self.enter("fetch_notifications", user_id.as_str()).await?;
        Ok(snapshot)
    }

    async fn fetch_unread_count(&self, user_id: &RecordId) -> Result<u64> {
        self.enter("fetch_unread_count", user_id.as_str()).await?;
        let count = *self.unread_count.lock();
        Ok(count.unwrap_or_else(|| self.notifications.lock().iter().filter(|n| !n.read).count() as u64))
    }

    async fn mark_notification_read(&self, id: &RecordId, user_id: &RecordId) -> Result<Option<Notification>> {
        self.enter("mark_notification_read", &format!("{}?userId={}", id, user_id)).await?;
        let mut list = self.notifications.lock();
        Ok(list.iter_mut().find(|n| &n.id == id).map(|n| {
            n.read = true;
            n.clone()
        }))
    }

    async fn mark_all_notifications_read(&self, user_id: &RecordId) -> Result<()> {
        self.enter("mark_all_notifications_read", user_id.as_str()).await?;
        for n in self.notifications.lock().iter_mut() {
            n.read = true;
        }
        Ok(())
    }

    async fn delete_notification(&self, id: &RecordId) -> Result<()> {
        self.enter("delete_notification", id.as_str()).await?;
        self.notifications.lock().retain(|n| &n.id != id);
        Ok(())
    }

    async fn fetch_conversations(&self, viewer: &Viewer) -> Result<Vec<Conversation>> {
        self.enter("fetch_conversations", viewer.id.as_str()).await?;
        Ok(self.conversations.lock().clone())
    }

    async fn open_conversation(&self, user_id: &RecordId, staff_id: &RecordId) -> Result<Conversation> {
        self.enter("open_conversation", &format!("{}-{}", user_id, staff_id)).await?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let created = Conversation {
            id: RecordId::from(id),
            user_id: Some(user_id.clone()),
            user_name: None,
            staff_id: Some(staff_id.clone()),
            staff_name: None,
            last_message: None,
            last_message_at: None,
            unread_count: 0,
        };
        self.conversations.lock().push(created.clone());
        Ok(created)
    }

    async fn fetch_messages(&self, conversation_id: &RecordId) -> Result<Vec<Message>> {
        let snapshot = self.messages.lock().get(conversation_id).cloned().unwrap_or_default();
        self.enter("fetch_messages", conversation_id.as_str()).await?;
        Ok(snapshot)
    }

    async fn mark_conversation_read(&self, conversation_id: &RecordId, is_user: bool) -> Result<()> {
        self.enter("mark_conversation_read", &format!("{}?isUser={}", conversation_id, is_user))
            .await
    }

    async fn send_message(&self, conversation_id: &RecordId, body: &NewMessage) -> Result<Message> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let created = Message {
            id: Some(RecordId::from(id)),
            local_id: None,
            conversation_id: conversation_id.clone(),
            sender_role: body.sender_type,
            sender_id: Some(body.sender_id.clone()),
            content: body.content.clone(),
            timestamp: Utc::now(),
            read: false,
            delivery: Delivery::Sent,
        };
        self.enter("send_message", conversation_id.as_str()).await?;
        self.messages
            .lock()
            .entry(conversation_id.clone())
            .or_default()
            .push(created.clone());
        Ok(created)
    }
}
