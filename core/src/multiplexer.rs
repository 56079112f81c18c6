/// Topic multiplexer: in-process fan-out of push frames
///
/// Subscribers register a callback per [`Topic`]. Every frame is delivered
/// to all callbacks of its topic in registration order. A panicking
/// callback is logged and skipped, delivery to the rest continues.
use crate::protocol::{PushFrame, Topic};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{error, trace};

pub type Callback = Arc<dyn Fn(&PushFrame) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Registry {
    topics: RwLock<HashMap<Topic, Vec<(SubscriptionId, Callback)>>>,
    next_id: AtomicU64,
}

#[derive(Clone, Default)]
pub struct TopicMultiplexer {
    registry: Arc<Registry>,
}

impl TopicMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `topic`. Dropping the returned handle removes it.
    pub fn subscribe<F>(&self, topic: Topic, callback: F) -> Subscription
    where
        F: Fn(&PushFrame) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.registry.next_id.fetch_add(1, Ordering::Relaxed));
        self.registry
            .topics
            .write()
            .entry(topic.clone())
            .or_default()
            .push((id, Arc::new(callback)));
        trace!("Subscribed {:?} to {}", id, topic);

        Subscription {
            id,
            topic,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Deliver `frame` to every subscriber of its topic. Returns how many
    /// callbacks completed without panicking.
    pub fn publish(&self, frame: &PushFrame) -> usize {
        let topic = frame.topic();
        // Snapshot so callbacks may (un)subscribe while being called.
        let callbacks: Vec<(SubscriptionId, Callback)> = match self.registry.topics.read().get(&topic) {
            Some(subs) => subs.clone(),
            None => {
                trace!("No subscribers for {}", topic);
                return 0;
            }
        };

        let mut delivered = 0;
        for (id, callback) in callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(frame))) {
                Ok(()) => delivered += 1,
                Err(_) => error!("Subscriber {:?} on {} panicked, skipping", id, topic),
            }
        }
        delivered
    }

    /// Remove one subscription. Removing twice is a no-op.
    pub fn unsubscribe(&self, topic: &Topic, id: SubscriptionId) -> bool {
        remove(&self.registry, topic, id)
    }

    /// Drop every subscription on every topic.
    pub fn clear(&self) {
        self.registry.topics.write().clear();
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.registry
            .topics
            .read()
            .get(topic)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

fn remove(registry: &Registry, topic: &Topic, id: SubscriptionId) -> bool {
    let mut topics = registry.topics.write();
    let Some(subs) = topics.get_mut(topic) else {
        return false;
    };
    let before = subs.len();
    subs.retain(|(sub_id, _)| *sub_id != id);
    let removed = subs.len() != before;
    if subs.is_empty() {
        topics.remove(topic);
    }
    removed
}

/// Handle to a registered callback
pub struct Subscription {
    id: SubscriptionId,
    topic: Topic,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn unsubscribe(self) -> bool {
        self.remove()
    }

    fn remove(&self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => remove(&registry, &self.topic, self.id),
            None => false,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.remove();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordId;
    use parking_lot::Mutex;

    fn read_frame() -> PushFrame {
        PushFrame::NotificationRead { id: Some(RecordId::from(1)) }
    }

    #[test]
    fn test_fan_out_in_registration_order() {
        let mux = TopicMultiplexer::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s1 = seen.clone();
        let _a = mux.subscribe(Topic::NotificationRead, move |_| s1.lock().push("a"));
        let s2 = seen.clone();
        let _b = mux.subscribe(Topic::NotificationRead, move |_| s2.lock().push("b"));
        let s3 = seen.clone();
        let _c = mux.subscribe(Topic::Message, move |_| s3.lock().push("c"));

        assert_eq!(mux.publish(&read_frame()), 2);
        assert_eq!(*seen.lock(), vec!["a", "b"]);
    }

    #[test]
    fn test_panicking_subscriber_is_isolated() {
        let mux = TopicMultiplexer::new();
        let hits = Arc::new(AtomicU64::new(0));

        let _bad = mux.subscribe(Topic::NotificationRead, |_| panic!("boom"));
        let h = hits.clone();
        let _good = mux.subscribe(Topic::NotificationRead, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(mux.publish(&read_frame()), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let mux = TopicMultiplexer::new();
        let sub = mux.subscribe(Topic::Default, |_| {});
        let id = sub.id();

        assert!(mux.unsubscribe(&Topic::Default, id));
        assert!(!mux.unsubscribe(&Topic::Default, id));
        assert!(!sub.unsubscribe());
        assert_eq!(mux.subscriber_count(&Topic::Default), 0);
    }

    #[test]
    fn test_drop_removes_subscription() {
        let mux = TopicMultiplexer::new();
        {
            let _sub = mux.subscribe(Topic::Message, |_| {});
            assert_eq!(mux.subscriber_count(&Topic::Message), 1);
        }
        assert_eq!(mux.subscriber_count(&Topic::Message), 0);
    }

    #[test]
    fn test_untyped_frames_reach_default_topic() {
        let mux = TopicMultiplexer::new();
        let hits = Arc::new(AtomicU64::new(0));
        let h = hits.clone();
        let _sub = mux.subscribe(Topic::Default, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        let frame = PushFrame::Other { kind: None, payload: serde_json::json!({}) };
        mux.publish(&frame);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
