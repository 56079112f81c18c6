/// Notification store behavior against an in-memory backend
extern crate lostfound_realtime;

mod common;

use common::*;
use lostfound_realtime::{EventBus, Notification, NotificationStore, RealtimeError, RecordId, StoreEvent};
use serde_json::json;
use std::sync::Arc;

fn store(rest: &Arc<FakeRest>) -> (NotificationStore, EventBus) {
    let events = EventBus::new(64);
    (NotificationStore::new(rest.clone(), events.clone()), events)
}

fn assert_unread_matches(store: &NotificationStore) {
    let derived = store.notifications().iter().filter(|n| !n.read).count();
    assert_eq!(store.unread_count(), derived);
}

fn user7() -> RecordId {
    RecordId::from(7)
}

#[tokio::test]
async fn test_fresh_load() {
    let rest = FakeRest::new();
    let record: Notification = serde_json::from_value(json!({
        "id": 1, "message": "Item matched", "read": false, "createdAt": "2024-01-01T10:00:00Z"
    }))
    .unwrap();
    *rest.notifications.lock() = vec![record];
    let (store, events) = store(&rest);
    let mut rx = events.subscribe();

    store.load(&user7()).await.unwrap();

    assert_eq!(store.unread_count(), 1);
    assert_eq!(store.notifications().len(), 1);
    assert_eq!(rx.recv().await.unwrap(), StoreEvent::NotificationsChanged { unread: 1 });
    assert!(store.last_error().is_none());
}

#[tokio::test]
async fn test_load_sorts_newest_first_and_drops_duplicates() {
    let rest = FakeRest::new();
    *rest.notifications.lock() = vec![
        notification(1, "old", true, 0),
        notification(3, "newest", false, 300),
        notification(2, "middle", false, 100),
        notification(3, "duplicate", false, 300),
    ];
    let (store, _events) = store(&rest);

    store.load(&user7()).await.unwrap();

    let ids: Vec<RecordId> = store.notifications().into_iter().map(|n| n.id).collect();
    assert_eq!(ids, vec![RecordId::from(3), RecordId::from(2), RecordId::from(1)]);
    assert_eq!(store.get(&RecordId::from(3)).unwrap().message, "newest");
    assert_eq!(store.unread_count(), 2);
}

#[tokio::test]
async fn test_mark_all_then_push() {
    let rest = FakeRest::new();
    *rest.notifications.lock() = vec![notification(1, "Item matched", false, 0)];
    let (store, _events) = store(&rest);
    store.load(&user7()).await.unwrap();

    store.mark_all_read().await.unwrap();
    assert_eq!(store.unread_count(), 0);
    assert_eq!(rest.count("mark_all_notifications_read:7"), 1);

    store.on_push(notification(2, "Claim approved", false, 60));

    let list = store.notifications();
    assert_eq!(store.unread_count(), 1);
    assert_eq!(list.len(), 2);
    assert_eq!(list[0].id, RecordId::from(2));
}

#[tokio::test]
async fn test_push_with_known_id_replaces_entry() {
    let rest = FakeRest::new();
    *rest.notifications.lock() = vec![notification(1, "Item matched", false, 0)];
    let (store, _events) = store(&rest);
    store.load(&user7()).await.unwrap();

    let mut pushed = notification(1, "Item matched", true, 0);
    pushed.message = "Item matched (updated)".to_string();
    store.on_push(pushed);

    let list = store.notifications();
    assert_eq!(list.len(), 1);
    assert!(list[0].read);
    assert_eq!(list[0].message, "Item matched (updated)");
    assert_eq!(store.unread_count(), 0);
}

#[tokio::test]
async fn test_mark_read_is_idempotent() {
    let rest = FakeRest::new();
    *rest.notifications.lock() = vec![notification(1, "a", false, 0), notification(2, "b", false, 10)];
    let (store, _events) = store(&rest);
    store.load(&user7()).await.unwrap();
    assert_eq!(store.unread_count(), 2);

    store.mark_read(&RecordId::from(1)).await.unwrap();
    store.mark_read(&RecordId::from(1)).await.unwrap();

    assert_eq!(store.unread_count(), 1);
    assert_eq!(store.notifications().iter().filter(|n| n.read).count(), 1);
    assert_eq!(rest.count("mark_notification_read:1?userId=7"), 2);
}

#[tokio::test]
async fn test_mark_read_unknown_id() {
    let rest = FakeRest::new();
    let (store, _events) = store(&rest);
    store.load(&user7()).await.unwrap();

    let err = store.mark_read(&RecordId::from(99)).await.unwrap_err();
    assert!(matches!(err, RealtimeError::NotFound(_)));
    assert_eq!(rest.count("mark_notification_read"), 0);
}

#[tokio::test]
async fn test_failed_mark_read_keeps_flag_until_reload() {
    let rest = FakeRest::new();
    *rest.notifications.lock() = vec![notification(1, "a", false, 0)];
    let (store, _events) = store(&rest);
    store.load(&user7()).await.unwrap();

    rest.fail("mark_notification_read");
    let err = store.mark_read(&RecordId::from(1)).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(store.get(&RecordId::from(1)).unwrap().read);
    assert_eq!(store.unread_count(), 0);
    assert!(store.last_error().is_some());

    // The server never saw the mark, the next load restores its truth
    store.load(&user7()).await.unwrap();
    assert_eq!(store.unread_count(), 1);
    assert!(store.last_error().is_none());
}

#[tokio::test]
async fn test_failed_load_keeps_previous_state() {
    let rest = FakeRest::new();
    *rest.notifications.lock() = vec![notification(1, "a", false, 0)];
    let (store, _events) = store(&rest);
    store.load(&user7()).await.unwrap();

    rest.notifications.lock().push(notification(2, "b", false, 10));
    rest.fail("fetch_notifications");
    assert!(store.load(&user7()).await.is_err());

    assert_eq!(store.notifications().len(), 1);
    assert_eq!(store.unread_count(), 1);
    assert!(store.last_error().is_some());
}

#[tokio::test]
async fn test_changes_during_load_survive_snapshot() {
    let rest = FakeRest::new();
    *rest.notifications.lock() = vec![notification(1, "a", false, 0)];
    let (store, _events) = store(&rest);
    store.load(&user7()).await.unwrap();

    rest.notifications.lock().push(notification(2, "b", false, 10));
    let gate = rest.gate("fetch_notifications:7");
    let loading = tokio::spawn({
        let store = store.clone();
        async move { store.load(&RecordId::from(7)).await }
    });
    rest.wait_for_calls("fetch_notifications", 2).await;

    store.on_push(notification(3, "c", false, 20));
    store.mark_read(&RecordId::from(1)).await.unwrap();
    gate.notify_one();
    loading.await.unwrap().unwrap();

    let ids: Vec<RecordId> = store.notifications().into_iter().map(|n| n.id).collect();
    assert_eq!(ids, vec![RecordId::from(3), RecordId::from(2), RecordId::from(1)]);
    assert!(store.get(&RecordId::from(1)).unwrap().read);
    assert_eq!(store.unread_count(), 2);
}

#[tokio::test]
async fn test_remote_read_frames() {
    let rest = FakeRest::new();
    *rest.notifications.lock() = vec![notification(1, "a", false, 0), notification(2, "b", false, 10)];
    let (store, _events) = store(&rest);
    store.load(&user7()).await.unwrap();

    store.apply_remote_read(Some(&RecordId::from(1)));
    assert_eq!(store.unread_count(), 1);
    store.apply_remote_read(None);
    assert_eq!(store.unread_count(), 0);
    assert_eq!(rest.count("mark_"), 0);
}

#[tokio::test]
async fn test_open_navigates_and_marks_read() {
    let rest = FakeRest::new();
    let mut claim = notification(1, "Claim approved", false, 0);
    claim.kind = Some("CLAIM_APPROVED".to_string());
    claim.related_id = Some(RecordId::from(42));
    *rest.notifications.lock() = vec![claim, notification(2, "plain", true, 10)];
    let (store, events) = store(&rest);
    store.load(&user7()).await.unwrap();
    let mut rx = events.subscribe();

    let target = store.open(&RecordId::from(1)).await.unwrap().unwrap();
    assert_eq!(target.section, "claims");
    assert_eq!(target.related_id, Some(RecordId::from(42)));
    assert_eq!(store.unread_count(), 0);

    assert_eq!(rx.recv().await.unwrap(), StoreEvent::NotificationsChanged { unread: 0 });
    assert_eq!(rx.recv().await.unwrap(), StoreEvent::Navigate { target });
    rest.wait_for_calls("mark_notification_read:1", 1).await;

    // Already read and nothing to follow
    assert!(store.open(&RecordId::from(2)).await.unwrap().is_none());
    assert_eq!(rest.count("mark_notification_read:2"), 0);
}

#[tokio::test]
async fn test_remove() {
    let rest = FakeRest::new();
    *rest.notifications.lock() = vec![notification(1, "a", false, 0), notification(2, "b", false, 10)];
    let (store, _events) = store(&rest);
    store.load(&user7()).await.unwrap();

    store.remove(&RecordId::from(1)).await.unwrap();
    assert_eq!(store.notifications().len(), 1);
    assert_eq!(rest.notifications.lock().len(), 1);

    rest.fail("delete_notification");
    assert!(store.remove(&RecordId::from(2)).await.is_err());
    assert_eq!(store.notifications().len(), 1);
}

#[tokio::test]
async fn test_reconcile_unread_reloads_on_drift() {
    let rest = FakeRest::new();
    let (store, _events) = store(&rest);
    assert!(!store.reconcile_unread(3).await.unwrap());

    *rest.notifications.lock() = vec![notification(1, "a", false, 0)];
    store.load(&user7()).await.unwrap();
    assert!(!store.reconcile_unread(1).await.unwrap());
    assert_eq!(rest.count("fetch_notifications"), 1);

    rest.notifications.lock().push(notification(2, "b", false, 10));
    assert!(store.reconcile_unread(2).await.unwrap());
    assert_eq!(store.unread_count(), 2);
    assert_eq!(rest.count("fetch_notifications"), 2);
}

#[tokio::test]
async fn test_unread_count_tracks_every_mutation() {
    let rest = FakeRest::new();
    *rest.notifications.lock() = vec![
        notification(1, "a", false, 0),
        notification(2, "b", true, 10),
        notification(3, "c", false, 20),
    ];
    let (store, _events) = store(&rest);

    store.load(&user7()).await.unwrap();
    assert_unread_matches(&store);
    store.on_push(notification(4, "d", false, 30));
    assert_unread_matches(&store);
    store.on_push(notification(2, "b", false, 10));
    assert_unread_matches(&store);
    store.mark_read(&RecordId::from(3)).await.unwrap();
    assert_unread_matches(&store);
    store.apply_remote_read(Some(&RecordId::from(4)));
    assert_unread_matches(&store);
    store.mark_all_read().await.unwrap();
    assert_unread_matches(&store);
    assert_eq!(store.unread_count(), 0);
    store.load(&user7()).await.unwrap();
    assert_unread_matches(&store);
}
