use chrono::Utc;
use fitlog_notify::message_hub;
use fitlog_notify::store::MemoryStore;
use fitlog_notify::tracker::TrackerConfig;
use fitlog_notify::{MessageRecord, NotificationTracker, TrackerHandle, UnreadState, UserId};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

async fn wait_for(
    rx: &mut watch::Receiver<UnreadState>,
    mut f: impl FnMut(&UnreadState) -> bool,
) -> UnreadState {
    let state = tokio::time::timeout(
        Duration::from_secs(30),
        rx.wait_for(|s| {
            assert!(s.is_consistent(), "inconsistent state published: {:?}", s);
            f(s)
        }),
    )
    .await
    .expect("timed out waiting for tracker state")
    .expect("tracker stopped");
    state.clone()
}

struct Fixture {
    store: Arc<MemoryStore>,
    me: UserId,
    ana: UserId,
    ben: UserId,
}

async fn fixture() -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let (me, ana, ben) = (UserId::new("me"), UserId::new("ana"), UserId::new("ben"));
    store.set_display_name(&me, "Me").await;
    store.set_display_name(&ana, "Ana").await;
    store.set_display_name(&ben, "Ben").await;
    store.add_friendship(&me, &ana).await;
    store.add_friendship(&me, &ben).await;
    Fixture { store, me, ana, ben }
}

fn track(fx: &Fixture, viewer: &UserId) -> TrackerHandle {
    NotificationTracker::spawn(fx.store.clone(), TrackerConfig::default(), Some(viewer.clone()))
}

fn message(from: &UserId, to: &UserId, content: &str) -> MessageRecord {
    MessageRecord {
        id: Uuid::new_v4(),
        sender_id: from.clone(),
        receiver_id: to.clone(),
        content: content.to_string(),
        read: false,
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_reconcile_counts_only_friends_with_unread() {
    let fx = fixture().await;
    fx.store.send_message(&fx.ana, &fx.me, "run?").await;
    fx.store.send_message(&fx.ana, &fx.me, "5k at 7").await;
    fx.store.send_message(&fx.me, &fx.ben, "nice lift").await;

    let handle = track(&fx, &fx.me);
    let state = handle.reconcile().await.unwrap();

    assert_eq!(state, UnreadState::from_counts([(fx.ana.clone(), 2)]));
    assert_eq!(state.total_unread(), 2);
    assert!(!state.unread_by_correspondent().contains_key(&fx.ben));
}

#[tokio::test]
async fn test_reconcile_ignores_messages_from_non_friends() {
    let fx = fixture().await;
    let stranger = UserId::new("stranger");
    fx.store.send_message(&stranger, &fx.me, "follow me").await;
    fx.store.send_message(&fx.ben, &fx.me, "hey").await;

    let handle = track(&fx, &fx.me);
    let state = handle.reconcile().await.unwrap();

    assert_eq!(state.total_unread(), 1);
    assert_eq!(state.unread_for(&fx.ben), 1);
    assert!(state.is_consistent());
}

#[tokio::test]
async fn test_incoming_message_increments_and_raises_toast() {
    let fx = fixture().await;
    let handle = track(&fx, &fx.me);
    assert_eq!(handle.reconcile().await.unwrap(), UnreadState::empty());
    let mut rx = handle.watch();

    fx.store.send_message(&fx.ana, &fx.me, "stretch first").await;
    let state = wait_for(&mut rx, |s| s.total_unread() == 1).await;

    assert_eq!(state.unread_for(&fx.ana), 1);
    assert_eq!(state.unread_by_correspondent().len(), 1);
    let toast = state.pending_toast().expect("toast raised");
    assert_eq!(toast.correspondent_name, "Ana");
    assert_eq!(toast.message_content, "stretch first");
}

#[tokio::test]
async fn test_foreign_and_own_messages_are_ignored() {
    let fx = fixture().await;
    let handle = track(&fx, &fx.me);
    let before = handle.reconcile().await.unwrap();

    handle
        .on_incoming_message(message(&fx.ana, &fx.ben, "not for you"))
        .await
        .unwrap();
    handle
        .on_incoming_message(message(&fx.me, &fx.ana, "sent by me"))
        .await
        .unwrap();

    // Commands are handled in order, so the reply reflects both events.
    fx.store.set_unavailable(true).await;
    let after = handle.reconcile().await.unwrap();
    assert_eq!(after, before);
}

#[tokio::test]
async fn test_unknown_sender_toast_uses_id() {
    let fx = fixture().await;
    let handle = track(&fx, &fx.me);
    handle.reconcile().await.unwrap();
    let mut rx = handle.watch();

    let stranger = UserId::new("stranger");
    handle
        .on_incoming_message(message(&stranger, &fx.me, "hi"))
        .await
        .unwrap();
    let state = wait_for(&mut rx, |s| s.total_unread() == 1).await;
    assert_eq!(state.pending_toast().unwrap().correspondent_name, "stranger");
}

#[tokio::test(start_paused = true)]
async fn test_mark_read_clears_before_store_and_resyncs_on_failure() {
    let fx = fixture().await;
    for content in ["one", "two", "three"] {
        fx.store.send_message(&fx.ana, &fx.me, content).await;
    }
    let handle = track(&fx, &fx.me);
    let state = handle.reconcile().await.unwrap();
    assert_eq!(state, UnreadState::from_counts([(fx.ana.clone(), 3)]));

    let delay = Duration::from_secs(1);
    fx.store.set_mark_read_delay(Some(delay)).await;
    fx.store.set_fail_mark_read(true).await;
    let mut rx = handle.watch();
    let started = tokio::time::Instant::now();

    handle.mark_read(fx.ana.clone()).await.unwrap();
    let cleared = wait_for(&mut rx, |s| s.total_unread() == 0).await;
    assert!(started.elapsed() < delay, "cleared only after the store call");
    assert!(cleared.unread_by_correspondent().is_empty());

    let restored = wait_for(&mut rx, |s| s.total_unread() == 3).await;
    assert!(started.elapsed() >= delay);
    assert_eq!(restored, UnreadState::from_counts([(fx.ana.clone(), 3)]));
}

#[tokio::test]
async fn test_mark_read_persists_on_success() {
    let fx = fixture().await;
    fx.store.send_message(&fx.ana, &fx.me, "one").await;
    fx.store.send_message(&fx.ben, &fx.me, "two").await;
    let handle = track(&fx, &fx.me);
    handle.reconcile().await.unwrap();
    let mut rx = handle.watch();

    handle.mark_read(fx.ana.clone()).await.unwrap();
    let state = wait_for(&mut rx, |s| s.total_unread() == 1).await;
    assert_eq!(state.unread_for(&fx.ana), 0);
    assert_eq!(state.unread_for(&fx.ben), 1);

    // The store eventually agrees, so a fresh reconcile keeps ana cleared.
    for _ in 0..100 {
        let state = handle.reconcile().await.unwrap();
        if state.unread_for(&fx.ana) == 0 && state.total_unread() == 1 {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("mark read never reached the store");
}

#[tokio::test]
async fn test_mark_read_unknown_correspondent_keeps_state() {
    let fx = fixture().await;
    fx.store.send_message(&fx.ana, &fx.me, "one").await;
    let handle = track(&fx, &fx.me);
    let before = handle.reconcile().await.unwrap();

    handle.mark_read(UserId::new("nobody")).await.unwrap();
    fx.store.set_unavailable(true).await;
    assert_eq!(handle.reconcile().await.unwrap(), before);
}

#[tokio::test]
async fn test_failed_reconcile_keeps_previous_state() {
    let fx = fixture().await;
    fx.store.send_message(&fx.ana, &fx.me, "one").await;
    let handle = track(&fx, &fx.me);
    let before = handle.reconcile().await.unwrap();
    assert_eq!(before.total_unread(), 1);

    fx.store.set_unavailable(true).await;
    assert_eq!(handle.reconcile().await.unwrap(), before);
    assert_eq!(handle.state(), before);
}

#[tokio::test]
async fn test_duplicate_delivery_is_counted_twice() {
    let fx = fixture().await;
    let handle = track(&fx, &fx.me);
    handle.reconcile().await.unwrap();
    let mut rx = handle.watch();

    let sent = fx.store.send_message(&fx.ana, &fx.me, "once").await;
    wait_for(&mut rx, |s| s.total_unread() == 1).await;
    fx.store.redeliver(&sent);
    let state = wait_for(&mut rx, |s| s.total_unread() == 2).await;
    assert_eq!(state.unread_for(&fx.ana), 2);
}

#[tokio::test]
async fn test_viewer_change_resets_and_releases_subscription() {
    let fx = fixture().await;
    fx.store.add_friendship(&fx.ana, &fx.ben).await;
    let handle = track(&fx, &fx.me);
    handle.reconcile().await.unwrap();
    let mut rx = handle.watch();

    fx.store.send_message(&fx.ana, &fx.me, "for me").await;
    wait_for(&mut rx, |s| s.total_unread() == 1).await;

    handle.set_viewer(Some(fx.ben.clone())).await.unwrap();
    let state = handle.reconcile().await.unwrap();
    assert_eq!(state, UnreadState::empty());

    assert_eq!(message_hub::subscriber_count(fx.store.hub(), &fx.me), 0);
    assert!(!fx.store.hub().contains_key(&fx.me));

    fx.store.send_message(&fx.ana, &fx.me, "old viewer").await;
    fx.store.send_message(&fx.ana, &fx.ben, "for ben").await;
    let state = wait_for(&mut rx, |s| s.pending_toast().is_some()).await;
    assert_eq!(state.pending_toast().unwrap().message_content, "for ben");
    assert_eq!(state.pending_toast().unwrap().correspondent_name, "Ana");
    assert_eq!(state.total_unread(), 1);
}

#[tokio::test]
async fn test_unauthenticated_viewer_is_empty() {
    let fx = fixture().await;
    fx.store.send_message(&fx.ana, &fx.me, "one").await;
    let handle = track(&fx, &fx.me);
    assert_eq!(handle.reconcile().await.unwrap().total_unread(), 1);

    handle.set_viewer(None).await.unwrap();
    assert_eq!(handle.reconcile().await.unwrap(), UnreadState::empty());

    handle
        .on_incoming_message(message(&fx.ana, &fx.me, "ignored"))
        .await
        .unwrap();
    assert_eq!(handle.reconcile().await.unwrap(), UnreadState::empty());
}

#[tokio::test]
async fn test_dropping_handles_stops_tracker() {
    let fx = fixture().await;
    let handle = track(&fx, &fx.me);
    handle.reconcile().await.unwrap();
    let mut rx = handle.watch();
    drop(handle);

    while rx.changed().await.is_ok() {}
    assert_eq!(*rx.borrow(), UnreadState::empty());
}

#[tokio::test]
async fn test_shutdown_removes_viewer_channel() {
    let fx = fixture().await;
    let handle = track(&fx, &fx.me);
    handle.reconcile().await.unwrap();
    assert_eq!(message_hub::subscriber_count(fx.store.hub(), &fx.me), 1);

    let mut rx = handle.watch();
    handle.shutdown().await;
    while rx.changed().await.is_ok() {}

    assert!(!fx.store.hub().contains_key(&fx.me));
    assert!(fx.store.hub().is_empty());
}
