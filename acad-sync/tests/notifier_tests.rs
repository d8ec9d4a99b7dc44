//! Realtime subscription: delivery, throttle, grace, dedup and quota handling

mod helpers;

use acad_common::events::{SkipReason, SyncEvent};
use acad_common::{DashboardSnapshot, Student};
use acad_sync::notifier::{ChangeNotifier, WriteMarker};
use acad_sync::store::PushError;
use chrono::Utc;
use helpers::Harness;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(200);

fn notifier(h: &Harness, throttle: Duration, grace: Duration) -> (ChangeNotifier, WriteMarker) {
    let marker = WriteMarker::new();
    let notifier = ChangeNotifier::new(
        Arc::new(h.cache.clone()),
        h.flag.clone(),
        marker.clone(),
        h.events.clone(),
        throttle,
        grace,
    );
    (notifier, marker)
}

fn with_student(base: &DashboardSnapshot, id: &str, name: &str) -> DashboardSnapshot {
    let mut next = base.clone();
    next.students
        .push(Student::new(id.into(), name, format!("{}@uni.edu", id)));
    next
}

fn doc(snapshot: &DashboardSnapshot) -> Value {
    serde_json::to_value(snapshot).unwrap()
}

async fn next_skip(rx: &mut broadcast::Receiver<SyncEvent>) -> Option<SkipReason> {
    timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(SyncEvent::RealtimeUpdateSkipped { reason, .. }) => return Some(reason),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

#[tokio::test]
async fn test_external_change_is_delivered() {
    let h = Harness::new().await;
    let (notifier, _) = notifier(&h, Duration::ZERO, Duration::ZERO);
    let base = DashboardSnapshot::seeded("prof-1", Utc::now());

    let mut sub = notifier.subscribe("prof-1", Some(&base)).await;
    assert!(sub.is_active());

    h.put_cached("prof-1", doc(&with_student(&base, "5", "Eve"))).await;

    let payload = timeout(WAIT, sub.recv()).await.unwrap().unwrap();
    assert_eq!(payload.students.len(), 1);
    assert_eq!(payload.students[0].name, "Eve");
    assert_eq!(payload.owner_uid, "prof-1");
}

#[tokio::test]
async fn test_echo_of_loaded_state_is_deduplicated() {
    let h = Harness::new().await;
    let mut events = h.events.subscribe();
    let (notifier, _) = notifier(&h, Duration::ZERO, Duration::ZERO);
    let base = DashboardSnapshot::seeded("prof-1", Utc::now());

    let mut sub = notifier.subscribe("prof-1", Some(&base)).await;

    // Same content, newer timestamp: not a change
    let mut echo = base.clone();
    echo.updated_at = Some(Utc::now());
    h.put_cached("prof-1", doc(&echo)).await;
    assert_eq!(next_skip(&mut events).await, Some(SkipReason::Unchanged));

    h.put_cached("prof-1", doc(&with_student(&base, "6", "Fay"))).await;
    let payload = timeout(WAIT, sub.recv()).await.unwrap().unwrap();
    assert_eq!(payload.students[0].name, "Fay");
}

#[tokio::test]
async fn test_rapid_pushes_inside_throttle_window_deliver_once() {
    let h = Harness::new().await;
    let mut events = h.events.subscribe();
    let (notifier, _) = notifier(&h, Duration::from_secs(30), Duration::ZERO);
    let base = DashboardSnapshot::seeded("prof-1", Utc::now());

    let mut sub = notifier.subscribe("prof-1", Some(&base)).await;

    h.put_cached("prof-1", doc(&with_student(&base, "1", "A"))).await;
    h.put_cached("prof-1", doc(&with_student(&base, "2", "B"))).await;

    let first = timeout(WAIT, sub.recv()).await.unwrap().unwrap();
    assert_eq!(first.students[0].name, "A");
    assert_eq!(next_skip(&mut events).await, Some(SkipReason::Throttled));
    assert!(timeout(QUIET, sub.recv()).await.is_err(), "second push withheld");
}

#[tokio::test]
async fn test_push_right_after_local_write_is_skipped() {
    let h = Harness::new().await;
    let mut events = h.events.subscribe();
    let (notifier, marker) = notifier(&h, Duration::ZERO, Duration::from_secs(30));
    let base = DashboardSnapshot::seeded("prof-1", Utc::now());

    let mut sub = notifier.subscribe("prof-1", Some(&base)).await;

    marker.stamp();
    h.put_cached("prof-1", doc(&with_student(&base, "1", "A"))).await;

    assert_eq!(next_skip(&mut events).await, Some(SkipReason::RecentLocalWrite));
    assert!(timeout(QUIET, sub.recv()).await.is_err());
}

#[tokio::test]
async fn test_undecodable_push_is_skipped() {
    let h = Harness::new().await;
    let mut events = h.events.subscribe();
    let (notifier, _) = notifier(&h, Duration::ZERO, Duration::ZERO);

    let mut sub = notifier.subscribe("prof-1", None).await;
    h.put_cached("prof-1", json!({"students": 5})).await;

    assert_eq!(next_skip(&mut events).await, Some(SkipReason::Undecodable));
    assert!(timeout(QUIET, sub.recv()).await.is_err());
}

#[tokio::test]
async fn test_quota_error_disables_realtime_until_cleared() {
    let h = Harness::new().await;
    let mut events = h.events.subscribe();
    let (notifier, _) = notifier(&h, Duration::ZERO, Duration::ZERO);
    let base = DashboardSnapshot::seeded("prof-1", Utc::now());

    let mut sub = notifier.subscribe("prof-1", Some(&base)).await;
    h.cache
        .publish_error("dashboards", "prof-1", PushError::QuotaExhausted("daily reads".into()));

    let disabled = timeout(WAIT, async {
        loop {
            if let Ok(SyncEvent::RealtimeDisabled { reason, .. }) = events.recv().await {
                return reason;
            }
        }
    })
    .await
    .expect("realtime disabled event");
    assert!(disabled.contains("daily reads"));
    assert!(h.flag.is_disabled(Utc::now()).await.unwrap());

    // The failed subscription delivers nothing further
    h.put_cached("prof-1", doc(&with_student(&base, "1", "A"))).await;
    assert!(timeout(QUIET, sub.recv()).await.is_err());

    let next = notifier.subscribe("prof-1", Some(&base)).await;
    assert!(next.is_inert());

    h.flag.clear().await.unwrap();
    let resumed = notifier.subscribe("prof-1", Some(&base)).await;
    assert!(resumed.is_active());
}

#[tokio::test]
async fn test_channel_error_leaves_flag_alone() {
    let h = Harness::new().await;
    let (notifier, _) = notifier(&h, Duration::ZERO, Duration::ZERO);

    let mut sub = notifier.subscribe("prof-1", None).await;
    h.cache
        .publish_error("dashboards", "prof-1", PushError::Channel("stream reset".into()));

    assert!(timeout(QUIET, sub.recv()).await.is_err());
    assert!(!h.flag.is_disabled(Utc::now()).await.unwrap());
}

#[tokio::test]
async fn test_disabled_flag_yields_inert_subscription() {
    let h = Harness::new().await;
    h.flag.disable_manually("maintenance").await.unwrap();
    let (notifier, _) = notifier(&h, Duration::ZERO, Duration::ZERO);

    let mut sub = notifier.subscribe("prof-1", None).await;
    assert!(sub.is_inert());
    assert!(!sub.is_active());

    h.put_cached("prof-1", json!({"ownerUid": "prof-1"})).await;
    assert!(timeout(QUIET, sub.recv()).await.is_err(), "inert never yields");

    sub.unsubscribe();
    sub.unsubscribe();
}

#[tokio::test]
async fn test_unsubscribe_is_idempotent() {
    let h = Harness::new().await;
    let (notifier, _) = notifier(&h, Duration::ZERO, Duration::ZERO);

    let mut sub = notifier.subscribe("prof-1", None).await;
    sub.unsubscribe();
    sub.unsubscribe();

    assert!(!sub.is_active());
    assert!(timeout(WAIT, sub.recv()).await.unwrap().is_none());
}
