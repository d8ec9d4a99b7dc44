//! Realtime change notifier
//!
//! Watches the owner's cached document and forwards external changes to the
//! session as [`MinimalPayload`]s. Each push passes through a [`ChangeGate`]:
//!
//! 1. Throttle: pushes closer than the throttle window to the last accepted
//!    update are skipped
//! 2. Grace: pushes arriving shortly after a local write are skipped, so a
//!    write's own echo never overwrites newer local state
//! 3. Dedup: pushes whose [`ChangeHash`] equals the last accepted one are
//!    skipped
//!
//! Push-channel failures are logged and never reach the subscriber. Quota
//! exhaustion also sets the persisted realtime disable flag.

use crate::hash::ChangeHash;
use crate::store::{DocumentCache, PushError, PushEvent, RealtimeFlag};
use acad_common::events::{EventBus, SkipReason, SyncEvent};
use acad_common::model::{Alert, DASHBOARD_COLLECTION};
use acad_common::{DashboardSnapshot, EnrollmentMap, Student, Subject};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Payloads buffered between the listener task and the subscriber
const PAYLOAD_BUFFER: usize = 16;

/// Fields a realtime update replaces in session state
///
/// Attendance records and grades are never carried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinimalPayload {
    pub subjects: Vec<Subject>,
    pub removed_subjects: Vec<Subject>,
    pub students: Vec<Student>,
    pub enrolls: EnrollmentMap,
    pub alerts: Vec<Alert>,
    pub owner_uid: String,
    pub updated_at: Option<DateTime<Utc>>,
}

impl MinimalPayload {
    pub fn from_snapshot(snapshot: &DashboardSnapshot) -> Self {
        Self {
            subjects: snapshot.subjects.clone(),
            removed_subjects: snapshot.removed_subjects.clone(),
            students: snapshot.students.clone(),
            enrolls: snapshot.enrolls.clone(),
            alerts: snapshot.alerts.clone(),
            owner_uid: snapshot.owner_uid.clone(),
            updated_at: snapshot.updated_at,
        }
    }

    /// Replace every carried field of `snapshot`
    pub fn apply_to(self, snapshot: &mut DashboardSnapshot) {
        snapshot.subjects = self.subjects;
        snapshot.removed_subjects = self.removed_subjects;
        snapshot.students = self.students;
        snapshot.enrolls = self.enrolls;
        snapshot.alerts = self.alerts;
        snapshot.owner_uid = self.owner_uid;
        snapshot.updated_at = self.updated_at;
    }
}

/// Time of the owner's most recent local cache write
///
/// Shared between the write queue, which stamps it, and the notifier, which
/// reads it for the grace period.
#[derive(Debug, Clone, Default)]
pub struct WriteMarker {
    last: Arc<Mutex<Option<Instant>>>,
}

impl WriteMarker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stamp(&self) {
        self.stamp_at(Instant::now());
    }

    pub fn stamp_at(&self, at: Instant) {
        let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
        *last = Some(at);
    }

    pub fn last(&self) -> Option<Instant> {
        *self.last.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Deliver,
    Skip(SkipReason),
}

/// Throttle, grace and dedup state for one subscription
#[derive(Debug, Clone)]
pub struct ChangeGate {
    throttle: Duration,
    grace: Duration,
    last_accepted: Option<Instant>,
    last_hash: Option<ChangeHash>,
}

impl ChangeGate {
    pub fn new(throttle: Duration, grace: Duration) -> Self {
        Self {
            throttle,
            grace,
            last_accepted: None,
            last_hash: None,
        }
    }

    /// Decide on one push; accepted pushes update the gate state
    pub fn evaluate(
        &mut self,
        hash: ChangeHash,
        now: Instant,
        last_local_write: Option<Instant>,
    ) -> GateDecision {
        if let Some(accepted) = self.last_accepted {
            if now.saturating_duration_since(accepted) < self.throttle {
                return GateDecision::Skip(SkipReason::Throttled);
            }
        }

        if let Some(written) = last_local_write {
            if now.saturating_duration_since(written) < self.grace {
                return GateDecision::Skip(SkipReason::RecentLocalWrite);
            }
        }

        if self.last_hash == Some(hash) {
            return GateDecision::Skip(SkipReason::Unchanged);
        }

        self.last_hash = Some(hash);
        self.last_accepted = Some(now);
        GateDecision::Deliver
    }

    /// Seed the dedup state with the snapshot the session already holds
    pub fn prime(&mut self, hash: ChangeHash) {
        self.last_hash = Some(hash);
    }
}

/// Handle to a realtime subscription
///
/// [`Subscription::unsubscribe`] detaches the listener; it is idempotent and
/// also runs on drop. An inert subscription (realtime disabled) never yields.
pub struct Subscription {
    rx: mpsc::Receiver<MinimalPayload>,
    token: Option<CancellationToken>,
    // Keeps an inert subscription's channel open so recv() pends
    _inert_tx: Option<mpsc::Sender<MinimalPayload>>,
}

impl Subscription {
    fn inert() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            rx,
            token: None,
            _inert_tx: Some(tx),
        }
    }

    pub fn is_inert(&self) -> bool {
        self.token.is_none()
    }

    /// Next accepted payload; `None` once unsubscribed
    pub async fn recv(&mut self) -> Option<MinimalPayload> {
        if self.token.as_ref().map(|t| t.is_cancelled()).unwrap_or(false) {
            return None;
        }
        self.rx.recv().await
    }

    pub fn unsubscribe(&self) {
        if let Some(token) = &self.token {
            token.cancel();
        }
    }

    pub fn is_active(&self) -> bool {
        self.token.as_ref().map(|t| !t.is_cancelled()).unwrap_or(false)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Creates realtime subscriptions for owners
#[derive(Clone)]
pub struct ChangeNotifier {
    cache: Arc<dyn DocumentCache>,
    flag: RealtimeFlag,
    marker: WriteMarker,
    events: EventBus,
    throttle: Duration,
    grace: Duration,
}

impl ChangeNotifier {
    pub fn new(
        cache: Arc<dyn DocumentCache>,
        flag: RealtimeFlag,
        marker: WriteMarker,
        events: EventBus,
        throttle: Duration,
        grace: Duration,
    ) -> Self {
        Self {
            cache,
            flag,
            marker,
            events,
            throttle,
            grace,
        }
    }

    /// Attach to the owner's document
    ///
    /// `current` primes dedup so the first push equal to the loaded state is
    /// not re-delivered.
    pub async fn subscribe(
        &self,
        owner_uid: &str,
        current: Option<&DashboardSnapshot>,
    ) -> Subscription {
        match self.flag.is_disabled(Utc::now()).await {
            Ok(false) => {}
            Ok(true) => {
                info!(owner_uid, "Realtime disabled, returning inert subscription");
                return Subscription::inert();
            }
            Err(e) => {
                warn!(owner_uid, error_class = %e.class(), error = %e, "Realtime flag unreadable, not attaching");
                return Subscription::inert();
            }
        }

        let mut gate = ChangeGate::new(self.throttle, self.grace);
        if let Some(snapshot) = current {
            gate.prime(ChangeHash::of(snapshot));
        }

        let push_rx = self.cache.watch(DASHBOARD_COLLECTION, owner_uid);
        let (tx, rx) = mpsc::channel(PAYLOAD_BUFFER);
        let token = CancellationToken::new();

        let listener = Listener {
            owner_uid: owner_uid.to_string(),
            gate,
            marker: self.marker.clone(),
            flag: self.flag.clone(),
            events: self.events.clone(),
        };
        tokio::spawn(listener.run(push_rx, tx, token.clone()));

        debug!(owner_uid, "Realtime subscription attached");
        Subscription {
            rx,
            token: Some(token),
            _inert_tx: None,
        }
    }
}

struct Listener {
    owner_uid: String,
    gate: ChangeGate,
    marker: WriteMarker,
    flag: RealtimeFlag,
    events: EventBus,
}

impl Listener {
    async fn run(
        mut self,
        mut push_rx: broadcast::Receiver<PushEvent>,
        tx: mpsc::Sender<MinimalPayload>,
        token: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                event = push_rx.recv() => event,
            };

            match event {
                Ok(PushEvent::Snapshot(document)) => {
                    let Some(payload) = self.evaluate(&document) else {
                        continue;
                    };
                    if tx.send(payload).await.is_err() {
                        debug!(owner_uid = %self.owner_uid, "Subscriber gone, listener stopping");
                        break;
                    }
                }
                Ok(PushEvent::Error(push_error)) => {
                    self.handle_error(push_error).await;
                    // Nominally alive, but nothing further is delivered
                    token.cancelled().await;
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(owner_uid = %self.owner_uid, missed, "Realtime listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    warn!(owner_uid = %self.owner_uid, "Push channel closed");
                    token.cancelled().await;
                    break;
                }
            }
        }
        debug!(owner_uid = %self.owner_uid, "Realtime listener stopped");
    }

    fn evaluate(&mut self, document: &serde_json::Value) -> Option<MinimalPayload> {
        let snapshot = match serde_json::from_value::<DashboardSnapshot>(document.clone()) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(owner_uid = %self.owner_uid, error = %e, "Undecodable realtime document skipped");
                self.skipped(SkipReason::Undecodable);
                return None;
            }
        };

        let hash = ChangeHash::of(&snapshot);
        match self.gate.evaluate(hash, Instant::now(), self.marker.last()) {
            GateDecision::Deliver => {
                debug!(owner_uid = %self.owner_uid, hash = %hash, "Realtime update accepted");
                Some(MinimalPayload::from_snapshot(&snapshot))
            }
            GateDecision::Skip(reason) => {
                debug!(owner_uid = %self.owner_uid, ?reason, "Realtime update skipped");
                self.skipped(reason);
                None
            }
        }
    }

    fn skipped(&self, reason: SkipReason) {
        self.events.emit_lossy(SyncEvent::RealtimeUpdateSkipped {
            owner_uid: self.owner_uid.clone(),
            reason,
            timestamp: Utc::now(),
        });
    }

    async fn handle_error(&self, push_error: PushError) {
        match &push_error {
            PushError::QuotaExhausted(detail) => {
                error!(owner_uid = %self.owner_uid, error_class = "quota", detail = %detail, "Realtime quota exhausted");
                let reason = push_error.to_string();
                if let Err(e) = self.flag.disable(&reason, Utc::now()).await {
                    error!(owner_uid = %self.owner_uid, error = %e, "Failed to persist realtime disable flag");
                }
                self.events.emit_lossy(SyncEvent::RealtimeDisabled {
                    owner_uid: self.owner_uid.clone(),
                    reason,
                    timestamp: Utc::now(),
                });
            }
            PushError::Channel(detail) => {
                warn!(owner_uid = %self.owner_uid, error_class = "transient", detail = %detail, "Realtime push channel failed");
            }
        }
    }
}
