//! Event types for the sync engine
//!
//! Provides the shared [`SyncEvent`] definitions and the [`EventBus`] that
//! fans them out to observers (CLI output, diagnostics, tests).

use crate::ids::SubjectCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Why a realtime push was not delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// Arrived inside the throttle window of the previous accepted update
    Throttled,
    /// Arrived inside the grace period after a local write
    RecentLocalWrite,
    /// ChangeHash equal to the last accepted update
    Unchanged,
    /// Pushed document could not be decoded
    Undecodable,
}

/// Sync engine events
///
/// Events are broadcast via [`EventBus`] and serialize with a `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SyncEvent {
    /// Loader committed a snapshot into session state
    SnapshotLoaded {
        owner_uid: String,
        subjects: usize,
        students: usize,
        /// True when the cache had no document and a seed was written
        seeded: bool,
        timestamp: DateTime<Utc>,
    },

    /// Repair pass dropped archived-but-enrolled ids
    SnapshotRepaired {
        owner_uid: String,
        dropped: usize,
        timestamp: DateTime<Utc>,
    },

    /// Authoritative rebuild failed; enrollments were projected as empty
    ProjectionFailed {
        owner_uid: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Realtime payload applied to session state
    RealtimeUpdateApplied {
        owner_uid: String,
        timestamp: DateTime<Utc>,
    },

    /// Realtime push discarded by the change gate
    RealtimeUpdateSkipped {
        owner_uid: String,
        reason: SkipReason,
        timestamp: DateTime<Utc>,
    },

    /// Realtime updates administratively disabled (quota exhaustion)
    RealtimeDisabled {
        owner_uid: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Bulk import merged into the roster
    ImportCompleted {
        owner_uid: String,
        subject: SubjectCode,
        added: usize,
        reactivated: usize,
        skipped: usize,
        rejected: usize,
        timestamp: DateTime<Utc>,
    },

    /// Cache document written through the session write queue
    CacheWritten {
        owner_uid: String,
        forced: bool,
        timestamp: DateTime<Utc>,
    },
}

impl SyncEvent {
    /// Event type string (matches the serde tag)
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::SnapshotLoaded { .. } => "SnapshotLoaded",
            SyncEvent::SnapshotRepaired { .. } => "SnapshotRepaired",
            SyncEvent::ProjectionFailed { .. } => "ProjectionFailed",
            SyncEvent::RealtimeUpdateApplied { .. } => "RealtimeUpdateApplied",
            SyncEvent::RealtimeUpdateSkipped { .. } => "RealtimeUpdateSkipped",
            SyncEvent::RealtimeDisabled { .. } => "RealtimeDisabled",
            SyncEvent::ImportCompleted { .. } => "ImportCompleted",
            SyncEvent::CacheWritten { .. } => "CacheWritten",
        }
    }

    /// Owner the event concerns
    pub fn owner_uid(&self) -> &str {
        match self {
            SyncEvent::SnapshotLoaded { owner_uid, .. }
            | SyncEvent::SnapshotRepaired { owner_uid, .. }
            | SyncEvent::ProjectionFailed { owner_uid, .. }
            | SyncEvent::RealtimeUpdateApplied { owner_uid, .. }
            | SyncEvent::RealtimeUpdateSkipped { owner_uid, .. }
            | SyncEvent::RealtimeDisabled { owner_uid, .. }
            | SyncEvent::ImportCompleted { owner_uid, .. }
            | SyncEvent::CacheWritten { owner_uid, .. } => owner_uid,
        }
    }
}

/// Broadcast bus for [`SyncEvent`]s
///
/// Cloning shares the same channel. Subscribers only see events emitted
/// after they subscribed; slow subscribers lose the oldest events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(&self, event: SyncEvent) -> Result<usize, broadcast::error::SendError<SyncEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: SyncEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
