//! Serialized cache write path
//!
//! A single worker task owns every cache write for a session. Requests are
//! applied in submission order and each is acknowledged through a oneshot.
//! Every completed write stamps the [`WriteMarker`] read by the notifier's
//! grace period.

use crate::error::{Result, StoreResult, SyncError};
use crate::notifier::WriteMarker;
use crate::store::{DocumentCache, WriteOptions};
use acad_common::events::{EventBus, SyncEvent};
use acad_common::model::DASHBOARD_COLLECTION;
use acad_common::DashboardSnapshot;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

struct WriteRequest {
    owner_uid: String,
    document: Value,
    options: WriteOptions,
    ack: oneshot::Sender<StoreResult<bool>>,
}

/// Submission handle; clones share the same worker
#[derive(Clone)]
pub struct WriteQueue {
    tx: mpsc::Sender<WriteRequest>,
}

impl WriteQueue {
    /// Start the worker; it stops when `cancel` fires or every handle is dropped
    pub fn spawn(
        cache: Arc<dyn DocumentCache>,
        marker: WriteMarker,
        events: EventBus,
        depth: usize,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        let handle = tokio::spawn(run_worker(rx, cache, marker, events, cancel));
        (Self { tx }, handle)
    }

    /// Queue a raw document write and wait for it to complete
    ///
    /// Returns `false` when the cache skipped an unchanged document.
    pub async fn submit(&self, owner_uid: &str, document: Value, options: WriteOptions) -> Result<bool> {
        let (ack, done) = oneshot::channel();
        let request = WriteRequest {
            owner_uid: owner_uid.to_string(),
            document,
            options,
            ack,
        };

        self.tx
            .send(request)
            .await
            .map_err(|_| SyncError::WriterClosed)?;

        let written = done.await.map_err(|_| SyncError::WriterClosed)??;
        Ok(written)
    }

    pub async fn write_snapshot(&self, snapshot: &DashboardSnapshot, options: WriteOptions) -> Result<bool> {
        let document = serde_json::to_value(snapshot).map_err(acad_common::Error::from)?;
        self.submit(&snapshot.owner_uid, document, options).await
    }
}

async fn run_worker(
    mut rx: mpsc::Receiver<WriteRequest>,
    cache: Arc<dyn DocumentCache>,
    marker: WriteMarker,
    events: EventBus,
    cancel: CancellationToken,
) {
    debug!("Cache write worker started");

    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => break,
            request = rx.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        // Stamped before the write too: the cache may push the write's own
        // echo before the call returns
        marker.stamp();
        let result = cache
            .set(DASHBOARD_COLLECTION, &request.owner_uid, &request.document, request.options)
            .await;

        match &result {
            Ok(written) => {
                marker.stamp();
                if *written {
                    events.emit_lossy(SyncEvent::CacheWritten {
                        owner_uid: request.owner_uid.clone(),
                        forced: request.options.force_write,
                        timestamp: Utc::now(),
                    });
                }
            }
            Err(e) => {
                error!(
                    owner_uid = %request.owner_uid,
                    error_class = %e.class(),
                    error = %e,
                    "Cache write failed"
                );
            }
        }

        // Submitter may have given up waiting
        let _ = request.ack.send(result);
    }

    rx.close();
    debug!("Cache write worker stopped");
}
