//! Document cache
//!
//! One JSON document per (collection, owner). Writers replace the whole
//! document or shallow-merge its top-level keys; every stored change is
//! pushed to watchers of that document through an in-process broadcast hub.

use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Per-document push channel capacity
const PUSH_CHANNEL_CAPACITY: usize = 32;

/// How a document write is applied
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Shallow top-level merge into the stored document instead of replace
    pub merge: bool,
    /// Write even when the stored body would not change
    pub force_write: bool,
}

impl WriteOptions {
    pub fn replace() -> Self {
        Self::default()
    }

    pub fn forced() -> Self {
        Self {
            merge: false,
            force_write: true,
        }
    }

    pub fn merge() -> Self {
        Self {
            merge: true,
            force_write: false,
        }
    }
}

/// Failure reported on the push channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushError {
    /// Read quota or rate limit exhausted
    QuotaExhausted(String),
    /// Listener dropped or backend unreachable
    Channel(String),
}

impl std::fmt::Display for PushError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PushError::QuotaExhausted(msg) => write!(f, "quota exhausted: {}", msg),
            PushError::Channel(msg) => write!(f, "push channel error: {}", msg),
        }
    }
}

/// Item delivered to document watchers
#[derive(Debug, Clone)]
pub enum PushEvent {
    /// Full document as stored after a write
    Snapshot(Arc<Value>),
    Error(PushError),
}

/// Async access to cached documents
#[async_trait]
pub trait DocumentCache: Send + Sync {
    async fn get(&self, collection: &str, owner_id: &str) -> StoreResult<Option<Value>>;

    /// Store a document
    ///
    /// Returns `false` when the write was skipped because the stored body
    /// already matched and `force_write` was not set.
    async fn set(
        &self,
        collection: &str,
        owner_id: &str,
        document: &Value,
        options: WriteOptions,
    ) -> StoreResult<bool>;

    /// Subscribe to pushes for one document
    fn watch(&self, collection: &str, owner_id: &str) -> broadcast::Receiver<PushEvent>;
}

type HubKey = (String, String);

/// Broadcast senders keyed by document
#[derive(Default)]
struct PushHub {
    channels: Mutex<HashMap<HubKey, broadcast::Sender<PushEvent>>>,
}

impl PushHub {
    fn subscribe(&self, collection: &str, owner_id: &str) -> broadcast::Receiver<PushEvent> {
        let mut channels = self.channels.lock().unwrap_or_else(|p| p.into_inner());
        channels
            .entry((collection.to_string(), owner_id.to_string()))
            .or_insert_with(|| broadcast::channel(PUSH_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    fn publish(&self, collection: &str, owner_id: &str, event: PushEvent) {
        let mut channels = self.channels.lock().unwrap_or_else(|p| p.into_inner());
        let key = (collection.to_string(), owner_id.to_string());
        if let Some(tx) = channels.get(&key) {
            if tx.send(event).is_err() {
                // Every watcher is gone
                channels.remove(&key);
            }
        }
    }
}

/// [`DocumentCache`] over the `cache_documents` table
#[derive(Clone)]
pub struct SqliteDocumentCache {
    pool: SqlitePool,
    hub: Arc<PushHub>,
}

impl SqliteDocumentCache {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            hub: Arc::new(PushHub::default()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Deliver a push-channel failure to watchers of one document
    pub fn publish_error(&self, collection: &str, owner_id: &str, error: PushError) {
        self.hub.publish(collection, owner_id, PushEvent::Error(error));
    }

    async fn read_body(&self, collection: &str, owner_id: &str) -> StoreResult<Option<Value>> {
        let body: Option<String> = sqlx::query_scalar(
            "SELECT body FROM cache_documents WHERE collection = ? AND owner_id = ?",
        )
        .bind(collection)
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?;

        match body {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }
}

/// Shallow merge: top-level keys of `incoming` replace those of `stored`
pub fn merge_top_level(stored: Option<&Value>, incoming: &Value) -> StoreResult<Value> {
    match (stored, incoming) {
        (Some(Value::Object(base)), Value::Object(update)) => {
            let mut merged = base.clone();
            for (key, value) in update {
                merged.insert(key.clone(), value.clone());
            }
            Ok(Value::Object(merged))
        }
        (_, Value::Object(_)) => Ok(incoming.clone()),
        _ => Err(StoreError::Shape("merge requires an object document".to_string())),
    }
}

#[async_trait]
impl DocumentCache for SqliteDocumentCache {
    async fn get(&self, collection: &str, owner_id: &str) -> StoreResult<Option<Value>> {
        self.read_body(collection, owner_id).await
    }

    async fn set(
        &self,
        collection: &str,
        owner_id: &str,
        document: &Value,
        options: WriteOptions,
    ) -> StoreResult<bool> {
        let stored = match self.read_body(collection, owner_id).await {
            Ok(stored) => stored,
            Err(StoreError::Shape(e)) => {
                // A corrupt body is replaced outright
                warn!(collection, owner_id, error = %e, "Stored document is not valid JSON");
                None
            }
            Err(e) => return Err(e),
        };

        let next = if options.merge {
            merge_top_level(stored.as_ref(), document)?
        } else {
            document.clone()
        };

        if !options.force_write && stored.as_ref() == Some(&next) {
            debug!(collection, owner_id, "Cache write skipped, document unchanged");
            return Ok(false);
        }

        let body = serde_json::to_string(&next)?;
        sqlx::query(
            r#"
            INSERT INTO cache_documents (collection, owner_id, body, updated_at)
            VALUES (?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(collection, owner_id) DO UPDATE SET
                body = excluded.body,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(collection)
        .bind(owner_id)
        .bind(&body)
        .execute(&self.pool)
        .await?;

        debug!(collection, owner_id, bytes = body.len(), forced = options.force_write, "Cache document written");
        self.hub
            .publish(collection, owner_id, PushEvent::Snapshot(Arc::new(next)));
        Ok(true)
    }

    fn watch(&self, collection: &str, owner_id: &str) -> broadcast::Receiver<PushEvent> {
        self.hub.subscribe(collection, owner_id)
    }
}
