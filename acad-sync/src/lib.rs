//! acad-sync library
//!
//! Reconciliation and realtime sync between the document cache and the
//! relational store of record for the academic dashboard.
//!
//! Leaves first:
//! - [`repair`], [`hash`], [`migrate`], [`import`]: pure transforms
//! - [`projection`]: authoritative enrollment rebuild
//! - [`loader`]: session-start pipeline
//! - [`notifier`]: throttled, deduplicated realtime subscription
//! - [`writer`]: serialized cache write queue
//! - [`session`]: professor session owning all of the above

pub mod error;
pub mod hash;
pub mod import;
pub mod loader;
pub mod migrate;
pub mod notifier;
pub mod projection;
pub mod repair;
pub mod session;
pub mod store;
pub mod student_view;
pub mod writer;

pub use crate::error::{ErrorClass, Result, StoreError, SyncError};
pub use crate::session::{ProfessorSession, SessionContext};

use acad_common::config::SyncConfig;
use acad_common::db::{init_cache_database, init_relational_database};
use acad_common::events::EventBus;
use std::sync::Arc;
use store::{RealtimeFlag, SqliteDocumentCache, SqliteRelationalStore};
use tracing::info;

/// Open both databases under the configured root folder
pub async fn open_context(config: SyncConfig) -> Result<SessionContext> {
    let relational_path = config.relational_db_path();
    let cache_path = config.cache_db_path();
    info!("Relational store: {}", relational_path.display());
    info!("Document cache: {}", cache_path.display());

    let relational_pool = init_relational_database(&relational_path).await?;
    let cache_pool = init_cache_database(&cache_path).await?;

    Ok(SessionContext {
        relational: Arc::new(SqliteRelationalStore::new(relational_pool)),
        cache: Arc::new(SqliteDocumentCache::new(cache_pool.clone())),
        flag: RealtimeFlag::new(cache_pool, config.quota_cooldown()),
        events: EventBus::new(config.event_capacity),
        config,
    })
}
