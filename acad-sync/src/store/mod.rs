//! External collaborators: relational store of record, document cache and
//! the realtime switch

pub mod cache;
pub mod flag;
pub mod relational;

pub use cache::{DocumentCache, PushError, PushEvent, SqliteDocumentCache, WriteOptions};
pub use flag::{FlagStatus, RealtimeFlag};
pub use relational::{RelationalStore, SqliteRelationalStore};
