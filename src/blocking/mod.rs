//! provide change feed blocking apis.
//!
//! Every pull runs on the caller's thread; the only threads this module starts are the
//! maintenance ones of [ChangeFeedService::spawn_maintenance].
mod cursor;
pub mod memory;
pub mod mongo;
mod reclaimer;
mod registry;
pub mod replication;
mod service;
pub mod transaction;

pub use cursor::{ChangeFeedCursor, CursorState};
pub use memory::{InMemoryCatalog, InMemoryOplogStore, MemoryNode, TxnOp};
pub use mongo::{MongoCatalog, MongoOplogStore};
pub use reclaimer::PreImageReclaimer;
pub use registry::{CursorId, CursorRegistry};
pub use replication::{MemberState, ReplicationState, RollbackAttempt};
pub use service::{ChangeFeedService, FeedBatch, MaintenanceHandle, OpenRequest, StartAt};
