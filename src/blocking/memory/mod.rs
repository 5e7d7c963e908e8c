//! In-memory replica set member: oplog, catalog and a primary write path.
mod catalog;
mod node;
mod oplog;

pub use catalog::InMemoryCatalog;
pub use node::{MemoryNode, TxnOp};
pub use oplog::InMemoryOplogStore;
