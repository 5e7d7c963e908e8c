//! Change feed lib, which turns a mongodb-style replicated oplog into an ordered, resumable
//! stream of logical change events.
//!
//! The entry point is [ChangeFeedService]: it opens feeds scoped to a collection, a database
//! or the whole cluster, hands out cursor ids, serves `getMore` style pulls and kills cursors.
//! The service reads from any [OplogStore](store::OplogStore); two are provided: an in-memory
//! one ([MemoryNode] bundles it with a catalog, a pre-image store and a primary write path) and
//! [MongoOplogStore], which tails `local.oplog.rs` of a live replica set.
//!
//! # Example:
//! ```
//! use change_feed::{ChangeFeedService, FeedConfig, MemoryNode, OpenRequest};
//! use bson::doc;
//!
//! let node = MemoryNode::new();
//! node.create_collection("test.coll", false).unwrap();
//! let service = ChangeFeedService::for_node(&node, FeedConfig::default());
//! let opened = service.open(OpenRequest::collection("test", "coll")).unwrap();
//!
//! node.insert("test.coll", doc! {"_id": 1, "a": 1}).unwrap();
//! let batch = service.get_more(opened.cursor_id, None).unwrap();
//! assert_eq!(batch.events.len(), 1);
//! ```

#![warn(missing_docs)]

pub mod blocking;
pub mod bson_helper;
pub mod cmd_oplog;
mod config;
mod error;
pub mod event;
pub mod key_string;
pub mod namespace;
pub mod oplog;
pub mod pre_image;
pub mod resume_token;
pub mod scope;
pub mod store;
pub mod time_helper;
pub mod translator;

/// mongodb internal database for admin.
const ADMIN_DB_NAME: &str = "admin";
/// mongodb internal database for sharding and session metadata.
const CONFIG_DB_NAME: &str = "config";
/// mongodb internal database which saves oplogs.
const OPLOG_DB: &str = "local";
/// mongodb internal collection which saves oplogs.
const OPLOG_COLL: &str = "oplog.rs";
/// collection name prefix reserved for server metadata.
const SYSTEM_COLL_PREFIX: &str = "system.";
/// collection part of the namespace command oplogs are written to.
const COMMAND_COLL: &str = "$cmd";

/// oplog namespace key name.
const NAMESPACE_KEY: &str = "ns";
/// oplog timestamp key name.
const TIMESTAMP_KEY: &str = "ts";
/// oplog operation key name.
const OP_KEY: &str = "op";
/// oplog collection uuid key name.
const UUID_KEY: &str = "ui";
/// oplog object key name.
const OBJ_KEY: &str = "o";
/// oplog second object key name.
const OBJ2_KEY: &str = "o2";

pub use blocking::{
    ChangeFeedService, CursorId, FeedBatch, MaintenanceHandle, MemoryNode, MongoCatalog,
    MongoOplogStore, OpenRequest, ReplicationState, StartAt,
};
pub use config::FeedConfig;
pub use error::{ErrorCategory, FeedError, Result};
pub use event::{ChangeEvent, EventKind, OperationType};
pub use namespace::Namespace;
pub use resume_token::{ResumeToken, ResumeTokenData};
pub use scope::FeedScope;
