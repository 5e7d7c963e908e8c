//! Collaborators backed by a live replica set, through the `mongodb` sync driver.
mod catalog;
mod oplog;

pub use catalog::MongoCatalog;
pub use oplog::MongoOplogStore;
