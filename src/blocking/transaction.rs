//! Expand transaction oplogs into the operations they commit.
//!
//! A transaction is logged as one or more `applyOps` entries linked through `prevOpTime`:
//!
//! - small transaction: one `applyOps` entry.
//! - large transaction: `applyOps` entries with `partialTxn: true`, the last one without.
//! - prepared transaction: `applyOps` with `prepare: true`, then `commitTransaction` or
//!   `abortTransaction`.
//!
//! Operations are reported at the entry which makes them visible, numbered in order across the
//! whole chain.
use bson::{Bson, Timestamp};
use tracing::debug;

use crate::cmd_oplog::CmdOplog;
use crate::oplog::OplogEntry;
use crate::store::OplogStore;
use crate::{FeedError, Result};

/// Logical operations of `entry`.
///
/// Plain entries come back as they are; entries which don't commit anything (partial,
/// prepared, aborted) come back empty.
pub fn expand_entry(store: &dyn OplogStore, entry: &OplogEntry) -> Result<Vec<OplogEntry>> {
    let cmd = match CmdOplog::from_entry(entry)? {
        Some(cmd) => cmd,
        None => return Ok(vec![entry.clone()]),
    };
    match cmd {
        CmdOplog::ApplyOps {
            partial_txn: true, ..
        }
        | CmdOplog::ApplyOps { prepare: true, .. }
        | CmdOplog::AbortTransaction => Ok(vec![]),
        CmdOplog::ApplyOps { ops, .. } => {
            let mut chain = collect_chain(store, entry.prev_op_time)?;
            chain.push(ops.clone());
            build_ops(chain, entry)
        }
        CmdOplog::CommitTransaction { .. } => {
            let chain = collect_chain(store, entry.prev_op_time)?;
            build_ops(chain, entry)
        }
        _ => Ok(vec![entry.clone()]),
    }
}

/// `applyOps` arrays of the entries before the terminating one, oldest first.
fn collect_chain(store: &dyn OplogStore, mut prev: Option<Timestamp>) -> Result<Vec<Vec<Bson>>> {
    let mut chain = vec![];
    while let Some(ts) = prev.filter(|ts| ts.time != 0 || ts.increment != 0) {
        let entry = store
            .find_at(ts)?
            .ok_or_else(|| FeedError::ResumeTokenNotFound {
                token: format!("{:?}", ts),
                reason: "transaction entry is no longer in the oplog".to_string(),
            })?;
        match CmdOplog::from_entry(&entry)? {
            Some(CmdOplog::ApplyOps { ops, .. }) => chain.push(ops.clone()),
            _ => {
                return Err(FeedError::BsonValueError {
                    key: "prevOpTime".to_string(),
                    val: format!("{:?} is not an applyOps entry", ts),
                })
            }
        }
        prev = entry.prev_op_time;
    }
    chain.reverse();
    Ok(chain)
}

fn build_ops(chain: Vec<Vec<Bson>>, commit: &OplogEntry) -> Result<Vec<OplogEntry>> {
    let mut ops = vec![];
    for item in chain.iter().flatten() {
        let item = item.as_document().ok_or_else(|| FeedError::BsonValueError {
            key: "applyOps".to_string(),
            val: item.to_string(),
        })?;
        ops.push(OplogEntry::from_apply_ops_item(item, commit, ops.len() as u32)?);
    }
    debug!(ts = ?commit.ts, ops = ops.len(), "Expand transaction.");
    Ok(ops)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocking::memory::InMemoryOplogStore;
    use crate::bson_helper;
    use crate::namespace::Namespace;
    use crate::oplog::{OpType, Position};
    use bson::{doc, Document};
    use uuid::Uuid;

    fn ts(time: u32) -> Timestamp {
        Timestamp { time, increment: 1 }
    }

    fn apply_ops(at: u32, ids: &[i32], extra: Document, prev: u32) -> OplogEntry {
        let uuid = bson_helper::new_binary(Uuid::nil());
        let ops: Vec<Bson> = ids
            .iter()
            .map(|id| Bson::Document(doc! {"op": "i", "ns": "test.coll", "ui": uuid.clone(), "o": {"_id": *id}}))
            .collect();
        let mut obj = doc! {"applyOps": ops};
        obj.extend(extra);
        OplogEntry::new(ts(at), OpType::Command, Namespace::command("admin"), None, obj).with_txn(
            doc! {"id": 1},
            1,
            Timestamp {
                time: prev,
                increment: if prev == 0 { 0 } else { 1 },
            },
        )
    }

    #[test]
    fn test_expand_partial_chain() {
        let store = InMemoryOplogStore::new();
        let first = apply_ops(10, &[1, 2], doc! {"partialTxn": true}, 0);
        let last = apply_ops(11, &[3], doc! {}, 10);
        store.append(first.clone()).unwrap();
        store.append(last.clone()).unwrap();

        assert!(expand_entry(&store, &first).unwrap().is_empty());
        let ops = expand_entry(&store, &last).unwrap();
        let positions: Vec<Position> = ops.iter().map(|op| op.position()).collect();
        assert_eq!(
            positions,
            vec![
                Position::new(ts(11), 0),
                Position::new(ts(11), 1),
                Position::new(ts(11), 2)
            ]
        );
        assert_eq!(ops[2].obj, doc! {"_id": 3});
        assert_eq!(ops[0].txn_number, Some(1));
    }

    #[test]
    fn test_prepared_then_committed() {
        let store = InMemoryOplogStore::new();
        let prepare = apply_ops(10, &[1], doc! {"prepare": true}, 0);
        let commit = OplogEntry::new(
            ts(12),
            OpType::Command,
            Namespace::command("admin"),
            None,
            doc! {"commitTransaction": 1, "commitTimestamp": ts(11)},
        )
        .with_txn(doc! {"id": 1}, 1, ts(10));
        store.append(prepare.clone()).unwrap();
        store.append(commit.clone()).unwrap();

        assert!(expand_entry(&store, &prepare).unwrap().is_empty());
        let ops = expand_entry(&store, &commit).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].ts, ts(12));
    }

    #[test]
    fn test_missing_chain_entry() {
        let store = InMemoryOplogStore::new();
        let last = apply_ops(11, &[3], doc! {}, 10);
        assert!(matches!(
            expand_entry(&store, &last),
            Err(FeedError::ResumeTokenNotFound { .. })
        ));
    }
}
