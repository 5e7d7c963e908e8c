//! Pre-images: document versions recorded right before an update, replace or delete.
//!
//! Records are keyed by `(collection uuid, oplog position)`, which makes both `lookup` and the
//! range deletes of reclamation and rollback cheap on a `BTreeMap`.
use std::collections::{BTreeMap, BTreeSet};

use bson::{doc, Document, Timestamp};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::bson_helper;
use crate::oplog::Position;
use crate::time_helper;
use crate::{FeedError, Result};

/// One recorded pre-image.
#[derive(Debug, Clone, PartialEq)]
pub struct PreImageRecord {
    /// collection the document belongs to.
    pub ns_uuid: Uuid,
    /// position of the oplog entry which changed the document.
    pub position: Position,
    /// wall clock time derived from the entry timestamp, used for expiry.
    pub operation_time: DateTime<Utc>,
    /// the document before the change.
    pub document: Document,
}

impl PreImageRecord {
    /// Same shape as a `config.system.preimages` document.
    pub fn to_document(&self) -> Document {
        doc! {
            "_id": {
                "nsUUID": bson_helper::new_binary(self.ns_uuid),
                "ts": self.position.timestamp(),
                "applyOpsIndex": self.position.apply_ops_index as i64,
            },
            "operationTime": bson::DateTime::from_millis(self.operation_time.timestamp_millis()),
            "preImage": self.document.clone(),
        }
    }
}

/// Side table of pre-images of one node.
#[derive(Debug, Default)]
pub struct PreImageStore {
    records: RwLock<BTreeMap<(Uuid, Position), PreImageRecord>>,
}

impl PreImageStore {
    /// An empty store.
    pub fn new() -> Self {
        PreImageStore::default()
    }

    /// Record the pre-image of the operation at `position`.
    ///
    /// Recording the same document twice is a no-op, so replaying a write is harmless.  A
    /// different document at an occupied key is an error.
    pub fn record(&self, ns_uuid: Uuid, position: Position, document: Document) -> Result<()> {
        let mut records = self.records.write();
        if let Some(existing) = records.get(&(ns_uuid, position)) {
            if existing.document == document {
                return Ok(());
            }
            return Err(FeedError::DuplicatePreImage {
                ns_uuid,
                position: position.to_string(),
            });
        }
        records.insert(
            (ns_uuid, position),
            PreImageRecord {
                ns_uuid,
                position,
                operation_time: time_helper::to_datetime(&position.timestamp()),
                document,
            },
        );
        Ok(())
    }

    /// Pre-image of the operation at `position`.
    pub fn lookup(&self, ns_uuid: Uuid, position: Position) -> Option<Document> {
        self.records
            .read()
            .get(&(ns_uuid, position))
            .map(|record| record.document.clone())
    }

    /// Delete every record whose timestamp precedes `older_than`.
    pub fn reclaim(&self, older_than: Timestamp) -> usize {
        let watermark = Position::at(older_than);
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|(_, position), _| *position >= watermark);
        let removed = before - records.len();
        if removed > 0 {
            debug!(%watermark, removed, "Reclaim pre-images.");
        }
        removed
    }

    /// Forget every record written after `common_point`, used when the node rolls back.
    pub fn rollback_after(&self, common_point: Timestamp) -> usize {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|(_, position), _| {
            time_helper::cmp(&position.timestamp(), &common_point) != std::cmp::Ordering::Greater
        });
        before - records.len()
    }

    /// Records of a collection, newest first.
    pub fn reverse_scan(&self, ns_uuid: Uuid) -> Vec<PreImageRecord> {
        self.records
            .read()
            .range((ns_uuid, Position::default())..=(ns_uuid, max_position()))
            .rev()
            .map(|(_, record)| record.clone())
            .collect()
    }

    /// Collections having at least one record.
    pub fn ns_uuids(&self) -> BTreeSet<Uuid> {
        self.records.read().keys().map(|(uuid, _)| *uuid).collect()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Is the store empty?
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

fn max_position() -> Position {
    Position {
        time: u32::MAX,
        increment: u32::MAX,
        apply_ops_index: u32::MAX,
    }
}

/// Compare the pre-image histories of the members of a replica set.
///
/// For every collection, all members are scanned newest first in lock step.  At each step the
/// members still holding entries must agree; a member running out early only means it kept
/// fewer records.
pub struct ConsistencyChecker {
    pool: ThreadPool,
}

impl ConsistencyChecker {
    /// A checker running collections in parallel on `threads` threads.
    pub fn new(threads: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("pre-image-check-{}", i))
            .build()
            .map_err(|e| FeedError::InvalidRequest(format!("build check pool failed: {}", e)))?;
        Ok(ConsistencyChecker { pool })
    }

    /// Check every collection found on any member.  `nodes` pairs a member name with its store.
    pub fn check(&self, nodes: &[(&str, &PreImageStore)]) -> Result<()> {
        let uuids: BTreeSet<Uuid> = nodes
            .iter()
            .flat_map(|(_, store)| store.ns_uuids())
            .collect();
        info!(collections = uuids.len(), nodes = nodes.len(), "Check pre-image consistency.");
        let uuids: Vec<Uuid> = uuids.into_iter().collect();
        self.pool.install(|| {
            uuids
                .par_iter()
                .try_for_each(|uuid| check_collection(*uuid, nodes))
        })
    }
}

fn check_collection(ns_uuid: Uuid, nodes: &[(&str, &PreImageStore)]) -> Result<()> {
    let mut readers: Vec<(&str, std::vec::IntoIter<PreImageRecord>)> = nodes
        .iter()
        .map(|(name, store)| (*name, store.reverse_scan(ns_uuid).into_iter()))
        .collect();

    loop {
        let mut to_compare: Option<(&str, PreImageRecord)> = None;
        for (name, reader) in readers.iter_mut() {
            let entry = match reader.next() {
                Some(entry) => entry,
                None => continue,
            };
            match &to_compare {
                None => to_compare = Some((*name, entry)),
                Some((origin_node, origin_entry)) => {
                    if origin_entry != &entry {
                        error!(%ns_uuid, %origin_node, node = %name, "Pre-image inconsistency detected.");
                        return Err(FeedError::PreImageInconsistency {
                            ns_uuid,
                            origin_node: origin_node.to_string(),
                            origin_entry: origin_entry.to_document().to_string(),
                            node: name.to_string(),
                            entry: entry.to_document().to_string(),
                        });
                    }
                }
            }
        }
        if to_compare.is_none() {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(time: u32, increment: u32) -> Timestamp {
        Timestamp { time, increment }
    }

    #[test]
    fn test_record_and_lookup() {
        let store = PreImageStore::new();
        let uuid = Uuid::new_v4();
        let position = Position::at(ts(10, 1));
        store.record(uuid, position, doc! {"_id": 1, "a": 1}).unwrap();

        assert_eq!(store.lookup(uuid, position), Some(doc! {"_id": 1, "a": 1}));
        assert_eq!(store.lookup(Uuid::new_v4(), position), None);
        assert_eq!(store.lookup(uuid, Position::at(ts(10, 2))), None);
    }

    #[test]
    fn test_record_is_idempotent_but_never_overwrites() {
        let store = PreImageStore::new();
        let uuid = Uuid::new_v4();
        let position = Position::at(ts(10, 1));
        store.record(uuid, position, doc! {"_id": 1}).unwrap();
        store.record(uuid, position, doc! {"_id": 1}).unwrap();
        assert!(matches!(
            store.record(uuid, position, doc! {"_id": 2}),
            Err(FeedError::DuplicatePreImage { .. })
        ));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_reclaim_and_rollback_bounds() {
        let store = PreImageStore::new();
        let uuid = Uuid::new_v4();
        for i in 1..=5 {
            store.record(uuid, Position::at(ts(i, 0)), doc! {"_id": i}).unwrap();
        }
        assert_eq!(store.reclaim(ts(3, 0)), 2);
        assert_eq!(store.lookup(uuid, Position::at(ts(3, 0))), Some(doc! {"_id": 3}));
        assert_eq!(store.rollback_after(ts(4, 0)), 1);
        let left: Vec<u32> = store
            .reverse_scan(uuid)
            .iter()
            .map(|r| r.position.time)
            .collect();
        assert_eq!(left, vec![4, 3]);
    }

    #[test]
    fn test_consistency_allows_shorter_history() {
        let uuid = Uuid::new_v4();
        let a = PreImageStore::new();
        let b = PreImageStore::new();
        for i in 1..=3 {
            a.record(uuid, Position::at(ts(i, 0)), doc! {"_id": i}).unwrap();
        }
        for i in 2..=3 {
            b.record(uuid, Position::at(ts(i, 0)), doc! {"_id": i}).unwrap();
        }
        let checker = ConsistencyChecker::new(2).unwrap();
        checker.check(&[("a", &a), ("b", &b)]).unwrap();
    }

    #[test]
    fn test_consistency_reports_disagreement() {
        let uuid = Uuid::new_v4();
        let a = PreImageStore::new();
        let b = PreImageStore::new();
        a.record(uuid, Position::at(ts(1, 0)), doc! {"_id": 1, "v": 1}).unwrap();
        b.record(uuid, Position::at(ts(1, 0)), doc! {"_id": 1, "v": 2}).unwrap();
        let checker = ConsistencyChecker::new(1).unwrap();
        match checker.check(&[("a", &a), ("b", &b)]) {
            Err(FeedError::PreImageInconsistency { origin_node, node, .. }) => {
                assert_eq!(origin_node, "a");
                assert_eq!(node, "b");
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
