use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bson::oid::ObjectId;
use bson::{doc, Bson, Document, Timestamp};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use super::{InMemoryCatalog, InMemoryOplogStore};
use crate::blocking::replication::{MemberState, ReplicationState};
use crate::bson_helper;
use crate::key_string;
use crate::namespace::Namespace;
use crate::oplog::{OpType, OplogEntry, Position};
use crate::pre_image::PreImageStore;
use crate::scope::{DdlListener, NamespaceSignal};
use crate::{FeedError, Result};

/// One write of a multi-document transaction.
#[derive(Debug, Clone)]
pub enum TxnOp {
    /// insert `doc` into `ns`.
    Insert {
        /// target namespace.
        ns: String,
        /// new document, an `_id` is generated when missing.
        doc: Document,
    },
    /// apply a `$set`/`$unset` update to the document `id` of `ns`.
    Update {
        /// target namespace.
        ns: String,
        /// `_id` of the document.
        id: Bson,
        /// update modifiers.
        update: Document,
    },
    /// delete the document `id` of `ns`.
    Delete {
        /// target namespace.
        ns: String,
        /// `_id` of the document.
        id: Bson,
    },
}

struct Clock {
    last: Timestamp,
    txn_number: i64,
}

impl Clock {
    /// Next oplog timestamp: wall clock seconds, ordinal within the second.
    fn tick(&mut self) -> Timestamp {
        let secs = Utc::now().timestamp().clamp(0, u32::MAX as i64) as u32;
        self.last = if secs > self.last.time {
            Timestamp {
                time: secs,
                increment: 1,
            }
        } else {
            Timestamp {
                time: self.last.time,
                increment: self.last.increment + 1,
            }
        };
        self.last
    }
}

struct StagedOp {
    ns: Namespace,
    uuid: Uuid,
    pre_images: bool,
    id: Bson,
    old: Option<Document>,
    new: Option<Document>,
    item: Document,
}

/// A replica set member kept in memory, acting as primary.
///
/// Every write is serialized, gets the next oplog timestamp, records the pre-image when the
/// collection asks for it, and only then appends its oplog entry.  Destructive DDL is pushed to
/// the subscribed listeners right after it is logged.
pub struct MemoryNode {
    name: String,
    oplog: Arc<InMemoryOplogStore>,
    catalog: Arc<InMemoryCatalog>,
    pre_images: Arc<PreImageStore>,
    replication: Arc<ReplicationState>,
    listeners: RwLock<Vec<Arc<dyn DdlListener>>>,
    clock: Mutex<Clock>,
    auto_commit: AtomicBool,
}

impl Default for MemoryNode {
    fn default() -> Self {
        MemoryNode::new()
    }
}

impl MemoryNode {
    /// A primary with an empty, unbounded oplog.
    pub fn new() -> Self {
        MemoryNode::with_oplog("node0", InMemoryOplogStore::new())
    }

    /// A primary named `name`, writing to `oplog`.
    pub fn with_oplog(name: &str, oplog: InMemoryOplogStore) -> Self {
        MemoryNode {
            name: name.to_string(),
            oplog: Arc::new(oplog),
            catalog: Arc::new(InMemoryCatalog::new()),
            pre_images: Arc::new(PreImageStore::new()),
            replication: Arc::new(ReplicationState::new(MemberState::Primary)),
            listeners: RwLock::new(vec![]),
            clock: Mutex::new(Clock {
                last: Timestamp {
                    time: 0,
                    increment: 0,
                },
                txn_number: 0,
            }),
            auto_commit: AtomicBool::new(true),
        }
    }

    /// member name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// the oplog.
    pub fn oplog(&self) -> Arc<InMemoryOplogStore> {
        self.oplog.clone()
    }

    /// the catalog, also serving document lookups.
    pub fn catalog(&self) -> Arc<InMemoryCatalog> {
        self.catalog.clone()
    }

    /// the pre-image side table.
    pub fn pre_images(&self) -> Arc<PreImageStore> {
        self.pre_images.clone()
    }

    /// replication state of the member.
    pub fn replication(&self) -> Arc<ReplicationState> {
        self.replication.clone()
    }

    /// Receive DDL and rollback notifications.
    pub fn subscribe(&self, listener: Arc<dyn DdlListener>) {
        self.listeners.write().push(listener);
    }

    /// When on (the default), every write is majority committed as soon as it is logged.
    pub fn set_auto_commit(&self, on: bool) {
        self.auto_commit.store(on, Ordering::SeqCst);
    }

    /// Create a collection, optionally recording pre-images of its documents.
    pub fn create_collection(&self, ns: &str, pre_images: bool) -> Result<Uuid> {
        let ns = Namespace::parse(ns)?;
        let mut clock = self.clock.lock();
        self.create_locked(&mut clock, &ns, pre_images)
    }

    /// Define `view` on top of the collection `source`.
    pub fn create_view(&self, view: &str, source: &str) -> Result<Timestamp> {
        let view = Namespace::parse(view)?;
        let source = Namespace::parse(source)?;
        let mut clock = self.clock.lock();
        let ts = clock.tick();
        self.catalog.add_view(view.clone(), source.clone());
        let definition = doc! {"_id": view.to_string(), "viewOn": source.coll.clone(), "pipeline": []};
        self.append(OplogEntry::new(
            ts,
            OpType::Insert,
            Namespace::new(view.db.clone(), "system.views"),
            None,
            definition,
        ))
    }

    /// Turn pre-image recording on or off, logged as a `collMod`.
    pub fn set_pre_images(&self, ns: &str, enabled: bool) -> Result<Timestamp> {
        let ns = Namespace::parse(ns)?;
        let mut clock = self.clock.lock();
        let coll = self.existing_collection(&ns)?;
        let ts = clock.tick();
        self.catalog.set_pre_images(&ns, enabled);
        self.append(OplogEntry::new(
            ts,
            OpType::Command,
            Namespace::command(ns.db.clone()),
            Some(coll.uuid),
            doc! {"collMod": ns.coll.clone(), "changeStreamPreAndPostImages": {"enabled": enabled}},
        ))
    }

    /// Insert a document, creating the collection when needed.
    pub fn insert(&self, ns: &str, doc: Document) -> Result<Timestamp> {
        let ns = Namespace::parse(ns)?;
        let mut clock = self.clock.lock();
        if !self.catalog.exists(&ns) {
            self.create_locked(&mut clock, &ns, false)?;
        }
        let coll = self.existing_collection(&ns)?;
        let doc = ensure_id(doc);
        let id = id_of(&doc)?;
        if self.catalog.find(&ns, &id).is_some() {
            return Err(duplicate_key(&ns, &id));
        }
        let ts = clock.tick();
        self.catalog.put(&ns, &id, doc.clone());
        self.append(OplogEntry::new(ts, OpType::Insert, ns, Some(coll.uuid), doc))
    }

    /// Apply `$set` / `$unset` modifiers to the document `id`, logged in the `$v: 2` diff format.
    pub fn update(&self, ns: &str, id: impl Into<Bson>, update: Document) -> Result<Timestamp> {
        let ns = Namespace::parse(ns)?;
        let id = id.into();
        let mut clock = self.clock.lock();
        let coll = self.existing_collection(&ns)?;
        let old = self.existing_document(&ns, &id)?;
        let (new, diff) = apply_update(&old, &update)?;
        let ts = clock.tick();
        if coll.pre_images {
            self.pre_images.record(coll.uuid, Position::at(ts), old)?;
        }
        self.catalog.put(&ns, &id, new);
        self.append(
            OplogEntry::new(ts, OpType::Update, ns, Some(coll.uuid), diff)
                .with_obj2(doc! {"_id": id}),
        )
    }

    /// Replace the document `id` as a whole.
    pub fn replace(&self, ns: &str, id: impl Into<Bson>, replacement: Document) -> Result<Timestamp> {
        let ns = Namespace::parse(ns)?;
        let id = id.into();
        let mut clock = self.clock.lock();
        let coll = self.existing_collection(&ns)?;
        let old = self.existing_document(&ns, &id)?;
        let mut new = doc! {"_id": id.clone()};
        for (k, v) in replacement {
            if k != "_id" {
                new.insert(k, v);
            }
        }
        let ts = clock.tick();
        if coll.pre_images {
            self.pre_images.record(coll.uuid, Position::at(ts), old)?;
        }
        self.catalog.put(&ns, &id, new.clone());
        self.append(
            OplogEntry::new(ts, OpType::Update, ns, Some(coll.uuid), new)
                .with_obj2(doc! {"_id": id}),
        )
    }

    /// Delete the document `id`.
    pub fn delete(&self, ns: &str, id: impl Into<Bson>) -> Result<Timestamp> {
        let ns = Namespace::parse(ns)?;
        let id = id.into();
        let mut clock = self.clock.lock();
        let coll = self.existing_collection(&ns)?;
        let old = self.existing_document(&ns, &id)?;
        let ts = clock.tick();
        if coll.pre_images {
            self.pre_images.record(coll.uuid, Position::at(ts), old)?;
        }
        self.catalog.remove(&ns, &id);
        self.append(OplogEntry::new(
            ts,
            OpType::Delete,
            ns,
            Some(coll.uuid),
            doc! {"_id": id},
        ))
    }

    /// Build an index on `ns`.
    pub fn create_index(&self, ns: &str, key: Document, name: &str) -> Result<Timestamp> {
        let ns = Namespace::parse(ns)?;
        let mut clock = self.clock.lock();
        let coll = self.existing_collection(&ns)?;
        let ts = clock.tick();
        self.append(OplogEntry::new(
            ts,
            OpType::Command,
            Namespace::command(ns.db.clone()),
            Some(coll.uuid),
            doc! {"createIndexes": ns.coll.clone(), "v": 2, "key": key, "name": name},
        ))
    }

    /// Drop the index `name` of `ns`.
    pub fn drop_index(&self, ns: &str, name: &str) -> Result<Timestamp> {
        let ns = Namespace::parse(ns)?;
        let mut clock = self.clock.lock();
        let coll = self.existing_collection(&ns)?;
        let ts = clock.tick();
        self.append(OplogEntry::new(
            ts,
            OpType::Command,
            Namespace::command(ns.db.clone()),
            Some(coll.uuid),
            doc! {"dropIndexes": ns.coll.clone(), "index": name},
        ))
    }

    /// Drop a collection.
    pub fn drop_collection(&self, ns: &str) -> Result<Timestamp> {
        let ns = Namespace::parse(ns)?;
        let mut clock = self.clock.lock();
        self.drop_locked(&mut clock, &ns)
    }

    /// Rename a collection.  An existing target is dropped first when `drop_target` is set.
    pub fn rename_collection(&self, from: &str, to: &str, drop_target: bool) -> Result<Timestamp> {
        let from = Namespace::parse(from)?;
        let to = Namespace::parse(to)?;
        let mut clock = self.clock.lock();
        let coll = self.existing_collection(&from)?;
        if self.catalog.exists(&to) {
            if !drop_target {
                return Err(FeedError::InvalidRequest(format!(
                    "target namespace {} exists",
                    to
                )));
            }
            self.drop_locked(&mut clock, &to)?;
        }
        let ts = clock.tick();
        self.catalog.rename(&from, to.clone());
        self.append(OplogEntry::new(
            ts,
            OpType::Command,
            Namespace::command(from.db.clone()),
            Some(coll.uuid),
            doc! {"renameCollection": from.to_string(), "to": to.to_string(), "dropTarget": drop_target},
        ))?;
        self.notify(NamespaceSignal::CollectionRenamed {
            from,
            to,
            uuid: Some(coll.uuid),
            at: ts,
        });
        Ok(ts)
    }

    /// Drop every collection of `db`, then the database itself.
    pub fn drop_database(&self, db: &str) -> Result<Timestamp> {
        let mut clock = self.clock.lock();
        for ns in self.catalog.collections_in(db) {
            self.drop_locked(&mut clock, &ns)?;
        }
        let ts = clock.tick();
        self.append(OplogEntry::new(
            ts,
            OpType::Command,
            Namespace::command(db),
            None,
            doc! {"dropDatabase": 1},
        ))?;
        self.notify(NamespaceSignal::DatabaseDropped {
            db: db.to_string(),
            at: ts,
        });
        Ok(ts)
    }

    /// Log a no-op entry.
    pub fn noop(&self, msg: &str) -> Result<Timestamp> {
        let mut clock = self.clock.lock();
        let ts = clock.tick();
        self.append(OplogEntry::new(
            ts,
            OpType::Noop,
            Namespace::default(),
            None,
            doc! {"msg": msg},
        ))
    }

    /// Win an election: start a new term with a no-op entry.
    pub fn step_up(&self) -> Result<Timestamp> {
        let mut clock = self.clock.lock();
        let ts = clock.tick();
        self.replication.step_up(ts);
        self.append(OplogEntry::new(
            ts,
            OpType::Noop,
            Namespace::default(),
            None,
            doc! {"msg": "new primary"},
        ))
    }

    /// Commit `ops` atomically, logged as a chain of `applyOps` entries holding at most
    /// `ops_per_entry` operations each.  Returns the timestamp of the committing entry.
    pub fn transaction(&self, ops: Vec<TxnOp>, ops_per_entry: usize) -> Result<Timestamp> {
        let mut clock = self.clock.lock();
        let staged = self.stage(ops)?;
        let chunks: Vec<&[StagedOp]> = staged.chunks(ops_per_entry.max(1)).collect();
        clock.txn_number += 1;
        let txn_number = clock.txn_number;
        let timestamps: Vec<Timestamp> = chunks.iter().map(|_| clock.tick()).collect();
        let commit_ts = *timestamps
            .last()
            .ok_or_else(|| FeedError::InvalidRequest("empty transaction".to_string()))?;

        self.record_txn_pre_images(&staged, commit_ts)?;
        self.apply_staged(&staged);
        let lsid = doc! {"id": bson_helper::new_binary(Uuid::new_v4())};
        let mut prev = Timestamp {
            time: 0,
            increment: 0,
        };
        for (n, (chunk, ts)) in chunks.iter().zip(&timestamps).enumerate() {
            let items: Vec<Bson> = chunk.iter().map(|op| Bson::Document(op.item.clone())).collect();
            let mut obj = doc! {"applyOps": items};
            if n + 1 < chunks.len() {
                obj.insert("partialTxn", true);
            }
            self.append(
                OplogEntry::new(*ts, OpType::Command, Namespace::command("admin"), None, obj)
                    .with_txn(lsid.clone(), txn_number, prev),
            )?;
            prev = *ts;
        }
        debug!(?commit_ts, ops = staged.len(), entries = chunks.len(), "Commit transaction.");
        Ok(commit_ts)
    }

    /// Prepare `ops`, then commit or abort them.  Returns the timestamp of the deciding entry.
    pub fn prepared_transaction(&self, ops: Vec<TxnOp>, commit: bool) -> Result<Timestamp> {
        let mut clock = self.clock.lock();
        let staged = self.stage(ops)?;
        if staged.is_empty() {
            return Err(FeedError::InvalidRequest("empty transaction".to_string()));
        }
        clock.txn_number += 1;
        let txn_number = clock.txn_number;
        let lsid = doc! {"id": bson_helper::new_binary(Uuid::new_v4())};
        let prepare_ts = clock.tick();
        let decide_ts = clock.tick();

        if commit {
            self.record_txn_pre_images(&staged, decide_ts)?;
        }
        let items: Vec<Bson> = staged.iter().map(|op| Bson::Document(op.item.clone())).collect();
        self.append(
            OplogEntry::new(
                prepare_ts,
                OpType::Command,
                Namespace::command("admin"),
                None,
                doc! {"applyOps": items, "prepare": true},
            )
            .with_txn(lsid.clone(), txn_number, Timestamp { time: 0, increment: 0 }),
        )?;
        let decision = if commit {
            self.apply_staged(&staged);
            doc! {"commitTransaction": 1, "commitTimestamp": decide_ts}
        } else {
            doc! {"abortTransaction": 1}
        };
        self.append(
            OplogEntry::new(decide_ts, OpType::Command, Namespace::command("admin"), None, decision)
                .with_txn(lsid, txn_number, prepare_ts),
        )
    }

    /// Roll back every write logged after `common_point`.
    ///
    /// The oplog and the pre-images lose the rolled back entries and listeners are told so
    /// cursors built on them can be dropped.  Document contents are left as they are.
    pub fn rollback_to(&self, common_point: Timestamp) -> Result<usize> {
        let _clock = self.clock.lock();
        let mut attempt = self.replication.begin_rollback();
        let removed = self.oplog.truncate_after(common_point);
        if removed > 0 {
            attempt.record_durable_change();
        }
        let pre_images = self.pre_images.rollback_after(common_point);
        attempt.complete(common_point);
        info!(node = %self.name, ?common_point, removed, pre_images, "Rolled back oplog.");
        for listener in self.listeners.read().iter() {
            listener.rolled_back(common_point);
        }
        Ok(removed)
    }

    fn create_locked(&self, clock: &mut Clock, ns: &Namespace, pre_images: bool) -> Result<Uuid> {
        if self.catalog.exists(ns) {
            return Err(FeedError::InvalidRequest(format!(
                "collection {} already exists",
                ns
            )));
        }
        let uuid = Uuid::new_v4();
        let mut obj = doc! {"create": ns.coll.clone()};
        if pre_images {
            obj.insert("changeStreamPreAndPostImages", doc! {"enabled": true});
        }
        let ts = clock.tick();
        self.catalog.create(ns.clone(), uuid, pre_images);
        self.append(OplogEntry::new(
            ts,
            OpType::Command,
            Namespace::command(ns.db.clone()),
            Some(uuid),
            obj,
        ))?;
        Ok(uuid)
    }

    fn drop_locked(&self, clock: &mut Clock, ns: &Namespace) -> Result<Timestamp> {
        let uuid = self
            .catalog
            .drop_collection(ns)
            .ok_or_else(|| FeedError::NamespaceNotFound(ns.to_string()))?;
        let ts = clock.tick();
        self.append(OplogEntry::new(
            ts,
            OpType::Command,
            Namespace::command(ns.db.clone()),
            Some(uuid),
            doc! {"drop": ns.coll.clone()},
        ))?;
        self.notify(NamespaceSignal::CollectionDropped {
            ns: ns.clone(),
            uuid: Some(uuid),
            at: ts,
        });
        Ok(ts)
    }

    fn append(&self, entry: OplogEntry) -> Result<Timestamp> {
        let ts = entry.ts;
        let entry = entry
            .with_term(self.replication.term())
            .with_wall(bson::DateTime::now());
        self.oplog.append(entry)?;
        if self.auto_commit.load(Ordering::SeqCst) {
            self.replication.advance_commit_point(ts);
        }
        Ok(ts)
    }

    fn notify(&self, signal: NamespaceSignal) {
        for listener in self.listeners.read().iter() {
            listener.namespace_gone(signal.clone());
        }
    }

    fn existing_collection(&self, ns: &Namespace) -> Result<super::catalog::CollectionEntry> {
        self.catalog
            .collection(ns)
            .ok_or_else(|| FeedError::NamespaceNotFound(ns.to_string()))
    }

    fn existing_document(&self, ns: &Namespace, id: &Bson) -> Result<Document> {
        self.catalog
            .find(ns, id)
            .ok_or_else(|| FeedError::DocumentNotFound {
                ns: ns.to_string(),
                key: id.to_string(),
            })
    }

    /// Validate every operation against the current data plus the earlier operations, without
    /// changing anything.
    fn stage(&self, ops: Vec<TxnOp>) -> Result<Vec<StagedOp>> {
        let mut overlay: HashMap<(Namespace, Vec<u8>), Option<Document>> = HashMap::new();
        let mut staged = Vec::with_capacity(ops.len());
        for op in ops {
            let (ns, id, old, new, op_type, obj, obj2) = match op {
                TxnOp::Insert { ns, doc } => {
                    let ns = Namespace::parse(&ns)?;
                    let doc = ensure_id(doc);
                    let id = id_of(&doc)?;
                    let old = self.current(&overlay, &ns, &id);
                    if old.is_some() {
                        return Err(duplicate_key(&ns, &id));
                    }
                    (ns, id, None, Some(doc.clone()), OpType::Insert, doc, None)
                }
                TxnOp::Update { ns, id, update } => {
                    let ns = Namespace::parse(&ns)?;
                    let old = self.current(&overlay, &ns, &id).ok_or_else(|| {
                        FeedError::DocumentNotFound {
                            ns: ns.to_string(),
                            key: id.to_string(),
                        }
                    })?;
                    let (new, diff) = apply_update(&old, &update)?;
                    let key = doc! {"_id": id.clone()};
                    (ns, id, Some(old), Some(new), OpType::Update, diff, Some(key))
                }
                TxnOp::Delete { ns, id } => {
                    let ns = Namespace::parse(&ns)?;
                    let old = self.current(&overlay, &ns, &id).ok_or_else(|| {
                        FeedError::DocumentNotFound {
                            ns: ns.to_string(),
                            key: id.to_string(),
                        }
                    })?;
                    let key = doc! {"_id": id.clone()};
                    (ns, id, Some(old), None, OpType::Delete, key, None)
                }
            };
            let coll = self.existing_collection(&ns)?;
            let mut item = doc! {
                "op": op_type.as_str(),
                "ns": ns.to_string(),
                "ui": bson_helper::new_binary(coll.uuid),
                "o": obj,
            };
            if let Some(o2) = obj2 {
                item.insert("o2", o2);
            }
            overlay.insert((ns.clone(), key_string::encode_value(&id)), new.clone());
            staged.push(StagedOp {
                ns,
                uuid: coll.uuid,
                pre_images: coll.pre_images,
                id,
                old,
                new,
                item,
            });
        }
        Ok(staged)
    }

    fn current(
        &self,
        overlay: &HashMap<(Namespace, Vec<u8>), Option<Document>>,
        ns: &Namespace,
        id: &Bson,
    ) -> Option<Document> {
        match overlay.get(&(ns.clone(), key_string::encode_value(id))) {
            Some(staged) => staged.clone(),
            None => self.catalog.find(ns, id),
        }
    }

    fn record_txn_pre_images(&self, staged: &[StagedOp], commit_ts: Timestamp) -> Result<()> {
        for (index, op) in staged.iter().enumerate() {
            if let (true, Some(old)) = (op.pre_images, &op.old) {
                self.pre_images
                    .record(op.uuid, Position::new(commit_ts, index as u32), old.clone())?;
            }
        }
        Ok(())
    }

    fn apply_staged(&self, staged: &[StagedOp]) {
        for op in staged {
            match &op.new {
                Some(doc) => self.catalog.put(&op.ns, &op.id, doc.clone()),
                None => {
                    self.catalog.remove(&op.ns, &op.id);
                }
            }
        }
    }
}

fn ensure_id(doc: Document) -> Document {
    if doc.contains_key("_id") {
        return doc;
    }
    let mut with_id = doc! {"_id": ObjectId::new()};
    with_id.extend(doc);
    with_id
}

fn id_of(doc: &Document) -> Result<Bson> {
    doc.get("_id")
        .cloned()
        .ok_or_else(|| FeedError::InvalidRequest("document has no _id".to_string()))
}

fn duplicate_key(ns: &Namespace, id: &Bson) -> FeedError {
    FeedError::InvalidRequest(format!("duplicate key {} in {}", id, ns))
}

/// Apply `$set` / `$unset` to `old`, returning the new document and the `$v: 2` oplog diff.
fn apply_update(old: &Document, update: &Document) -> Result<(Document, Document)> {
    if update.is_empty() || !update.keys().all(|k| k.starts_with('$')) {
        return Err(FeedError::InvalidRequest(format!(
            "update must only hold modifiers, got {}",
            update
        )));
    }
    let mut new = old.clone();
    let mut diff = Document::new();
    for (op, fields) in update {
        let fields = fields.as_document().ok_or_else(|| {
            FeedError::InvalidRequest(format!("{} expects a document", op))
        })?;
        for (path, value) in fields {
            if path == "_id" || path.starts_with("_id.") {
                return Err(FeedError::InvalidRequest("_id is immutable".to_string()));
            }
            match op.as_str() {
                "$set" => {
                    set_path(&mut new, path, value.clone())?;
                    add_to_diff(&mut diff, path, "u", value.clone());
                }
                "$unset" => {
                    unset_path(&mut new, path);
                    add_to_diff(&mut diff, path, "d", Bson::Boolean(false));
                }
                other => {
                    return Err(FeedError::InvalidRequest(format!(
                        "unsupported update operator {}",
                        other
                    )))
                }
            }
        }
    }
    Ok((new, doc! {"$v": 2, "diff": diff}))
}

fn set_path(doc: &mut Document, path: &str, value: Bson) -> Result<()> {
    match path.split_once('.') {
        None => {
            doc.insert(path, value);
            Ok(())
        }
        Some((head, rest)) => {
            if !doc.contains_key(head) {
                doc.insert(head, Document::new());
            }
            match doc.get_mut(head) {
                Some(Bson::Document(sub)) => set_path(sub, rest, value),
                _ => Err(FeedError::InvalidRequest(format!(
                    "can't set {} inside a non document field",
                    path
                ))),
            }
        }
    }
}

fn unset_path(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Bson::Document(sub)) = doc.get_mut(head) {
                unset_path(sub, rest);
            }
        }
    }
}

fn add_to_diff(diff: &mut Document, path: &str, section: &str, value: Bson) {
    let (key, target) = match path.split_once('.') {
        None => (section.to_string(), None),
        Some((head, rest)) => (format!("s{}", head), Some(rest)),
    };
    if !diff.contains_key(&key) {
        diff.insert(key.clone(), Document::new());
    }
    if let Some(Bson::Document(sub)) = diff.get_mut(&key) {
        match target {
            None => {
                sub.insert(path, value);
            }
            Some(rest) => add_to_diff(sub, rest, section, value),
        }
    }
}
