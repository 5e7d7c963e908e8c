//! Most oplog information comes from here:
//! https://github.com/mongodb/mongo/blob/master/src/mongo/db/repl/oplog_entry.idl
//! https://github.com/mongodb/mongo/blob/master/src/mongo/db/repl/optime_and_wall_time_base.idl
//! https://github.com/mongodb/mongo/blob/master/src/mongo/db/logical_session_id.idl
//!
//! Useful fields:
//! ts: The time when the oplog entry was created. (Timestamp)
//! t: The term of the primary which wrote the entry. (i64)
//! op: The operation type. (enum Optype)
//! ns: The namespace on which to apply the operation. (String)
//! ui: The uuid of the collection. (Binary, subtype uuid)
//! o: The operation applied. (Document)
//! o2: Additional information about the operation applied, the document key for updates. (Document)
//! lsid, txnNumber: The session and transaction the operation belongs to.
//! prevOpTime: The previous oplog entry of the same transaction. ({ts, t})
//! wall: Wall clock time of the write. (DateTime)
//!
//! For `op` field, the definition of OpType:
//! "c": Command
//! "i": Insert
//! "u": Update
//! "d": Delete
//! "n": Noop

use std::cmp::Ordering;
use std::fmt;

use bson::{doc, Bson, Document, Timestamp};
use uuid::Uuid;

use crate::bson_helper;
use crate::namespace::Namespace;
use crate::{FeedError, Result};
use crate::{NAMESPACE_KEY, OBJ2_KEY, OBJ_KEY, OP_KEY, TIMESTAMP_KEY, UUID_KEY};

const INSERT_OP: &str = "i";
const UPDATE_OP: &str = "u";
const DELETE_OP: &str = "d";
const COMMAND_OP: &str = "c";
const NOOP_OP: &str = "n";

const TERM_KEY: &str = "t";
const VERSION_KEY: &str = "v";
const WALL_KEY: &str = "wall";
const LSID_KEY: &str = "lsid";
const TXN_NUMBER_KEY: &str = "txnNumber";
const PREV_OP_TIME_KEY: &str = "prevOpTime";

/// A logical position in the oplog: the timestamp of the physical entry plus the index of the
/// operation inside it (non zero only for the operations of a transaction).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Position {
    /// seconds part of the timestamp.
    pub time: u32,
    /// ordinal part of the timestamp.
    pub increment: u32,
    /// index inside an `applyOps` entry.
    pub apply_ops_index: u32,
}

impl Position {
    /// Position of the `index`th operation of the entry at `ts`.
    pub fn new(ts: Timestamp, apply_ops_index: u32) -> Self {
        Position {
            time: ts.time,
            increment: ts.increment,
            apply_ops_index,
        }
    }

    /// Position of the plain entry at `ts`.
    pub fn at(ts: Timestamp) -> Self {
        Position::new(ts, 0)
    }

    /// timestamp part of the position.
    pub fn timestamp(&self) -> Timestamp {
        Timestamp {
            time: self.time,
            increment: self.increment,
        }
    }
}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.time, self.increment, self.apply_ops_index).cmp(&(
            other.time,
            other.increment,
            other.apply_ops_index,
        ))
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Timestamp({}, {})#{}",
            self.time, self.increment, self.apply_ops_index
        )
    }
}

/// The type of an operation in the oplog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    /// represent by "i"
    Insert,
    /// represent by "u"
    Update,
    /// represent by "d"
    Delete,
    /// represent by "c"
    Command,
    /// represent by "n", which never produces an event.
    Noop,
}

impl OpType {
    /// Parse the `op` field.
    pub fn parse(op: &str) -> Result<Self> {
        match op {
            INSERT_OP => Ok(OpType::Insert),
            UPDATE_OP => Ok(OpType::Update),
            DELETE_OP => Ok(OpType::Delete),
            COMMAND_OP => Ok(OpType::Command),
            NOOP_OP => Ok(OpType::Noop),
            other => Err(FeedError::BsonValueError {
                key: OP_KEY.to_string(),
                val: other.to_string(),
            }),
        }
    }

    /// The `op` field value.
    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::Insert => INSERT_OP,
            OpType::Update => UPDATE_OP,
            OpType::Delete => DELETE_OP,
            OpType::Command => COMMAND_OP,
            OpType::Noop => NOOP_OP,
        }
    }
}

/// One structured oplog record.
#[derive(Debug, Clone, PartialEq)]
pub struct OplogEntry {
    /// The time when the oplog entry was created.
    pub ts: Timestamp,
    /// election term of the writer.
    pub term: Option<i64>,
    /// oplog format version.
    pub version: Option<i64>,
    /// The operation type.
    pub op: OpType,
    /// The namespace on which to apply the operation.
    pub ns: Namespace,
    /// collection uuid, stable across renames.
    pub uuid: Option<Uuid>,
    /// The operation applied.
    pub obj: Document,
    /// Additional information about the operation applied.
    pub obj2: Option<Document>,
    /// wall clock time of the write.
    pub wall: Option<bson::DateTime>,
    /// logical session the write belongs to.
    pub lsid: Option<Document>,
    /// transaction number inside the session.
    pub txn_number: Option<i64>,
    /// previous entry written by the same transaction.
    pub prev_op_time: Option<Timestamp>,
    /// index of this operation inside its `applyOps` entry.
    pub apply_ops_index: u32,
}

impl OplogEntry {
    /// Parse a raw oplog document.
    pub fn from_doc(doc: &Document) -> Result<Self> {
        let op = OpType::parse(doc.get_str(OP_KEY)?)?;
        let ns = match (op, Namespace::parse(doc.get_str(NAMESPACE_KEY)?)) {
            (_, Ok(ns)) => ns,
            // noop oplogs are written with an empty namespace.
            (OpType::Noop, Err(_)) => Namespace::default(),
            (_, Err(e)) => return Err(e),
        };

        Ok(OplogEntry {
            ts: doc.get_timestamp(TIMESTAMP_KEY)?,
            term: bson_helper::get_optional_i64(doc, TERM_KEY)?,
            version: bson_helper::get_optional_i64(doc, VERSION_KEY)?,
            op,
            ns,
            uuid: bson_helper::get_optional_uuid(doc, UUID_KEY)?,
            obj: doc.get_document(OBJ_KEY)?.clone(),
            obj2: bson_helper::get_optional_document(doc, OBJ2_KEY)?.cloned(),
            wall: match doc.get(WALL_KEY) {
                Some(Bson::DateTime(dt)) => Some(*dt),
                _ => None,
            },
            lsid: bson_helper::get_optional_document(doc, LSID_KEY)?.cloned(),
            txn_number: bson_helper::get_optional_i64(doc, TXN_NUMBER_KEY)?,
            prev_op_time: bson_helper::get_optime_ts(doc, PREV_OP_TIME_KEY)?,
            apply_ops_index: 0,
        })
    }

    /// Build the `index`th operation of an `applyOps` array.
    ///
    /// Operations inside `applyOps` carry no timestamp or session, they take the ones of the
    /// entry which commits them.
    pub fn from_apply_ops_item(item: &Document, commit: &OplogEntry, index: u32) -> Result<Self> {
        let op = OpType::parse(item.get_str(OP_KEY)?)?;
        Ok(OplogEntry {
            ts: commit.ts,
            term: commit.term,
            version: commit.version,
            op,
            ns: Namespace::parse(item.get_str(NAMESPACE_KEY)?)?,
            uuid: bson_helper::get_optional_uuid(item, UUID_KEY)?,
            obj: item.get_document(OBJ_KEY)?.clone(),
            obj2: bson_helper::get_optional_document(item, OBJ2_KEY)?.cloned(),
            wall: commit.wall,
            lsid: commit.lsid.clone(),
            txn_number: commit.txn_number,
            prev_op_time: None,
            apply_ops_index: index,
        })
    }

    /// Render the entry back to its raw form.
    pub fn to_doc(&self) -> Document {
        let ns = if self.ns.db.is_empty() {
            String::new()
        } else {
            self.ns.to_string()
        };
        let mut doc = doc! {
            TIMESTAMP_KEY: self.ts,
            OP_KEY: self.op.as_str(),
            NAMESPACE_KEY: ns,
            OBJ_KEY: self.obj.clone(),
        };
        if let Some(t) = self.term {
            doc.insert(TERM_KEY, t);
        }
        if let Some(v) = self.version {
            doc.insert(VERSION_KEY, v);
        }
        if let Some(uuid) = self.uuid {
            doc.insert(UUID_KEY, bson_helper::new_binary(uuid));
        }
        if let Some(o2) = &self.obj2 {
            doc.insert(OBJ2_KEY, o2.clone());
        }
        if let Some(wall) = self.wall {
            doc.insert(WALL_KEY, wall);
        }
        if let Some(lsid) = &self.lsid {
            doc.insert(LSID_KEY, lsid.clone());
        }
        if let Some(txn_number) = self.txn_number {
            doc.insert(TXN_NUMBER_KEY, txn_number);
        }
        if let Some(prev) = self.prev_op_time {
            let term = self.term.unwrap_or(-1);
            doc.insert(PREV_OP_TIME_KEY, doc! {"ts": prev, "t": term});
        }
        doc
    }

    /// Where this operation sits in the total order of the oplog.
    pub fn position(&self) -> Position {
        Position::new(self.ts, self.apply_ops_index)
    }

    /// Fields identifying the affected document, for CRUD operations.
    pub fn document_key(&self) -> Option<Document> {
        match self.op {
            OpType::Insert => match &self.obj2 {
                Some(key) => Some(key.clone()),
                None => self.obj.get("_id").map(|id| doc! {"_id": id.clone()}),
            },
            OpType::Update => self.obj2.clone(),
            OpType::Delete => Some(self.obj.clone()),
            OpType::Command | OpType::Noop => None,
        }
    }

    /// A plain CRUD or command entry, used by write paths.
    pub fn new(ts: Timestamp, op: OpType, ns: Namespace, uuid: Option<Uuid>, obj: Document) -> Self {
        OplogEntry {
            ts,
            term: None,
            version: Some(2),
            op,
            ns,
            uuid,
            obj,
            obj2: None,
            wall: None,
            lsid: None,
            txn_number: None,
            prev_op_time: None,
            apply_ops_index: 0,
        }
    }

    /// Set the second object.
    pub fn with_obj2(mut self, obj2: Document) -> Self {
        self.obj2 = Some(obj2);
        self
    }

    /// Set the writer's term.
    pub fn with_term(mut self, term: i64) -> Self {
        self.term = Some(term);
        self
    }

    /// Set the wall clock time of the write.
    pub fn with_wall(mut self, wall: bson::DateTime) -> Self {
        self.wall = Some(wall);
        self
    }

    /// Attach the entry to a transaction.
    pub fn with_txn(mut self, lsid: Document, txn_number: i64, prev: Timestamp) -> Self {
        self.lsid = Some(lsid);
        self.txn_number = Some(txn_number);
        self.prev_op_time = Some(prev);
        self
    }
}
