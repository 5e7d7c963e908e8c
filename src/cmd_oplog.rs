//! Provide structured command type oplog definition.

use bson::{doc, Array, Document, Timestamp};
use tracing::warn;

use crate::bson_helper;
use crate::namespace::Namespace;
use crate::oplog::{OpType, OplogEntry};
use crate::{FeedError, Result};

/// collection namespace borrowed from a command oplog.
#[derive(Debug, PartialEq)]
pub struct CollNs<'a> {
    /// database name.
    db_name: &'a str,
    /// collection name.
    coll_name: &'a str,
}

impl<'a> CollNs<'a> {
    /// construct a namespace from `db_name` and `coll_name`.
    pub fn new(db_name: &'a str, coll_name: &'a str) -> Self {
        CollNs { db_name, coll_name }
    }

    /// database name.
    pub fn db(&self) -> &'a str {
        self.db_name
    }

    /// collection name.
    pub fn coll(&self) -> &'a str {
        self.coll_name
    }

    /// Is this the same namespace as `ns`?
    pub fn is(&self, ns: &Namespace) -> bool {
        self.db_name == ns.db && self.coll_name == ns.coll
    }

    /// owned copy of the namespace.
    pub fn to_namespace(&self) -> Namespace {
        Namespace::new(self.db_name, self.coll_name)
    }

    fn parse(ns: &'a str, field: &str) -> Result<Self> {
        match ns.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(CollNs::new(db, coll)),
            _ => {
                warn!(%ns, %field, "Get an invalid namespace, which should be split by '.'");
                Err(FeedError::InvalidNamespace(ns.to_string()))
            }
        }
    }
}

/// Structured command type oplog definition.
///
/// Basically, use [CmdOplog::from_entry] (or [CmdOplog::from_oplog_doc] for a raw document)
/// to parse mongodb command oplog and create this item.
#[derive(Debug, PartialEq)]
pub enum CmdOplog<'a> {
    /// rename collection command.
    RenameCollection {
        /// rename namespace from.
        from: CollNs<'a>,
        /// rename namespace to.
        to: CollNs<'a>,
        /// an existing target collection is dropped first.
        drop_target: bool,
    },
    /// drop collection command.
    DropCollection(CollNs<'a>),
    /// create collection command.
    CreateCollection(CollNs<'a>),
    /// drop database command.
    DropDatabase(&'a str),
    /// drop indexes command.
    DropIndexes {
        /// relative namespace to drop index.
        ns: CollNs<'a>,
        /// index name.
        name: &'a str,
    },
    /// create indexes command.
    CreateIndexes {
        /// relative namespace to create index.
        ns: CollNs<'a>,
        /// index key.
        key: &'a Document,
        /// index name.
        name: &'a str,
        /// is unique?.
        unique: bool,
        /// index partial_filter_expression, for more information, see <https://docs.mongodb.com/manual/core/index-partial/>
        partial_filter_expression: Option<&'a Document>,
    },
    /// two phase index build committed, one or more indexes are ready.
    CommitIndexBuild {
        /// relative namespace of the index build.
        ns: CollNs<'a>,
        /// index specs.
        indexes: &'a Array,
    },
    /// collMod command, `obj` is the whole command.
    CollMod {
        /// modified collection.
        ns: CollNs<'a>,
        /// command body.
        obj: &'a Document,
    },
    /// operations applied atomically, written by transactions.
    ApplyOps {
        /// the operations.
        ops: &'a Array,
        /// more entries of the same transaction follow.
        partial_txn: bool,
        /// prepared transaction, committed by a later `commitTransaction` entry.
        prepare: bool,
    },
    /// commit of a prepared transaction.
    CommitTransaction {
        /// timestamp the transaction committed at.
        commit_timestamp: Option<Timestamp>,
    },
    /// abort of a prepared transaction.
    AbortTransaction,
}

impl<'a> CmdOplog<'a> {
    /// Parse mongodb command oplog to create the item.
    ///
    /// It returns None when the command in `doc` can't be recognized.
    ///
    /// # Example
    /// ```
    /// use change_feed::cmd_oplog::{CmdOplog, CollNs};
    /// use bson::doc;
    /// let test_doc = doc! {"ns": "a.$cmd", "o": {"renameCollection": "a.b", "to": "a.c"}};
    /// let oplog = CmdOplog::from_oplog_doc(&test_doc).unwrap().unwrap();
    /// assert_eq!(
    ///     oplog,
    ///     CmdOplog::RenameCollection {
    ///         from: CollNs::new("a", "b"),
    ///         to: CollNs::new("a", "c"),
    ///         drop_target: false,
    ///     }
    /// );
    /// ```
    pub fn from_oplog_doc(doc: &'a Document) -> Result<Option<Self>> {
        let obj = doc.get_document("o")?;
        let ns = doc.get_str("ns")?;
        let (db, _) = ns
            .split_once('.')
            .ok_or_else(|| FeedError::InvalidNamespace(ns.to_string()))?;
        Self::parse(db, obj)
    }

    /// Parse the command carried by a structured entry, None for non command entries.
    pub fn from_entry(entry: &'a OplogEntry) -> Result<Option<Self>> {
        if entry.op != OpType::Command {
            return Ok(None);
        }
        Self::parse(&entry.ns.db, &entry.obj)
    }

    fn parse(db: &'a str, obj: &'a Document) -> Result<Option<Self>> {
        if obj.contains_key("renameCollection") {
            // rename collection command.
            // obj structure:
            // {"renameCollection": "ns", "to": "ns", "dropTarget": false}
            let from = CollNs::parse(obj.get_str("renameCollection")?, "renameCollection")?;
            let to = CollNs::parse(obj.get_str("to")?, "to")?;
            Ok(Some(CmdOplog::RenameCollection {
                from,
                to,
                drop_target: bson_helper::get_flag(obj, "dropTarget"),
            }))
        } else if obj.contains_key("drop") {
            // drop collection command.
            // obj structure:
            // { "drop": "coll" }
            let coll = obj.get_str("drop")?;
            Ok(Some(CmdOplog::DropCollection(CollNs::new(db, coll))))
        } else if obj.contains_key("create") {
            // create collection command.
            // obj structure:
            // { "create": "coll" }
            let coll = obj.get_str("create")?;
            Ok(Some(CmdOplog::CreateCollection(CollNs::new(db, coll))))
        } else if obj.contains_key("dropDatabase") {
            // obj structure:
            // { "dropDatabase": 1 }
            Ok(Some(CmdOplog::DropDatabase(db)))
        } else if obj.contains_key("createIndexes") {
            // create Indexes command.
            // obj structure:
            // { "createIndexes": "coll", "key": {"x": 1}, "name": "index_name", "unique": true, "partialFilterExpression": {"a": {"$ne": null}}}
            // "unique" key is optional.
            // "partialFilterExpression" key is optional.
            let key = match obj.get_document("key") {
                Err(err) => {
                    warn!(?obj, ?err, "Failed to access `key` field in createIndex command oplog, so the command will be ignored.");
                    return Ok(None);
                }
                Ok(doc) => doc,
            };
            let name = match obj.get_str("name") {
                Err(err) => {
                    warn!(?obj, ?err, "Failed to access `name` field in CreateIndex command oplog, so the command will be ignored.");
                    return Ok(None);
                }
                Ok(name) => name,
            };

            let partial_filter_expression =
                bson_helper::get_optional_document(obj, "partialFilterExpression")?;
            let coll = obj.get_str("createIndexes")?;
            let unique = obj.get_bool("unique").unwrap_or(false);
            Ok(Some(CmdOplog::CreateIndexes {
                ns: CollNs::new(db, coll),
                key,
                name,
                unique,
                partial_filter_expression,
            }))
        } else if obj.contains_key("commitIndexBuild") {
            // obj structure:
            // { "commitIndexBuild": "coll", "indexBuildUUID": UUID, "indexes": [{"v": 2, "key": {"x": 1}, "name": "x_1"}]}
            let coll = obj.get_str("commitIndexBuild")?;
            Ok(Some(CmdOplog::CommitIndexBuild {
                ns: CollNs::new(db, coll),
                indexes: obj.get_array("indexes")?,
            }))
        } else if obj.contains_key("dropIndexes") {
            // drop Indexes command.
            // obj structure:
            // { "dropIndexes": "coll", "index": "index_name"}
            let name = match obj.get_str("index") {
                Err(err) => {
                    warn!(?obj, ?err, "Failed to access `index` field in dropIndexes command oplog, so the command will be ignored.");
                    return Ok(None);
                }
                Ok(n) => n,
            };

            let coll = obj.get_str("dropIndexes")?;
            Ok(Some(CmdOplog::DropIndexes {
                ns: CollNs::new(db, coll),
                name,
            }))
        } else if obj.contains_key("collMod") {
            // obj structure:
            // { "collMod": "coll", "changeStreamPreAndPostImages": {"enabled": true} }
            let coll = obj.get_str("collMod")?;
            Ok(Some(CmdOplog::CollMod {
                ns: CollNs::new(db, coll),
                obj,
            }))
        } else if obj.contains_key("applyOps") {
            // obj structure:
            // { "applyOps": [{"op": "i", "ns": "a.b", "ui": UUID, "o": {...}}], "partialTxn": true, "prepare": true }
            Ok(Some(CmdOplog::ApplyOps {
                ops: obj.get_array("applyOps")?,
                partial_txn: bson_helper::get_flag(obj, "partialTxn"),
                prepare: bson_helper::get_flag(obj, "prepare"),
            }))
        } else if obj.contains_key("commitTransaction") {
            // obj structure:
            // { "commitTransaction": 1, "commitTimestamp": Timestamp }
            Ok(Some(CmdOplog::CommitTransaction {
                commit_timestamp: obj.get_timestamp("commitTimestamp").ok(),
            }))
        } else if obj.contains_key("abortTransaction") {
            Ok(Some(CmdOplog::AbortTransaction))
        } else {
            warn!(?obj, "Get a command which can't be handled.");
            Ok(None)
        }
    }

    /// Index spec documents described by an index command.
    pub fn index_specs(&self) -> Vec<Document> {
        match self {
            CmdOplog::CreateIndexes {
                key,
                name,
                unique,
                partial_filter_expression,
                ..
            } => {
                let mut index_info = doc! {
                    "key": (*key).clone(), "name": *name
                };
                if *unique {
                    index_info.insert("unique", true);
                }
                if let Some(partial_filter_expression) = partial_filter_expression {
                    index_info.insert("partialFilterExpression", (*partial_filter_expression).clone());
                }
                vec![index_info]
            }
            CmdOplog::CommitIndexBuild { indexes, .. } => indexes
                .iter()
                .filter_map(|spec| spec.as_document().cloned())
                .collect(),
            _ => vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmd_oplog_rename_collection() {
        let test_doc = doc! {"ns": "a.$cmd", "o": {"renameCollection": "a.b", "to": "a.c", "dropTarget": true}};
        let oplog = CmdOplog::from_oplog_doc(&test_doc).unwrap().unwrap();

        assert_eq!(
            oplog,
            CmdOplog::RenameCollection {
                from: CollNs::new("a", "b"),
                to: CollNs::new("a", "c"),
                drop_target: true,
            }
        );
    }

    #[test]
    fn test_cmd_oplog_rename_invalid_namespace() {
        let test_doc = doc! {"ns": "a.$cmd", "o": {"renameCollection": "ab", "to": "a.c"}};
        assert!(matches!(
            CmdOplog::from_oplog_doc(&test_doc),
            Err(FeedError::InvalidNamespace(_))
        ));
    }

    #[test]
    fn test_cmd_oplog_drop_collection() {
        let test_doc = doc! {"ns": "a.$cmd", "o": {"drop": "cc"}};
        let oplog = CmdOplog::from_oplog_doc(&test_doc).unwrap().unwrap();

        assert_eq!(oplog, CmdOplog::DropCollection(CollNs::new("a", "cc")));
    }

    #[test]
    fn test_cmd_oplog_create_collection() {
        let test_doc = doc! { "ns": "a.$cmd", "o": {"create": "cc"}};
        let oplog = CmdOplog::from_oplog_doc(&test_doc).unwrap().unwrap();

        assert_eq!(oplog, CmdOplog::CreateCollection(CollNs::new("a", "cc")));
    }

    #[test]
    fn test_cmd_oplog_drop_database() {
        let test_doc = doc! { "ns": "a.$cmd", "o": {"dropDatabase": 1}};
        let oplog = CmdOplog::from_oplog_doc(&test_doc).unwrap().unwrap();

        assert_eq!(oplog, CmdOplog::DropDatabase("a"));
    }

    #[test]
    fn test_cmd_oplog_drop_indexes() {
        let test_doc = doc! {"ns": "a.$cmd", "o": {"dropIndexes": "abc", "index": "aa_1"}};
        let oplog = CmdOplog::from_oplog_doc(&test_doc).unwrap().unwrap();

        assert_eq!(
            oplog,
            CmdOplog::DropIndexes {
                ns: CollNs::new("a", "abc"),
                name: "aa_1"
            }
        );
    }

    #[test]
    fn test_cmd_oplog_create_indexes_contains_unique_and_partial_key() {
        let test_doc = doc! {"ns": "a.$cmd", "o": {"createIndexes": "coll_aa", "key": {"x": 1}, "name": "x_1", "unique": true, "partialFilterExpression": {"a": {"$gt": 1}}}};
        let oplog = CmdOplog::from_oplog_doc(&test_doc).unwrap().unwrap();

        assert_eq!(
            oplog,
            CmdOplog::CreateIndexes {
                ns: CollNs::new("a", "coll_aa"),
                key: &doc! {"x": 1},
                name: "x_1",
                unique: true,
                partial_filter_expression: Some(&doc! {"a": {"$gt": 1}})
            }
        );
        assert_eq!(
            oplog.index_specs(),
            vec![doc! {"key": {"x": 1}, "name": "x_1", "unique": true, "partialFilterExpression": {"a": {"$gt": 1}}}]
        );
    }

    #[test]
    fn test_cmd_oplog_apply_ops_flags() {
        let test_doc = doc! {"ns": "admin.$cmd", "o": {"applyOps": [], "partialTxn": true}};
        let oplog = CmdOplog::from_oplog_doc(&test_doc).unwrap().unwrap();

        assert!(matches!(
            oplog,
            CmdOplog::ApplyOps {
                partial_txn: true,
                prepare: false,
                ..
            }
        ));
    }

    #[test]
    fn test_cmd_oplog_unknown_command() {
        let test_doc = doc! {"ns": "a.$cmd", "o": {"emptycapped": "cc"}};
        assert_eq!(CmdOplog::from_oplog_doc(&test_doc).unwrap(), None);
    }
}
