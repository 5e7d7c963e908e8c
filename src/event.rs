//! User facing change events.
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use bson::{doc, Bson, Document, Timestamp};
use uuid::Uuid;

use crate::bson_helper;
use crate::namespace::Namespace;
use crate::resume_token::ResumeToken;
use crate::{FeedError, Result};

/// Discriminant of [EventKind], rendered as the `operationType` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    /// a document was inserted.
    Insert,
    /// some fields of a document changed.
    Update,
    /// a document was replaced as a whole.
    Replace,
    /// a document was removed.
    Delete,
    /// a collection was created.
    Create,
    /// a collection was dropped.
    Drop,
    /// a collection was renamed.
    Rename,
    /// a database was dropped.
    DropDatabase,
    /// indexes were built.
    CreateIndexes,
    /// indexes were dropped.
    DropIndexes,
    /// collection options changed.
    Modify,
    /// the watched scope is gone, always the last event of a feed.
    Invalidate,
}

impl OperationType {
    /// The `operationType` value.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Update => "update",
            OperationType::Replace => "replace",
            OperationType::Delete => "delete",
            OperationType::Create => "create",
            OperationType::Drop => "drop",
            OperationType::Rename => "rename",
            OperationType::DropDatabase => "dropDatabase",
            OperationType::CreateIndexes => "createIndexes",
            OperationType::DropIndexes => "dropIndexes",
            OperationType::Modify => "modify",
            OperationType::Invalidate => "invalidate",
        }
    }

    /// Only reported when the feed asked for expanded events.
    pub fn is_expanded(&self) -> bool {
        matches!(
            self,
            OperationType::CreateIndexes | OperationType::DropIndexes | OperationType::Modify
        )
    }
}

impl FromStr for OperationType {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self> {
        let op = match s {
            "insert" => OperationType::Insert,
            "update" => OperationType::Update,
            "replace" => OperationType::Replace,
            "delete" => OperationType::Delete,
            "create" => OperationType::Create,
            "drop" => OperationType::Drop,
            "rename" => OperationType::Rename,
            "dropDatabase" => OperationType::DropDatabase,
            "createIndexes" => OperationType::CreateIndexes,
            "dropIndexes" => OperationType::DropIndexes,
            "modify" => OperationType::Modify,
            "invalidate" => OperationType::Invalidate,
            other => {
                return Err(FeedError::InvalidRequest(format!(
                    "unknown operation type {:?}",
                    other
                )))
            }
        };
        Ok(op)
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `ns` of an event, the collection is absent for database level events.
#[derive(Debug, Clone, PartialEq)]
pub struct EventNamespace {
    /// database name.
    pub db: String,
    /// collection name.
    pub coll: Option<String>,
}

impl EventNamespace {
    /// A collection namespace.
    pub fn collection(ns: &Namespace) -> Self {
        EventNamespace {
            db: ns.db.clone(),
            coll: Some(ns.coll.clone()),
        }
    }

    /// A database namespace.
    pub fn database(db: &str) -> Self {
        EventNamespace {
            db: db.to_string(),
            coll: None,
        }
    }

    fn to_document(&self) -> Document {
        let mut doc = doc! {"db": self.db.clone()};
        if let Some(coll) = &self.coll {
            doc.insert("coll", coll.clone());
        }
        doc
    }
}

/// An array shortened by an update.
#[derive(Debug, Clone, PartialEq)]
pub struct TruncatedArray {
    /// dotted path of the array.
    pub field: String,
    /// length after the update.
    pub new_size: i64,
}

/// Delta of a partial update.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpdateDescription {
    /// new values, keyed by dotted path.
    pub updated_fields: Document,
    /// dotted paths of removed fields.
    pub removed_fields: Vec<String>,
    /// arrays that got shorter.
    pub truncated_arrays: Vec<TruncatedArray>,
}

impl UpdateDescription {
    fn to_document(&self) -> Document {
        let truncated: Vec<Bson> = self
            .truncated_arrays
            .iter()
            .map(|t| Bson::Document(doc! {"field": t.field.clone(), "newSize": t.new_size}))
            .collect();
        doc! {
            "updatedFields": self.updated_fields.clone(),
            "removedFields": self.removed_fields.clone(),
            "truncatedArrays": truncated,
        }
    }
}

/// Payload of an event, one variant per operation type.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// insert.
    Insert {
        /// key of the new document.
        document_key: Document,
        /// the inserted document.
        full_document: Document,
    },
    /// partial update.
    Update {
        /// key of the updated document.
        document_key: Document,
        /// what changed.
        update_description: UpdateDescription,
        /// current version of the document, when post-images were requested and it still exists.
        full_document: Option<Document>,
        /// version before the update, when pre-images were requested and recorded.
        full_document_before_change: Option<Document>,
    },
    /// whole document replacement.
    Replace {
        /// key of the replaced document.
        document_key: Document,
        /// the new document.
        full_document: Document,
        /// version before the replacement, when pre-images were requested and recorded.
        full_document_before_change: Option<Document>,
    },
    /// delete.
    Delete {
        /// key of the removed document.
        document_key: Document,
        /// the removed document, when pre-images were requested and recorded.
        full_document: Option<Document>,
        /// same as `full_document`.
        full_document_before_change: Option<Document>,
    },
    /// collection created.
    Create {
        /// collection options, with expanded events only.
        operation_description: Option<Document>,
    },
    /// collection dropped.
    Drop,
    /// collection renamed.
    Rename {
        /// new name.
        to: EventNamespace,
        /// a collection at the target was dropped first.
        drop_target: bool,
    },
    /// database dropped.
    DropDatabase,
    /// indexes built.
    CreateIndexes {
        /// index specs.
        indexes: Vec<Document>,
    },
    /// indexes dropped.
    DropIndexes {
        /// index names.
        indexes: Vec<Document>,
    },
    /// collection options changed.
    Modify {
        /// the collMod command.
        operation_description: Document,
    },
    /// terminal event.
    Invalidate,
}

impl EventKind {
    /// discriminant of the payload.
    pub fn operation_type(&self) -> OperationType {
        match self {
            EventKind::Insert { .. } => OperationType::Insert,
            EventKind::Update { .. } => OperationType::Update,
            EventKind::Replace { .. } => OperationType::Replace,
            EventKind::Delete { .. } => OperationType::Delete,
            EventKind::Create { .. } => OperationType::Create,
            EventKind::Drop => OperationType::Drop,
            EventKind::Rename { .. } => OperationType::Rename,
            EventKind::DropDatabase => OperationType::DropDatabase,
            EventKind::CreateIndexes { .. } => OperationType::CreateIndexes,
            EventKind::DropIndexes { .. } => OperationType::DropIndexes,
            EventKind::Modify { .. } => OperationType::Modify,
            EventKind::Invalidate => OperationType::Invalidate,
        }
    }
}

/// One logical change.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// resume token of the event.
    pub id: ResumeToken,
    /// timestamp of the oplog entry.
    pub cluster_time: Timestamp,
    /// wall clock time of the write.
    pub wall_time: Option<bson::DateTime>,
    /// namespace, absent on invalidate events of wide feeds.
    pub ns: Option<EventNamespace>,
    /// uuid of the collection.
    pub collection_uuid: Option<Uuid>,
    /// session of the transaction the write belongs to.
    pub lsid: Option<Document>,
    /// transaction number.
    pub txn_number: Option<i64>,
    /// operation specific payload.
    pub kind: EventKind,
}

impl ChangeEvent {
    /// discriminant of the event.
    pub fn operation_type(&self) -> OperationType {
        self.kind.operation_type()
    }

    /// key of the affected document, for CRUD events.
    pub fn document_key(&self) -> Option<&Document> {
        match &self.kind {
            EventKind::Insert { document_key, .. }
            | EventKind::Update { document_key, .. }
            | EventKind::Replace { document_key, .. }
            | EventKind::Delete { document_key, .. } => Some(document_key),
            _ => None,
        }
    }

    /// `fullDocument` of the event, if any.
    pub fn full_document(&self) -> Option<&Document> {
        match &self.kind {
            EventKind::Insert { full_document, .. } | EventKind::Replace { full_document, .. } => {
                Some(full_document)
            }
            EventKind::Update { full_document, .. } | EventKind::Delete { full_document, .. } => {
                full_document.as_ref()
            }
            _ => None,
        }
    }

    /// `fullDocumentBeforeChange` of the event, if any.
    pub fn full_document_before_change(&self) -> Option<&Document> {
        match &self.kind {
            EventKind::Update {
                full_document_before_change,
                ..
            }
            | EventKind::Replace {
                full_document_before_change,
                ..
            }
            | EventKind::Delete {
                full_document_before_change,
                ..
            } => full_document_before_change.as_ref(),
            _ => None,
        }
    }

    /// Render the event the way a client receives it.
    pub fn to_document(&self) -> Document {
        let mut doc = doc! {
            "_id": self.id.to_document(),
            "operationType": self.operation_type().as_str(),
            "clusterTime": self.cluster_time,
        };
        if let Some(wall) = self.wall_time {
            doc.insert("wallTime", wall);
        }
        if let Some(ns) = &self.ns {
            doc.insert("ns", ns.to_document());
        }
        if let Some(uuid) = self.collection_uuid {
            doc.insert("collectionUUID", bson_helper::new_binary(uuid));
        }
        match &self.kind {
            EventKind::Insert {
                document_key,
                full_document,
            } => {
                doc.insert("documentKey", document_key.clone());
                doc.insert("fullDocument", full_document.clone());
            }
            EventKind::Update {
                document_key,
                update_description,
                full_document,
                full_document_before_change,
            } => {
                doc.insert("documentKey", document_key.clone());
                doc.insert("updateDescription", update_description.to_document());
                insert_optional(&mut doc, "fullDocument", full_document);
                insert_optional(&mut doc, "fullDocumentBeforeChange", full_document_before_change);
            }
            EventKind::Replace {
                document_key,
                full_document,
                full_document_before_change,
            } => {
                doc.insert("documentKey", document_key.clone());
                doc.insert("fullDocument", full_document.clone());
                insert_optional(&mut doc, "fullDocumentBeforeChange", full_document_before_change);
            }
            EventKind::Delete {
                document_key,
                full_document,
                full_document_before_change,
            } => {
                doc.insert("documentKey", document_key.clone());
                insert_optional(&mut doc, "fullDocument", full_document);
                insert_optional(&mut doc, "fullDocumentBeforeChange", full_document_before_change);
            }
            EventKind::Create {
                operation_description,
            } => insert_optional(&mut doc, "operationDescription", operation_description),
            EventKind::Rename { to, drop_target } => {
                doc.insert("to", to.to_document());
                if *drop_target {
                    doc.insert("operationDescription", doc! {"dropTarget": true});
                }
            }
            EventKind::CreateIndexes { indexes } | EventKind::DropIndexes { indexes } => {
                doc.insert("operationDescription", doc! {"indexes": indexes.clone()});
            }
            EventKind::Modify {
                operation_description,
            } => {
                doc.insert("operationDescription", operation_description.clone());
            }
            EventKind::Drop | EventKind::DropDatabase | EventKind::Invalidate => {}
        }
        if let Some(lsid) = &self.lsid {
            doc.insert("lsid", lsid.clone());
        }
        if let Some(txn_number) = self.txn_number {
            doc.insert("txnNumber", txn_number);
        }
        doc
    }
}

fn insert_optional(doc: &mut Document, key: &str, value: &Option<Document>) {
    if let Some(v) = value {
        doc.insert(key, v.clone());
    }
}

/// Optional operation type filter of a feed.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    operation_types: Option<HashSet<OperationType>>,
}

impl EventFilter {
    /// Keep only the given operation types, `None` keeps everything.
    pub fn new(operation_types: Option<Vec<OperationType>>) -> Self {
        EventFilter {
            operation_types: operation_types.map(|types| types.into_iter().collect()),
        }
    }

    /// Should the event be delivered?  Invalidate always is.
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        let op = event.operation_type();
        if op == OperationType::Invalidate {
            return true;
        }
        match &self.operation_types {
            None => true,
            Some(types) => types.contains(&op),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oplog::Position;
    use crate::resume_token::ResumeTokenData;

    fn event(kind: EventKind) -> ChangeEvent {
        let ts = Timestamp {
            time: 1,
            increment: 1,
        };
        ChangeEvent {
            id: ResumeTokenData::event(Position::at(ts), None, None).encode(),
            cluster_time: ts,
            wall_time: None,
            ns: Some(EventNamespace::collection(&Namespace::new("test", "coll"))),
            collection_uuid: None,
            lsid: None,
            txn_number: None,
            kind,
        }
    }

    #[test]
    fn test_insert_document_shape() {
        let doc = event(EventKind::Insert {
            document_key: doc! {"_id": 1},
            full_document: doc! {"_id": 1, "a": 1},
        })
        .to_document();
        assert_eq!(doc.get_str("operationType").unwrap(), "insert");
        assert_eq!(doc.get_document("ns").unwrap(), &doc! {"db": "test", "coll": "coll"});
        assert_eq!(doc.get_document("documentKey").unwrap(), &doc! {"_id": 1});
        assert_eq!(doc.get_document("fullDocument").unwrap(), &doc! {"_id": 1, "a": 1});
        assert!(doc.get_document("_id").unwrap().contains_key("_data"));
    }

    #[test]
    fn test_missing_images_are_omitted_not_null() {
        let doc = event(EventKind::Delete {
            document_key: doc! {"_id": 1},
            full_document: None,
            full_document_before_change: None,
        })
        .to_document();
        assert!(!doc.contains_key("fullDocument"));
        assert!(!doc.contains_key("fullDocumentBeforeChange"));
    }

    #[test]
    fn test_filter_always_keeps_invalidate() {
        let filter = EventFilter::new(Some(vec![OperationType::Insert]));
        assert!(filter.matches(&event(EventKind::Invalidate)));
        assert!(!filter.matches(&event(EventKind::Drop)));
        assert!(EventFilter::default().matches(&event(EventKind::Drop)));
    }

    #[test]
    fn test_operation_type_names() {
        for op in [
            OperationType::Insert,
            OperationType::DropDatabase,
            OperationType::CreateIndexes,
            OperationType::Invalidate,
        ] {
            assert_eq!(op.as_str().parse::<OperationType>().unwrap(), op);
        }
        assert!("upsert".parse::<OperationType>().is_err());
    }
}
