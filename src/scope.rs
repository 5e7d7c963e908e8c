//! Decide which oplog entries a feed may see, and which DDL ends it.
use bson::Timestamp;
use uuid::Uuid;

use crate::cmd_oplog::CmdOplog;
use crate::namespace::Namespace;
use crate::oplog::{OpType, OplogEntry};
use crate::Result;

/// Breadth of a feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedScope {
    /// one collection.
    Collection(Namespace),
    /// every user collection of a database.
    Database(String),
    /// every user collection of every user database.
    Cluster,
}

impl FeedScope {
    /// database the scope is limited to, if any.
    pub fn db(&self) -> Option<&str> {
        match self {
            FeedScope::Collection(ns) => Some(&ns.db),
            FeedScope::Database(db) => Some(db),
            FeedScope::Cluster => None,
        }
    }
}

/// A destructive DDL pushed by the write path to every open cursor.
#[derive(Debug, Clone, PartialEq)]
pub enum NamespaceSignal {
    /// a collection was dropped at `at`.
    CollectionDropped {
        /// dropped namespace.
        ns: Namespace,
        /// its uuid.
        uuid: Option<Uuid>,
        /// oplog time of the drop.
        at: Timestamp,
    },
    /// a collection was renamed at `at`.
    CollectionRenamed {
        /// old name.
        from: Namespace,
        /// new name.
        to: Namespace,
        /// collection uuid.
        uuid: Option<Uuid>,
        /// oplog time of the rename.
        at: Timestamp,
    },
    /// a database was dropped at `at`.
    DatabaseDropped {
        /// dropped database.
        db: String,
        /// oplog time of the drop.
        at: Timestamp,
    },
}

impl NamespaceSignal {
    /// oplog time of the DDL.
    pub fn at(&self) -> Timestamp {
        match self {
            NamespaceSignal::CollectionDropped { at, .. }
            | NamespaceSignal::CollectionRenamed { at, .. }
            | NamespaceSignal::DatabaseDropped { at, .. } => *at,
        }
    }
}

/// Receiver of namespace signals, implemented by whoever owns the cursors.
pub trait DdlListener: Send + Sync {
    /// Called synchronously by the write path right after the DDL is logged.
    fn namespace_gone(&self, signal: NamespaceSignal);

    /// Called after a rollback removed every entry newer than `common_point`.
    fn rolled_back(&self, _common_point: Timestamp) {}
}

/// Per-cursor visibility rules.
#[derive(Debug, Clone)]
pub struct ScopeResolver {
    scope: FeedScope,
    target_uuid: Option<Uuid>,
}

impl ScopeResolver {
    /// Resolver for `scope`.  For a collection scope `target_uuid` pins the collection
    /// identity, so entries written before a rename still match.
    pub fn new(scope: FeedScope, target_uuid: Option<Uuid>) -> Self {
        ScopeResolver { scope, target_uuid }
    }

    /// The watched scope.
    pub fn scope(&self) -> &FeedScope {
        &self.scope
    }

    /// uuid a collection feed is bound to.
    pub fn target_uuid(&self) -> Option<Uuid> {
        self.target_uuid
    }

    /// Is `entry` in scope?  Transaction wrappers are never visible themselves, their
    /// operations are checked one by one after expansion.
    pub fn is_visible(&self, entry: &OplogEntry) -> bool {
        if entry.op == OpType::Noop {
            return false;
        }
        match self.affected_namespace(entry) {
            Some(ns) => self.matches(&ns, entry.uuid),
            None => false,
        }
    }

    /// Track the identity of the watched collection.  A collection feed opened before its
    /// collection exists adopts the uuid of the first matching write or create.
    pub fn observe(&mut self, entry: &OplogEntry) {
        if let FeedScope::Collection(ns) = &self.scope {
            if self.target_uuid.is_none() && entry.uuid.is_some() {
                if let Some(affected) = self.affected_namespace(entry) {
                    if &affected == ns {
                        self.target_uuid = entry.uuid;
                    }
                }
            }
        }
    }

    /// Does this already visible DDL entry end the feed?
    ///
    /// Collection feeds end on a drop or rename of the collection, or a drop of its database.
    /// Database feeds end on the drop of the database.  Cluster feeds never end.
    pub fn invalidated_by(&self, entry: &OplogEntry) -> Result<bool> {
        let cmd = match CmdOplog::from_entry(entry)? {
            Some(cmd) => cmd,
            None => return Ok(false),
        };
        let invalidates = match (&self.scope, cmd) {
            (FeedScope::Collection(_), CmdOplog::DropCollection(_)) => true,
            (FeedScope::Collection(ns), CmdOplog::RenameCollection { from, to, .. }) => {
                from.is(ns) || self.same_collection(entry.uuid, &from.to_namespace(), ns)
                    // renaming another collection over the watched one drops it.
                    || to.is(ns)
            }
            (FeedScope::Collection(_), CmdOplog::DropDatabase(_)) => true,
            (FeedScope::Database(_), CmdOplog::DropDatabase(_)) => true,
            _ => false,
        };
        Ok(invalidates)
    }

    /// Does a pushed DDL signal end the feed?
    pub fn signal_invalidates(&self, signal: &NamespaceSignal) -> bool {
        match (&self.scope, signal) {
            (FeedScope::Collection(ns), NamespaceSignal::CollectionDropped { ns: dropped, uuid, .. }) => {
                self.same_collection(*uuid, dropped, ns)
            }
            (
                FeedScope::Collection(ns),
                NamespaceSignal::CollectionRenamed { from, to, uuid, .. },
            ) => self.same_collection(*uuid, from, ns) || to == ns,
            (FeedScope::Collection(ns), NamespaceSignal::DatabaseDropped { db, .. }) => &ns.db == db,
            (FeedScope::Database(watched), NamespaceSignal::DatabaseDropped { db, .. }) => {
                watched == db
            }
            _ => false,
        }
    }

    fn same_collection(&self, uuid: Option<Uuid>, ns: &Namespace, watched: &Namespace) -> bool {
        match (self.target_uuid, uuid) {
            (Some(target), Some(uuid)) => target == uuid,
            _ => ns == watched,
        }
    }

    fn matches(&self, ns: &Namespace, uuid: Option<Uuid>) -> bool {
        match &self.scope {
            FeedScope::Collection(watched) => self.same_collection(uuid, ns, watched),
            FeedScope::Database(db) => {
                &ns.db == db && !ns.is_internal_db() && !ns.is_system_collection()
            }
            FeedScope::Cluster => !ns.is_internal_db() && !ns.is_system_collection(),
        }
    }

    /// Namespace an entry acts on.  For commands that is the collection in the command body;
    /// database wide commands use an empty collection name.
    fn affected_namespace(&self, entry: &OplogEntry) -> Option<Namespace> {
        if entry.op != OpType::Command {
            return Some(entry.ns.clone());
        }
        match CmdOplog::from_entry(entry) {
            Ok(Some(cmd)) => match cmd {
                CmdOplog::RenameCollection { from, to, .. } => {
                    let from = from.to_namespace();
                    // a rename is seen from both ends.
                    if self.matches(&from, entry.uuid) {
                        Some(from)
                    } else {
                        Some(to.to_namespace())
                    }
                }
                CmdOplog::DropCollection(ns)
                | CmdOplog::CreateCollection(ns)
                | CmdOplog::DropIndexes { ns, .. }
                | CmdOplog::CreateIndexes { ns, .. }
                | CmdOplog::CommitIndexBuild { ns, .. }
                | CmdOplog::CollMod { ns, .. } => Some(ns.to_namespace()),
                CmdOplog::DropDatabase(db) => match &self.scope {
                    FeedScope::Collection(watched) if watched.db == db => Some(watched.clone()),
                    FeedScope::Collection(_) => None,
                    _ if crate::namespace::is_internal_db(db) => None,
                    _ => Some(Namespace::new(db, "")),
                },
                CmdOplog::ApplyOps { .. }
                | CmdOplog::CommitTransaction { .. }
                | CmdOplog::AbortTransaction => None,
            },
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn ts() -> Timestamp {
        Timestamp {
            time: 1,
            increment: 1,
        }
    }

    fn insert(ns: &str, uuid: Option<Uuid>) -> OplogEntry {
        OplogEntry::new(
            ts(),
            OpType::Insert,
            Namespace::parse(ns).unwrap(),
            uuid,
            doc! {"_id": 1},
        )
    }

    fn command(db: &str, obj: bson::Document) -> OplogEntry {
        OplogEntry::new(ts(), OpType::Command, Namespace::command(db), None, obj)
    }

    #[test]
    fn test_cluster_scope_excludes_internal_names_exactly() {
        let resolver = ScopeResolver::new(FeedScope::Cluster, None);
        assert!(resolver.is_visible(&insert("admin1.coll", None)));
        assert!(resolver.is_visible(&insert("test.system", None)));
        assert!(!resolver.is_visible(&insert("admin.coll", None)));
        assert!(!resolver.is_visible(&insert("local.oplog.rs", None)));
        assert!(!resolver.is_visible(&insert("config.system.sessions", None)));
        assert!(!resolver.is_visible(&insert("test.system.views", None)));
        assert!(!resolver.is_visible(&command("admin", doc! {"drop": "coll"})));
        assert!(!resolver.is_visible(&command("config", doc! {"dropDatabase": 1})));
    }

    #[test]
    fn test_database_scope() {
        let resolver = ScopeResolver::new(FeedScope::Database("test".into()), None);
        assert!(resolver.is_visible(&insert("test.a", None)));
        assert!(!resolver.is_visible(&insert("test1.a", None)));
        assert!(resolver.is_visible(&command("test", doc! {"drop": "a"})));
        assert!(resolver.is_visible(&command("test", doc! {"dropDatabase": 1})));
        assert!(!resolver.is_visible(&command("other", doc! {"dropDatabase": 1})));
    }

    #[test]
    fn test_collection_scope_follows_uuid_across_rename() {
        let uuid = Uuid::new_v4();
        let resolver = ScopeResolver::new(
            FeedScope::Collection(Namespace::new("test", "a")),
            Some(uuid),
        );
        assert!(resolver.is_visible(&insert("test.renamed", Some(uuid))));
        assert!(!resolver.is_visible(&insert("test.a", Some(Uuid::new_v4()))));
        // entries without a uuid fall back to name matching.
        assert!(resolver.is_visible(&insert("test.a", None)));
    }

    #[test]
    fn test_collection_scope_adopts_uuid_of_first_write() {
        let uuid = Uuid::new_v4();
        let mut resolver =
            ScopeResolver::new(FeedScope::Collection(Namespace::new("test", "a")), None);
        resolver.observe(&insert("test.b", Some(Uuid::new_v4())));
        assert_eq!(resolver.target_uuid(), None);
        resolver.observe(&insert("test.a", Some(uuid)));
        assert_eq!(resolver.target_uuid(), Some(uuid));
    }

    #[test]
    fn test_invalidation_rules() {
        let coll = ScopeResolver::new(FeedScope::Collection(Namespace::new("test", "a")), None);
        let db = ScopeResolver::new(FeedScope::Database("test".into()), None);
        let cluster = ScopeResolver::new(FeedScope::Cluster, None);

        let drop = command("test", doc! {"drop": "a"});
        let rename = command("test", doc! {"renameCollection": "test.a", "to": "test.b"});
        let drop_db = command("test", doc! {"dropDatabase": 1});

        assert!(coll.invalidated_by(&drop).unwrap());
        assert!(coll.invalidated_by(&rename).unwrap());
        assert!(coll.invalidated_by(&drop_db).unwrap());
        assert!(!db.invalidated_by(&drop).unwrap());
        assert!(!db.invalidated_by(&rename).unwrap());
        assert!(db.invalidated_by(&drop_db).unwrap());
        assert!(!cluster.invalidated_by(&drop_db).unwrap());
    }

    #[test]
    fn test_signal_rules() {
        let coll = ScopeResolver::new(FeedScope::Collection(Namespace::new("test", "a")), None);
        let dropped_other = NamespaceSignal::CollectionDropped {
            ns: Namespace::new("test", "b"),
            uuid: None,
            at: ts(),
        };
        let dropped_db = NamespaceSignal::DatabaseDropped {
            db: "test".into(),
            at: ts(),
        };
        assert!(!coll.signal_invalidates(&dropped_other));
        assert!(coll.signal_invalidates(&dropped_db));
        assert!(!ScopeResolver::new(FeedScope::Cluster, None).signal_invalidates(&dropped_db));
    }
}
