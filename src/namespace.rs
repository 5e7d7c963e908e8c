//! Namespaces and the reserved names the feed never reports in wide scopes.
use std::fmt;

use crate::{FeedError, Result};
use crate::{ADMIN_DB_NAME, COMMAND_COLL, CONFIG_DB_NAME, OPLOG_DB, SYSTEM_COLL_PREFIX};

/// Databases owned by the server itself.
pub const INTERNAL_DBS: [&str; 3] = [ADMIN_DB_NAME, CONFIG_DB_NAME, OPLOG_DB];

/// A `db.collection` pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Namespace {
    /// database name.
    pub db: String,
    /// collection name, `$cmd` for command oplogs.
    pub coll: String,
}

impl Namespace {
    /// construct a namespace from `db` and `coll`.
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Namespace {
            db: db.into(),
            coll: coll.into(),
        }
    }

    /// Parse `db.coll`.  Only the first `.` separates database and collection.
    pub fn parse(ns: &str) -> Result<Self> {
        match ns.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Namespace::new(db, coll)),
            _ => Err(FeedError::InvalidNamespace(ns.to_string())),
        }
    }

    /// Namespace command oplogs of `db` are written to.
    pub fn command(db: impl Into<String>) -> Self {
        Namespace::new(db, COMMAND_COLL)
    }

    /// Is this `db.$cmd`?
    pub fn is_command(&self) -> bool {
        self.coll == COMMAND_COLL
    }

    /// Is the database one of `admin`, `config`, `local`?
    pub fn is_internal_db(&self) -> bool {
        is_internal_db(&self.db)
    }

    /// Is the collection reserved, that is named `system.<something>`?
    pub fn is_system_collection(&self) -> bool {
        is_system_collection(&self.coll)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

/// Exact match against the internal database names.
///
/// `admin1` or `Admin` are user databases.
pub fn is_internal_db(db: &str) -> bool {
    INTERNAL_DBS.contains(&db)
}

/// Prefix match on `system.`, so a collection literally named `system` is a user collection.
pub fn is_system_collection(coll: &str) -> bool {
    coll.starts_with(SYSTEM_COLL_PREFIX)
}
