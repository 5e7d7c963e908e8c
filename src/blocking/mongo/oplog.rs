use bson::{doc, Document, Timestamp};
use mongodb::options::{FindOneOptions, FindOptions};
use mongodb::sync::{Client, Collection};
use tracing::trace;

use crate::oplog::OplogEntry;
use crate::store::OplogStore;
use crate::{Result, OPLOG_COLL, OPLOG_DB, TIMESTAMP_KEY};

enum Natural {
    Earliest,
    Latest,
}

/// `local.oplog.rs` of a replica set member.
#[derive(Debug, Clone)]
pub struct MongoOplogStore {
    coll: Collection<Document>,
}

impl MongoOplogStore {
    /// Read the oplog through `client`.
    pub fn new(client: &Client) -> Self {
        MongoOplogStore {
            coll: client.database(OPLOG_DB).collection(OPLOG_COLL),
        }
    }

    /// Connect to `uri`, which needs to point at a replica set member.
    pub fn connect(uri: &str) -> Result<Self> {
        let client = Client::with_uri_str(uri)?;
        Ok(MongoOplogStore::new(&client))
    }

    fn get_one_oplog_ts(&self, natural: Natural) -> Result<Option<Timestamp>> {
        let sorted_doc = match natural {
            Natural::Earliest => doc! {"$natural": 1},
            Natural::Latest => doc! {"$natural": -1},
        };
        match self
            .coll
            .find_one(None, FindOneOptions::builder().sort(sorted_doc).build())?
        {
            Some(d) => Ok(Some(d.get_timestamp(TIMESTAMP_KEY)?)),
            None => Ok(None),
        }
    }
}

impl OplogStore for MongoOplogStore {
    fn read(&self, from: Timestamp, limit: usize) -> Result<Vec<OplogEntry>> {
        let cursor = self.coll.find(
            doc! {TIMESTAMP_KEY: {"$gte": from}},
            FindOptions::builder()
                .sort(doc! {"$natural": 1})
                .limit(limit as i64)
                .build(),
        )?;
        let mut entries = Vec::with_capacity(limit.min(1024));
        for doc in cursor {
            entries.push(OplogEntry::from_doc(&doc?)?);
        }
        trace!(?from, read = entries.len(), "Read oplog.");
        Ok(entries)
    }

    fn find_at(&self, ts: Timestamp) -> Result<Option<OplogEntry>> {
        match self.coll.find_one(doc! {TIMESTAMP_KEY: ts}, None)? {
            Some(doc) => Ok(Some(OplogEntry::from_doc(&doc)?)),
            None => Ok(None),
        }
    }

    fn latest_position(&self) -> Result<Option<Timestamp>> {
        self.get_one_oplog_ts(Natural::Latest)
    }

    fn earliest_position(&self) -> Result<Option<Timestamp>> {
        self.get_one_oplog_ts(Natural::Earliest)
    }
}
