//! Narrow interfaces of the collaborators the feed reads from.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bson::{Document, Timestamp};
use uuid::Uuid;

use crate::namespace::Namespace;
use crate::oplog::OplogEntry;
use crate::Result;

/// Poll interval of the default [OplogStore::read_await].
const AWAIT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Shared flag telling a blocked read to give up.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A fresh, not cancelled token.
    pub fn new() -> Self {
        CancelToken::default()
    }

    /// Cancel every holder of this token.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Has the token been cancelled?
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Read side of the replicated oplog.
///
/// Implementations must return entries in timestamp order and never hand out an entry whose
/// pre-image (if recorded) is not yet readable.
pub trait OplogStore: Send + Sync {
    /// Entries with `ts >= from`, at most `limit` of them.
    fn read(&self, from: Timestamp, limit: usize) -> Result<Vec<OplogEntry>>;

    /// Like [read](OplogStore::read), but waits up to `max_wait` for at least one entry.
    ///
    /// Returns an empty vector on timeout or when `cancel` fires.
    fn read_await(
        &self,
        from: Timestamp,
        limit: usize,
        max_wait: Duration,
        cancel: &CancelToken,
    ) -> Result<Vec<OplogEntry>> {
        let deadline = Instant::now() + max_wait;
        loop {
            let entries = self.read(from, limit)?;
            if !entries.is_empty() || cancel.is_cancelled() || Instant::now() >= deadline {
                return Ok(entries);
            }
            std::thread::sleep(AWAIT_POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now())));
        }
    }

    /// The entry written exactly at `ts`.
    fn find_at(&self, ts: Timestamp) -> Result<Option<OplogEntry>>;

    /// Timestamp of the newest entry.
    fn latest_position(&self) -> Result<Option<Timestamp>>;

    /// Timestamp of the oldest entry still retained.
    fn earliest_position(&self) -> Result<Option<Timestamp>>;

    /// Every entry logged at or after this timestamp is still retained.  `None` when the
    /// oplog never lost its head.
    ///
    /// Defaults to the oldest retained entry, which can't tell a truncated head from a young
    /// oplog.
    fn retained_from(&self) -> Result<Option<Timestamp>> {
        self.earliest_position()
    }

    /// Wake up readers blocked in [read_await](OplogStore::read_await).
    fn wake(&self) {}
}

/// Collection metadata, used to pin a collection feed on a uuid and to resolve views.
pub trait Catalog: Send + Sync {
    /// uuid of an existing collection.
    fn collection_uuid(&self, ns: &Namespace) -> Result<Option<Uuid>>;

    /// The namespace a view is defined on, `None` when `ns` is not a view.
    fn view_source(&self, ns: &Namespace) -> Result<Option<Namespace>>;
}

/// Current state of documents, used for post-image lookups.
pub trait DocumentLookup: Send + Sync {
    /// The document of `ns` matching `key`, if it still exists.
    fn find_by_key(&self, ns: &Namespace, key: &Document) -> Result<Option<Document>>;
}
