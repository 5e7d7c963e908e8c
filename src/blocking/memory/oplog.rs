use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bson::Timestamp;
use parking_lot::{Condvar, Mutex};
use tracing::info;

use crate::oplog::OplogEntry;
use crate::store::{CancelToken, OplogStore};
use crate::time_helper;
use crate::{FeedError, Result};

const WAIT_SLICE: Duration = Duration::from_millis(20);

/// Capped, append-only oplog kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryOplogStore {
    entries: Mutex<VecDeque<OplogEntry>>,
    appended: Condvar,
    capacity: Option<usize>,
    /// newest entry dropped from the head.
    truncated_through: Mutex<Option<Timestamp>>,
}

impl InMemoryOplogStore {
    /// An unbounded oplog.
    pub fn new() -> Self {
        InMemoryOplogStore::default()
    }

    /// An oplog keeping at most `capacity` entries, the oldest ones are dropped first.
    pub fn with_capacity(capacity: usize) -> Self {
        InMemoryOplogStore {
            capacity: Some(capacity.max(1)),
            ..Default::default()
        }
    }

    /// Append one entry.  Its timestamp must be newer than the newest entry.
    pub fn append(&self, entry: OplogEntry) -> Result<()> {
        let mut entries = self.entries.lock();
        if let Some(latest) = entries.back() {
            if time_helper::cmp(&entry.ts, &latest.ts) != std::cmp::Ordering::Greater {
                return Err(FeedError::OutOfOrderAppend {
                    appended: format!("{:?}", entry.ts),
                    latest: format!("{:?}", latest.ts),
                });
            }
        }
        entries.push_back(entry);
        if let Some(capacity) = self.capacity {
            while entries.len() > capacity {
                if let Some(dropped) = entries.pop_front() {
                    *self.truncated_through.lock() = Some(dropped.ts);
                }
            }
        }
        self.appended.notify_all();
        Ok(())
    }

    /// Drop entries older than `ts`, the way a capped oplog loses its head.
    pub fn truncate_before(&self, ts: Timestamp) -> usize {
        let mut entries = self.entries.lock();
        let cut = partition(&entries, ts);
        if let Some(last) = entries.drain(..cut).last() {
            *self.truncated_through.lock() = Some(last.ts);
        }
        if cut > 0 {
            info!(?ts, removed = cut, "Truncate oplog head.");
        }
        cut
    }

    /// Drop entries newer than `ts`, used by rollback.
    pub fn truncate_after(&self, ts: Timestamp) -> usize {
        let mut entries = self.entries.lock();
        let keep = partition(&entries, time_helper::next_timestamp(ts));
        let removed = entries.len() - keep;
        entries.truncate(keep);
        removed
    }

    /// number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Is the oplog empty?
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn read_locked(entries: &VecDeque<OplogEntry>, from: Timestamp, limit: usize) -> Vec<OplogEntry> {
        let start = partition(entries, from);
        entries.iter().skip(start).take(limit).cloned().collect()
    }
}

/// index of the first entry with `ts >= from`.
fn partition(entries: &VecDeque<OplogEntry>, from: Timestamp) -> usize {
    entries.partition_point(|e| time_helper::cmp(&e.ts, &from) == std::cmp::Ordering::Less)
}

impl OplogStore for InMemoryOplogStore {
    fn read(&self, from: Timestamp, limit: usize) -> Result<Vec<OplogEntry>> {
        Ok(Self::read_locked(&self.entries.lock(), from, limit))
    }

    fn read_await(
        &self,
        from: Timestamp,
        limit: usize,
        max_wait: Duration,
        cancel: &CancelToken,
    ) -> Result<Vec<OplogEntry>> {
        let deadline = Instant::now() + max_wait;
        let mut entries = self.entries.lock();
        loop {
            let found = Self::read_locked(&entries, from, limit);
            let now = Instant::now();
            if !found.is_empty() || cancel.is_cancelled() || now >= deadline {
                return Ok(found);
            }
            self.appended
                .wait_for(&mut entries, WAIT_SLICE.min(deadline - now));
        }
    }

    fn find_at(&self, ts: Timestamp) -> Result<Option<OplogEntry>> {
        let entries = self.entries.lock();
        let idx = partition(&entries, ts);
        Ok(entries.get(idx).filter(|e| e.ts == ts).cloned())
    }

    fn latest_position(&self) -> Result<Option<Timestamp>> {
        Ok(self.entries.lock().back().map(|e| e.ts))
    }

    fn earliest_position(&self) -> Result<Option<Timestamp>> {
        Ok(self.entries.lock().front().map(|e| e.ts))
    }

    fn retained_from(&self) -> Result<Option<Timestamp>> {
        Ok(self
            .truncated_through
            .lock()
            .map(time_helper::next_timestamp))
    }

    fn wake(&self) {
        self.appended.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::Namespace;
    use crate::oplog::OpType;
    use bson::doc;

    fn noop(time: u32) -> OplogEntry {
        OplogEntry::new(
            Timestamp { time, increment: 1 },
            OpType::Noop,
            Namespace::default(),
            None,
            doc! {},
        )
    }

    #[test]
    fn test_append_rejects_out_of_order() {
        let store = InMemoryOplogStore::new();
        store.append(noop(2)).unwrap();
        assert!(matches!(
            store.append(noop(2)),
            Err(FeedError::OutOfOrderAppend { .. })
        ));
        assert!(store.append(noop(1)).is_err());
    }

    #[test]
    fn test_read_from_inclusive_position() {
        let store = InMemoryOplogStore::new();
        for i in 1..=5 {
            store.append(noop(i)).unwrap();
        }
        let read = store.read(Timestamp { time: 3, increment: 1 }, 2).unwrap();
        let times: Vec<u32> = read.iter().map(|e| e.ts.time).collect();
        assert_eq!(times, vec![3, 4]);
    }

    #[test]
    fn test_capacity_and_truncation() {
        let store = InMemoryOplogStore::with_capacity(3);
        for i in 1..=5 {
            store.append(noop(i)).unwrap();
        }
        assert_eq!(store.earliest_position().unwrap().unwrap().time, 3);
        assert_eq!(
            store.retained_from().unwrap(),
            Some(Timestamp { time: 2, increment: 2 })
        );
        assert_eq!(store.truncate_after(Timestamp { time: 4, increment: 1 }), 1);
        assert_eq!(store.latest_position().unwrap().unwrap().time, 4);
        assert_eq!(store.truncate_before(Timestamp { time: 4, increment: 0 }), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.retained_from().unwrap(),
            Some(Timestamp { time: 3, increment: 2 })
        );
    }

    #[test]
    fn test_untruncated_oplog_is_complete() {
        let store = InMemoryOplogStore::new();
        assert_eq!(store.retained_from().unwrap(), None);
        store.append(noop(1)).unwrap();
        store.truncate_after(Timestamp { time: 0, increment: 0 });
        assert_eq!(store.retained_from().unwrap(), None);
    }

    #[test]
    fn test_read_await_times_out_empty() {
        let store = InMemoryOplogStore::new();
        let started = Instant::now();
        let read = store
            .read_await(
                Timestamp { time: 1, increment: 0 },
                10,
                Duration::from_millis(30),
                &CancelToken::new(),
            )
            .unwrap();
        assert!(read.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }
}
