use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bson::Timestamp;
use crossbeam::channel::Sender;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{info, warn};

use super::cursor::{ChangeFeedCursor, CursorMessage};
use crate::scope::{DdlListener, NamespaceSignal};
use crate::store::CancelToken;
use crate::time_helper;
use crate::{FeedError, Result};

/// Opaque id of an open cursor.  `0` means the cursor is exhausted.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CursorId(pub u64);

impl CursorId {
    /// Id returned once a cursor has nothing more to deliver.
    pub const EXHAUSTED: CursorId = CursorId(0);

    /// Is this the exhausted id?
    pub fn is_exhausted(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for CursorId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for CursorId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CursorId({})", self.0)
    }
}

/// A registered cursor plus what other threads may touch without locking it.
pub(crate) struct CursorHandle {
    pub(crate) id: CursorId,
    pub(crate) cursor: Mutex<ChangeFeedCursor>,
    pub(crate) cancel: CancelToken,
    inbox: Sender<CursorMessage>,
    last_used: Mutex<Instant>,
    /// packed scan position, see [time_helper::pack].
    watermark: AtomicU64,
    wants_pre_images: bool,
}

impl CursorHandle {
    /// Record a pull that ended with the cursor scanning from `scan_from`.
    pub(crate) fn touch(&self, scan_from: Timestamp) {
        *self.last_used.lock() = Instant::now();
        self.watermark
            .store(time_helper::pack(scan_from), Ordering::SeqCst);
    }

    fn scan_from(&self) -> Timestamp {
        time_helper::unpack(self.watermark.load(Ordering::SeqCst))
    }
}

/// Every live cursor of a service, reachable by id from any thread.
#[derive(Default)]
pub struct CursorRegistry {
    cursors: DashMap<CursorId, Arc<CursorHandle>>,
    next_id: AtomicU64,
    /// shared by opens until their cursor is registered, exclusive for a reclamation pass.
    opening: RwLock<()>,
}

impl CursorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        CursorRegistry::default()
    }

    /// Allocate a fresh, never exhausted, cursor id.
    pub fn next_id(&self) -> CursorId {
        CursorId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub(crate) fn register(
        &self,
        cursor: ChangeFeedCursor,
        inbox: Sender<CursorMessage>,
    ) -> Arc<CursorHandle> {
        let id = cursor.id();
        let handle = Arc::new(CursorHandle {
            id,
            cancel: cursor.cancel_token(),
            wants_pre_images: cursor.wants_pre_images(),
            watermark: AtomicU64::new(time_helper::pack(cursor.scan_from())),
            cursor: Mutex::new(cursor),
            inbox,
            last_used: Mutex::new(Instant::now()),
        });
        self.cursors.insert(id, handle.clone());
        handle
    }

    /// Held while a cursor resolves its start and registers, its watermark isn't visible yet.
    pub(crate) fn open_guard(&self) -> RwLockReadGuard<'_, ()> {
        self.opening.read()
    }

    /// Held across a reclamation pass, waits for opens in flight.
    pub(crate) fn reclaim_guard(&self) -> RwLockWriteGuard<'_, ()> {
        self.opening.write()
    }

    pub(crate) fn get(&self, id: CursorId) -> Result<Arc<CursorHandle>> {
        self.cursors
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(FeedError::CursorNotFound(id))
    }

    pub(crate) fn remove(&self, id: CursorId) -> Option<Arc<CursorHandle>> {
        self.cursors.remove(&id).map(|(_, handle)| handle)
    }

    /// number of live cursors.
    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    /// Is there no live cursor?
    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }

    /// Push a DDL signal into every cursor inbox.
    pub fn broadcast(&self, signal: &NamespaceSignal) {
        for entry in self.cursors.iter() {
            // the receiver lives as long as the cursor, a failed send means it is going away.
            let _ = entry
                .value()
                .inbox
                .send(CursorMessage::Namespace(signal.clone()));
        }
    }

    /// Kill cursors not pulled for `timeout`.  Cursors serving a pull right now are skipped.
    pub fn reap_idle(&self, timeout: Duration) -> Vec<CursorId> {
        let idle: Vec<CursorId> = self
            .cursors
            .iter()
            .filter(|entry| {
                let handle = entry.value();
                handle.last_used.lock().elapsed() >= timeout && !handle.cursor.is_locked()
            })
            .map(|entry| *entry.key())
            .collect();
        for id in idle.iter() {
            if let Some(handle) = self.remove(*id) {
                handle.cancel.cancel();
                info!(cursor_id = %id, ?timeout, "Reap idle cursor.");
            }
        }
        idle
    }

    /// Oldest scan position among cursors asking for pre-images, the pre-images they may still
    /// read start there.
    pub fn pre_image_watermark(&self) -> Option<Timestamp> {
        self.cursors
            .iter()
            .filter(|entry| entry.value().wants_pre_images)
            .map(|entry| entry.value().watermark.load(Ordering::SeqCst))
            .min()
            .map(time_helper::unpack)
    }
}

impl DdlListener for CursorRegistry {
    fn namespace_gone(&self, signal: NamespaceSignal) {
        self.broadcast(&signal);
    }

    fn rolled_back(&self, common_point: Timestamp) {
        let first_lost = time_helper::next_timestamp(common_point);
        let stale: Vec<CursorId> = self
            .cursors
            .iter()
            .filter(|entry| {
                time_helper::cmp(&entry.value().scan_from(), &first_lost)
                    == std::cmp::Ordering::Greater
            })
            .map(|entry| *entry.key())
            .collect();
        for id in stale {
            if let Some(handle) = self.remove(id) {
                handle.cancel.cancel();
                warn!(cursor_id = %id, ?common_point, "Kill cursor which read rolled back entries.");
            }
        }
        // survivors drop whatever they learnt from the lost entries.
        for entry in self.cursors.iter() {
            let _ = entry
                .value()
                .inbox
                .send(CursorMessage::RolledBack(common_point));
        }
    }
}
