use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bson::Timestamp;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::cursor::{ChangeFeedCursor, CursorSettings, CursorState};
use super::memory::MemoryNode;
use super::reclaimer::PreImageReclaimer;
use super::registry::{CursorHandle, CursorId, CursorRegistry};
use super::replication::ReplicationState;
use crate::config::FeedConfig;
use crate::event::{ChangeEvent, EventFilter, OperationType};
use crate::namespace::{self, Namespace};
use crate::pre_image::PreImageStore;
use crate::resume_token::{ResumeToken, ResumeTokenData};
use crate::scope::{FeedScope, ScopeResolver};
use crate::store::{Catalog, DocumentLookup, OplogStore};
use crate::time_helper;
use crate::translator::{EventTranslator, TranslateOptions};
use crate::{FeedError, Result};

/// Views may be defined on views, but not endlessly.
const MAX_VIEW_DEPTH: usize = 16;

/// Where a new feed starts.
#[derive(Debug, Clone, PartialEq)]
pub enum StartAt {
    /// after the newest majority committed entry.
    Now,
    /// right after the event of the token.  Invalidate tokens are refused.
    ResumeAfter(ResumeToken),
    /// like `ResumeAfter`, but an invalidate token starts a new stream past the invalidation.
    StartAfter(ResumeToken),
    /// at the first entry at or after the timestamp.
    AtClusterTime(Timestamp),
}

/// Request to open a change feed.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    scope: FeedScope,
    start_at: StartAt,
    want_pre_images: bool,
    want_post_images: bool,
    show_expanded_events: bool,
    collation: Option<String>,
    operation_types: Option<Vec<OperationType>>,
    batch_size: Option<usize>,
    max_await: Option<Duration>,
}

impl OpenRequest {
    /// Watch a feed of `scope`, starting now.
    pub fn new(scope: FeedScope) -> Self {
        OpenRequest {
            scope,
            start_at: StartAt::Now,
            want_pre_images: false,
            want_post_images: false,
            show_expanded_events: false,
            collation: None,
            operation_types: None,
            batch_size: None,
            max_await: None,
        }
    }

    /// Watch one collection.
    pub fn collection(db: &str, coll: &str) -> Self {
        OpenRequest::new(FeedScope::Collection(Namespace::new(db, coll)))
    }

    /// Watch every user collection of `db`.
    pub fn database(db: &str) -> Self {
        OpenRequest::new(FeedScope::Database(db.to_string()))
    }

    /// Watch every user database.
    pub fn cluster() -> Self {
        OpenRequest::new(FeedScope::Cluster)
    }

    /// Resume after the event of `token`.
    pub fn resume_after(mut self, token: ResumeToken) -> Self {
        self.start_at = StartAt::ResumeAfter(token);
        self
    }

    /// Start after `token`, which may be an invalidate.
    pub fn start_after(mut self, token: ResumeToken) -> Self {
        self.start_at = StartAt::StartAfter(token);
        self
    }

    /// Start at the cluster time `ts`.
    pub fn start_at_operation_time(mut self, ts: Timestamp) -> Self {
        self.start_at = StartAt::AtClusterTime(ts);
        self
    }

    /// Attach recorded pre-images to updates, replaces and deletes.
    pub fn with_pre_images(mut self) -> Self {
        self.want_pre_images = true;
        self
    }

    /// Look up the current document for updates.
    pub fn with_post_images(mut self) -> Self {
        self.want_post_images = true;
        self
    }

    /// Report index builds, index drops, collMod and create options.
    pub fn with_expanded_events(mut self) -> Self {
        self.show_expanded_events = true;
        self
    }

    /// Explicit collation.  Lets a collection feed resume on a collection which has since
    /// been dropped or recreated.
    pub fn with_collation(mut self, collation: &str) -> Self {
        self.collation = Some(collation.to_string());
        self
    }

    /// Deliver only these operation types, invalidate is always delivered.
    pub fn with_operation_types(mut self, types: Vec<OperationType>) -> Self {
        self.operation_types = Some(types);
        self
    }

    /// Batch size of the first batch.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Bounded wait of empty pulls.
    pub fn with_max_await(mut self, max_await: Duration) -> Self {
        self.max_await = Some(max_await);
        self
    }

    /// requested scope.
    pub fn scope(&self) -> &FeedScope {
        &self.scope
    }
}

/// Response of an open or a pull.
#[derive(Debug, Clone)]
pub struct FeedBatch {
    /// cursor to pull from next, [CursorId::EXHAUSTED] once the feed ended.
    pub cursor_id: CursorId,
    /// events in delivery order.
    pub events: Vec<ChangeEvent>,
    /// resume after everything the feed has handled so far.
    pub post_batch_resume_token: ResumeToken,
}

impl FeedBatch {
    /// Did the feed end with this batch?
    pub fn is_exhausted(&self) -> bool {
        self.cursor_id.is_exhausted()
    }
}

/// Opens, serves and kills change feed cursors of one node.
pub struct ChangeFeedService {
    store: Arc<dyn OplogStore>,
    catalog: Arc<dyn Catalog>,
    lookup: Arc<dyn DocumentLookup>,
    pre_images: Arc<PreImageStore>,
    replication: Option<Arc<ReplicationState>>,
    registry: Arc<CursorRegistry>,
    config: FeedConfig,
}

impl ChangeFeedService {
    /// A service reading `store`, without replication awareness.
    pub fn new(
        store: Arc<dyn OplogStore>,
        catalog: Arc<dyn Catalog>,
        lookup: Arc<dyn DocumentLookup>,
        pre_images: Arc<PreImageStore>,
        config: FeedConfig,
    ) -> Self {
        ChangeFeedService {
            store,
            catalog,
            lookup,
            pre_images,
            replication: None,
            registry: Arc::new(CursorRegistry::new()),
            config,
        }
    }

    /// Only serve majority committed entries of `replication`, and guard reads after an
    /// election.
    pub fn with_replication(mut self, replication: Arc<ReplicationState>) -> Self {
        self.replication = Some(replication);
        self
    }

    /// A service over an in-memory node, subscribed to its DDL and rollback notifications.
    pub fn for_node(node: &MemoryNode, config: FeedConfig) -> Self {
        let catalog = node.catalog();
        let service = ChangeFeedService::new(
            node.oplog(),
            catalog.clone(),
            catalog,
            node.pre_images(),
            config,
        )
        .with_replication(node.replication());
        node.subscribe(service.registry.clone());
        service
    }

    /// the live cursors.
    pub fn registry(&self) -> Arc<CursorRegistry> {
        self.registry.clone()
    }

    /// the configuration.
    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    /// Open a feed and return its first batch.
    ///
    /// The first batch never waits.  Watching a collection which doesn't exist yet is fine,
    /// the feed picks it up once created.
    pub fn open(&self, request: OpenRequest) -> Result<FeedBatch> {
        let opening = self.registry.open_guard();
        let scope = self.resolve_scope(&request.scope)?;
        let current_uuid = match &scope {
            FeedScope::Collection(ns) => self.catalog.collection_uuid(ns)?,
            _ => None,
        };
        let (scan_from, token, target_uuid) = self.start_position(
            &request.start_at,
            &scope,
            current_uuid,
            request.collation.is_some(),
        )?;

        let id = self.registry.next_id();
        let (inbox_tx, inbox_rx) = channel::unbounded();
        let translator = EventTranslator::new(
            self.pre_images.clone(),
            self.lookup.clone(),
            TranslateOptions {
                want_pre_images: request.want_pre_images,
                want_post_images: request.want_post_images,
                show_expanded_events: request.show_expanded_events,
            },
        );
        let settings = CursorSettings {
            max_read_retries: self.config.get_max_read_retries(),
            retry_backoff: self.config.get_retry_backoff(),
            read_chunk: self.config.get_read_chunk(),
            max_await: request
                .max_await
                .unwrap_or_else(|| self.config.get_max_await()),
        };
        let mut cursor = ChangeFeedCursor::new(
            id,
            ScopeResolver::new(scope.clone(), target_uuid),
            translator,
            EventFilter::new(request.operation_types.clone()),
            self.store.clone(),
            self.replication.clone(),
            inbox_rx,
            settings,
        );
        cursor.start(scan_from, token);
        let handle = self.registry.register(cursor, inbox_tx);
        drop(opening);
        info!(cursor_id = %id, ?scope, start_at = ?request.start_at, ?scan_from, "Open change feed.");

        let batch_size = request
            .batch_size
            .unwrap_or_else(|| self.config.get_default_batch_size());
        self.pull(&handle, batch_size, Some(Duration::ZERO))
    }

    /// Pull the next batch of an open cursor.
    ///
    /// Fails with [FeedError::CursorInUse] while another thread pulls the same cursor.
    pub fn get_more(&self, id: CursorId, batch_size: Option<usize>) -> Result<FeedBatch> {
        let handle = self.registry.get(id)?;
        let batch_size = batch_size.unwrap_or_else(|| self.config.get_default_batch_size());
        self.pull(&handle, batch_size, None)
    }

    /// Kill a cursor.  Killing an unknown or already closed cursor is not an error.
    pub fn kill_cursor(&self, id: CursorId) -> Result<()> {
        if let Some(handle) = self.registry.remove(id) {
            handle.cancel.cancel();
            self.store.wake();
            info!(cursor_id = %id, "Kill cursor.");
        }
        Ok(())
    }

    /// Kill cursors idle for longer than the configured timeout.
    pub fn reap_idle_cursors(&self) -> usize {
        let reaped = self.registry.reap_idle(self.config.get_idle_timeout());
        if !reaped.is_empty() {
            self.store.wake();
        }
        reaped.len()
    }

    /// Run one pre-image reclamation pass.
    pub fn reclaim_pre_images(&self) -> usize {
        self.reclaimer().run_once()
    }

    /// Reclaimer bound to this service's pre-images and cursors.
    pub fn reclaimer(&self) -> PreImageReclaimer {
        PreImageReclaimer::new(
            self.pre_images.clone(),
            self.registry.clone(),
            self.config.get_pre_image_expiry(),
        )
    }

    /// Start the idle reaper and the pre-image reclaimer threads.
    pub fn spawn_maintenance(&self) -> Result<MaintenanceHandle> {
        let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(0);
        let mut threads = vec![];

        let registry = self.registry.clone();
        let store = self.store.clone();
        let idle_timeout = self.config.get_idle_timeout();
        let reap_every = (idle_timeout / 2).max(Duration::from_millis(10));
        threads.push(spawn_periodic(
            "feed-reaper",
            shutdown_rx.clone(),
            reap_every,
            move || {
                if !registry.reap_idle(idle_timeout).is_empty() {
                    store.wake();
                }
            },
        )?);

        let reclaimer = self.reclaimer();
        threads.push(spawn_periodic(
            "pre-image-reclaimer",
            shutdown_rx,
            self.config.get_reclaim_interval(),
            move || {
                reclaimer.run_once();
            },
        )?);

        info!("Maintenance threads started.");
        Ok(MaintenanceHandle {
            shutdown: Some(shutdown_tx),
            threads,
        })
    }

    fn pull(
        &self,
        handle: &Arc<CursorHandle>,
        batch_size: usize,
        max_await: Option<Duration>,
    ) -> Result<FeedBatch> {
        let id = handle.id;
        let mut cursor = handle
            .cursor
            .try_lock()
            .ok_or(FeedError::CursorInUse(id))?;
        let max_await = max_await.unwrap_or_else(|| cursor.max_await());
        let result = cursor.next_batch(batch_size, max_await);
        handle.touch(cursor.scan_from());
        let exhausted = cursor.state() == CursorState::Invalidated;
        let token = cursor.resume_token().clone();
        drop(cursor);

        match result {
            Ok(events) => {
                debug!(cursor_id = %id, events = events.len(), %token, "Batch served.");
                let cursor_id = if exhausted {
                    self.registry.remove(id);
                    info!(cursor_id = %id, "Cursor exhausted.");
                    CursorId::EXHAUSTED
                } else {
                    id
                };
                Ok(FeedBatch {
                    cursor_id,
                    events,
                    post_batch_resume_token: token,
                })
            }
            Err(e) => {
                if !e.is_retryable() {
                    self.registry.remove(id);
                    warn!(cursor_id = %id, error = %e, "Cursor closed by error.");
                }
                Err(e)
            }
        }
    }

    fn resolve_scope(&self, scope: &FeedScope) -> Result<FeedScope> {
        match scope {
            FeedScope::Collection(ns) => {
                if ns.db.is_empty() || ns.coll.is_empty() {
                    return Err(FeedError::InvalidNamespace(ns.to_string()));
                }
                if ns.is_internal_db() || ns.is_system_collection() {
                    return Err(FeedError::InvalidRequest(format!(
                        "can't watch internal namespace {}",
                        ns
                    )));
                }
                let mut resolved = ns.clone();
                for _ in 0..MAX_VIEW_DEPTH {
                    match self.catalog.view_source(&resolved)? {
                        Some(source) => {
                            debug!(view = %resolved, %source, "Resolve view.");
                            resolved = source;
                        }
                        None => return Ok(FeedScope::Collection(resolved)),
                    }
                }
                Err(FeedError::InvalidRequest(format!(
                    "view {} is nested too deep",
                    ns
                )))
            }
            FeedScope::Database(db) => {
                if db.is_empty() {
                    return Err(FeedError::InvalidNamespace(db.clone()));
                }
                if namespace::is_internal_db(db) {
                    return Err(FeedError::InvalidRequest(format!(
                        "can't watch internal database {}",
                        db
                    )));
                }
                Ok(scope.clone())
            }
            FeedScope::Cluster => Ok(FeedScope::Cluster),
        }
    }

    /// Resolve the start of a feed into the first timestamp to scan, the initial resume token
    /// and the collection uuid a collection feed is bound to.
    fn start_position(
        &self,
        start_at: &StartAt,
        scope: &FeedScope,
        current_uuid: Option<Uuid>,
        collation_override: bool,
    ) -> Result<(Timestamp, ResumeToken, Option<Uuid>)> {
        let token = match start_at {
            StartAt::Now => {
                let from = match self.newest_readable()? {
                    Some(ts) => time_helper::next_timestamp(ts),
                    None => Timestamp {
                        time: 0,
                        increment: 0,
                    },
                };
                return Ok((from, high_water_mark(from), current_uuid));
            }
            StartAt::AtClusterTime(ts) => {
                self.ensure_history_from(*ts, &format!("{:?}", ts))?;
                return Ok((*ts, high_water_mark(*ts), current_uuid));
            }
            StartAt::ResumeAfter(token) | StartAt::StartAfter(token) => token,
        };

        let data = token.decode()?;
        if data.from_invalidate && matches!(start_at, StartAt::ResumeAfter(_)) {
            return Err(FeedError::InvalidRequest(
                "can't resume after an invalidate, use startAfter".to_string(),
            ));
        }
        let ts = data.cluster_time;
        self.ensure_history_from(ts, token.as_str())?;
        if !data.is_high_water_mark() && self.store.find_at(ts)?.is_none() {
            return Err(not_found(token, "the event is no longer in the oplog"));
        }

        if data.from_invalidate {
            // a new stream past the invalidation, following whatever has the name now.
            let from = time_helper::next_timestamp(ts);
            return Ok((from, high_water_mark(from), current_uuid));
        }

        let mut target_uuid = current_uuid;
        if let (FeedScope::Collection(ns), Some(token_uuid)) = (scope, data.uuid) {
            if current_uuid != Some(token_uuid) && !collation_override {
                return Err(not_found(
                    token,
                    &format!(
                        "collection {} was dropped or recreated, an explicit collation is required",
                        ns
                    ),
                ));
            }
            target_uuid = Some(token_uuid);
        }
        Ok((ts, token.clone(), target_uuid))
    }

    /// Newest entry a feed may read: the majority commit point when replication is attached.
    fn newest_readable(&self) -> Result<Option<Timestamp>> {
        let latest = self.store.latest_position()?;
        let replication = match &self.replication {
            Some(replication) => replication,
            None => return Ok(latest),
        };
        Ok(match (latest, replication.majority_commit_point()) {
            (Some(latest), Some(commit))
                if time_helper::cmp(&commit, &latest) == std::cmp::Ordering::Less =>
            {
                Some(commit)
            }
            (latest, Some(_)) => latest,
            (_, None) => None,
        })
    }

    fn ensure_history_from(&self, ts: Timestamp, what: &str) -> Result<()> {
        match self.store.earliest_position()? {
            Some(earliest)
                if time_helper::cmp(&ts, &earliest) != std::cmp::Ordering::Less =>
            {
                Ok(())
            }
            Some(earliest) => Err(FeedError::ResumeTokenNotFound {
                token: what.to_string(),
                reason: format!("oplog history starts at {:?}", earliest),
            }),
            None => Err(FeedError::ResumeTokenNotFound {
                token: what.to_string(),
                reason: "the oplog is empty".to_string(),
            }),
        }
    }
}

fn high_water_mark(ts: Timestamp) -> ResumeToken {
    ResumeTokenData::high_water_mark(ts).encode()
}

fn not_found(token: &ResumeToken, reason: &str) -> FeedError {
    FeedError::ResumeTokenNotFound {
        token: token.to_string(),
        reason: reason.to_string(),
    }
}

fn spawn_periodic<F>(
    name: &str,
    shutdown: Receiver<()>,
    every: Duration,
    mut work: F,
) -> Result<JoinHandle<()>>
where
    F: FnMut() + Send + 'static,
{
    let thread_name = name.to_string();
    let handle = thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || loop {
            match shutdown.recv_timeout(every) {
                Err(RecvTimeoutError::Timeout) => work(),
                _ => {
                    debug!(thread = %thread_name, "Maintenance thread stopped.");
                    return;
                }
            }
        })?;
    Ok(handle)
}

/// Owner of the maintenance threads, stops them when shut down or dropped.
pub struct MaintenanceHandle {
    shutdown: Option<Sender<()>>,
    threads: Vec<JoinHandle<()>>,
}

impl MaintenanceHandle {
    /// Stop the threads and wait for them.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        // dropping the sender disconnects every receiver.
        self.shutdown.take();
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                warn!("Maintenance thread panicked.");
            }
        }
    }
}

impl Drop for MaintenanceHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
