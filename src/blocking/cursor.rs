use std::sync::Arc;
use std::time::{Duration, Instant};

use bson::Timestamp;
use crossbeam::channel::Receiver;
use tracing::{debug, info, warn};

use super::registry::CursorId;
use super::replication::ReplicationState;
use super::transaction;
use crate::event::{ChangeEvent, EventFilter};
use crate::oplog::{OplogEntry, Position};
use crate::resume_token::{ResumeToken, ResumeTokenData};
use crate::scope::{FeedScope, NamespaceSignal, ScopeResolver};
use crate::store::{CancelToken, OplogStore};
use crate::time_helper;
use crate::translator::EventTranslator;
use crate::{FeedError, Result};

/// Life cycle of a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// created, start position not yet established.
    Opening,
    /// serving pulls.
    Streaming,
    /// the invalidate event has been delivered, terminal.
    Invalidated,
    /// killed, reaped or failed, terminal.
    Closed,
}

/// What other threads push into a cursor's inbox.
#[derive(Debug, Clone)]
pub(crate) enum CursorMessage {
    /// a destructive DDL was logged.
    Namespace(NamespaceSignal),
    /// the node rolled back every entry after this timestamp.
    RolledBack(Timestamp),
}

/// Knobs a cursor reads its oplog with.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CursorSettings {
    pub(crate) max_read_retries: u32,
    pub(crate) retry_backoff: Duration,
    pub(crate) read_chunk: usize,
    pub(crate) max_await: Duration,
}

/// Everything a pull may move.  A pull works on a copy which replaces the cursor's only
/// when the pull succeeds, so a failed pull can be re-issued from the same place.
#[derive(Debug, Clone)]
struct Progress {
    resolver: ScopeResolver,
    resume_token: ResumeToken,
    /// next oplog timestamp to read, every entry before it has been handled.
    scan_from: Timestamp,
    /// an invalidate event which didn't fit in the previous batch.
    queued: Option<ChangeEvent>,
    /// a signal ending the feed once the scan passes its DDL.
    pending_signal: Option<NamespaceSignal>,
    invalidated: bool,
}

/// One change feed, pulled batch by batch by whatever thread serves its requests.
pub struct ChangeFeedCursor {
    id: CursorId,
    state: CursorState,
    progress: Progress,
    translator: EventTranslator,
    filter: EventFilter,
    store: Arc<dyn OplogStore>,
    replication: Option<Arc<ReplicationState>>,
    inbox: Receiver<CursorMessage>,
    cancel: CancelToken,
    settings: CursorSettings,
}

impl ChangeFeedCursor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: CursorId,
        resolver: ScopeResolver,
        translator: EventTranslator,
        filter: EventFilter,
        store: Arc<dyn OplogStore>,
        replication: Option<Arc<ReplicationState>>,
        inbox: Receiver<CursorMessage>,
        settings: CursorSettings,
    ) -> Self {
        let origin = Timestamp {
            time: 0,
            increment: 0,
        };
        ChangeFeedCursor {
            id,
            state: CursorState::Opening,
            progress: Progress {
                resolver,
                resume_token: ResumeTokenData::high_water_mark(origin).encode(),
                scan_from: origin,
                queued: None,
                pending_signal: None,
                invalidated: false,
            },
            translator,
            filter,
            store,
            replication,
            inbox,
            cancel: CancelToken::new(),
            settings,
        }
    }

    /// Establish the start position, the cursor is streaming from now on.
    pub(crate) fn start(&mut self, scan_from: Timestamp, resume_token: ResumeToken) {
        self.progress.scan_from = scan_from;
        self.progress.resume_token = resume_token;
        self.state = CursorState::Streaming;
        debug!(cursor_id = %self.id, ?scan_from, "Cursor streaming.");
    }

    /// cursor id.
    pub fn id(&self) -> CursorId {
        self.id
    }

    /// current state.
    pub fn state(&self) -> CursorState {
        self.state
    }

    /// watched scope.
    pub fn scope(&self) -> &FeedScope {
        self.progress.resolver.scope()
    }

    /// Token to resume after everything delivered so far.
    pub fn resume_token(&self) -> &ResumeToken {
        &self.progress.resume_token
    }

    /// Oldest oplog timestamp the cursor still has to read.
    pub fn scan_from(&self) -> Timestamp {
        self.progress.scan_from
    }

    /// default bounded wait of an empty pull.
    pub fn max_await(&self) -> Duration {
        self.settings.max_await
    }

    /// Does the cursor attach pre-images?
    pub fn wants_pre_images(&self) -> bool {
        self.translator.options().want_pre_images
    }

    pub(crate) fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Pull at most `batch_size` events, waiting up to `max_await` when none is available.
    ///
    /// The position only moves when the pull succeeds.
    pub fn next_batch(&mut self, batch_size: usize, max_await: Duration) -> Result<Vec<ChangeEvent>> {
        match self.state {
            CursorState::Opening => {
                return Err(FeedError::InvalidRequest(format!(
                    "cursor {} has no start position",
                    self.id
                )))
            }
            CursorState::Invalidated => return Err(FeedError::CursorInvalidated(self.id)),
            CursorState::Closed => return Err(FeedError::CursorKilled(self.id)),
            CursorState::Streaming => {}
        }
        self.check_cancelled()?;
        self.drain_inbox();
        if batch_size == 0 {
            return Ok(vec![]);
        }

        let mut work = self.progress.clone();
        let mut events = vec![];
        if let Some(invalidate) = work.queued.take() {
            Self::deliver_invalidate(&mut work, &mut events, invalidate);
        } else {
            let deadline = Instant::now() + max_await;
            if !self.await_read_snapshot(deadline)? {
                self.check_cancelled()?;
                return Ok(vec![]);
            }
            self.scan(&mut work, &mut events, batch_size, deadline)?;
        }

        if !work.invalidated && work.queued.is_none() {
            let high_water_mark = ResumeTokenData::high_water_mark(work.scan_from).encode();
            if high_water_mark > work.resume_token {
                work.resume_token = high_water_mark;
            }
        }
        if work.invalidated {
            info!(cursor_id = %self.id, token = %work.resume_token, "Cursor invalidated.");
            self.state = CursorState::Invalidated;
        }
        self.progress = work;
        Ok(events)
    }

    fn check_cancelled(&mut self) -> Result<()> {
        if self.cancel.is_cancelled() {
            self.state = CursorState::Closed;
            return Err(FeedError::CursorKilled(self.id));
        }
        Ok(())
    }

    fn drain_inbox(&mut self) {
        let messages: Vec<CursorMessage> = self.inbox.try_iter().collect();
        for message in messages {
            match message {
                CursorMessage::Namespace(signal) => {
                    if self.progress.pending_signal.is_none()
                        && self.progress.resolver.signal_invalidates(&signal)
                    {
                        debug!(cursor_id = %self.id, ?signal, "Namespace signal received.");
                        self.progress.pending_signal = Some(signal);
                    }
                }
                CursorMessage::RolledBack(common_point) => {
                    let lost = matches!(
                        &self.progress.pending_signal,
                        Some(signal) if time_helper::cmp(&signal.at(), &common_point) == std::cmp::Ordering::Greater
                    );
                    if lost {
                        info!(cursor_id = %self.id, ?common_point, "Discard rolled back namespace signal.");
                        self.progress.pending_signal = None;
                    }
                }
            }
        }
    }

    /// Fail when the oplog head was truncated past entries the cursor has not read yet.
    fn ensure_history(&mut self, scan_from: Timestamp, token: &ResumeToken) -> Result<()> {
        let retained_from = match self.store.retained_from()? {
            Some(ts) => ts,
            None => return Ok(()),
        };
        if time_helper::cmp(&retained_from, &scan_from) != std::cmp::Ordering::Greater {
            return Ok(());
        }
        warn!(cursor_id = %self.id, ?scan_from, ?retained_from, "Close cursor, oplog history lost.");
        self.state = CursorState::Closed;
        Err(FeedError::ResumeTokenNotFound {
            token: token.to_string(),
            reason: format!(
                "the oplog was truncated up to {:?} before the cursor read from {:?}",
                retained_from, scan_from
            ),
        })
    }

    /// On a freshly elected primary, wait until the term's first write is majority committed.
    fn await_read_snapshot(&mut self, deadline: Instant) -> Result<bool> {
        let replication = match &self.replication {
            Some(replication) => replication,
            None => return Ok(true),
        };
        match replication.await_read_snapshot(deadline, &self.cancel) {
            Ok(ready) => Ok(ready),
            Err(e) => {
                warn!(cursor_id = %self.id, error = %e, "Close cursor, primary stepped down.");
                self.state = CursorState::Closed;
                Err(e)
            }
        }
    }

    fn scan(
        &mut self,
        work: &mut Progress,
        events: &mut Vec<ChangeEvent>,
        batch_size: usize,
        deadline: Instant,
    ) -> Result<()> {
        let chunk = self.settings.read_chunk;
        loop {
            let wait = if events.is_empty() {
                deadline.saturating_duration_since(Instant::now())
            } else {
                Duration::ZERO
            };
            let entries = self.read_entries(work.scan_from, chunk, wait)?;
            self.check_cancelled()?;
            self.ensure_history(work.scan_from, &work.resume_token)?;
            let read = entries.len();
            let caught_up = read < chunk;
            let entries = self.majority_committed(entries);
            let capped = entries.len() < read;

            for entry in entries.iter() {
                if !self.handle_entry(work, events, batch_size, entry)? {
                    return Ok(());
                }
                work.scan_from = time_helper::next_timestamp(entry.ts);
                if work.invalidated || work.queued.is_some() || events.len() >= batch_size {
                    return Ok(());
                }
            }
            if entries.is_empty() && !capped {
                break;
            }
            if capped || (caught_up && !events.is_empty()) {
                break;
            }
        }
        self.check_pending_signal(work, events, batch_size);
        Ok(())
    }

    /// Handle every operation of one entry.  Returns false when the batch filled up before the
    /// last operation, the entry is handled again by the next pull.
    fn handle_entry(
        &self,
        work: &mut Progress,
        events: &mut Vec<ChangeEvent>,
        batch_size: usize,
        entry: &OplogEntry,
    ) -> Result<bool> {
        let ops = transaction::expand_entry(self.store.as_ref(), entry)?;
        let last = ops.len().saturating_sub(1);
        for (i, op) in ops.iter().enumerate() {
            self.handle_op(work, events, batch_size, op)?;
            if work.invalidated || work.queued.is_some() {
                return Ok(true);
            }
            if events.len() >= batch_size && i < last {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn handle_op(
        &self,
        work: &mut Progress,
        events: &mut Vec<ChangeEvent>,
        batch_size: usize,
        op: &OplogEntry,
    ) -> Result<()> {
        work.resolver.observe(op);
        if !work.resolver.is_visible(op) {
            return Ok(());
        }
        let event = self.translator.translate(op)?;
        let invalidates = work.resolver.invalidated_by(op)?;
        if let Some(event) = &event {
            if event.id > work.resume_token {
                work.resume_token = event.id.clone();
                if self.filter.matches(event) {
                    events.push(event.clone());
                }
            }
        }
        if invalidates {
            let invalidate = match &event {
                Some(event) => self.translator.invalidate_event(event),
                None => self.translator.invalidate_at(op.position(), op.uuid),
            };
            if invalidate.id > work.resume_token {
                Self::queue_invalidate(work, events, batch_size, invalidate);
            }
        }
        Ok(())
    }

    /// The inbox told us the watched namespace is gone.  Once the scan has passed the DDL
    /// without seeing it, end the feed anyway.
    fn check_pending_signal(
        &self,
        work: &mut Progress,
        events: &mut Vec<ChangeEvent>,
        batch_size: usize,
    ) {
        if work.invalidated || work.queued.is_some() {
            return;
        }
        let at = match &work.pending_signal {
            Some(signal) => signal.at(),
            None => return,
        };
        if time_helper::cmp(&work.scan_from, &at) != std::cmp::Ordering::Greater {
            return;
        }
        let uuid = match &work.pending_signal {
            Some(NamespaceSignal::CollectionDropped { uuid, .. })
            | Some(NamespaceSignal::CollectionRenamed { uuid, .. }) => *uuid,
            _ => work.resolver.target_uuid(),
        };
        let invalidate = self.translator.invalidate_at(Position::at(at), uuid);
        if invalidate.id > work.resume_token {
            Self::queue_invalidate(work, events, batch_size, invalidate);
        }
    }

    fn queue_invalidate(
        work: &mut Progress,
        events: &mut Vec<ChangeEvent>,
        batch_size: usize,
        invalidate: ChangeEvent,
    ) {
        if events.len() < batch_size {
            Self::deliver_invalidate(work, events, invalidate);
        } else {
            work.queued = Some(invalidate);
        }
    }

    fn deliver_invalidate(work: &mut Progress, events: &mut Vec<ChangeEvent>, invalidate: ChangeEvent) {
        work.resume_token = invalidate.id.clone();
        work.invalidated = true;
        events.push(invalidate);
    }

    /// Drop entries past the majority commit point.
    fn majority_committed(&self, mut entries: Vec<OplogEntry>) -> Vec<OplogEntry> {
        let replication = match &self.replication {
            Some(replication) => replication,
            None => return entries,
        };
        match replication.majority_commit_point() {
            None => vec![],
            Some(commit_point) => {
                let visible = entries.partition_point(|e| {
                    time_helper::cmp(&e.ts, &commit_point) != std::cmp::Ordering::Greater
                });
                entries.truncate(visible);
                entries
            }
        }
    }

    /// Read from the oplog, retrying transient failures at the same position.
    fn read_entries(&self, from: Timestamp, limit: usize, wait: Duration) -> Result<Vec<OplogEntry>> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let read = if wait.is_zero() {
                self.store.read(from, limit)
            } else {
                self.store.read_await(from, limit, wait, &self.cancel)
            };
            match read {
                Ok(entries) => return Ok(entries),
                Err(e) if e.is_transient() && attempts <= self.settings.max_read_retries => {
                    warn!(cursor_id = %self.id, ?from, attempts, error = %e, "Oplog read failed, retry.");
                    std::thread::sleep(self.settings.retry_backoff);
                }
                Err(e) if e.is_transient() => {
                    return Err(FeedError::StorageRetriesExhausted {
                        attempts,
                        source: Box::new(e),
                    })
                }
                Err(e) => return Err(e),
            }
        }
    }
}
