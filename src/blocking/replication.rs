//! Replication facts the feed depends on: member state, term, majority commit point.
use std::time::{Duration, Instant};

use bson::Timestamp;
use parking_lot::{Condvar, Mutex};
use tracing::{info, warn};

use crate::store::CancelToken;
use crate::time_helper;
use crate::{FeedError, Result};

/// Longest single sleep of a blocked read, so cancellation is noticed quickly.
const WAIT_SLICE: Duration = Duration::from_millis(20);

/// State of this replica set member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    /// accepts writes.
    Primary,
    /// replicates from a primary.
    Secondary,
    /// undoing writes that never became majority committed.
    Rollback,
    /// a rollback failed after changing data, the member needs manual repair.
    Fatal,
}

#[derive(Debug)]
struct Inner {
    state: MemberState,
    term: i64,
    term_start: Option<Timestamp>,
    commit_point: Option<Timestamp>,
}

/// Shared replication state of one member.
#[derive(Debug)]
pub struct ReplicationState {
    inner: Mutex<Inner>,
    changed: Condvar,
}

impl Default for ReplicationState {
    fn default() -> Self {
        ReplicationState::new(MemberState::Secondary)
    }
}

impl ReplicationState {
    /// A member in `state`, at term 0, with nothing majority committed.
    pub fn new(state: MemberState) -> Self {
        ReplicationState {
            inner: Mutex::new(Inner {
                state,
                term: 0,
                term_start: None,
                commit_point: None,
            }),
            changed: Condvar::new(),
        }
    }

    /// current member state.
    pub fn member_state(&self) -> MemberState {
        self.inner.lock().state
    }

    /// current election term.
    pub fn term(&self) -> i64 {
        self.inner.lock().term
    }

    /// Win an election.  `term_start` is the timestamp of the first entry of the new term.
    pub fn step_up(&self, term_start: Timestamp) -> i64 {
        let mut inner = self.inner.lock();
        inner.term += 1;
        inner.state = MemberState::Primary;
        inner.term_start = Some(term_start);
        info!(term = inner.term, ?term_start, "Step up.");
        self.changed.notify_all();
        inner.term
    }

    /// Lose the primary role, failing reads blocked on the term start.
    pub fn step_down(&self) {
        let mut inner = self.inner.lock();
        if inner.state == MemberState::Primary {
            inner.state = MemberState::Secondary;
            warn!(term = inner.term, "Step down.");
        }
        self.changed.notify_all();
    }

    /// Move the majority commit point forward.  It never moves back.
    pub fn advance_commit_point(&self, ts: Timestamp) {
        let mut inner = self.inner.lock();
        let newer = match inner.commit_point {
            None => true,
            Some(current) => time_helper::cmp(&ts, &current) == std::cmp::Ordering::Greater,
        };
        if newer {
            inner.commit_point = Some(ts);
            self.changed.notify_all();
        }
    }

    /// Newest majority committed timestamp.
    pub fn majority_commit_point(&self) -> Option<Timestamp> {
        self.inner.lock().commit_point
    }

    /// First timestamp written in the current term, if this member was elected.
    pub fn current_term_start_position(&self) -> Option<Timestamp> {
        self.inner.lock().term_start
    }

    /// Wait until a majority snapshot is readable on this member.
    ///
    /// A freshly elected primary must not serve majority reads until the first write of its
    /// term is majority committed.  Returns `Ok(false)` on timeout or cancellation, and fails
    /// with [FeedError::PrimarySteppedDown] if the member loses the primary role while waiting.
    pub fn await_read_snapshot(&self, deadline: Instant, cancel: &CancelToken) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.state != MemberState::Primary {
            return Ok(true);
        }
        let term = inner.term;
        loop {
            if inner.state != MemberState::Primary || inner.term != term {
                return Err(FeedError::PrimarySteppedDown { term });
            }
            let ready = match (inner.term_start, inner.commit_point) {
                (None, _) => true,
                (Some(_), None) => false,
                (Some(start), Some(commit)) => {
                    time_helper::cmp(&commit, &start) != std::cmp::Ordering::Less
                }
            };
            if ready {
                return Ok(true);
            }
            let now = Instant::now();
            if cancel.is_cancelled() || now >= deadline {
                return Ok(false);
            }
            self.changed
                .wait_for(&mut inner, WAIT_SLICE.min(deadline - now));
        }
    }

    /// Enter rollback.  Dropping the attempt without [RollbackAttempt::complete] marks it
    /// as failed.
    pub fn begin_rollback(&self) -> RollbackAttempt<'_> {
        let mut inner = self.inner.lock();
        inner.state = MemberState::Rollback;
        info!(term = inner.term, "Begin rollback.");
        self.changed.notify_all();
        RollbackAttempt {
            state: self,
            durable_change: false,
            finished: false,
        }
    }

    fn finish_rollback(&self, state: MemberState, common_point: Option<Timestamp>) {
        let mut inner = self.inner.lock();
        inner.state = state;
        if let (Some(common), Some(commit)) = (common_point, inner.commit_point) {
            if time_helper::cmp(&commit, &common) == std::cmp::Ordering::Greater {
                inner.commit_point = Some(common);
            }
        }
        self.changed.notify_all();
    }
}

/// A rollback in progress.
pub struct RollbackAttempt<'a> {
    state: &'a ReplicationState,
    durable_change: bool,
    finished: bool,
}

impl<'a> RollbackAttempt<'a> {
    /// Data has been changed on disk, a failure from now on can't be retried.
    pub fn record_durable_change(&mut self) {
        self.durable_change = true;
    }

    /// The member rolled back to `common_point` and goes back to SECONDARY.
    pub fn complete(mut self, common_point: Timestamp) {
        self.finished = true;
        info!(?common_point, "Rollback complete.");
        self.state
            .finish_rollback(MemberState::Secondary, Some(common_point));
    }
}

impl<'a> Drop for RollbackAttempt<'a> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if self.durable_change {
            warn!("Rollback failed after changing data.");
            self.state.finish_rollback(MemberState::Fatal, None);
        } else {
            // nothing changed, the member may sync from any source again.
            warn!("Rollback failed before changing data.");
            self.state.finish_rollback(MemberState::Secondary, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ts(time: u32) -> Timestamp {
        Timestamp { time, increment: 1 }
    }

    #[test]
    fn test_commit_point_never_moves_back() {
        let state = ReplicationState::default();
        state.advance_commit_point(ts(5));
        state.advance_commit_point(ts(3));
        assert_eq!(state.majority_commit_point(), Some(ts(5)));
    }

    #[test]
    fn test_new_primary_waits_for_term_start() {
        let state = ReplicationState::default();
        state.advance_commit_point(ts(5));
        state.step_up(ts(6));
        let cancel = CancelToken::new();
        let soon = Instant::now() + Duration::from_millis(30);
        assert!(!state.await_read_snapshot(soon, &cancel).unwrap());

        state.advance_commit_point(ts(6));
        let soon = Instant::now() + Duration::from_millis(30);
        assert!(state.await_read_snapshot(soon, &cancel).unwrap());
    }

    #[test]
    fn test_step_down_fails_blocked_read() {
        let state = Arc::new(ReplicationState::default());
        let term = state.step_up(ts(6));
        let waiter = {
            let state = state.clone();
            std::thread::spawn(move || {
                state.await_read_snapshot(Instant::now() + Duration::from_secs(10), &CancelToken::new())
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        state.step_down();
        match waiter.join().unwrap() {
            Err(FeedError::PrimarySteppedDown { term: t }) => assert_eq!(t, term),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_failed_rollback_without_changes_is_not_stuck() {
        let state = ReplicationState::new(MemberState::Primary);
        {
            let _attempt = state.begin_rollback();
            assert_eq!(state.member_state(), MemberState::Rollback);
        }
        assert_eq!(state.member_state(), MemberState::Secondary);

        {
            let mut attempt = state.begin_rollback();
            attempt.record_durable_change();
        }
        assert_eq!(state.member_state(), MemberState::Fatal);
    }

    #[test]
    fn test_completed_rollback_lowers_commit_point() {
        let state = ReplicationState::new(MemberState::Primary);
        state.advance_commit_point(ts(9));
        state.begin_rollback().complete(ts(4));
        assert_eq!(state.member_state(), MemberState::Secondary);
        assert_eq!(state.majority_commit_point(), Some(ts(4)));
    }
}
