mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bson::{doc, Timestamp};
use change_feed::blocking::{InMemoryOplogStore, MemoryNode, TxnOp};
use change_feed::oplog::OplogEntry;
use change_feed::store::{CancelToken, OplogStore};
use change_feed::{
    ChangeFeedService, ErrorCategory, FeedConfig, FeedError, OpenRequest, OperationType, Result,
};
use common::{assert_ordered, op_types, Context};

/// Oplog store failing its next `failures` reads.
struct FlakyStore {
    inner: Arc<InMemoryOplogStore>,
    failures: AtomicU32,
}

impl FlakyStore {
    fn fail(&self) -> Result<()> {
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(FeedError::TransientStorage("injected read failure".to_string()));
        }
        Ok(())
    }
}

impl OplogStore for FlakyStore {
    fn read(&self, from: Timestamp, limit: usize) -> Result<Vec<OplogEntry>> {
        self.fail()?;
        self.inner.read(from, limit)
    }

    fn read_await(
        &self,
        from: Timestamp,
        limit: usize,
        max_wait: Duration,
        cancel: &CancelToken,
    ) -> Result<Vec<OplogEntry>> {
        self.fail()?;
        self.inner.read_await(from, limit, max_wait, cancel)
    }

    fn find_at(&self, ts: Timestamp) -> Result<Option<OplogEntry>> {
        self.inner.find_at(ts)
    }

    fn latest_position(&self) -> Result<Option<Timestamp>> {
        self.inner.latest_position()
    }

    fn earliest_position(&self) -> Result<Option<Timestamp>> {
        self.inner.earliest_position()
    }

    fn retained_from(&self) -> Result<Option<Timestamp>> {
        self.inner.retained_from()
    }
}

fn flaky_service(node: &MemoryNode) -> (Arc<FlakyStore>, ChangeFeedService) {
    let store = Arc::new(FlakyStore {
        inner: node.oplog(),
        failures: AtomicU32::new(0),
    });
    let catalog = node.catalog();
    let service = ChangeFeedService::new(
        store.clone(),
        catalog.clone(),
        catalog,
        node.pre_images(),
        FeedConfig::default()
            .with_max_read_retries(3)
            .with_max_await(Duration::from_millis(50)),
    );
    (store, service)
}

#[test]
fn test_transient_failures_are_retried_in_place() {
    let node = MemoryNode::new();
    node.create_collection("test.coll", false).unwrap();
    let (store, service) = flaky_service(&node);
    let opened = service.open(OpenRequest::collection("test", "coll")).unwrap();
    node.insert("test.coll", doc! {"_id": 1}).unwrap();

    store.failures.store(2, Ordering::SeqCst);
    let batch = service.get_more(opened.cursor_id, None).unwrap();
    assert_eq!(op_types(&batch.events), vec![OperationType::Insert]);
    assert_eq!(store.failures.load(Ordering::SeqCst), 0);
}

#[test]
fn test_exhausted_retries_surface_without_losing_events() {
    let node = MemoryNode::new();
    node.create_collection("test.coll", false).unwrap();
    let (store, service) = flaky_service(&node);
    let opened = service.open(OpenRequest::collection("test", "coll")).unwrap();
    node.insert("test.coll", doc! {"_id": 1}).unwrap();
    node.insert("test.coll", doc! {"_id": 2}).unwrap();

    store.failures.store(10, Ordering::SeqCst);
    let err = service.get_more(opened.cursor_id, None).unwrap_err();
    assert!(matches!(err, FeedError::StorageRetriesExhausted { attempts: 4, .. }));
    assert!(err.is_retryable());
    assert_eq!(err.category(), ErrorCategory::Transient);

    store.failures.store(0, Ordering::SeqCst);
    let batch = service.get_more(opened.cursor_id, None).unwrap();
    let keys: Vec<_> = batch
        .events
        .iter()
        .map(|e| e.document_key().cloned().unwrap())
        .collect();
    assert_eq!(keys, vec![doc! {"_id": 1}, doc! {"_id": 2}]);
}

#[test]
fn test_kill_is_idempotent() {
    let context = Context::new();
    let opened = context.open(OpenRequest::cluster());
    context.service.kill_cursor(opened.cursor_id).unwrap();
    context.service.kill_cursor(opened.cursor_id).unwrap();
    assert!(matches!(
        context.service.get_more(opened.cursor_id, None),
        Err(FeedError::CursorNotFound(_))
    ));
    assert!(context.service.registry().is_empty());
}

#[test]
fn test_kill_ends_blocked_pull_and_busy_cursor_is_refused() {
    let context = Context::new();
    let opened = context.open(OpenRequest::cluster().with_max_await(Duration::from_secs(10)));
    let id = opened.cursor_id;

    std::thread::scope(|s| {
        let started = Instant::now();
        let blocked = s.spawn(|| context.service.get_more(id, None));
        std::thread::sleep(Duration::from_millis(100));
        assert!(matches!(
            context.service.get_more(id, None),
            Err(FeedError::CursorInUse(_))
        ));
        context.service.kill_cursor(id).unwrap();
        let res = blocked.join().unwrap();
        assert!(matches!(res, Err(FeedError::CursorKilled(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
    });
}

#[test]
fn test_idle_cursors_are_reaped() {
    let context = Context::with_config(FeedConfig::default().with_idle_timeout(Duration::ZERO));
    let opened = context.open(OpenRequest::cluster());
    assert_eq!(context.service.reap_idle_cursors(), 1);
    assert!(matches!(
        context.service.get_more(opened.cursor_id, None),
        Err(FeedError::CursorNotFound(_))
    ));
}

#[test]
fn test_maintenance_threads_reap_and_stop() {
    let context = Context::with_config(FeedConfig::default().with_idle_timeout(Duration::ZERO));
    context.open(OpenRequest::cluster());
    let maintenance = context.service.spawn_maintenance().unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while !context.service.registry().is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(context.service.registry().is_empty());
    maintenance.shutdown();
}

#[test]
fn test_small_batches_split_a_transaction_without_duplicates() {
    let context = Context::new();
    context.node.create_collection("test.coll", false).unwrap();
    let opened = context.open(OpenRequest::collection("test", "coll"));
    let ops = (1..=3)
        .map(|i| TxnOp::Insert {
            ns: "test.coll".to_string(),
            doc: doc! {"_id": i},
        })
        .collect();
    context.node.transaction(ops, 10).unwrap();

    let first = context.service.get_more(opened.cursor_id, Some(2)).unwrap();
    assert_eq!(first.events.len(), 2);
    assert_eq!(&first.post_batch_resume_token, &first.events[1].id);
    let second = context.service.get_more(opened.cursor_id, Some(2)).unwrap();
    assert_eq!(second.events.len(), 1);

    let mut events = first.events;
    events.extend(second.events);
    assert_ordered(&events);
    assert_eq!(events[2].document_key(), Some(&doc! {"_id": 3}));
}

#[test]
fn test_invalidate_waits_for_room_in_the_batch() {
    let context = Context::new();
    context.node.create_collection("test.coll", false).unwrap();
    let opened = context.open(OpenRequest::collection("test", "coll"));
    context.node.insert("test.coll", doc! {"_id": 1}).unwrap();
    context.node.drop_collection("test.coll").unwrap();

    let first = context.service.get_more(opened.cursor_id, Some(2)).unwrap();
    assert_eq!(
        op_types(&first.events),
        vec![OperationType::Insert, OperationType::Drop]
    );
    assert!(!first.cursor_id.is_exhausted());
    let second = context.service.get_more(opened.cursor_id, Some(2)).unwrap();
    assert_eq!(op_types(&second.events), vec![OperationType::Invalidate]);
    assert!(second.cursor_id.is_exhausted());
    assert!(second.events[0].id > first.events[1].id);
}

#[test]
fn test_operation_type_filter() {
    let context = Context::new();
    context.node.create_collection("test.coll", false).unwrap();
    let opened = context.open(
        OpenRequest::collection("test", "coll").with_operation_types(vec![OperationType::Insert]),
    );
    context.node.insert("test.coll", doc! {"_id": 1}).unwrap();
    context
        .node
        .update("test.coll", 1, doc! {"$set": {"a": 1}})
        .unwrap();
    context.node.drop_collection("test.coll").unwrap();

    let events = context.drain(opened.cursor_id, 2);
    assert_eq!(
        op_types(&events),
        vec![OperationType::Insert, OperationType::Invalidate]
    );
}

#[test]
fn test_feed_on_missing_collection_waits_for_create() {
    let context = Context::new();
    let opened = context.open(OpenRequest::collection("test", "later"));
    assert!(opened.events.is_empty());
    assert!(!opened.cursor_id.is_exhausted());
    assert!(context.pull(opened.cursor_id).events.is_empty());

    context.node.insert("test.later", doc! {"_id": 1}).unwrap();
    let events = context.drain(opened.cursor_id, 2);
    assert_eq!(
        op_types(&events),
        vec![OperationType::Create, OperationType::Insert]
    );
}

#[test]
fn test_zero_batch_size_returns_nothing() {
    let context = Context::new();
    context.node.create_collection("test.coll", false).unwrap();
    let opened = context.open(OpenRequest::collection("test", "coll").with_batch_size(0));
    context.node.insert("test.coll", doc! {"_id": 1}).unwrap();
    let batch = context.service.get_more(opened.cursor_id, Some(0)).unwrap();
    assert!(batch.events.is_empty());
    assert_eq!(context.drain(opened.cursor_id, 1).len(), 1);
}
