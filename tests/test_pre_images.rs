mod common;

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bson::doc;
use change_feed::blocking::{InMemoryCatalog, MemoryNode, PreImageReclaimer};
use change_feed::pre_image::ConsistencyChecker;
use change_feed::store::Catalog;
use change_feed::{
    ChangeFeedService, FeedConfig, FeedError, Namespace, OpenRequest, OperationType, Result,
};
use chrono::{Duration as ChronoDuration, Utc};
use common::{op_types, Context};
use parking_lot::Mutex;
use uuid::Uuid;

/// Catalog starting a reclamation pass while a feed resolves its collection.
struct ReclaimingCatalog {
    inner: Arc<InMemoryCatalog>,
    reclaimer: Mutex<Option<PreImageReclaimer>>,
    running: Mutex<Option<JoinHandle<usize>>>,
}

impl Catalog for ReclaimingCatalog {
    fn collection_uuid(&self, ns: &Namespace) -> Result<Option<Uuid>> {
        if let Some(reclaimer) = self.reclaimer.lock().take() {
            let later = Utc::now() + ChronoDuration::hours(2);
            *self.running.lock() = Some(thread::spawn(move || reclaimer.run_at(later)));
            thread::sleep(Duration::from_millis(50));
        }
        self.inner.collection_uuid(ns)
    }

    fn view_source(&self, ns: &Namespace) -> Result<Option<Namespace>> {
        self.inner.view_source(ns)
    }
}

#[test]
fn test_pre_images_of_update_replace_and_delete() {
    let context = Context::new();
    context.node.create_collection("test.coll", true).unwrap();
    context.node.insert("test.coll", doc! {"_id": 1, "a": 1}).unwrap();
    let opened = context.open(OpenRequest::collection("test", "coll").with_pre_images());

    context
        .node
        .update("test.coll", 1, doc! {"$set": {"a": 2}})
        .unwrap();
    context
        .node
        .replace("test.coll", 1, doc! {"b": 1})
        .unwrap();
    context.node.delete("test.coll", 1).unwrap();

    let events = context.drain(opened.cursor_id, 3);
    assert_eq!(
        op_types(&events),
        vec![
            OperationType::Update,
            OperationType::Replace,
            OperationType::Delete
        ]
    );
    assert_eq!(
        events[0].full_document_before_change(),
        Some(&doc! {"_id": 1, "a": 1})
    );
    assert_eq!(
        events[1].full_document_before_change(),
        Some(&doc! {"_id": 1, "a": 2})
    );
    assert_eq!(
        events[2].full_document_before_change(),
        Some(&doc! {"_id": 1, "b": 1})
    );
    let rendered = events[2].to_document();
    assert!(rendered.contains_key("fullDocumentBeforeChange"));
}

#[test]
fn test_pre_images_absent_when_collection_does_not_record_them() {
    let context = Context::new();
    context.node.insert("test.coll", doc! {"_id": 1, "a": 1}).unwrap();
    let opened = context.open(OpenRequest::collection("test", "coll").with_pre_images());
    context
        .node
        .update("test.coll", 1, doc! {"$set": {"a": 2}})
        .unwrap();
    context.node.delete("test.coll", 1).unwrap();

    let events = context.drain(opened.cursor_id, 2);
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.full_document_before_change().is_none()));
    assert!(!events[0].to_document().contains_key("fullDocumentBeforeChange"));
}

#[test]
fn test_pre_images_not_requested() {
    let context = Context::new();
    context.node.create_collection("test.coll", true).unwrap();
    context.node.insert("test.coll", doc! {"_id": 1, "a": 1}).unwrap();
    let opened = context.open(OpenRequest::collection("test", "coll"));
    context.node.delete("test.coll", 1).unwrap();

    let events = context.drain(opened.cursor_id, 1);
    assert_eq!(events[0].full_document_before_change(), None);
}

#[test]
fn test_pre_images_enabled_later() {
    let context = Context::new();
    context.node.insert("test.coll", doc! {"_id": 1, "a": 1}).unwrap();
    let opened = context.open(OpenRequest::collection("test", "coll").with_pre_images());
    context.node.set_pre_images("test.coll", true).unwrap();
    context
        .node
        .update("test.coll", 1, doc! {"$set": {"a": 2}})
        .unwrap();

    // collMod is an expanded event, only the update shows up.
    let events = context.drain(opened.cursor_id, 1);
    assert_eq!(op_types(&events), vec![OperationType::Update]);
    assert_eq!(
        events[0].full_document_before_change(),
        Some(&doc! {"_id": 1, "a": 1})
    );
}

#[test]
fn test_post_image_is_looked_up() {
    let context = Context::new();
    context.node.insert("test.coll", doc! {"_id": 1, "a": 1}).unwrap();
    context.node.insert("test.coll", doc! {"_id": 2, "a": 1}).unwrap();
    let opened = context.open(OpenRequest::collection("test", "coll").with_post_images());
    context
        .node
        .update("test.coll", 1, doc! {"$set": {"a": 2}})
        .unwrap();
    context
        .node
        .update("test.coll", 2, doc! {"$set": {"a": 2}})
        .unwrap();
    context.node.delete("test.coll", 2).unwrap();

    let events = context.drain(opened.cursor_id, 3);
    assert_eq!(events[0].full_document(), Some(&doc! {"_id": 1, "a": 2}));
    // the document is gone by the time the feed reads the update.
    assert_eq!(events[1].full_document(), None);
}

#[test]
fn test_reclaim_waits_for_cursors_needing_pre_images() {
    let context = Context::new();
    context.node.create_collection("test.coll", true).unwrap();
    context.node.insert("test.coll", doc! {"_id": 1, "a": 1}).unwrap();
    let opened = context.open(OpenRequest::collection("test", "coll").with_pre_images());
    context
        .node
        .update("test.coll", 1, doc! {"$set": {"a": 2}})
        .unwrap();
    assert_eq!(context.node.pre_images().len(), 1);

    let later = Utc::now() + ChronoDuration::hours(2);
    let reclaimer = context.service.reclaimer();
    assert_eq!(reclaimer.run_at(later), 0);

    let events = context.drain(opened.cursor_id, 1);
    assert!(events[0].full_document_before_change().is_some());
    assert_eq!(reclaimer.run_at(later), 1);
    assert!(context.node.pre_images().is_empty());
}

#[test]
fn test_reclaim_during_open_keeps_pre_images_at_the_resume_point() {
    let node = MemoryNode::new();
    node.create_collection("test.coll", true).unwrap();
    let catalog = Arc::new(ReclaimingCatalog {
        inner: node.catalog(),
        reclaimer: Mutex::new(None),
        running: Mutex::new(None),
    });
    let service = ChangeFeedService::new(
        node.oplog(),
        catalog.clone(),
        node.catalog(),
        node.pre_images(),
        FeedConfig::default().with_max_await(Duration::from_millis(50)),
    );

    let first = service.open(OpenRequest::collection("test", "coll")).unwrap();
    node.insert("test.coll", doc! {"_id": 1, "a": 1}).unwrap();
    node.update("test.coll", 1, doc! {"$set": {"a": 2}}).unwrap();
    let batch = service.get_more(first.cursor_id, None).unwrap();
    assert_eq!(batch.events.len(), 2);
    let after_insert = batch.events[0].id.clone();
    service.kill_cursor(first.cursor_id).unwrap();

    *catalog.reclaimer.lock() = Some(service.reclaimer());
    let resumed = service
        .open(
            OpenRequest::collection("test", "coll")
                .resume_after(after_insert)
                .with_pre_images(),
        )
        .unwrap();
    let reclaim = catalog.running.lock().take().unwrap();
    reclaim.join().unwrap();

    let mut events = resumed.events;
    if events.is_empty() {
        events = service.get_more(resumed.cursor_id, None).unwrap().events;
    }
    assert_eq!(op_types(&events), vec![OperationType::Update]);
    assert_eq!(
        events[0].full_document_before_change(),
        Some(&doc! {"_id": 1, "a": 1})
    );
}

#[test]
fn test_killed_cursor_releases_pre_images() {
    let context = Context::new();
    context.node.create_collection("test.coll", true).unwrap();
    context.node.insert("test.coll", doc! {"_id": 1, "a": 1}).unwrap();
    let opened = context.open(OpenRequest::collection("test", "coll").with_pre_images());
    context.node.delete("test.coll", 1).unwrap();

    let later = Utc::now() + ChronoDuration::hours(2);
    assert_eq!(context.service.reclaimer().run_at(later), 0);
    context.service.kill_cursor(opened.cursor_id).unwrap();
    assert_eq!(context.service.reclaimer().run_at(later), 1);
}

#[test]
fn test_recent_pre_images_are_kept() {
    let context = Context::new();
    context.node.create_collection("test.coll", true).unwrap();
    context.node.insert("test.coll", doc! {"_id": 1, "a": 1}).unwrap();
    context.node.delete("test.coll", 1).unwrap();
    assert_eq!(context.service.reclaim_pre_images(), 0);
    assert_eq!(context.node.pre_images().len(), 1);
}

#[test]
fn test_consistency_across_members() {
    let primary = MemoryNode::new();
    primary.create_collection("test.coll", true).unwrap();
    primary.insert("test.coll", doc! {"_id": 1, "a": 1}).unwrap();
    primary.insert("test.coll", doc! {"_id": 2, "a": 1}).unwrap();
    primary
        .update("test.coll", 1, doc! {"$set": {"a": 2}})
        .unwrap();
    primary
        .update("test.coll", 2, doc! {"$set": {"a": 2}})
        .unwrap();

    let store = primary.pre_images();
    let records = store.ns_uuids();
    assert_eq!(records.len(), 1);
    let uuid = *records.iter().next().unwrap();
    let history = store.reverse_scan(uuid);
    assert_eq!(history.len(), 2);

    // a member that kept only the newest record agrees.
    let lagging = change_feed::pre_image::PreImageStore::new();
    lagging
        .record(uuid, history[0].position, history[0].document.clone())
        .unwrap();
    let checker = ConsistencyChecker::new(2).unwrap();
    checker
        .check(&[("node0", store.as_ref()), ("node1", &lagging)])
        .unwrap();

    // a member with another document at the same position does not.
    let diverged = change_feed::pre_image::PreImageStore::new();
    diverged
        .record(uuid, history[0].position, doc! {"_id": 2, "a": 42})
        .unwrap();
    let err = checker
        .check(&[("node0", store.as_ref()), ("node2", &diverged)])
        .unwrap_err();
    assert!(matches!(err, FeedError::PreImageInconsistency { .. }));
}
