mod common;

use bson::doc;
use change_feed::{FeedError, OpenRequest, OperationType};
use common::{assert_ordered, op_types, Context};

#[test]
fn test_insert_on_collection_feed() {
    let context = Context::new();
    context.node.create_collection("test.coll", false).unwrap();
    let opened = context.open(OpenRequest::collection("test", "coll"));
    assert!(opened.events.is_empty());
    assert!(!opened.cursor_id.is_exhausted());

    context.node.insert("test.coll", doc! {"_id": 1, "a": 1}).unwrap();
    let events = context.drain(opened.cursor_id, 1);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].operation_type(), OperationType::Insert);
    assert_eq!(events[0].document_key(), Some(&doc! {"_id": 1}));
    assert_eq!(events[0].full_document(), Some(&doc! {"_id": 1, "a": 1}));
}

#[test]
fn test_crud_then_drop_ends_with_invalidate() {
    let context = Context::new();
    context.node.create_collection("test.coll", false).unwrap();
    let opened = context.open(OpenRequest::collection("test", "coll"));

    context.node.insert("test.coll", doc! {"_id": 1}).unwrap();
    context
        .node
        .update("test.coll", 1, doc! {"$set": {"a": 1}})
        .unwrap();
    context.node.delete("test.coll", 1).unwrap();
    context.node.drop_collection("test.coll").unwrap();

    let batch = context.pull(opened.cursor_id);
    assert_eq!(
        op_types(&batch.events),
        vec![
            OperationType::Insert,
            OperationType::Update,
            OperationType::Delete,
            OperationType::Drop,
            OperationType::Invalidate
        ]
    );
    assert_ordered(&batch.events);
    assert!(batch.cursor_id.is_exhausted());
    assert_eq!(&batch.post_batch_resume_token, &batch.events[4].id);
    assert!(matches!(
        context.service.get_more(opened.cursor_id, None),
        Err(FeedError::CursorNotFound(_))
    ));
}

#[test]
fn test_resume_across_drop_and_recreate_needs_collation() {
    let context = Context::new();
    context.node.create_collection("test.coll", false).unwrap();
    let opened = context.open(OpenRequest::collection("test", "coll"));
    context.node.insert("test.coll", doc! {"_id": 1}).unwrap();
    context.node.insert("test.coll", doc! {"_id": 2}).unwrap();
    let events = context.drain(opened.cursor_id, 2);
    assert_eq!(events.len(), 2);
    let token = events[0].id.clone();

    context.node.drop_collection("test.coll").unwrap();
    context.node.create_collection("test.coll", false).unwrap();
    context.node.insert("test.coll", doc! {"_id": 3}).unwrap();

    let refused = context
        .service
        .open(OpenRequest::collection("test", "coll").resume_after(token.clone()));
    assert!(matches!(refused, Err(FeedError::ResumeTokenNotFound { .. })));

    let resumed = context.open(
        OpenRequest::collection("test", "coll")
            .resume_after(token)
            .with_collation("simple"),
    );
    assert_eq!(
        op_types(&resumed.events),
        vec![
            OperationType::Insert,
            OperationType::Drop,
            OperationType::Invalidate
        ]
    );
    assert_eq!(resumed.events[0].document_key(), Some(&doc! {"_id": 2}));
    assert!(resumed.cursor_id.is_exhausted());
}

#[test]
fn test_cluster_feed_reports_namespaces_in_order() {
    let context = Context::new();
    context.node.create_collection("db1.t1", false).unwrap();
    context.node.create_collection("db2.t2", false).unwrap();
    let opened = context.open(OpenRequest::cluster());

    context.node.insert("db1.t1", doc! {"_id": 1}).unwrap();
    context.node.insert("db2.t2", doc! {"_id": 1}).unwrap();
    let events = context.drain(opened.cursor_id, 2);
    assert_eq!(
        op_types(&events),
        vec![OperationType::Insert, OperationType::Insert]
    );
    let namespaces: Vec<(String, Option<String>)> = events
        .iter()
        .map(|e| {
            let ns = e.ns.clone().unwrap();
            (ns.db, ns.coll)
        })
        .collect();
    assert_eq!(
        namespaces,
        vec![
            ("db1".to_string(), Some("t1".to_string())),
            ("db2".to_string(), Some("t2".to_string()))
        ]
    );
    assert_ordered(&events);
}
