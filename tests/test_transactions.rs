mod common;

use bson::doc;
use change_feed::blocking::TxnOp;
use change_feed::{FeedError, Namespace, OpenRequest, OperationType};
use common::{assert_ordered, op_types, Context};

fn insert(id: i32) -> TxnOp {
    TxnOp::Insert {
        ns: "test.coll".to_string(),
        doc: doc! {"_id": id},
    }
}

#[test]
fn test_large_transaction_is_reported_at_commit() {
    let context = Context::new();
    context.node.create_collection("test.coll", false).unwrap();
    let opened = context.open(OpenRequest::collection("test", "coll"));
    let commit_ts = context
        .node
        .transaction(vec![insert(1), insert(2), insert(3)], 1)
        .unwrap();

    let events = context.drain(opened.cursor_id, 3);
    assert_eq!(events.len(), 3);
    assert_ordered(&events);
    for event in events.iter() {
        assert_eq!(event.operation_type(), OperationType::Insert);
        assert_eq!(event.cluster_time, commit_ts);
        assert!(event.lsid.is_some());
        assert!(event.txn_number.is_some());
    }
    let keys: Vec<_> = events.iter().map(|e| e.document_key().cloned()).collect();
    assert_eq!(
        keys,
        vec![
            Some(doc! {"_id": 1}),
            Some(doc! {"_id": 2}),
            Some(doc! {"_id": 3})
        ]
    );
    let rendered = events[0].to_document();
    assert!(rendered.contains_key("lsid"));
    assert!(rendered.contains_key("txnNumber"));
}

#[test]
fn test_transaction_touching_other_collections_is_filtered() {
    let context = Context::new();
    context.node.create_collection("test.coll", false).unwrap();
    context.node.create_collection("test.other", false).unwrap();
    let opened = context.open(OpenRequest::collection("test", "coll"));
    context
        .node
        .transaction(
            vec![
                TxnOp::Insert {
                    ns: "test.other".to_string(),
                    doc: doc! {"_id": 1},
                },
                insert(2),
            ],
            10,
        )
        .unwrap();

    let events = context.drain(opened.cursor_id, 1);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].document_key(), Some(&doc! {"_id": 2}));
}

#[test]
fn test_prepared_transaction_commit_and_abort() {
    let context = Context::new();
    context.node.create_collection("test.coll", false).unwrap();
    context.node.insert("test.coll", doc! {"_id": 1, "a": 1}).unwrap();
    let opened = context.open(OpenRequest::collection("test", "coll"));

    context
        .node
        .prepared_transaction(vec![insert(10)], false)
        .unwrap();
    let commit_ts = context
        .node
        .prepared_transaction(
            vec![
                insert(2),
                TxnOp::Update {
                    ns: "test.coll".to_string(),
                    id: 1.into(),
                    update: doc! {"$set": {"a": 2}},
                },
                TxnOp::Delete {
                    ns: "test.coll".to_string(),
                    id: 2.into(),
                },
            ],
            true,
        )
        .unwrap();

    let events = context.drain(opened.cursor_id, 3);
    assert_eq!(
        op_types(&events),
        vec![
            OperationType::Insert,
            OperationType::Update,
            OperationType::Delete
        ]
    );
    assert!(events.iter().all(|e| e.cluster_time == commit_ts));
    assert_eq!(context.node.catalog().count(&Namespace::parse("test.coll").unwrap()), 1);
}

#[test]
fn test_transaction_pre_images() {
    let context = Context::new();
    context.node.create_collection("test.coll", true).unwrap();
    context.node.insert("test.coll", doc! {"_id": 1, "a": 1}).unwrap();
    context.node.insert("test.coll", doc! {"_id": 2, "a": 1}).unwrap();
    let opened = context.open(OpenRequest::collection("test", "coll").with_pre_images());
    context
        .node
        .transaction(
            vec![
                TxnOp::Update {
                    ns: "test.coll".to_string(),
                    id: 1.into(),
                    update: doc! {"$set": {"a": 2}},
                },
                TxnOp::Delete {
                    ns: "test.coll".to_string(),
                    id: 2.into(),
                },
            ],
            1,
        )
        .unwrap();

    let events = context.drain(opened.cursor_id, 2);
    assert_eq!(
        events[0].full_document_before_change(),
        Some(&doc! {"_id": 1, "a": 1})
    );
    assert_eq!(
        events[1].full_document_before_change(),
        Some(&doc! {"_id": 2, "a": 1})
    );
}

#[test]
fn test_failed_transaction_writes_nothing() {
    let context = Context::new();
    context.node.create_collection("test.coll", false).unwrap();
    context.node.insert("test.coll", doc! {"_id": 1}).unwrap();
    let opened = context.open(OpenRequest::collection("test", "coll"));

    let err = context
        .node
        .transaction(vec![insert(2), insert(1)], 10)
        .unwrap_err();
    assert!(matches!(err, FeedError::InvalidRequest(_)));
    assert!(context.pull(opened.cursor_id).events.is_empty());
}
