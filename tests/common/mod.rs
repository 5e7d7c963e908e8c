#![allow(dead_code)]
use std::time::Duration;

use change_feed::blocking::MemoryNode;
use change_feed::{ChangeEvent, ChangeFeedService, CursorId, FeedBatch, FeedConfig, OpenRequest, OperationType};

pub struct Context {
    pub node: MemoryNode,
    pub service: ChangeFeedService,
}

impl Context {
    pub fn new() -> Self {
        Context::with_config(FeedConfig::default())
    }

    pub fn with_config(config: FeedConfig) -> Self {
        let node = MemoryNode::new();
        let service =
            ChangeFeedService::for_node(&node, config.with_max_await(Duration::from_millis(50)));
        Context { node, service }
    }

    pub fn open(&self, request: OpenRequest) -> FeedBatch {
        self.service.open(request).unwrap()
    }

    pub fn pull(&self, id: CursorId) -> FeedBatch {
        self.service.get_more(id, None).unwrap()
    }

    /// Pull until `expected` events arrived or the feed ended.
    pub fn drain(&self, id: CursorId, expected: usize) -> Vec<ChangeEvent> {
        let mut events = vec![];
        for _ in 0..20 {
            let batch = self.pull(id);
            events.extend(batch.events);
            if events.len() >= expected || batch.cursor_id.is_exhausted() {
                break;
            }
        }
        events
    }
}

pub fn op_types(events: &[ChangeEvent]) -> Vec<OperationType> {
    events.iter().map(|e| e.operation_type()).collect()
}

/// Delivered tokens must be strictly increasing.
pub fn assert_ordered(events: &[ChangeEvent]) {
    for pair in events.windows(2) {
        assert_eq!(pair[0].id.compare(&pair[1].id), -1, "{:?} !< {:?}", pair[0].id, pair[1].id);
    }
}
