use std::{
    collections::VecDeque,
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::{Condvar, Mutex};
use serde_json::Value;

/// A multi-subscriber broadcast stream of unilateral responses
/// (settle/state/cancel events) on a root.
#[derive(Default)]
pub struct Publisher {
    subscribers: Mutex<Vec<Weak<SubscriberQueue>>>,
}

impl Publisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Arc<SubscriberQueue> {
        let queue = Arc::new(SubscriberQueue::default());
        self.subscribers.lock().push(Arc::downgrade(&queue));
        queue
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|weak| weak.strong_count() > 0);
        subscribers.len()
    }

    pub fn enqueue(&self, item: Value) {
        let item = Arc::new(item);
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|weak| match weak.upgrade() {
            Some(queue) => {
                queue.push(Arc::clone(&item));
                true
            }
            None => false,
        });
    }
}

#[derive(Default)]
pub struct SubscriberQueue {
    items: Mutex<VecDeque<Arc<Value>>>,
    cond: Condvar,
}

impl SubscriberQueue {
    fn push(&self, item: Arc<Value>) {
        self.items.lock().push_back(item);
        self.cond.notify_all();
    }

    pub fn drain(&self) -> Vec<Arc<Value>> {
        self.items.lock().drain(..).collect()
    }

    /// Blocks until an item is available or the timeout expires.
    pub fn wait_for_item(&self, timeout: Duration) -> bool {
        let mut items = self.items.lock();
        if items.is_empty() {
            self.cond.wait_for(&mut items, timeout);
        }
        !items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn broadcast_reaches_all_live_subscribers() {
        let publisher = Publisher::new();
        let a = publisher.subscribe();
        let b = publisher.subscribe();
        publisher.enqueue(json!({"settled": true}));

        assert_eq!(a.drain().len(), 1);
        assert_eq!(b.drain().len(), 1);

        drop(b);
        publisher.enqueue(json!({"settled": true}));
        assert_eq!(publisher.subscriber_count(), 1);
        assert_eq!(a.drain().len(), 1);
    }
}
