//! Bounded FIFO of requests waiting for a worker

use std::collections::VecDeque;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::recipe::TypedRecipe;
use crate::registry::OperationRegistry;
use crate::types::{RequestId, Value};

/// One unit of work: a validated recipe, its input and the registry
/// snapshot it was validated against
///
/// Owned by the queue until dequeued, then by exactly one worker.
#[derive(Debug)]
pub(crate) struct ExecutionRequest {
    pub id: RequestId,
    pub recipe: TypedRecipe,
    pub input: Value,
    pub registry: Arc<OperationRegistry>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Default)]
pub(crate) struct AdmissionQueue {
    pending: VecDeque<ExecutionRequest>,
}

impl AdmissionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Whether one more request fits
    ///
    /// Entries up to the number of idle workers are claimed straight away and
    /// never actually wait; only the remainder counts against `capacity`.
    pub fn has_room(&self, idle_workers: usize, capacity: usize) -> bool {
        self.pending.len() < idle_workers.saturating_add(capacity)
    }

    pub fn push_back(&mut self, request: ExecutionRequest) {
        self.pending.push_back(request);
    }

    pub fn pop_front(&mut self) -> Option<ExecutionRequest> {
        self.pending.pop_front()
    }

    /// Pull a specific request out, preserving the order of the rest
    pub fn remove(&mut self, id: &RequestId) -> Option<ExecutionRequest> {
        let index = self.pending.iter().position(|r| &r.id == id)?;
        self.pending.remove(index)
    }

    pub fn drain(&mut self) -> impl Iterator<Item = ExecutionRequest> + '_ {
        self.pending.drain(..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::{validate, Recipe};

    fn request() -> ExecutionRequest {
        let registry = Arc::new(OperationRegistry::with_builtins());
        ExecutionRequest {
            id: RequestId::new(),
            recipe: validate(&Recipe::default(), &registry).unwrap(),
            input: Value::from("x"),
            registry,
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = AdmissionQueue::new();
        let ids: Vec<RequestId> = (0..3)
            .map(|_| {
                let r = request();
                let id = r.id;
                queue.push_back(r);
                id
            })
            .collect();

        let popped: Vec<RequestId> = std::iter::from_fn(|| queue.pop_front().map(|r| r.id)).collect();
        assert_eq!(popped, ids);
    }

    #[test]
    fn test_remove_keeps_order() {
        let mut queue = AdmissionQueue::new();
        let (a, b, c) = (request(), request(), request());
        let (ida, idb, idc) = (a.id, b.id, c.id);
        queue.push_back(a);
        queue.push_back(b);
        queue.push_back(c);

        assert_eq!(queue.remove(&idb).map(|r| r.id), Some(idb));
        assert!(queue.remove(&idb).is_none());
        assert_eq!(queue.pop_front().map(|r| r.id), Some(ida));
        assert_eq!(queue.pop_front().map(|r| r.id), Some(idc));
    }

    #[test]
    fn test_has_room_counts_idle_workers() {
        let mut queue = AdmissionQueue::new();
        assert!(queue.has_room(0, 1));
        assert!(!queue.has_room(0, 0));
        assert!(queue.has_room(1, 0));

        queue.push_back(request());
        assert!(!queue.has_room(1, 0));
        assert!(queue.has_room(1, 1));
        assert!(!queue.has_room(0, 1));
    }
}
