//! FIFO queue bounding concurrent builder VMs, the build-side twin of
//! `vmkit-image`'s conversion queue (spec §5 "Build queue: pending
//! promotion order is FIFO from the moment of enqueue"). Callbacks run
//! outside the internal mutex to avoid lock inversion with the instance
//! engine, per spec §5's shared-resource policy for the build queue.

use std::collections::{BTreeSet, VecDeque};
use std::future::Future;
use std::pin::Pin;

use tokio::sync::Mutex;

type BoxedJob = Pin<Box<dyn Future<Output = ()> + Send>>;

struct QueueState {
    active: BTreeSet<String>,
    pending: VecDeque<(String, BoxedJob)>,
    max_concurrent: usize,
}

/// Invariants: `active.len() <= max_concurrent`; `pending` is strict
/// arrival order; an id is never in both sets at once.
pub struct BuildQueue {
    state: Mutex<QueueState>,
}

impl BuildQueue {
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self { state: Mutex::new(QueueState { active: BTreeSet::new(), pending: VecDeque::new(), max_concurrent }) }
    }

    /// Admit `id` with its start future. Returns 0 if it started
    /// immediately, or its 1-based position in the pending queue otherwise.
    pub async fn enqueue<Fut>(&self, id: String, start: Fut) -> usize
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut state = self.state.lock().await;
        if state.active.len() < state.max_concurrent {
            state.active.insert(id);
            drop(state);
            tokio::spawn(start);
            0
        } else {
            state.pending.push_back((id, Box::pin(start)));
            state.pending.len()
        }
    }

    /// Release `id`'s slot and promote the head of `pending`, if any. A
    /// no-op for an id this queue never admitted.
    pub async fn mark_complete(&self, id: &str) {
        let promoted = {
            let mut state = self.state.lock().await;
            state.active.remove(id);
            if state.active.len() < state.max_concurrent { state.pending.pop_front() } else { None }
        };
        if let Some((promoted_id, start)) = promoted {
            self.state.lock().await.active.insert(promoted_id);
            tokio::spawn(start);
        }
    }

    pub async fn active_count(&self) -> usize {
        self.state.lock().await.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Notify;

    fn job(notify: Arc<Notify>) -> impl Future<Output = ()> + Send + 'static {
        async move { notify.notified().await }
    }

    #[tokio::test]
    async fn starts_immediately_while_under_capacity() {
        let queue = BuildQueue::new(2);
        let gate = Arc::new(Notify::new());
        let position = queue.enqueue("build-a".into(), job(gate.clone())).await;
        assert_eq!(position, 0);
        assert_eq!(queue.active_count().await, 1);
        gate.notify_one();
    }

    #[tokio::test]
    async fn queues_past_capacity_and_promotes_fifo_on_completion() {
        let queue = BuildQueue::new(1);
        let gate_a = Arc::new(Notify::new());
        assert_eq!(queue.enqueue("build-a".into(), job(gate_a.clone())).await, 0);
        assert_eq!(queue.enqueue("build-b".into(), async {}).await, 1);

        queue.mark_complete("build-a").await;
        assert_eq!(queue.active_count().await, 1);
        queue.mark_complete("build-b").await;
        assert_eq!(queue.active_count().await, 0);
    }
}
