//! FIFO queue bounding concurrent image conversions (spec §4.C
//! `createImage`). Each job carries its own start future; promotion from
//! `pending` to `active` on `mark_complete` is what actually runs it, so a
//! job queued behind a full active set doesn't start until a slot frees.

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

/// Bounded FIFO admission control. Invariants: `active.len() <=
/// max_concurrent`; `pending` is strict arrival order; an id is never in
/// both sets at once.
pub struct BuildQueue {
    state: Mutex<QueueState>,
}

impl BuildQueue {
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self { state: Mutex::new(QueueState { active: BTreeSet::new(), pending: VecDeque::new(), max_concurrent }) }
    }

    /// Admit `id` with its start future. Returns 0 if it started immediately,
    /// or its 1-based position in the pending queue otherwise.
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

    /// Release `id`'s slot and promote the head of `pending` into it, if
    /// any. A no-op for an id this queue never admitted (spec invariant:
    /// completing an unknown id does nothing).
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

    /// 1-based position in the pending queue, or `None` if `id` is active
    /// or unknown.
    pub async fn position(&self, id: &str) -> Option<usize> {
        let state = self.state.lock().await;
        state.pending.iter().position(|(pending_id, _)| pending_id == id).map(|i| i + 1)
    }

    pub async fn active_count(&self) -> usize {
        self.state.lock().await.active.len()
    }
}
