//! Per-resource serialized task queue.
//!
//! A [`Sequencer`] runs at most one task at a time, in submission order. A
//! failing (or panicking) task settles its own caller with an error and the
//! queue moves on to the next one. [`SequencerMap`] hands out one sequencer per
//! working directory so unrelated repositories never wait on each other.

use std::collections::VecDeque;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{GitwardenError, Result};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Default)]
struct SequencerState {
    pending: VecDeque<Job>,
    running: bool,
}

/// Serialized async queue. Cheap to clone; clones share the same queue.
#[derive(Clone, Default)]
pub struct Sequencer {
    state: Arc<Mutex<SequencerState>>,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue `action` and return a future for its result.
    ///
    /// The task is enqueued before this returns, so submission order is the
    /// order of `push` calls, not the order in which the returned futures are
    /// awaited.
    pub fn push<F, T>(&self, action: F) -> impl Future<Output = Result<T>> + Send + 'static
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            // The caller may have stopped listening; the task still counts as settled.
            let _ = tx.send(action.await);
        });

        let start_loop = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.pending.push_back(job);
            if state.running {
                false
            } else {
                state.running = true;
                true
            }
        };

        if start_loop {
            tokio::spawn(drain(self.state.clone()));
        }

        async move { rx.await.map_err(|_| GitwardenError::TaskAborted)? }
    }

    /// Number of tasks waiting behind the one currently running.
    pub fn pending(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pending
            .len()
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).running
    }
}

async fn drain(state: Arc<Mutex<SequencerState>>) {
    loop {
        let job = {
            let mut guard = state.lock().unwrap_or_else(|e| e.into_inner());
            match guard.pending.pop_front() {
                Some(job) => job,
                None => {
                    guard.running = false;
                    return;
                }
            }
        };

        // Each job gets its own task so a panic is contained to that job.
        if let Err(e) = tokio::spawn(job).await {
            warn!(error = %e, "sequenced task did not complete");
        }
    }
}

/// One [`Sequencer`] per working directory. Entries for directories with
/// nothing queued are dropped by [`remove_idle`](SequencerMap::remove_idle).
#[derive(Default)]
pub struct SequencerMap {
    sequencers: DashMap<PathBuf, Sequencer>,
}

impl SequencerMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// The sequencer bound to `dir`, created on first use.
    pub fn for_dir(&self, dir: &Path) -> Sequencer {
        if let Some(existing) = self.sequencers.get(dir) {
            return existing.clone();
        }
        debug!(dir = %dir.display(), "creating sequencer");
        self.sequencers
            .entry(dir.to_path_buf())
            .or_default()
            .clone()
    }

    /// Drop sequencers that have no queued work and no outside handles.
    /// Returns how many were removed.
    ///
    /// Handles are cloned from the map under its shard lock, and a busy queue
    /// holds its own reference, so a sequencer that is only referenced by the
    /// map cannot be in use.
    pub fn remove_idle(&self) -> usize {
        let before = self.sequencers.len();
        self.sequencers
            .retain(|_, sequencer| Arc::strong_count(&sequencer.state) > 1);
        let removed = before.saturating_sub(self.sequencers.len());
        if removed > 0 {
            debug!(removed, "dropped idle sequencers");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sequencers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequencers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn idle_sequencer_stops_its_loop() {
        let seq = Sequencer::new();
        let value = seq.push(async { Ok::<_, GitwardenError>(7) }).await.unwrap();
        assert_eq!(value, 7);

        // The loop clears the flag right after the last job settles.
        for _ in 0..50 {
            if !seq.is_running() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!seq.is_running());
        assert_eq!(seq.pending(), 0);
    }

    #[test]
    fn map_reuses_sequencer_per_dir() {
        let map = SequencerMap::new();
        let a = map.for_dir(Path::new("/repo/a"));
        let _ = map.for_dir(Path::new("/repo/b"));
        let a_again = map.for_dir(Path::new("/repo/a"));

        assert_eq!(map.len(), 2);
        assert!(Arc::ptr_eq(&a.state, &a_again.state));
    }

    #[test]
    fn idle_entries_are_removed_but_held_ones_stay() {
        let map = SequencerMap::new();
        let held = map.for_dir(Path::new("/repo/held"));
        drop(map.for_dir(Path::new("/repo/idle")));

        assert_eq!(map.remove_idle(), 1);
        assert_eq!(map.len(), 1);
        drop(held);
        assert_eq!(map.remove_idle(), 1);
        assert!(map.is_empty());
    }
}
