use std::{
    collections::{BTreeMap, HashSet, VecDeque},
    hash::Hash,
    sync::{Condvar, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use log::debug;

struct QueueState<K> {
    ready: VecDeque<K>,
    /// Keys waiting in `ready` or scheduled to be added; a key is queued at most once.
    dirty: HashSet<K>,
    /// Keys handed to a worker and not yet marked done.
    processing: HashSet<K>,
    delayed: BTreeMap<Instant, Vec<K>>,
    shutting_down: bool,
}

/// Blocking work queue that never hands the same key to two workers at once.
///
/// Adding a key that is currently being processed marks it dirty; it is
/// queued again when the worker calls `done`.
pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    available: Condvar,
}

impl<K: Clone + Eq + Hash + std::fmt::Debug> Default for WorkQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Clone + Eq + Hash + std::fmt::Debug> WorkQueue<K> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                ready: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                delayed: BTreeMap::new(),
                shutting_down: false,
            }),
            available: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<K>> {
        // A panicking worker must not wedge every other worker.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add(&self, key: K) {
        let mut state = self.lock();
        Self::enqueue(&mut state, key);
        self.available.notify_one();
    }

    fn enqueue(state: &mut QueueState<K>, key: K) {
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            debug!("[queue] {key:?} is in flight; will requeue when done");
            return;
        }
        state.ready.push_back(key);
    }

    /// Queues `key` once `delay` has elapsed.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            return self.add(key);
        }
        let mut state = self.lock();
        if state.shutting_down {
            return;
        }
        state
            .delayed
            .entry(Instant::now() + delay)
            .or_default()
            .push(key);
        self.available.notify_one();
    }

    fn promote_due(state: &mut QueueState<K>, now: Instant) {
        let pending = state.delayed.split_off(&(now + Duration::from_nanos(1)));
        let due = std::mem::replace(&mut state.delayed, pending);
        for key in due.into_values().flatten() {
            Self::enqueue(state, key);
        }
    }

    /// Blocks until a key is ready, returning `None` once the queue is shut down.
    pub fn get(&self) -> Option<K> {
        let mut state = self.lock();
        loop {
            Self::promote_due(&mut state, Instant::now());
            if let Some(key) = state.ready.pop_front() {
                state.dirty.remove(&key);
                state.processing.insert(key.clone());
                return Some(key);
            }
            if state.shutting_down {
                return None;
            }
            state = match state.delayed.keys().next().copied() {
                Some(next) => {
                    let wait = next.saturating_duration_since(Instant::now());
                    self.available
                        .wait_timeout(state, wait)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|poisoned| poisoned.into_inner().0)
                }
                None => self
                    .available
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
            };
        }
    }

    /// Releases `key`; if it was re-added while in flight it becomes ready again.
    pub fn done(&self, key: &K) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.ready.push_back(key.clone());
            self.available.notify_one();
        }
    }

    /// Wakes every blocked worker; queued keys are still drained before `get` returns `None`.
    pub fn shut_down(&self) {
        let mut state = self.lock();
        state.shutting_down = true;
        state.delayed.clear();
        self.available.notify_all();
    }

    pub fn len(&self) -> usize {
        self.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
