//! Keyed work queue
//!
//! Items are grouped by key. A key handed to a worker is not handed out
//! again until the worker calls [`WorkQueue::done`], so one key is never
//! processed concurrently, and items for one key come out in the order they
//! went in. Consecutive updates to the same key collapse into the newest.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Kind of change that produced a queued item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Add,
    Update,
    Delete,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Add => write!(f, "add"),
            EventKind::Update => write!(f, "update"),
            EventKind::Delete => write!(f, "delete"),
        }
    }
}

/// One queued change
#[derive(Debug, Clone)]
pub struct WorkItem<K> {
    pub kind: EventKind,
    pub object: K,
    /// Number of failed attempts so far
    pub attempts: u32,
}

impl<K> WorkItem<K> {
    pub fn new(kind: EventKind, object: K) -> Self {
        Self {
            kind,
            object,
            attempts: 0,
        }
    }
}

struct State<K> {
    pending: HashMap<String, VecDeque<WorkItem<K>>>,
    ready: VecDeque<String>,
    queued: HashSet<String>,
    processing: HashSet<String>,
    /// Bumped on every add; a retry scheduled at an older generation is stale
    generations: HashMap<String, u64>,
    /// Retry timers still sleeping, per key
    retries: HashMap<String, usize>,
    shutting_down: bool,
}

impl<K> State<K> {
    fn mark_ready(&mut self, key: &str) {
        if !self.processing.contains(key) && !self.queued.contains(key) {
            self.queued.insert(key.to_string());
            self.ready.push_back(key.to_string());
        }
    }

    /// Drop the generation of a key nothing refers to any more
    fn forget_if_idle(&mut self, key: &str) {
        if !self.pending.contains_key(key)
            && !self.processing.contains(key)
            && !self.queued.contains(key)
            && !self.retries.contains_key(key)
        {
            self.generations.remove(key);
        }
    }
}

/// Per-key FIFO queue shared by a dispatcher's workers
pub struct WorkQueue<K> {
    state: Mutex<State<K>>,
    notify: Notify,
}

impl<K: Clone + Send + 'static> WorkQueue<K> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                pending: HashMap::new(),
                ready: VecDeque::new(),
                queued: HashSet::new(),
                processing: HashSet::new(),
                generations: HashMap::new(),
                retries: HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
        })
    }

    /// Queue an item behind whatever is already pending for `key`.
    ///
    /// Returns `false` once the queue is shutting down.
    pub fn add(&self, key: &str, item: WorkItem<K>) -> bool {
        {
            let mut state = self.state.lock();
            if state.shutting_down {
                return false;
            }
            *state.generations.entry(key.to_string()).or_default() += 1;
            let items = state.pending.entry(key.to_string()).or_default();
            match items.back_mut() {
                Some(last) if last.kind == EventKind::Update && item.kind == EventKind::Update => {
                    *last = item;
                }
                _ => items.push_back(item),
            }
            state.mark_ready(key);
        }
        self.notify.notify_one();
        true
    }

    /// Put a failed item back after `delay`. The retry is dropped if a newer
    /// item for the same key arrived meanwhile.
    pub fn requeue_after(self: &Arc<Self>, key: String, item: WorkItem<K>, delay: Duration) {
        let queue = Arc::clone(self);
        let generation = {
            let mut state = self.state.lock();
            *state.retries.entry(key.clone()).or_default() += 1;
            state.generations.get(&key).copied().unwrap_or(0)
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut state = queue.state.lock();
                if let Some(n) = state.retries.get_mut(&key) {
                    *n -= 1;
                    if *n == 0 {
                        state.retries.remove(&key);
                    }
                }
                if state.shutting_down
                    || state.generations.get(&key).copied().unwrap_or(0) != generation
                {
                    state.forget_if_idle(&key);
                    return;
                }
                state.pending.entry(key.clone()).or_default().push_back(item);
                state.mark_ready(&key);
            }
            queue.notify.notify_one();
        });
    }

    /// Wait for the next key with pending work. Returns `None` once the
    /// queue is shutting down and fully drained.
    pub async fn next(&self) -> Option<(String, WorkItem<K>)> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                while let Some(key) = state.ready.pop_front() {
                    state.queued.remove(&key);
                    let item = state.pending.get_mut(&key).and_then(VecDeque::pop_front);
                    if state.pending.get(&key).is_some_and(VecDeque::is_empty) {
                        state.pending.remove(&key);
                    }
                    if let Some(item) = item {
                        state.processing.insert(key.clone());
                        return Some((key, item));
                    }
                }
                if state.shutting_down && state.processing.is_empty() {
                    drop(state);
                    self.notify.notify_waiters();
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Release `key` after a worker finished with it
    pub fn done(&self, key: &str) {
        {
            let mut state = self.state.lock();
            state.processing.remove(key);
            if state.pending.get(key).is_some_and(|items| !items.is_empty()) {
                state.mark_ready(key);
            } else {
                state.forget_if_idle(key);
            }
        }
        // Wake one worker for the released key and any worker waiting on
        // shutdown to observe the drained state.
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Stop accepting new items; queued items are still handed out
    pub fn shut_down(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Number of keys with pending items
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
