//! Keyed serial executor.
//!
//! Tasks submitted under the same key run strictly one at a time, in
//! submission order. Different keys drain independently and concurrently.
//! A failing (or panicking) task only rejects its own deferred value; the
//! queue moves on to the next entry.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use tracing::{debug, trace};

use crate::deferred::{Deferred, Settle};
use crate::ids::TaskId;
use crate::observability::QueueCounts;

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// One submitted task.
///
/// The head entry stays in the queue while it executes (`job` is `None` then),
/// so queue length always counts the running task too.
struct Entry {
    id: TaskId,
    job: Option<Job>,
    watch: Arc<dyn Settle>,
}

type Queues<K> = Arc<Mutex<HashMap<K, VecDeque<Entry>>>>;

fn lock<K>(
    queues: &Mutex<HashMap<K, VecDeque<Entry>>>,
) -> MutexGuard<'_, HashMap<K, VecDeque<Entry>>> {
    queues.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-key FIFO executor.
///
/// # 使用例
/// ```ignore
/// let executor = KeyedExecutor::new();
/// let saved = executor.execute("user-1", || async { save().await });
/// let again = executor.execute("user-1", || async { save().await }); // waits for `saved`
/// ```
pub struct KeyedExecutor<K> {
    queues: Queues<K>,
}

impl<K> Clone for KeyedExecutor<K> {
    fn clone(&self) -> Self {
        Self {
            queues: Arc::clone(&self.queues),
        }
    }
}

impl<K> Default for KeyedExecutor<K> {
    fn default() -> Self {
        Self {
            queues: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K> KeyedExecutor<K>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `task` under `key`.
    ///
    /// The task is enqueued before this returns, so submission order is call
    /// order. Must be called from within a Tokio runtime.
    pub fn execute<F, Fut, T, E>(&self, key: K, task: F) -> Deferred<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let deferred = Deferred::new();
        let id = TaskId::generate();

        let handle = deferred.handle();
        let job: Job = Box::new(move || async move { handle.settle_with(task()).await }.boxed());
        let entry = Entry {
            id,
            job: Some(job),
            watch: Arc::new(deferred.handle()),
        };

        let start_drain = {
            let mut queues = lock(&self.queues);
            let queue = queues.entry(key.clone()).or_default();
            queue.push_back(entry);
            queue.len() == 1
        };
        debug!(%id, ?key, start_drain, "task queued");

        if start_drain {
            tokio::spawn(drain(Arc::clone(&self.queues), key));
        }
        deferred
    }

    /// Number of unfinished tasks under `key`, including the running one.
    pub fn queue_len(&self, key: &K) -> usize {
        lock(&self.queues).get(key).map_or(0, VecDeque::len)
    }

    pub fn is_running(&self, key: &K) -> bool {
        self.queue_len(key) > 0
    }

    pub fn counts(&self) -> QueueCounts {
        let queues = lock(&self.queues);
        let mut counts = QueueCounts {
            keys: queues.len(),
            ..QueueCounts::default()
        };
        for entry in queues.values().flatten() {
            if entry.job.is_some() {
                counts.queued += 1;
            } else {
                counts.running += 1;
            }
        }
        counts
    }

    /// Wait until every task currently queued under `key` has settled.
    ///
    /// Tasks submitted after this call are not waited for.
    pub async fn wait_idle(&self, key: &K) {
        let watches: Vec<Arc<dyn Settle>> = lock(&self.queues)
            .get(key)
            .map(|queue| queue.iter().map(|entry| Arc::clone(&entry.watch)).collect())
            .unwrap_or_default();
        join_all(watches.iter().map(|watch| watch.settled())).await;
    }

    /// Like [`wait_idle`](Self::wait_idle), across all keys.
    pub async fn wait_all_idle(&self) {
        let watches: Vec<Arc<dyn Settle>> = lock(&self.queues)
            .values()
            .flatten()
            .map(|entry| Arc::clone(&entry.watch))
            .collect();
        join_all(watches.iter().map(|watch| watch.settled())).await;
    }
}

/// Run the queue for `key` until it is empty, then drop the key.
///
/// Exactly one drain runs per non-empty key: it is spawned by the submission
/// that created the queue and exits only after removing it.
async fn drain<K>(queues: Queues<K>, key: K)
where
    K: Eq + Hash + fmt::Debug,
{
    loop {
        let head = {
            let mut guard = lock(&queues);
            guard
                .get_mut(&key)
                .and_then(VecDeque::front_mut)
                .map(|entry| (entry.id, entry.job.take()))
        };
        let Some((id, job)) = head else {
            return;
        };

        if let Some(job) = job {
            trace!(%id, ?key, "task started");
            job().await;
            trace!(%id, ?key, "task settled");
        }

        let drained = {
            let mut guard = lock(&queues);
            match guard.get_mut(&key) {
                Some(queue) => {
                    queue.pop_front();
                    if queue.is_empty() {
                        guard.remove(&key);
                        true
                    } else {
                        false
                    }
                }
                None => true,
            }
        };
        if drained {
            debug!(?key, "queue drained");
            return;
        }
    }
}
