//! Latest-wins ("run last") scheduler.
//!
//! # スロット
//! - `running`: the task currently executing. Never preempted.
//! - `pending`: at most one task waiting for `running` to finish. A newer
//!   submission displaces it, and the displaced task resolves
//!   [`RunOutcome::Ignored`] without ever starting.
//!
//! A task's timeout is armed when it is promoted to `running`, not when it is
//! submitted. A timed-out task keeps running in the background; its late
//! result is dropped and the next pending task is promoted right away.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::deferred::{Deferred, DeferredHandle};
use crate::error::DeferredError;
use crate::ids::TaskId;

/// Result of a latest-wins run. Task failures are reported as errors instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "result", rename_all = "snake_case")]
pub enum RunOutcome<T> {
    Success(T),
    /// Displaced by a newer submission before it started.
    Ignored,
    TimedOut,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatestConfig {
    /// Applied to runs without their own timeout. `None` or 0 means no timeout.
    #[serde(rename = "default_timeout_ms", with = "crate::config::millis_opt")]
    pub default_timeout: Option<Duration>,
}

type Task<T, E> = Box<dyn FnOnce() -> BoxFuture<'static, Result<T, E>> + Send>;
type RunHandle<T, E> = DeferredHandle<RunOutcome<T>, E>;

struct PendingRun<T, E> {
    id: TaskId,
    task: Task<T, E>,
    timeout: Option<Duration>,
    handle: RunHandle<T, E>,
}

struct Slots<T, E> {
    running: Option<RunHandle<T, E>>,
    pending: Option<PendingRun<T, E>>,
}

fn lock<T, E>(slots: &Mutex<Slots<T, E>>) -> MutexGuard<'_, Slots<T, E>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Move `pending` into `running` and start it. Caller must hold the lock and
/// have checked that `running` is empty.
fn promote<T, E>(
    slots: &mut Slots<T, E>,
    default_timeout: Option<Duration>,
) -> Option<RunHandle<T, E>>
where
    T: Send + 'static,
    E: Send + 'static,
{
    let next = slots.pending.take()?;
    let timeout = next.timeout.or(default_timeout);
    if let Err(err) = next.handle.set_timeout(timeout) {
        warn!(id = %next.id, %err, "could not arm timeout for promoted run");
    }
    debug!(id = %next.id, ?timeout, "run promoted");

    slots.running = Some(next.handle.clone());
    let handle = next.handle.clone();
    let task = next.task;
    tokio::spawn(async move {
        handle
            .settle_with(async move { task().await.map(RunOutcome::Success) })
            .await;
    });
    Some(next.handle)
}

/// Wait for the running slot to settle, then promote whatever is pending.
/// Exits once nothing is left to promote.
async fn supervise<T, E>(
    slots: Arc<Mutex<Slots<T, E>>>,
    mut running: RunHandle<T, E>,
    default_timeout: Option<Duration>,
) where
    T: Send + 'static,
    E: Send + 'static,
{
    loop {
        let state = running.settled().await;
        trace!(%state, "running slot settled");

        let next = {
            let mut slots = lock(&slots);
            slots.running = None;
            promote(&mut slots, default_timeout)
        };
        match next {
            Some(handle) => running = handle,
            None => return,
        }
    }
}

/// Runs only the most recent submission once the current one finishes.
///
/// # 使用例
/// ```ignore
/// let search = RunLatest::with_default_timeout(Duration::from_secs(2));
/// let outcome = search.run(move || query(text), None).await?;
/// ```
pub struct RunLatest<T, E> {
    slots: Arc<Mutex<Slots<T, E>>>,
    default_timeout: Option<Duration>,
}

impl<T, E> Clone for RunLatest<T, E> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
            default_timeout: self.default_timeout,
        }
    }
}

impl<T, E> Default for RunLatest<T, E> {
    fn default() -> Self {
        Self {
            slots: Arc::new(Mutex::new(Slots {
                running: None,
                pending: None,
            })),
            default_timeout: None,
        }
    }
}

impl<T, E> RunLatest<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// A zero duration means no default timeout.
    pub fn with_default_timeout(timeout: Duration) -> Self {
        Self {
            default_timeout: Some(timeout).filter(|d| !d.is_zero()),
            ..Self::default()
        }
    }

    pub fn from_config(config: &LatestConfig) -> Self {
        config
            .default_timeout
            .map_or_else(Self::new, Self::with_default_timeout)
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    /// No task running and none waiting.
    pub fn is_idle(&self) -> bool {
        let slots = lock(&self.slots);
        slots.running.is_none() && slots.pending.is_none()
    }

    /// Submit `task`.
    ///
    /// `timeout` overrides the scheduler default for this run; `Some(Duration::ZERO)`
    /// runs without any timeout. The submission takes effect before this
    /// returns. Must be called from within a Tokio runtime.
    pub fn run<F, Fut>(
        &self,
        task: F,
        timeout: Option<Duration>,
    ) -> BoxFuture<'static, Result<RunOutcome<T>, DeferredError<E>>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let deferred = Deferred::new();
        let id = TaskId::generate();
        let submission = PendingRun {
            id,
            task: Box::new(move || task().boxed()),
            timeout,
            handle: deferred.handle(),
        };

        let started = {
            let mut slots = lock(&self.slots);
            if let Some(displaced) = slots.pending.replace(submission) {
                debug!(id = %displaced.id, by = %id, "pending run ignored");
                displaced.handle.resolve(RunOutcome::Ignored);
            }
            if slots.running.is_none() {
                promote(&mut slots, self.default_timeout)
            } else {
                trace!(%id, "run waiting for running slot");
                None
            }
        };
        if let Some(running) = started {
            tokio::spawn(supervise(
                Arc::clone(&self.slots),
                running,
                self.default_timeout,
            ));
        }

        async move {
            match deferred.await {
                Err(DeferredError::TimedOut) => Ok(RunOutcome::TimedOut),
                other => other,
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use futures::future::join_all;
    use tokio::time::{Instant, sleep, timeout};

    use super::*;

    type Outcome = Result<RunOutcome<u32>, DeferredError<String>>;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn after(delay: u64, value: u32) -> impl FnOnce() -> BoxFuture<'static, Result<u32, String>> {
        move || {
            async move {
                sleep(ms(delay)).await;
                Ok(value)
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn middle_submission_is_ignored() {
        let latest = RunLatest::<u32, String>::new();
        let results: (Outcome, Outcome, Outcome) = tokio::join!(
            latest.run(|| async { Ok(1) }, None),
            latest.run(|| async { Ok(2) }, None),
            latest.run(|| async { Ok(3) }, None),
        );

        assert_eq!(
            results,
            (
                Ok(RunOutcome::Success(1)),
                Ok(RunOutcome::Ignored),
                Ok(RunOutcome::Success(3)),
            )
        );
    }

    #[tokio::test(start_paused = true)]
    async fn per_run_timeouts() {
        let latest = RunLatest::<u32, String>::new();
        let results: (Outcome, Outcome, Outcome) = tokio::join!(
            latest.run(after(50, 1), Some(ms(30))),
            latest.run(after(70, 2), Some(ms(50))),
            latest.run(after(50, 3), Some(Duration::ZERO)),
        );

        assert_eq!(
            results,
            (
                Ok(RunOutcome::TimedOut),
                Ok(RunOutcome::Ignored),
                Ok(RunOutcome::Success(3)),
            )
        );
    }

    #[tokio::test(start_paused = true)]
    async fn default_timeout_applies_without_override() {
        let latest = RunLatest::<u32, String>::with_default_timeout(ms(50));
        let results: (Outcome, Outcome, Outcome) = tokio::join!(
            latest.run(after(30, 1), None),
            latest.run(after(30, 2), None),
            latest.run(after(70, 3), None),
        );

        assert_eq!(
            results,
            (
                Ok(RunOutcome::Success(1)),
                Ok(RunOutcome::Ignored),
                Ok(RunOutcome::TimedOut),
            )
        );
    }

    #[tokio::test(start_paused = true)]
    async fn zero_override_disables_default_timeout() {
        let latest = RunLatest::<u32, String>::with_default_timeout(ms(50));
        let results: (Outcome, Outcome, Outcome) = tokio::join!(
            latest.run(after(30, 1), Some(ms(50))),
            latest.run(after(30, 2), None),
            latest.run(after(80, 3), Some(Duration::ZERO)),
        );

        assert_eq!(
            results,
            (
                Ok(RunOutcome::Success(1)),
                Ok(RunOutcome::Ignored),
                Ok(RunOutcome::Success(3)),
            )
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_armed_on_promotion_not_submission() {
        let latest = RunLatest::<u32, String>::new();
        let first = latest.run(after(100, 1), None);
        // waits 100ms behind `first`, then has 50ms of its own
        let second = latest.run(after(30, 2), Some(ms(50)));

        assert_eq!(first.await, Ok(RunOutcome::Success(1)));
        assert_eq!(second.await, Ok(RunOutcome::Success(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn running_task_is_never_preempted() {
        let latest = RunLatest::<u32, String>::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        let start = Instant::now();

        let shared_log = Arc::clone(&log);
        let record = move |name: &'static str, delay: u64, value: u32| {
            let log = Arc::clone(&shared_log);
            move || async move {
                log.lock().unwrap().push((name, "start", start.elapsed()));
                sleep(ms(delay)).await;
                log.lock().unwrap().push((name, "end", start.elapsed()));
                Ok::<_, String>(value)
            }
        };

        let a = latest.run(record("a", 100, 1), None);
        sleep(ms(10)).await;
        let b = latest.run(record("b", 10, 2), None);

        assert_eq!(a.await, Ok(RunOutcome::Success(1)));
        assert_eq!(b.await, Ok(RunOutcome::Success(2)));
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                ("a", "start", ms(0)),
                ("a", "end", ms(100)),
                ("b", "start", ms(100)),
                ("b", "end", ms(110)),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_run_frees_the_slot_immediately() {
        let latest = RunLatest::<u32, String>::new();
        let first = latest.run(after(100, 1), Some(ms(20)));
        let second = latest.run(after(10, 2), None);

        let start = Instant::now();
        assert_eq!(first.await, Ok(RunOutcome::TimedOut));
        assert_eq!(second.await, Ok(RunOutcome::Success(2)));
        assert_eq!(start.elapsed(), ms(30));
    }

    #[tokio::test]
    async fn task_failure_is_an_error_and_does_not_stall() {
        let latest = RunLatest::<u32, String>::new();
        let failed = latest.run(|| async { Err("boom".to_string()) }, None).await;
        assert_eq!(failed, Err(DeferredError::Rejected("boom".to_string())));

        let next = latest.run(|| async { Ok(4) }, None).await;
        assert_eq!(next, Ok(RunOutcome::Success(4)));
    }

    async fn explode() -> Result<u32, String> {
        panic!("run exploded")
    }

    #[tokio::test]
    async fn panicking_run_does_not_stall() {
        let latest = RunLatest::<u32, String>::new();
        let failed = latest.run(explode, None).await;
        assert!(matches!(failed, Err(DeferredError::Panicked(_))));

        let next = latest.run(|| async { Ok(5) }, None).await;
        assert_eq!(next, Ok(RunOutcome::Success(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn becomes_idle_after_last_run() {
        let latest = RunLatest::<u32, String>::new();
        assert!(latest.is_idle());

        let run = latest.run(after(10, 1), None);
        assert!(!latest.is_idle());
        run.await.unwrap();

        tokio::task::yield_now().await;
        assert!(latest.is_idle());
    }

    #[test]
    fn config_maps_to_default_timeout() {
        let config = LatestConfig {
            default_timeout: Some(ms(250)),
        };
        let latest = RunLatest::<u32, String>::from_config(&config);
        assert_eq!(latest.default_timeout(), Some(ms(250)));

        let latest = RunLatest::<u32, String>::with_default_timeout(Duration::ZERO);
        assert_eq!(latest.default_timeout(), None);
    }

    #[test]
    fn outcome_serializes_with_state_tag() {
        let json = serde_json::to_value(RunOutcome::Success(1)).unwrap();
        assert_eq!(json, serde_json::json!({ "state": "success", "result": 1 }));

        let json = serde_json::to_value(RunOutcome::<u32>::Ignored).unwrap();
        assert_eq!(json, serde_json::json!({ "state": "ignored" }));

        let json = serde_json::to_value(RunOutcome::<u32>::TimedOut).unwrap();
        assert_eq!(json, serde_json::json!({ "state": "timed_out" }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_submitters_never_overlap() {
        let latest = RunLatest::<usize, String>::new();
        let busy = Arc::new(AtomicBool::new(false));
        let overlaps = Arc::new(AtomicUsize::new(0));

        let submitters: Vec<_> = (0..8usize)
            .map(|s| {
                let latest = latest.clone();
                let busy = Arc::clone(&busy);
                let overlaps = Arc::clone(&overlaps);
                tokio::spawn(async move {
                    let mut runs = Vec::new();
                    for n in 0..100usize {
                        let busy = Arc::clone(&busy);
                        let overlaps = Arc::clone(&overlaps);
                        runs.push(latest.run(
                            move || async move {
                                if busy.swap(true, Ordering::SeqCst) {
                                    overlaps.fetch_add(1, Ordering::SeqCst);
                                }
                                tokio::task::yield_now().await;
                                busy.store(false, Ordering::SeqCst);
                                Ok(s * 1000 + n)
                            },
                            None,
                        ));
                        if n % 10 == 0 {
                            tokio::task::yield_now().await;
                        }
                    }
                    join_all(runs).await
                })
            })
            .collect();

        let mut outcomes = Vec::new();
        for submitter in join_all(submitters).await {
            outcomes.extend(submitter.unwrap());
        }

        assert_eq!(outcomes.len(), 800);
        assert!(outcomes.iter().all(Result::is_ok));
        let succeeded = outcomes
            .iter()
            .filter(|outcome| matches!(outcome, Ok(RunOutcome::Success(_))))
            .count();
        assert!(succeeded >= 1);
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);

        timeout(Duration::from_secs(5), async {
            while !latest.is_idle() {
                sleep(ms(1)).await;
            }
        })
        .await
        .expect("scheduler became idle");
    }
}
