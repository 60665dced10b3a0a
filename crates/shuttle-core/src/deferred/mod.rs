//! Deferred value: a settle-once future with optional timeout.
//!
//! # 構成
//! - [`Deferred`]: the owning side. A plain [`Future`], so it composes with
//!   `join_all`, `select` and friends.
//! - [`DeferredHandle`]: cloneable handle that can settle and observe the value
//!   but never takes it out.
//!
//! Every state transition (resolve, reject, timer firing) goes through a single
//! compare-and-transition under a per-instance lock, so only the first one wins.

mod state;

pub use state::DeferredState;

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::{Pin, pin};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::error::{DeferredError, ShuttleError};

enum Slot<T, E> {
    Empty,
    Ready(Result<T, DeferredError<E>>),
    Taken,
}

struct Cell<T, E> {
    state: DeferredState,
    slot: Slot<T, E>,
    timer: Option<JoinHandle<()>>,
    /// Task polling the owning [`Deferred`], if any.
    waker: Option<Waker>,
    /// Bumped on every (re)arm. A timer only fires if its generation is current.
    generation: u64,
}

impl<T, E> Cell<T, E> {
    fn clear_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn take_outcome(&mut self) -> Option<Result<T, DeferredError<E>>> {
        match std::mem::replace(&mut self.slot, Slot::Taken) {
            Slot::Ready(outcome) => Some(outcome),
            other => {
                self.slot = other;
                None
            }
        }
    }
}

impl<T, E> Drop for Cell<T, E> {
    fn drop(&mut self) {
        self.clear_timer();
    }
}

struct Shared<T, E> {
    cell: Mutex<Cell<T, E>>,
    notify: Notify,
}

impl<T, E> Shared<T, E> {
    fn lock(&self) -> MutexGuard<'_, Cell<T, E>> {
        self.cell.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, state: DeferredState, outcome: Result<T, DeferredError<E>>) -> bool {
        let mut cell = self.lock();
        cell.clear_timer();
        if !cell.state.is_pending() {
            return false;
        }
        cell.state = state;
        cell.slot = Slot::Ready(outcome);
        let waker = cell.waker.take();
        drop(cell);

        self.wake(waker);
        true
    }

    fn wake(&self, waker: Option<Waker>) {
        self.notify.notify_waiters();
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn fire_timeout(&self, generation: u64) {
        let mut cell = self.lock();
        if cell.generation != generation || !cell.state.is_pending() {
            return;
        }
        // this is the timer task itself, so just forget the handle
        cell.timer = None;
        cell.state = DeferredState::TimedOut;
        cell.slot = Slot::Ready(Err(DeferredError::TimedOut));
        let waker = cell.waker.take();
        drop(cell);

        trace!(generation, "deferred value timed out");
        self.wake(waker);
    }
}

/// (Re)arm the timer. `None` or a zero duration leaves no timer armed.
fn arm<T, E>(shared: &Arc<Shared<T, E>>, cell: &mut Cell<T, E>, timeout: Option<Duration>)
where
    T: Send + 'static,
    E: Send + 'static,
{
    cell.clear_timer();
    cell.generation += 1;

    let Some(timeout) = timeout.filter(|d| !d.is_zero()) else {
        return;
    };
    let generation = cell.generation;
    let weak = Arc::downgrade(shared);
    cell.timer = Some(tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        if let Some(shared) = weak.upgrade() {
            shared.fire_timeout(generation);
        }
    }));
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Cloneable settle/observe handle for a [`Deferred`].
pub struct DeferredHandle<T, E> {
    shared: Arc<Shared<T, E>>,
}

impl<T, E> Clone for DeferredHandle<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T, E> DeferredHandle<T, E> {
    /// Settle with a value. Returns `false` if already settled.
    pub fn resolve(&self, value: T) -> bool {
        self.shared.transition(DeferredState::Resolved, Ok(value))
    }

    /// Settle with a cause. Returns `false` if already settled.
    pub fn reject(&self, cause: E) -> bool {
        self.shared
            .transition(DeferredState::Rejected, Err(DeferredError::Rejected(cause)))
    }

    pub(crate) fn reject_panicked(&self, message: String) -> bool {
        self.shared
            .transition(DeferredState::Rejected, Err(DeferredError::Panicked(message)))
    }

    pub fn state(&self) -> DeferredState {
        self.shared.lock().state
    }

    pub fn is_pending(&self) -> bool {
        self.state().is_pending()
    }

    pub fn is_timed_out(&self) -> bool {
        self.state() == DeferredState::TimedOut
    }

    /// Wait until the value leaves `Pending`, without taking it.
    pub async fn settled(&self) -> DeferredState {
        loop {
            let mut notified = pin!(self.shared.notify.notified());
            notified.as_mut().enable();

            let state = self.state();
            if state.is_terminal() {
                return state;
            }
            notified.await;
        }
    }

    /// Drive `task` to completion and settle with its outcome.
    ///
    /// A panic inside `task` becomes [`DeferredError::Panicked`], so whoever
    /// waits on this value is never left hanging.
    pub(crate) async fn settle_with<Fut>(&self, task: Fut)
    where
        Fut: Future<Output = Result<T, E>>,
    {
        match AssertUnwindSafe(task).catch_unwind().await {
            Ok(Ok(value)) => {
                self.resolve(value);
            }
            Ok(Err(cause)) => {
                self.reject(cause);
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(%message, "task panicked");
                self.reject_panicked(message);
            }
        }
    }
}

impl<T, E> DeferredHandle<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Arm (or re-arm) the timeout. The newest call wins.
    ///
    /// Fails with [`ShuttleError::InvalidState`] once settled.
    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<(), ShuttleError> {
        let mut cell = self.shared.lock();
        if !cell.state.is_pending() {
            return Err(ShuttleError::InvalidState(cell.state));
        }
        arm(&self.shared, &mut cell, timeout);
        Ok(())
    }
}

impl<T, E> fmt::Debug for DeferredHandle<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredHandle")
            .field("state", &self.state())
            .finish()
    }
}

/// Type-erased view of a deferred value, used where entries of different
/// value types share one collection.
#[async_trait]
pub trait Settle: Send + Sync {
    async fn settled(&self) -> DeferredState;
}

#[async_trait]
impl<T, E> Settle for DeferredHandle<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    async fn settled(&self) -> DeferredState {
        DeferredHandle::settled(self).await
    }
}

/// A settle-once future.
///
/// Polling again after it returned `Ready` stays `Pending`.
///
/// # 使用例
/// ```ignore
/// let deferred = Deferred::<u32, String>::with_timeout(Some(Duration::from_secs(1)));
/// let handle = deferred.handle();
/// tokio::spawn(async move { handle.resolve(42); });
/// assert_eq!(deferred.await, Ok(42));
/// ```
pub struct Deferred<T, E> {
    handle: DeferredHandle<T, E>,
}

impl<T, E> Deferred<T, E> {
    pub fn new() -> Self {
        let cell = Cell {
            state: DeferredState::Pending,
            slot: Slot::Empty,
            timer: None,
            waker: None,
            generation: 0,
        };
        Self {
            handle: DeferredHandle {
                shared: Arc::new(Shared {
                    cell: Mutex::new(cell),
                    notify: Notify::new(),
                }),
            },
        }
    }

    pub fn handle(&self) -> DeferredHandle<T, E> {
        self.handle.clone()
    }

    pub fn resolve(&self, value: T) -> bool {
        self.handle.resolve(value)
    }

    pub fn reject(&self, cause: E) -> bool {
        self.handle.reject(cause)
    }

    pub fn state(&self) -> DeferredState {
        self.handle.state()
    }

    pub fn is_timed_out(&self) -> bool {
        self.handle.is_timed_out()
    }

    /// Wait for settlement and take the outcome.
    pub async fn wait(self) -> Result<T, DeferredError<E>> {
        self.await
    }
}

impl<T, E> Deferred<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Create a deferred value with its timer already armed.
    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        let deferred = Self::new();
        let shared = &deferred.handle.shared;
        let mut cell = shared.lock();
        arm(shared, &mut cell, timeout);
        drop(cell);
        deferred
    }

    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<(), ShuttleError> {
        self.handle.set_timeout(timeout)
    }

    /// Start `task` right away on the runtime and settle with its outcome.
    pub fn spawn<Fut>(task: Fut, timeout: Option<Duration>) -> Self
    where
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let deferred = Self::with_timeout(timeout);
        let handle = deferred.handle();
        tokio::spawn(async move { handle.settle_with(task).await });
        deferred
    }
}

impl<T, E> Default for Deferred<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> fmt::Debug for Deferred<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("state", &self.state())
            .finish()
    }
}

impl<T, E> Future for Deferred<T, E> {
    type Output = Result<T, DeferredError<E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut cell = self.handle.shared.lock();
        if let Some(outcome) = cell.take_outcome() {
            return Poll::Ready(outcome);
        }
        match &mut cell.waker {
            Some(waker) if waker.will_wake(cx.waker()) => {}
            slot => *slot = Some(cx.waker().clone()),
        }
        Poll::Pending
    }
}
