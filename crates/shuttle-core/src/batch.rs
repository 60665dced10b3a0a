//! Bounded-concurrency map.
//!
//! # 実行モデル
//! - At most `limit` task futures are in flight; each completion pulls the next
//!   not-yet-started input.
//! - Results come back in input order, whatever the completion order.
//! - The first failure stops new dispatch. Tasks already in flight are still
//!   driven to completion and their results discarded, then the first error
//!   is returned.
//!
//! Everything runs inside the caller's task (no spawning), so `f` and its
//! futures do not need to be `'static`.

use std::future::Future;

use futures::FutureExt;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Concurrency cap used when nothing else is configured.
pub const DEFAULT_CONCURRENCY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_concurrency: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

/// Apply `f` to every input with at most `limit` calls outstanding.
///
/// A `limit` of 0 is treated as 1.
pub async fn map<I, F, Fut, U, E>(inputs: I, mut f: F, limit: usize) -> Result<Vec<U>, E>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Fut,
    Fut: Future<Output = Result<U, E>>,
{
    let limit = limit.max(1);
    let mut inputs = inputs.into_iter().enumerate().peekable();
    if inputs.peek().is_none() {
        return Ok(Vec::new());
    }

    let mut dispatch =
        |(index, input): (usize, I::Item)| f(input).map(move |outcome| (index, outcome));

    let mut in_flight = FuturesUnordered::new();
    for item in inputs.by_ref().take(limit) {
        in_flight.push(dispatch(item));
    }
    trace!(started = in_flight.len(), limit, "batch started");

    let mut done = Vec::new();
    let mut first_error = None;
    while let Some((index, outcome)) = in_flight.next().await {
        match outcome {
            Ok(value) => {
                done.push((index, value));
                if first_error.is_none()
                    && let Some(item) = inputs.next()
                {
                    in_flight.push(dispatch(item));
                }
            }
            Err(err) => {
                if first_error.is_none() {
                    debug!(
                        index,
                        in_flight = in_flight.len(),
                        "batch task failed, no further dispatch"
                    );
                    first_error = Some(err);
                }
            }
        }
    }

    if let Some(err) = first_error {
        return Err(err);
    }
    done.sort_unstable_by_key(|(index, _)| *index);
    Ok(done.into_iter().map(|(_, value)| value).collect())
}

/// [`map`] over zero-argument task closures.
pub async fn run<I, F, Fut, U, E>(tasks: I, limit: usize) -> Result<Vec<U>, E>
where
    I: IntoIterator<Item = F>,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<U, E>>,
{
    map(tasks, |task| task(), limit).await
}

impl BatchConfig {
    pub async fn map<I, F, Fut, U, E>(&self, inputs: I, f: F) -> Result<Vec<U>, E>
    where
        I: IntoIterator,
        F: FnMut(I::Item) -> Fut,
        Fut: Future<Output = Result<U, E>>,
    {
        map(inputs, f, self.max_concurrency).await
    }

    pub async fn run<I, F, Fut, U, E>(&self, tasks: I) -> Result<Vec<U>, E>
    where
        I: IntoIterator<Item = F>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<U, E>>,
    {
        run(tasks, self.max_concurrency).await
    }
}
