//! shuttle-core
//!
//! Async coordination primitives on top of Tokio.
//!
//! # モジュール構成
//! - **deferred**: externally settled value with an optional, resettable timeout
//! - **batch**: bounded-concurrency map with input-ordered results
//! - **keyed**: per-key FIFO execution, different keys run in parallel
//! - **latest**: latest-wins scheduler (one running, one pending)
//! - **retry**: retry with capped exponential backoff
//! - **config**: serde configuration for the above
//! - **observability**: queue snapshots
//!
//! # 使用例
//! ```no_run
//! use std::time::Duration;
//! use shuttle_core::{Deferred, KeyedExecutor};
//!
//! # async fn demo() {
//! let executor = KeyedExecutor::new();
//! let first = executor.execute("user-1", || async { Ok::<_, String>(1) });
//! let second = executor.execute("user-1", || async { Ok::<_, String>(2) });
//! assert_eq!(first.await, Ok(1));
//! assert_eq!(second.await, Ok(2));
//!
//! let slow = Deferred::<u32, String>::with_timeout(Some(Duration::from_millis(10)));
//! assert!(slow.await.unwrap_err().is_timed_out());
//! # }
//! ```

pub mod batch;
pub mod config;
pub mod deferred;
pub mod error;
pub mod ids;
pub mod keyed;
pub mod latest;
pub mod observability;
pub mod retry;

pub use batch::{BatchConfig, DEFAULT_CONCURRENCY};
pub use config::ShuttleConfig;
pub use deferred::{Deferred, DeferredHandle, DeferredState, Settle};
pub use error::{DeferredError, ShuttleError};
pub use ids::TaskId;
pub use keyed::KeyedExecutor;
pub use latest::{LatestConfig, RunLatest, RunOutcome};
pub use observability::QueueCounts;
pub use retry::{Backoff, RetryPolicy, retry, retry_with};
