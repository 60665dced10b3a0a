use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::time::{Duration, Instant, sleep};
use tracing::info;
use tracing_subscriber::EnvFilter;

use shuttle_core::{
    Deferred, KeyedExecutor, RetryPolicy, RunLatest, ShuttleConfig, ShuttleError, retry_with,
};

/// Fails a fixed number of times, then greets.
struct FlakyGreeter {
    remaining_failures: AtomicU32,
}

impl FlakyGreeter {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }

    async fn greet(&self, name: &str) -> Result<String, String> {
        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(format!("intentional failure (left={left})"));
        }
        Ok(format!("Hello, {name}!"))
    }
}

/// Config from the path given as first argument, if any.
fn load_config() -> Result<Option<ShuttleConfig>, Box<dyn Error>> {
    let Some(path) = std::env::args().nth(1) else {
        return Ok(None);
    };
    let json = std::fs::read_to_string(&path)?;
    let config = ShuttleConfig::from_json(&json)?;
    info!(%path, "config loaded");
    Ok(Some(config))
}

/// Shortens the retry interval for the demo unless a config file set one.
fn demo_retry_policy(config: &ShuttleConfig, from_file: bool) -> RetryPolicy {
    if from_file {
        config.retry.clone()
    } else {
        config.retry.clone().with_interval(Duration::from_millis(50))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // (A) 設定
    let loaded = load_config()?;
    let from_file = loaded.is_some();
    let config = loaded.unwrap_or_default();
    println!("config: {}", serde_json::to_string(&config)?);

    // (B) deferred: 外部から resolve、もう一つは timeout
    let greeting = Deferred::<&str, String>::new();
    let handle = greeting.handle();
    tokio::spawn(async move {
        sleep(Duration::from_millis(20)).await;
        handle.resolve("resolved from another task");
    });
    println!("deferred: {:?}", greeting.await);

    let slow = Deferred::<(), String>::with_timeout(Some(Duration::from_millis(30)));
    println!("deferred with timeout: {:?}", slow.await);

    // (C) batch: 上限付き並行 map
    let start = Instant::now();
    let doubled = config
        .batch
        .map(1..=10u64, |x| async move {
            sleep(Duration::from_millis(10 * (11 - x))).await;
            Ok::<_, String>(x * 2)
        })
        .await?;
    println!("batch: {doubled:?} in {:?}", start.elapsed());

    // (D) keyed: 同一キーは直列、別キーは並行
    let executor = KeyedExecutor::new();
    let mut pending = Vec::new();
    for (key, n) in [("alpha", 1u32), ("beta", 1), ("alpha", 2), ("beta", 2), ("alpha", 3)] {
        pending.push(executor.execute(key, move || async move {
            sleep(Duration::from_millis(15)).await;
            Ok::<_, String>(format!("{key}#{n}"))
        }));
    }
    println!("keyed counts: {}", serde_json::to_string(&executor.counts())?);
    for deferred in pending {
        println!("keyed: {:?}", deferred.await);
    }
    executor.wait_all_idle().await;

    // (E) latest-wins: 中間の投入は Ignored になる
    let latest = RunLatest::<&str, String>::from_config(&config.latest);
    let runs = [("first", 40u64), ("middle", 10), ("last", 10)].map(|(name, ms)| {
        latest.run(
            move || async move {
                sleep(Duration::from_millis(ms)).await;
                Ok(name)
            },
            None,
        )
    });
    for run in runs {
        println!("latest: {}", serde_json::to_string(&run.await?)?);
    }

    // (F) retry: 2 回失敗してから成功
    let greeter = Arc::new(FlakyGreeter::new(2));
    let policy = demo_retry_policy(&config, from_file);
    let greeted = retry_with(
        || {
            let greeter = Arc::clone(&greeter);
            async move { greeter.greet("shuttle").await }
        },
        &policy,
        |cause, attempt| {
            println!("attempt {attempt} failed: {cause}");
            std::future::ready(())
        },
    )
    .await;
    match greeted {
        Ok(msg) => println!("retry: {msg}"),
        Err(ShuttleError::RetryExhausted { attempts }) => {
            println!("retry: gave up after {attempts} attempts")
        }
        Err(e) => return Err(e.into()),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_interval_is_kept() {
        let config = ShuttleConfig::from_json(r#"{"retry": {"interval_ms": 200}}"#).unwrap();
        let policy = demo_retry_policy(&config, true);
        assert_eq!(policy.interval, Duration::from_millis(200));
        assert_eq!(policy, config.retry);
    }

    #[test]
    fn default_interval_is_shortened_for_the_demo() {
        let policy = demo_retry_policy(&ShuttleConfig::default(), false);
        assert_eq!(policy.interval, Duration::from_millis(50));
        assert_eq!(policy.max_retries, None);
    }
}
