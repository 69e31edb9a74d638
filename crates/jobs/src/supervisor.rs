use std::{fmt::Display, future::Future, sync::Arc, time::Duration};

use anyhow::{Result, bail};

use crate::{Outcome, Worker, backoff};

/// Calls `connect` until it succeeds, sleeping with a capped exponential backoff between
/// attempts. Returns `None` when `shutdown` completes first.
pub async fn connect_with_backoff<T, E, F, Fut>(
    mut connect: F,
    max_backoff: Duration,
    shutdown: impl Future<Output = ()>,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    tokio::pin!(shutdown);
    let mut attempt = 0u32;
    loop {
        let result = tokio::select! {
            _ = &mut shutdown => return None,
            result = connect() => result,
        };
        match result {
            Ok(value) => return Some(value),
            Err(e) => {
                let delay = backoff(attempt, max_backoff);
                tracing::error!("Failed to connect: {} (retry in {:?})", e, delay);
                attempt = attempt.saturating_add(1);
                tokio::select! {
                    _ = &mut shutdown => return None,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Hosts a worker: each unit of work runs in its own task so that a panic ends only that unit,
/// and broker errors are retried with a capped exponential backoff. With `once`, returns after
/// the first message has been handled.
pub async fn run_supervised(
    worker: Arc<Worker>,
    max_backoff: Duration,
    once: bool,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    tokio::pin!(shutdown);
    let mut attempt = 0u32;
    let mut prepared = false;
    tracing::info!(
        "Starting {} worker on {} as {}",
        worker.kind(),
        worker.stream(),
        worker.consumer()
    );
    loop {
        if !prepared {
            match worker.prepare().await {
                Ok(()) => prepared = true,
                Err(e) => {
                    let delay = backoff(attempt, max_backoff);
                    tracing::error!(
                        "Failed to prepare consumer group: {} (retry in {:?})",
                        e,
                        delay
                    );
                    attempt = attempt.saturating_add(1);
                    tokio::select! {
                        _ = &mut shutdown => break,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            }
        }

        let mut task = tokio::spawn({
            let worker = worker.clone();
            async move { worker.process_one().await }
        });
        let joined = tokio::select! {
            joined = &mut task => joined,
            _ = &mut shutdown => {
                tracing::info!("Shutdown requested, waiting for the current unit of work");
                let joined = task.await;
                if let Ok(Ok(outcome)) = &joined {
                    tracing::info!("Last unit of work ended: {:?}", outcome);
                }
                break;
            }
        };
        match joined {
            Ok(Ok(Outcome::Idle)) => attempt = 0,
            Ok(Ok(outcome)) => {
                attempt = 0;
                tracing::info!("Unit of work ended: {:?}", outcome);
                if once {
                    tracing::info!("Job complete, exiting");
                    return Ok(());
                }
            }
            Ok(Err(e)) => {
                let delay = backoff(attempt, max_backoff);
                tracing::error!("Broker error: {} (retry in {:?})", e, delay);
                attempt = attempt.saturating_add(1);
                // A missing group (e.g. the stream was deleted) is recreated on the next pass.
                prepared = e.is_connection();
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => {
                let what = if e.is_panic() { "panicked" } else { "was cancelled" };
                tracing::error!("Unit of work {}: {}", what, e);
                if once {
                    bail!("Unit of work {}", what);
                }
                // The entry stays pending until it is reclaimed.
                let delay = backoff(attempt, max_backoff);
                attempt = attempt.saturating_add(1);
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    tracing::info!("Worker stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::time::Instant;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_until_available() {
        let attempts = AtomicU32::new(0);
        let connect = || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            async move { if attempt < 3 { Err("Connection refused") } else { Ok(attempt) } }
        };
        let started = Instant::now();
        let connected =
            connect_with_backoff(connect, Duration::from_secs(30), std::future::pending()).await;
        assert_eq!(connected, Some(3));
        assert_eq!(started.elapsed(), Duration::from_secs(1 + 2 + 4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_gives_up_on_shutdown() {
        let connect = || async { Err::<(), _>("Connection refused") };
        let shutdown = tokio::time::sleep(Duration::from_secs(10));
        let started = Instant::now();
        assert_eq!(connect_with_backoff(connect, Duration::from_secs(2), shutdown).await, None);
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }
}
