//! Bounded-concurrency batch processing with transient-only retries.
//!
//! Used for independent work such as scheduled triggers across many threads.
//! Each item is isolated: a failure or panic in one never affects the others.

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::orchestrator::{Inbound, Orchestrator, TurnOutcome};

/// Default number of items processed at once
pub const DEFAULT_BATCH_CONCURRENCY: usize = 5;

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Calculate delay for a given attempt (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_secs =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        // A negative multiplier gives negative delays; retry right away
        Duration::try_from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()))
            .unwrap_or(Duration::ZERO)
    }
}

/// Batch configuration
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub concurrency: usize,
    pub retry: RetryConfig,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_BATCH_CONCURRENCY,
            retry: RetryConfig::default(),
        }
    }
}

/// Outcome of one batch item, in input order
#[derive(Debug)]
pub struct BatchItem<T> {
    pub index: usize,
    /// How many times the item ran (0 if it was cancelled before starting)
    pub attempts: u32,
    pub result: Result<T>,
}

/// Run `op`, retrying with backoff while it fails transiently.
///
/// Returns the number of attempts made alongside the final result.
pub async fn retry_transient<T, F, Fut>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut op: F,
) -> (u32, Result<T>)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Err(e) if e.is_transient() && attempt <= config.max_retries => {
                let delay = config.delay_for_attempt(attempt - 1);
                tracing::warn!(attempt, ?delay, "Transient failure, retrying: {}", e);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return (attempt, Err(Error::Cancelled)),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            result => return (attempt, result),
        }
    }
}

/// Process items with at most `config.concurrency` in flight.
///
/// Results come back in input order. Items still waiting for a slot when
/// `cancel` fires are reported as [`Error::Cancelled`].
pub async fn run_batch<I, T, F, Fut>(
    items: Vec<I>,
    config: &BatchConfig,
    cancel: CancellationToken,
    f: F,
) -> Vec<BatchItem<T>>
where
    I: Clone + Send + 'static,
    T: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let total = items.len();
    let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
    let f = Arc::new(f);
    let mut set = JoinSet::new();

    for (index, item) in items.into_iter().enumerate() {
        let semaphore = Arc::clone(&semaphore);
        let f = Arc::clone(&f);
        let retry = config.retry.clone();
        let cancel = cancel.clone();

        set.spawn(async move {
            let _permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return (index, 0, Err(Error::Cancelled)),
                permit = semaphore.acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => return (index, 0, Err(Error::Cancelled)),
                },
            };

            let work = retry_transient(&retry, &cancel, move || f(item.clone()));
            match AssertUnwindSafe(work).catch_unwind().await {
                Ok((attempts, result)) => (index, attempts, result),
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "panicked".to_string());
                    tracing::error!(index, "Batch item panicked: {}", message);
                    (index, 1, Err(Error::handler("batch", message)))
                }
            }
        });
    }

    let mut slots: Vec<Option<BatchItem<T>>> = (0..total).map(|_| None).collect();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((index, attempts, result)) => {
                slots[index] = Some(BatchItem {
                    index,
                    attempts,
                    result,
                });
            }
            Err(e) => tracing::error!("Batch task failed to join: {}", e),
        }
    }

    slots
        .into_iter()
        .enumerate()
        .map(|(index, slot)| {
            slot.unwrap_or(BatchItem {
                index,
                attempts: 0,
                result: Err(Error::Cancelled),
            })
        })
        .collect()
}

/// Feed independent inbound messages through one orchestrator
pub async fn handle_messages(
    orchestrator: Arc<Orchestrator>,
    inbound: Vec<Inbound>,
    config: &BatchConfig,
    cancel: CancellationToken,
) -> Vec<BatchItem<TurnOutcome>> {
    run_batch(inbound, config, cancel, move |message| {
        let orchestrator = Arc::clone(&orchestrator);
        async move { orchestrator.handle_message(message).await }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    #[test]
    fn test_delay_for_attempt() {
        let config = RetryConfig {
            max_delay: Duration::from_secs(3),
            ..Default::default()
        };
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(3));

        let negative = RetryConfig {
            backoff_multiplier: -2.0,
            ..Default::default()
        };
        assert_eq!(negative.delay_for_attempt(1), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let (attempts, result) =
            retry_transient(&RetryConfig::default(), &CancellationToken::new(), || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::Transient("503".into()))
                    } else {
                        Ok("sent")
                    }
                }
            })
            .await;
        assert_eq!(attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.unwrap(), "sent");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_are_bounded() {
        let (attempts, result) = retry_transient(
            &RetryConfig::default(),
            &CancellationToken::new(),
            || async { Err::<(), _>(Error::Transient("timeout".into())) },
        )
        .await;
        assert_eq!(attempts, 3);
        assert!(result.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn test_logic_errors_are_not_retried() {
        let (attempts, result) = retry_transient(
            &RetryConfig::default(),
            &CancellationToken::new(),
            || async { Err::<(), _>(Error::validation("s1", "missing title")) },
        )
        .await;
        assert_eq!(attempts, 1);
        assert!(matches!(result, Err(Error::Validation { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_isolates_failures_and_keeps_order() {
        let results = run_batch(
            vec![1u32, 2, 3, 4],
            &BatchConfig::default(),
            CancellationToken::new(),
            |n| async move {
                match n {
                    2 => Err(Error::handler("tasks", "boom")),
                    3 => panic!("handler bug"),
                    _ => Ok(n * 10),
                }
            },
        )
        .await;

        assert_eq!(results.len(), 4);
        assert_eq!(results.iter().map(|r| r.index).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert_eq!(*results[0].result.as_ref().unwrap(), 10);
        assert!(matches!(results[1].result, Err(Error::Handler { .. })));
        assert!(matches!(
            results[2].result,
            Err(Error::Handler { ref message, .. }) if message.contains("handler bug")
        ));
        assert_eq!(*results[3].result.as_ref().unwrap(), 40);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_respects_concurrency_limit() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let config = BatchConfig {
            concurrency: 2,
            ..Default::default()
        };
        let (i, p) = (Arc::clone(&in_flight), Arc::clone(&peak));

        let results = run_batch(vec![(); 6], &config, CancellationToken::new(), move |_| {
            let (i, p) = (Arc::clone(&i), Arc::clone(&p));
            async move {
                let now = i.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                i.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        assert!(results.iter().all(|r| r.result.is_ok()));
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancelled_batch_runs_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let results = run_batch(vec![1, 2, 3], &BatchConfig::default(), cancel, move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        assert!(results.iter().all(|r| matches!(r.result, Err(Error::Cancelled))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
