//! Rate limited, retried calls to the chain node.
//!
//! The rate limiter decides when a call may start, the retry policy decides
//! what happens when it fails. Every attempt takes a slot from the limiter.

use std::{
    future::Future,
    num::NonZeroU32,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use backon::{ExponentialBuilder, Retryable};
use error_stack::{Report, Result};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tracing::debug;

use crate::provider::CometRpcError;

/// Error contexts that know whether they are worth retrying.
pub trait RetryableContext: error_stack::Context {
    fn is_retryable(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry. Doubles on every retry.
    pub base_delay: Duration,
    /// Upper bound for the delay between attempts.
    pub max_delay: Duration,
    /// Randomize delays so that concurrent fetches don't retry in lockstep.
    pub jitter: bool,
}

/// The error returned once a call gives up.
#[derive(Debug)]
pub struct RetryError<C> {
    pub attempts: u32,
    pub report: Report<C>,
}

#[derive(Debug, Clone)]
pub struct FetcherOptions {
    /// Maximum number of requests per second sent to the node.
    pub requests_per_second: u32,
    /// Maximum number of heights fetched concurrently.
    pub parallel_fetches: usize,
    /// Deadline for one call, retries included.
    pub deadline: Duration,
    pub retry: RetryPolicy,
}

/// Wraps node calls with the shared rate limiter, the retry policy and the
/// call deadline.
pub struct Fetcher {
    limiter: Arc<DefaultDirectRateLimiter>,
    policy: RetryPolicy,
    deadline: Duration,
}

impl RetryPolicy {
    pub fn to_backoff(&self) -> ExponentialBuilder {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.base_delay)
            .with_max_delay(self.max_delay)
            .with_factor(2.0)
            .with_max_times(self.max_attempts.saturating_sub(1) as usize);

        if self.jitter {
            backoff.with_jitter()
        } else {
            backoff
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl Default for FetcherOptions {
    fn default() -> Self {
        Self {
            requests_per_second: 10,
            parallel_fetches: 10,
            deadline: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

/// Run `operation` until it succeeds, fails with a non retryable error, or
/// the policy runs out of attempts.
pub async fn with_retry<T, C, F, Fut>(
    policy: &RetryPolicy,
    mut operation: F,
) -> std::result::Result<T, RetryError<C>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, C>>,
    C: RetryableContext,
{
    let attempts = AtomicU32::new(0);

    let result = (|| {
        attempts.fetch_add(1, Ordering::Relaxed);
        operation()
    })
    .retry(policy.to_backoff())
    .when(|err: &Report<C>| err.current_context().is_retryable())
    .notify(|err: &Report<C>, delay: Duration| {
        debug!(error = %err.current_context(), delay = ?delay, "retrying after error");
    })
    .await;

    result.map_err(|report| RetryError {
        attempts: attempts.load(Ordering::Relaxed),
        report,
    })
}

impl Fetcher {
    pub fn new(options: &FetcherOptions) -> Self {
        Self {
            limiter: Arc::new(new_limiter(options.requests_per_second)),
            policy: options.retry.clone(),
            deadline: options.deadline,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Wait for a slot from the shared rate limiter.
    ///
    /// Calls that bypass `fetch` must go through this before hitting the node.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    pub async fn fetch<T, F, Fut>(
        &self,
        mut operation: F,
    ) -> std::result::Result<T, RetryError<CometRpcError>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CometRpcError>>,
    {
        let attempts = AtomicU32::new(0);
        let limiter = &self.limiter;

        let request = with_retry(&self.policy, || {
            attempts.fetch_add(1, Ordering::Relaxed);
            let call = operation();
            async move {
                limiter.until_ready().await;
                call.await
            }
        });

        match tokio::time::timeout(self.deadline, request).await {
            Ok(result) => result,
            Err(_) => Err(RetryError {
                attempts: attempts.load(Ordering::Relaxed).max(1),
                report: Report::new(CometRpcError::Timeout)
                    .attach_printable(format!("deadline of {:?} exceeded", self.deadline)),
            }),
        }
    }
}

/// Evenly spaced requests: at most `rate_limit + 1` in any one second window.
fn new_limiter(rate_limit: u32) -> DefaultDirectRateLimiter {
    let rate = NonZeroU32::new(rate_limit).unwrap_or(NonZeroU32::MIN);
    let quota = Quota::per_second(rate).allow_burst(NonZeroU32::MIN);
    RateLimiter::direct(quota)
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicU32, Ordering},
            Arc, Mutex,
        },
        time::{Duration, Instant},
    };

    use assert_matches::assert_matches;
    use error_stack::Report;

    use crate::provider::CometRpcError;

    use super::{with_retry, Fetcher, FetcherOptions, RetryPolicy};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: false,
        }
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_errors() {
        let calls = AtomicU32::new(0);

        let result = with_retry(&fast_policy(3), || async {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call < 3 {
                Err(Report::new(CometRpcError::ServerError))
            } else {
                Ok(call)
            }
        })
        .await;

        assert_matches!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let result: Result<(), _> = with_retry(&fast_policy(3), || async {
            Err(Report::new(CometRpcError::Timeout))
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(err.report.current_context(), &CometRpcError::Timeout);
    }

    #[tokio::test]
    async fn test_retry_does_not_retry_not_found() {
        let result: Result<(), _> = with_retry(&fast_policy(5), || async {
            Err(Report::new(CometRpcError::NotFound))
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 1);
    }

    #[tokio::test]
    async fn test_fetch_deadline_covers_all_retries() {
        let options = FetcherOptions {
            requests_per_second: 1000,
            parallel_fetches: 1,
            deadline: Duration::from_millis(50),
            retry: fast_policy(100),
        };
        let fetcher = Fetcher::new(&options);

        let started = Instant::now();
        let result: Result<(), _> = fetcher
            .fetch(|| async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Err(Report::new(CometRpcError::Request))
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.report.current_context(), &CometRpcError::Timeout);
        assert!(err.attempts >= 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_fetch_respects_rate_limit() {
        let rate = 5;
        let options = FetcherOptions {
            requests_per_second: rate,
            parallel_fetches: 16,
            deadline: Duration::from_secs(30),
            retry: fast_policy(1),
        };
        let fetcher = Arc::new(Fetcher::new(&options));
        let issued = Arc::new(Mutex::new(Vec::new()));

        let calls = (0..16).map(|_| {
            let fetcher = fetcher.clone();
            let issued = issued.clone();
            async move {
                fetcher
                    .fetch(|| {
                        let issued = issued.clone();
                        async move {
                            issued.lock().unwrap().push(Instant::now());
                            Ok::<_, Report<CometRpcError>>(())
                        }
                    })
                    .await
            }
        });

        let results = futures::future::join_all(calls).await;
        assert!(results.iter().all(|r| r.is_ok()));

        let mut issued = issued.lock().unwrap().clone();
        issued.sort();
        assert_eq!(issued.len(), 16);

        for (i, start) in issued.iter().enumerate() {
            let in_window = issued[i..]
                .iter()
                .take_while(|t| t.duration_since(*start) < Duration::from_secs(1))
                .count();
            assert!(
                in_window <= rate as usize + 1,
                "{in_window} requests within one second"
            );
        }
    }
}
