use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use quorum_core::context::LlmContext;
use quorum_core::errors::GatewayError;
use quorum_core::provider::{EventStream, LlmProvider, StreamOptions};
use quorum_core::retry::{RetryPolicy, RetryVerdict};

/// Suspends the current task between retry attempts.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Production sleeper backed by the tokio timer.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Run `op` until it succeeds, `classify` gives up on its error, or
/// `policy.max_retries` retries have been spent.
///
/// Only rate-limit class errors are retried; every other error is returned
/// after the first attempt without sleeping. After `max_retries + 1` failed
/// attempts the last error is returned.
pub async fn retry_call<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    classify: C,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> RetryVerdict,
    E: Display,
{
    let mut attempt = 0u32;
    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let suggested = match classify(&err) {
            RetryVerdict::GiveUp => return Err(err),
            RetryVerdict::Retry { suggested } => suggested,
        };

        if attempt >= policy.max_retries {
            warn!(
                attempts = attempt + 1,
                error = %err,
                "rate limit retries exhausted"
            );
            return Err(err);
        }

        let delay = policy.delay(attempt, suggested, rand::random::<f64>());
        warn!(
            attempt = attempt + 1,
            max_retries = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "rate limited, retrying"
        );
        sleeper.sleep(delay).await;
        attempt += 1;
    }
}

/// Wraps an [`LlmProvider`] so that each `stream` call (one chat-completion
/// round trip) is retried on rate-limit errors.
///
/// Retries happen only while opening the stream. Once a stream has been
/// handed to the caller its events pass through untouched, so a multi-turn
/// tool loop built on top is never replayed.
pub struct ReliableProvider<P: LlmProvider> {
    inner: P,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    total_retries: AtomicU64,
}

impl<P: LlmProvider> ReliableProvider<P> {
    pub fn new(inner: P, policy: RetryPolicy) -> Self {
        Self::with_sleeper(inner, policy, Arc::new(TokioSleeper))
    }

    pub fn with_sleeper(inner: P, policy: RetryPolicy, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            inner,
            policy,
            sleeper,
            total_retries: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(inner: P) -> Self {
        Self::new(inner, RetryPolicy::default())
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl<P: LlmProvider> LlmProvider for ReliableProvider<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    fn supports_tools(&self) -> bool {
        self.inner.supports_tools()
    }

    async fn stream(
        &self,
        context: &LlmContext,
        options: &StreamOptions,
    ) -> Result<EventStream, GatewayError> {
        let attempts = AtomicU32::new(0);
        let result = retry_call(
            &self.policy,
            self.sleeper.as_ref(),
            GatewayError::retry_verdict,
            || {
                attempts.fetch_add(1, Ordering::Relaxed);
                self.inner.stream(context, options)
            },
        )
        .await;

        let retries = attempts.load(Ordering::Relaxed).saturating_sub(1);
        self.total_retries
            .fetch_add(u64::from(retries), Ordering::Relaxed);
        result
    }
}
