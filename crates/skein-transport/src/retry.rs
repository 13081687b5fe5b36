use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::debug;

use crate::broadcast::Broadcaster;
use crate::error::{TransportError, TransportErrorCode};

/// Hard ceiling on retries, independent of configuration. Guarantees
/// termination even under an absurd `max_retries`.
pub const MAX_RETRY_CEILING: u32 = 30;

pub type RetryPredicate = Arc<dyn Fn(&TransportError, u32, u32) -> bool + Send + Sync>;
pub type RetryCallback = Arc<dyn Fn(&TransportError, &RetryState) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RetryState {
    pub retry_count: u32,
    pub is_retrying: bool,
    pub next_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    pub use_backoff: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
            use_backoff: true,
        }
    }
}

/// Never retry a cancelled operation; retry network, timeout, and
/// server-class HTTP failures; never retry auth or validation failures.
/// Anything else is not retryable.
pub fn default_retry_predicate(error: &TransportError, _retry_count: u32, _max_retries: u32) -> bool {
    match error.code {
        TransportErrorCode::Cancelled => false,
        TransportErrorCode::Network
        | TransportErrorCode::Timeout
        | TransportErrorCode::StreamTimeout => true,
        TransportErrorCode::HttpStatus => match error.http_status() {
            Some(status) => status == 429 || status >= 500,
            None => false,
        },
        _ => false,
    }
}

/// Wraps an arbitrary retryable operation, replaying it on
/// classified-retryable failure with exponential backoff.
pub struct RetryEngine {
    policy: RetryPolicy,
    predicate: RetryPredicate,
    on_retry: Option<RetryCallback>,
    state: Broadcaster<RetryState>,
}

impl RetryEngine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            predicate: Arc::new(default_retry_predicate),
            on_retry: None,
            state: Broadcaster::new(RetryState::default()),
        }
    }

    pub fn predicate(mut self, predicate: RetryPredicate) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn on_retry(mut self, callback: RetryCallback) -> Self {
        self.on_retry = Some(callback);
        self
    }

    pub fn state(&self) -> RetryState {
        self.state.get_state()
    }

    pub fn subscribe(&self, listener: impl Fn(&RetryState) + Send + Sync + 'static) -> u64 {
        self.state.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.state.unsubscribe(id);
    }

    /// Delay before the `retry_count + 1`-th attempt: growth is computed
    /// from the attempt index before incrementing, so the first retry uses
    /// `initial_delay × factor^0`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        if !self.policy.use_backoff {
            return self.policy.initial_delay;
        }
        let grown = self.policy.initial_delay.as_millis() as f64
            * self.policy.backoff_factor.powi(retry_count as i32);
        let capped = grown.min(self.policy.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> Result<T, TransportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        self.state.set_state(RetryState::default());
        let effective_max = self.policy.max_retries.min(MAX_RETRY_CEILING);

        loop {
            match operation().await {
                Ok(value) => {
                    self.state.set_state(RetryState::default());
                    return Ok(value);
                }
                Err(error) => {
                    let retry_count = self.state.get_state().retry_count;
                    if retry_count >= effective_max
                        || !(self.predicate)(&error, retry_count, effective_max)
                    {
                        self.state.update_state(|state| state.is_retrying = false);
                        return Err(error);
                    }

                    let delay = self.delay_for(retry_count);
                    let next = RetryState {
                        retry_count: retry_count + 1,
                        is_retrying: true,
                        next_delay_ms: delay.as_millis() as u64,
                    };
                    self.state.set_state(next.clone());
                    if let Some(on_retry) = &self.on_retry {
                        on_retry(&error, &next);
                    }
                    debug!(
                        retry_count = next.retry_count,
                        delay_ms = next.next_delay_ms,
                        code = ?error.code,
                        "retrying after classified failure"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

impl Default for RetryEngine {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}
