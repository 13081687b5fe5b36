use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::sleep;
use tracing::warn;

use crate::broadcast::Broadcaster;
use crate::error::{TransportError, TransportErrorCode};

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReconnectState {
    pub reconnecting: bool,
    pub reconnect_count: u32,
}

/// Lifecycle hooks for a reconnect run. Every run ends in exactly one of
/// `on_success` or `on_exhausted` unless it was stopped.
pub trait ReconnectEvents: Send + Sync {
    fn on_attempt(&self, _attempt: u32, _delay: Duration) {}
    fn on_success(&self, _attempt: u32) {}
    fn on_exhausted(&self) {}
}

impl ReconnectEvents for () {}

#[derive(Debug)]
pub enum ReconnectOutcome<T> {
    Connected(T),
    Cancelled,
    Exhausted(TransportError),
}

/// Cancellable exponential-backoff loop for session-style clients that must
/// re-establish a connection after failure. The wait between attempts is a
/// single outstanding deferred result whose resolver is retained here, so
/// [`ReconnectController::stop`] can force-resolve it to the cancelled
/// outcome instead of leaving a timer to fire stale.
pub struct ReconnectController {
    config: ReconnectConfig,
    state: Broadcaster<ReconnectState>,
    pending: Mutex<Option<oneshot::Sender<()>>>,
    stopped: AtomicBool,
}

impl ReconnectController {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            state: Broadcaster::new(ReconnectState::default()),
            pending: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ReconnectState {
        self.state.get_state()
    }

    pub fn subscribe(&self, listener: impl Fn(&ReconnectState) + Send + Sync + 'static) -> u64 {
        self.state.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.state.unsubscribe(id);
    }

    /// Abandons the run: an outstanding wait resolves immediately as
    /// cancelled and no stale timer fires after this returns.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let pending = self
            .pending
            .lock()
            .expect("pending resolver mutex poisoned")
            .take();
        if let Some(resolver) = pending {
            let _ = resolver.send(());
        }
        self.state.set_state(ReconnectState::default());
    }

    fn delay_for(&self, reconnect_count: u32) -> Duration {
        let shift = reconnect_count.min(63);
        let multiplier = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
        let grown = (self.config.initial_delay.as_millis() as u64).saturating_mul(multiplier);
        Duration::from_millis(grown.min(self.config.max_delay.as_millis() as u64))
    }

    /// `true` when the delay completed naturally, `false` when stopped.
    async fn cancellable_delay(&self, delay: Duration) -> bool {
        let (resolver, cancelled) = oneshot::channel();
        *self
            .pending
            .lock()
            .expect("pending resolver mutex poisoned") = Some(resolver);

        let completed = tokio::select! {
            _ = sleep(delay) => true,
            _ = cancelled => false,
        };

        self.pending
            .lock()
            .expect("pending resolver mutex poisoned")
            .take();
        completed
    }

    pub async fn run<T, F, Fut>(
        &self,
        events: &dyn ReconnectEvents,
        mut connect: F,
    ) -> ReconnectOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        self.stopped.store(false, Ordering::SeqCst);
        self.state.set_state(ReconnectState::default());
        let mut last_error: Option<TransportError> = None;

        while self.state.get_state().reconnect_count < self.config.max_retries {
            let count = self.state.get_state().reconnect_count;
            let delay = self.delay_for(count);
            self.state.set_state(ReconnectState {
                reconnecting: true,
                reconnect_count: count + 1,
            });
            events.on_attempt(count + 1, delay);

            if !self.cancellable_delay(delay).await {
                return ReconnectOutcome::Cancelled;
            }

            match connect().await {
                Ok(value) => {
                    self.state.set_state(ReconnectState::default());
                    events.on_success(count + 1);
                    return ReconnectOutcome::Connected(value);
                }
                Err(error) => {
                    // Second cancellation point: stop() may have landed
                    // while the connect attempt was in flight.
                    if self.stopped.load(Ordering::SeqCst) {
                        return ReconnectOutcome::Cancelled;
                    }
                    warn!(attempt = count + 1, %error, "reconnect attempt failed");
                    last_error = Some(error);
                }
            }
        }

        self.state
            .update_state(|state| state.reconnecting = false);
        events.on_exhausted();
        ReconnectOutcome::Exhausted(last_error.unwrap_or_else(|| {
            TransportError::new(TransportErrorCode::Unknown, "reconnect attempts exhausted")
        }))
    }
}

impl Default for ReconnectController {
    fn default() -> Self {
        Self::new(ReconnectConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    use super::*;

    fn fast_config(max_retries: u32) -> ReconnectConfig {
        ReconnectConfig {
            max_retries,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(80),
        }
    }

    #[test]
    fn delays_double_until_the_cap() {
        let controller = ReconnectController::new(fast_config(8));
        let delays: Vec<u64> = (0..6)
            .map(|i| controller.delay_for(i).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![10, 20, 40, 80, 80, 80]);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_transient_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let controller = ReconnectController::new(fast_config(5));

        let counter = Arc::clone(&attempts);
        let outcome = controller
            .run(&(), move || {
                let current = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if current < 2 {
                        Err(TransportError::network("refused"))
                    } else {
                        Ok("session")
                    }
                }
            })
            .await;

        assert!(matches!(outcome, ReconnectOutcome::Connected("session")));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(controller.state(), ReconnectState::default());
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_produces_a_terminal_signal() {
        struct CountExhausted(AtomicUsize);
        impl ReconnectEvents for CountExhausted {
            fn on_exhausted(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let events = CountExhausted(AtomicUsize::new(0));
        let controller = ReconnectController::new(fast_config(3));
        let outcome: ReconnectOutcome<()> = controller
            .run(&events, || async { Err(TransportError::network("down")) })
            .await;

        assert!(matches!(outcome, ReconnectOutcome::Exhausted(_)));
        assert_eq!(events.0.load(Ordering::SeqCst), 1);
        assert!(!controller.state().reconnecting);
        assert_eq!(controller.state().reconnect_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_mid_delay_cancels_without_another_attempt() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let controller = Arc::new(ReconnectController::new(ReconnectConfig {
            max_retries: 5,
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
        }));

        let runner = Arc::clone(&controller);
        let counter = Arc::clone(&attempts);
        let handle = tokio::spawn(async move {
            runner
                .run(&(), move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, TransportError>(()) }
                })
                .await
        });

        // Let the run enter its first cancellable wait, then stop it.
        tokio::task::yield_now().await;
        controller.stop();

        let outcome = handle.await.expect("run task completes");
        assert!(matches!(outcome, ReconnectOutcome::Cancelled));
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
        assert_eq!(controller.state(), ReconnectState::default());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_connect_attempt_cancels_after_failure() {
        let controller = Arc::new(ReconnectController::new(fast_config(5)));

        let stopper = Arc::clone(&controller);
        let outcome: ReconnectOutcome<()> = controller
            .run(&(), move || {
                let stopper = Arc::clone(&stopper);
                async move {
                    stopper.stop();
                    Err(TransportError::network("interrupted"))
                }
            })
            .await;

        assert!(matches!(outcome, ReconnectOutcome::Cancelled));
    }
}
