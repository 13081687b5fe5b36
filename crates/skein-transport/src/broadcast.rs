use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::error;

type ListenerFn<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Listener<T> {
    id: u64,
    callback: ListenerFn<T>,
}

impl<T> Clone for Listener<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            callback: Arc::clone(&self.callback),
        }
    }
}

#[derive(Default)]
struct ThrottleWindow {
    armed: bool,
    trailing_pending: bool,
    timer: Option<JoinHandle<()>>,
}

struct BroadcasterInner<T> {
    state: Mutex<T>,
    listeners: Mutex<Vec<Listener<T>>>,
    next_listener_id: AtomicU64,
    throttle: Option<Duration>,
    window: Mutex<ThrottleWindow>,
    torn_down: AtomicBool,
}

/// Holds a value, lets owners replace it, and notifies subscribers —
/// optionally throttled so a storm of rapid updates collapses into a
/// bounded notification rate without ever losing the final value.
///
/// Stateful components compose one of these and delegate
/// `subscribe`/`get_state` to it rather than inheriting notify behavior.
pub struct Broadcaster<T> {
    inner: Arc<BroadcasterInner<T>>,
}

impl<T> Clone for Broadcaster<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Broadcaster<T>
where
    T: Clone + Send + 'static,
{
    pub fn new(initial: T) -> Self {
        Self::build(initial, None)
    }

    /// With interval `T`: the first change in a quiet period notifies
    /// immediately and arms a window; further changes inside the window
    /// coalesce into one trailing notification carrying the latest value.
    pub fn with_throttle(initial: T, interval: Duration) -> Self {
        Self::build(initial, Some(interval))
    }

    fn build(initial: T, throttle: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(BroadcasterInner {
                state: Mutex::new(initial),
                listeners: Mutex::new(Vec::new()),
                next_listener_id: AtomicU64::new(1),
                throttle,
                window: Mutex::new(ThrottleWindow::default()),
                torn_down: AtomicBool::new(false),
            }),
        }
    }

    /// Defensive snapshot: later internal mutation never shows through a
    /// value returned here.
    pub fn get_state(&self) -> T {
        self.inner.state.lock().expect("state mutex poisoned").clone()
    }

    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> u64 {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .listeners
            .lock()
            .expect("listener mutex poisoned")
            .push(Listener {
                id,
                callback: Arc::new(listener),
            });
        id
    }

    /// Takes effect for future notification passes only.
    pub fn unsubscribe(&self, id: u64) {
        self.inner
            .listeners
            .lock()
            .expect("listener mutex poisoned")
            .retain(|listener| listener.id != id);
    }

    pub fn set_state(&self, value: T) {
        self.replace_state_silently(value);
        self.notify();
    }

    pub fn update_state(&self, apply: impl FnOnce(&mut T)) {
        {
            let mut state = self.inner.state.lock().expect("state mutex poisoned");
            apply(&mut state);
        }
        self.notify();
    }

    /// Replaces the value without notifying. Callers batching several
    /// internal writes compose this with an explicit [`Broadcaster::notify`].
    pub fn replace_state_silently(&self, value: T) {
        *self.inner.state.lock().expect("state mutex poisoned") = value;
    }

    pub fn notify(&self) {
        if self.inner.torn_down.load(Ordering::SeqCst) {
            return;
        }
        let Some(interval) = self.inner.throttle else {
            deliver(&self.inner);
            return;
        };

        let leading = {
            let mut window = self.inner.window.lock().expect("window mutex poisoned");
            if window.armed {
                window.trailing_pending = true;
                false
            } else {
                window.armed = true;
                window.trailing_pending = false;
                window.timer = Some(spawn_window_timer(Arc::clone(&self.inner), interval));
                true
            }
        };
        if leading {
            deliver(&self.inner);
        }
    }

    /// Clears all listeners and cancels any pending throttle timer. Safe to
    /// call multiple times.
    pub fn teardown(&self) {
        self.inner.torn_down.store(true, Ordering::SeqCst);
        self.inner
            .listeners
            .lock()
            .expect("listener mutex poisoned")
            .clear();
        let mut window = self.inner.window.lock().expect("window mutex poisoned");
        if let Some(timer) = window.timer.take() {
            timer.abort();
        }
        window.armed = false;
        window.trailing_pending = false;
    }
}

fn deliver<T: Clone>(inner: &BroadcasterInner<T>) {
    let snapshot = inner.state.lock().expect("state mutex poisoned").clone();
    let listeners = inner
        .listeners
        .lock()
        .expect("listener mutex poisoned")
        .clone();
    for listener in listeners {
        // One panicking listener must not starve the rest of the pass.
        if catch_unwind(AssertUnwindSafe(|| (listener.callback)(&snapshot))).is_err() {
            error!(listener_id = listener.id, "state listener panicked");
        }
    }
}

fn spawn_window_timer<T: Clone + Send + 'static>(
    inner: Arc<BroadcasterInner<T>>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            if inner.torn_down.load(Ordering::SeqCst) {
                return;
            }
            let fire_trailing = {
                let mut window = inner.window.lock().expect("window mutex poisoned");
                if window.trailing_pending {
                    // A change landed inside the window: flush the latest
                    // value and keep the window armed for another interval.
                    window.trailing_pending = false;
                    true
                } else {
                    window.armed = false;
                    window.timer = None;
                    false
                }
            };
            if fire_trailing {
                deliver(&inner);
            } else {
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector<T: Clone + Send + 'static>(
        broadcaster: &Broadcaster<T>,
    ) -> Arc<Mutex<Vec<T>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        broadcaster.subscribe(move |value: &T| {
            sink.lock().expect("collector mutex poisoned").push(value.clone());
        });
        seen
    }

    #[test]
    fn set_state_notifies_synchronously_without_throttle() {
        let broadcaster = Broadcaster::new(0u32);
        let seen = collector(&broadcaster);
        broadcaster.set_state(1);
        broadcaster.set_state(2);
        assert_eq!(*seen.lock().expect("collector mutex poisoned"), vec![1, 2]);
    }

    #[test]
    fn get_state_returns_a_defensive_snapshot() {
        let broadcaster = Broadcaster::new(vec![1u32]);
        let snapshot = broadcaster.get_state();
        broadcaster.update_state(|state| state.push(2));
        assert_eq!(snapshot, vec![1]);
        assert_eq!(broadcaster.get_state(), vec![1, 2]);
    }

    #[test]
    fn silent_replace_defers_notification_until_explicit_notify() {
        let broadcaster = Broadcaster::new(0u32);
        let seen = collector(&broadcaster);
        broadcaster.replace_state_silently(7);
        assert!(seen.lock().expect("collector mutex poisoned").is_empty());
        broadcaster.notify();
        assert_eq!(*seen.lock().expect("collector mutex poisoned"), vec![7]);
    }

    #[test]
    fn unsubscribe_stops_future_passes() {
        let broadcaster = Broadcaster::new(0u32);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = broadcaster.subscribe(move |value: &u32| {
            sink.lock().expect("collector mutex poisoned").push(*value);
        });
        broadcaster.set_state(1);
        broadcaster.unsubscribe(id);
        broadcaster.set_state(2);
        assert_eq!(*seen.lock().expect("collector mutex poisoned"), vec![1]);
    }

    #[test]
    fn panicking_listener_does_not_starve_the_rest() {
        let broadcaster = Broadcaster::new(0u32);
        broadcaster.subscribe(|_: &u32| panic!("listener failure"));
        let seen = collector(&broadcaster);
        broadcaster.set_state(5);
        assert_eq!(*seen.lock().expect("collector mutex poisoned"), vec![5]);
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_collapses_burst_to_leading_and_trailing() {
        let broadcaster = Broadcaster::with_throttle(0u32, Duration::from_millis(100));
        let seen = collector(&broadcaster);

        broadcaster.set_state(1);
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(10)).await;
        broadcaster.set_state(2);
        tokio::time::advance(Duration::from_millis(40)).await;
        broadcaster.set_state(3);
        tokio::time::advance(Duration::from_millis(300)).await;
        tokio::task::yield_now().await;

        assert_eq!(*seen.lock().expect("collector mutex poisoned"), vec![1, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_window_fires_nothing_on_the_trailing_edge() {
        let broadcaster = Broadcaster::with_throttle(0u32, Duration::from_millis(100));
        let seen = collector(&broadcaster);

        broadcaster.set_state(1);
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(300)).await;
        tokio::task::yield_now().await;

        assert_eq!(*seen.lock().expect("collector mutex poisoned"), vec![1]);

        // The window disarmed, so the next change is a fresh leading edge.
        broadcaster.set_state(9);
        assert_eq!(*seen.lock().expect("collector mutex poisoned"), vec![1, 9]);
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_cancels_the_pending_trailing_notification() {
        let broadcaster = Broadcaster::with_throttle(0u32, Duration::from_millis(100));
        let seen = collector(&broadcaster);

        broadcaster.set_state(1);
        tokio::task::yield_now().await;
        broadcaster.set_state(2);
        broadcaster.teardown();
        broadcaster.teardown();
        tokio::time::advance(Duration::from_millis(500)).await;
        tokio::task::yield_now().await;

        assert_eq!(*seen.lock().expect("collector mutex poisoned"), vec![1]);
    }
}
