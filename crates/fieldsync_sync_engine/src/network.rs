//! Debounced connectivity monitoring.
//!
//! The platform layer calls [`NetworkMonitor::report`] with every raw
//! connectivity reading. A change is delivered to subscribers only after it
//! has held for the debounce window, so a blip shorter than the window
//! produces no callback at all, and each real transition produces exactly
//! one.

use crate::listeners::{Listeners, Subscription};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info};

struct MonitorState {
    raw: bool,
    delivered: bool,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

struct MonitorInner {
    debounce: Duration,
    state: Mutex<MonitorState>,
    listeners: Listeners<bool>,
}

impl MonitorInner {
    fn settle(&self, generation: u64) {
        let online = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            state.timer = None;
            if state.raw == state.delivered {
                return;
            }
            state.delivered = state.raw;
            state.raw
        };
        info!(online, "connectivity changed");
        self.listeners.emit(&online);
    }
}

/// Push-based connectivity state with a debounce window.
///
/// Cheap to clone; clones share state and subscribers.
#[derive(Clone)]
pub struct NetworkMonitor {
    inner: Arc<MonitorInner>,
}

impl NetworkMonitor {
    /// Creates a monitor that starts in `initially_online`.
    pub fn new(initially_online: bool, debounce: Duration) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                debounce,
                state: Mutex::new(MonitorState {
                    raw: initially_online,
                    delivered: initially_online,
                    generation: 0,
                    timer: None,
                }),
                listeners: Listeners::new("network"),
            }),
        }
    }

    /// Debounced connectivity, as last delivered to subscribers.
    pub fn is_online(&self) -> bool {
        self.inner.state.lock().delivered
    }

    /// Most recent raw reading.
    pub fn raw_state(&self) -> bool {
        self.inner.state.lock().raw
    }

    /// The debounce window.
    pub fn debounce(&self) -> Duration {
        self.inner.debounce
    }

    /// Records a raw connectivity reading.
    ///
    /// Outside a tokio runtime, or with a zero window, changes are delivered
    /// immediately.
    pub fn report(&self, online: bool) {
        let mut state = self.inner.state.lock();
        state.raw = online;
        state.generation += 1;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        if online == state.delivered {
            return;
        }

        let runtime = if self.inner.debounce.is_zero() {
            None
        } else {
            Handle::try_current().ok()
        };
        let Some(runtime) = runtime else {
            state.delivered = online;
            drop(state);
            info!(online, "connectivity changed");
            self.inner.listeners.emit(&online);
            return;
        };

        debug!(online, debounce_ms = self.inner.debounce.as_millis() as u64, "connectivity change pending");
        let generation = state.generation;
        let debounce = self.inner.debounce;
        let weak: Weak<MonitorInner> = Arc::downgrade(&self.inner);
        state.timer = Some(runtime.spawn(async move {
            tokio::time::sleep(debounce).await;
            if let Some(inner) = weak.upgrade() {
                inner.settle(generation);
            }
        }));
    }

    /// Registers `callback` for debounced transitions.
    pub fn subscribe(&self, callback: impl Fn(bool) + Send + Sync + 'static) -> Subscription {
        self.inner.listeners.subscribe(move |online: &bool| callback(*online))
    }

    /// Number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Drops a pending (not yet delivered) transition.
    pub fn cancel_pending(&self) {
        let mut state = self.inner.state.lock();
        state.generation += 1;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.raw = state.delivered;
    }
}

impl fmt::Debug for NetworkMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("NetworkMonitor")
            .field("online", &state.delivered)
            .field("raw", &state.raw)
            .field("debounce", &self.inner.debounce)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(monitor: &NetworkMonitor) -> (Arc<Mutex<Vec<bool>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sub = {
            let seen = seen.clone();
            monitor.subscribe(move |online| seen.lock().push(online))
        };
        (seen, sub)
    }

    #[tokio::test(start_paused = true)]
    async fn short_blip_is_swallowed() {
        let monitor = NetworkMonitor::new(true, Duration::from_secs(2));
        let (seen, _sub) = recorder(&monitor);

        monitor.report(false);
        tokio::time::sleep(Duration::from_millis(500)).await;
        monitor.report(true);
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(seen.lock().is_empty());
        assert!(monitor.is_online());
    }

    #[tokio::test(start_paused = true)]
    async fn stable_change_delivered_once() {
        let monitor = NetworkMonitor::new(false, Duration::from_secs(2));
        let (seen, _sub) = recorder(&monitor);

        monitor.report(true);
        monitor.report(true);
        assert!(!monitor.is_online());
        tokio::time::sleep(Duration::from_millis(2100)).await;

        assert_eq!(*seen.lock(), vec![true]);
        assert!(monitor.is_online());

        monitor.report(true);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn window_restarts_on_each_reading() {
        let monitor = NetworkMonitor::new(false, Duration::from_secs(2));
        let (seen, _sub) = recorder(&monitor);

        monitor.report(true);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        monitor.report(false);
        monitor.report(true);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(seen.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(*seen.lock(), vec![true]);
    }

    #[test]
    fn zero_debounce_delivers_immediately() {
        let monitor = NetworkMonitor::new(false, Duration::ZERO);
        let (seen, _sub) = recorder(&monitor);

        monitor.report(true);
        monitor.report(false);
        assert_eq!(*seen.lock(), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_pending_drops_transition() {
        let monitor = NetworkMonitor::new(true, Duration::from_secs(2));
        let (seen, _sub) = recorder(&monitor);

        monitor.report(false);
        monitor.cancel_pending();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(seen.lock().is_empty());
        assert!(monitor.is_online());
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribed_callback_is_not_called() {
        let monitor = NetworkMonitor::new(false, Duration::from_secs(1));
        let (seen, mut sub) = recorder(&monitor);
        sub.unsubscribe();
        sub.unsubscribe();

        monitor.report(true);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(seen.lock().is_empty());
        assert_eq!(monitor.subscriber_count(), 0);
    }
}
