//! Listener liveness tracking.
//!
//! The registry only holds `Weak` references to listeners, so the bus is
//! never what keeps a listener alive. A dropped listener is skipped at
//! invocation time straight away; removing it from the registry is the job
//! of a sweep, triggered by:
//! - dispatch meeting an unreachable listener (marks the tracker dirty)
//! - every `sweep_every` publishes
//! - an optional janitor thread ticking every `sweep_period`
//! - an explicit `MessageBus::sweep`

use super::registry::SubscriptionRegistry;
use crossbeam_channel::{bounded, select, tick, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Decides when the registry should be swept.
pub struct LivenessTracker {
    sweep_every: Option<u64>,
    publishes: AtomicU64,
    dirty: AtomicBool,
}

impl LivenessTracker {
    /// `sweep_every`: publish count between sweeps (`None` disables).
    pub fn new(sweep_every: Option<u64>) -> Self {
        Self {
            sweep_every: sweep_every.filter(|n| *n > 0),
            publishes: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
        }
    }

    /// Counts one publish. Returns whether a sweep is due.
    pub(crate) fn record_publish(&self) -> bool {
        let count = self.publishes.fetch_add(1, Ordering::Relaxed) + 1;
        self.is_dirty() || self.sweep_every.is_some_and(|every| count % every == 0)
    }

    /// Dispatch found a subscription whose listener is gone.
    pub(crate) fn mark_unreachable(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub(crate) fn begin_sweep(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    /// Whether an unreachable listener was seen since the last sweep.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn publish_count(&self) -> u64 {
        self.publishes.load(Ordering::Relaxed)
    }
}

/// Background thread sweeping the registry on a fixed period.
pub(crate) struct Janitor {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl Janitor {
    pub(crate) fn spawn(
        registry: Weak<SubscriptionRegistry>,
        period: Duration,
        name: String,
    ) -> std::io::Result<Self> {
        let (stop, stopped) = bounded::<()>(0);
        let ticker = tick(period);

        let handle = thread::Builder::new().name(name).spawn(move || loop {
            select! {
                recv(stopped) -> _ => break,
                recv(ticker) -> _ => {
                    let Some(registry) = registry.upgrade() else {
                        break;
                    };
                    registry.sweep();
                }
            }
        })?;

        Ok(Self { stop, handle })
    }

    /// Stops the thread and waits for the sweep in progress, if any.
    pub(crate) fn stop(self) {
        drop(self.stop);
        if self.handle.join().is_err() {
            tracing::warn!("liveness janitor panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_count_trigger() {
        let tracker = LivenessTracker::new(Some(3));
        assert!(!tracker.record_publish());
        assert!(!tracker.record_publish());
        assert!(tracker.record_publish());
        assert!(!tracker.record_publish());
        assert_eq!(tracker.publish_count(), 4);
    }

    #[test]
    fn test_dirty_trigger() {
        let tracker = LivenessTracker::new(None);
        assert!(!tracker.record_publish());

        tracker.mark_unreachable();
        assert!(tracker.record_publish());

        tracker.begin_sweep();
        assert!(!tracker.record_publish());
    }

    #[test]
    fn test_zero_interval_disables() {
        let tracker = LivenessTracker::new(Some(0));
        for _ in 0..10 {
            assert!(!tracker.record_publish());
        }
    }
}
