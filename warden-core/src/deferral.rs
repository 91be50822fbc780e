//! Single-shot deferred re-evaluation.
//!
//! A detector that needs to wait for correlated data (a DNS answer that may
//! still be in flight) hands a closure to [`DeferralTimer::schedule`]; the
//! closure runs exactly once after the delay, on its own thread, without
//! blocking the event-consumption path. There is deliberately no cancel
//! API: the consumer's pending-set membership check is what makes a stale
//! firing a no-op, and that invariant lives with the consumer, not here.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

pub struct DeferralTimer {
    shutdown: Arc<AtomicBool>,
    outstanding: Arc<AtomicU64>,
    scheduled: AtomicU64,
}

impl DeferralTimer {
    pub fn new() -> Self {
        Self {
            shutdown: Arc::new(AtomicBool::new(false)),
            outstanding: Arc::new(AtomicU64::new(0)),
            scheduled: AtomicU64::new(0),
        }
    }

    /// Run `job` once after `delay`. Returns false when the timer is shut
    /// down or the thread could not be spawned; the job is dropped in
    /// either case.
    pub fn schedule(&self, delay: Duration, job: impl FnOnce() + Send + 'static) -> bool {
        if self.shutdown.load(Ordering::Acquire) {
            debug!("deferral rejected: timer is shut down");
            return false;
        }
        let shutdown = Arc::clone(&self.shutdown);
        let outstanding = Arc::clone(&self.outstanding);
        outstanding.fetch_add(1, Ordering::Relaxed);

        let spawned = std::thread::Builder::new()
            .name("warden-deferral".into())
            .spawn(move || {
                std::thread::sleep(delay);
                // A shutdown that happened while we slept turns the firing
                // into a no-op; the referenced state may be torn down.
                if !shutdown.load(Ordering::Acquire) {
                    job();
                }
                outstanding.fetch_sub(1, Ordering::Relaxed);
            });

        match spawned {
            Ok(_) => {
                self.scheduled.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.outstanding.fetch_sub(1, Ordering::Relaxed);
                error!(error = %e, "failed to spawn deferral thread");
                false
            }
        }
    }

    /// Stop accepting new schedules and suppress not-yet-fired jobs.
    /// Already-sleeping threads are not awaited; they wake, observe the
    /// flag, and exit.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Timers scheduled over the lifetime of this instance.
    pub fn total_scheduled(&self) -> u64 {
        self.scheduled.load(Ordering::Relaxed)
    }

    /// Timers currently sleeping or firing.
    pub fn outstanding(&self) -> u64 {
        self.outstanding.load(Ordering::Relaxed)
    }
}

impl Default for DeferralTimer {
    fn default() -> Self {
        Self::new()
    }
}
