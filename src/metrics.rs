//! Optional scheduler counters, compiled in with the `metrics` feature.
//!
//! Without the feature `Scheduler::record` is a no-op and only the `Event`
//! enum exists.

#[cfg(feature = "metrics")]
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(feature = "metrics")]
use std::time::Instant;

/// Something the scheduler counts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Event {
    JobEnqueued,
    JobCompleted,
    FiberStarted,
    FiberResumed,
    WaitPublished,
    WaitCancelled,
    QueueFullRetry,
    FreeFiberSpin,
}

#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct Metrics {
    /// Jobs pushed into the queue (including shutdown jobs).
    pub jobs_enqueued: AtomicU64,
    /// Job procedures that returned or panicked.
    pub jobs_completed: AtomicU64,
    /// Free fibers bound to a freshly dequeued job.
    pub fibers_started: AtomicU64,
    /// Waiting fibers resumed after their chain settled.
    pub fibers_resumed: AtomicU64,
    /// Fibers published to the waiting list.
    pub waits_published: AtomicU64,
    /// Waits abandoned because the chain settled before publication.
    pub waits_cancelled: AtomicU64,
    /// Push attempts rejected by a full queue.
    pub queue_full_retries: AtomicU64,
    /// Scans of the free list that found nothing.
    pub free_fiber_spins: AtomicU64,
    pub start_time: Instant,
}

#[cfg(feature = "metrics")]
impl Metrics {
    pub fn new() -> Self {
        Self {
            jobs_enqueued: AtomicU64::new(0),
            jobs_completed: AtomicU64::new(0),
            fibers_started: AtomicU64::new(0),
            fibers_resumed: AtomicU64::new(0),
            waits_published: AtomicU64::new(0),
            waits_cancelled: AtomicU64::new(0),
            queue_full_retries: AtomicU64::new(0),
            free_fiber_spins: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub(crate) fn record(&self, event: Event) {
        let counter = match event {
            Event::JobEnqueued => &self.jobs_enqueued,
            Event::JobCompleted => &self.jobs_completed,
            Event::FiberStarted => &self.fibers_started,
            Event::FiberResumed => &self.fibers_resumed,
            Event::WaitPublished => &self.waits_published,
            Event::WaitCancelled => &self.waits_cancelled,
            Event::QueueFullRetry => &self.queue_full_retries,
            Event::FreeFiberSpin => &self.free_fiber_spins,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_enqueued: self.jobs_enqueued.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            fibers_started: self.fibers_started.load(Ordering::Relaxed),
            fibers_resumed: self.fibers_resumed.load(Ordering::Relaxed),
            waits_published: self.waits_published.load(Ordering::Relaxed),
            waits_cancelled: self.waits_cancelled.load(Ordering::Relaxed),
            queue_full_retries: self.queue_full_retries.load(Ordering::Relaxed),
            free_fiber_spins: self.free_fiber_spins.load(Ordering::Relaxed),
            elapsed_seconds: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

#[cfg(feature = "metrics")]
impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time.
#[cfg(feature = "metrics")]
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub jobs_enqueued: u64,
    pub jobs_completed: u64,
    pub fibers_started: u64,
    pub fibers_resumed: u64,
    pub waits_published: u64,
    pub waits_cancelled: u64,
    pub queue_full_retries: u64,
    pub free_fiber_spins: u64,
    pub elapsed_seconds: f64,
}

#[cfg(feature = "metrics")]
impl MetricsSnapshot {
    pub fn jobs_per_second(&self) -> f64 {
        if self.elapsed_seconds > 0.0 {
            self.jobs_completed as f64 / self.elapsed_seconds
        } else {
            0.0
        }
    }

    /// Jobs enqueued but not yet finished (approximate).
    pub fn in_flight(&self) -> i64 {
        self.jobs_enqueued as i64 - self.jobs_completed as i64
    }
}
