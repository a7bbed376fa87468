//! The scheduler core.
//!
//! Each worker alternates between its home context and one fiber at a time.
//! Whenever a fiber suspends, the home loop asks `next_fiber` what to run:
//!
//! 1. a waiting fiber whose chain has settled;
//! 2. the fiber that just parked itself, if its own chain settled in the
//!    meantime (the parked fiber is not on the waiting list yet, so nobody
//!    else could ever find it);
//! 3. a free fiber bound to the next queued job.
//!
//! A worker that dequeued a job spins until some fiber is free. If every
//! fiber is waiting at that point, and the jobs they wait on are the ones held
//! by spinning workers, nothing makes progress: `fiber_count` has to cover the
//! deepest set of simultaneously waiting jobs.
//!
//! A parked fiber is only published to the waiting list once the worker has
//! committed to running something else.

use crate::chain::{Chain, ChainPool};
use crate::error::ConfigError;
use crate::fiber::{Resume, Suspend};
use crate::fiber_pool::FiberPool;
use crate::job::{EnqueuedJob, Job};
use crate::job_system::{Config, OverflowPolicy};
use crate::metrics::Event;
use crate::queue::BoundedQueue;
use crate::timeline::TraceGuard;
use crate::worker::{self, StartBarrier, ThreadSlot};
use crossbeam::utils::Backoff;
use std::sync::atomic::{AtomicBool, Ordering};

#[cfg(feature = "metrics")]
use crate::metrics::Metrics;

/// A fiber that suspended on a chain but has not been published yet.
#[derive(Clone, Copy, Debug)]
struct Parked {
    fiber: usize,
    chain: Option<Chain>,
}

/// Snapshot of where every fiber currently is. Only exact while the system is
/// quiet; under load the counts can be off by in-flight transitions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FiberCensus {
    pub free: usize,
    pub waiting: usize,
    pub driving: usize,
    /// Fibers seen in more than one role at once.
    pub conflicts: Vec<usize>,
}

pub(crate) struct Scheduler {
    queue: BoundedQueue<EnqueuedJob>,
    fibers: FiberPool,
    chains: ChainPool,
    threads: Box<[ThreadSlot]>,
    start: StartBarrier,
    overflow: OverflowPolicy,
    queue_full_reported: AtomicBool,
    tearing_down: AtomicBool,
    timeline: bool,
    #[cfg(feature = "metrics")]
    metrics: Metrics,
}

impl Scheduler {
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        let fibers = FiberPool::new(config.fiber_count, config.stack_size).map_err(|source| {
            ConfigError::StackAllocation {
                stack_size: config.stack_size,
                source,
            }
        })?;

        Ok(Scheduler {
            queue: BoundedQueue::with_log2_capacity(config.log2_queue_capacity),
            fibers,
            chains: ChainPool::new(config.chain_count),
            threads: (0..config.thread_count).map(|_| ThreadSlot::new()).collect(),
            start: StartBarrier::new(),
            overflow: config.on_queue_full,
            queue_full_reported: AtomicBool::new(false),
            tearing_down: AtomicBool::new(false),
            timeline: config.timeline,
            #[cfg(feature = "metrics")]
            metrics: Metrics::new(),
        })
    }

    pub fn chains(&self) -> &ChainPool {
        &self.chains
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn fiber_count(&self) -> usize {
        self.fibers.len()
    }

    pub fn start_barrier(&self) -> &StartBarrier {
        &self.start
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.tearing_down.load(Ordering::Acquire)
    }

    pub fn threads(&self) -> &[ThreadSlot] {
        &self.threads
    }

    #[inline]
    pub fn record(&self, _event: Event) {
        #[cfg(feature = "metrics")]
        self.metrics.record(_event);
    }

    #[cfg(feature = "metrics")]
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn note_job_completed(&self) {
        self.record(Event::JobCompleted);
    }

    pub fn timeline_span(&self, name: &'static str) -> Option<TraceGuard> {
        if !self.timeline {
            return None;
        }
        Some(TraceGuard::new(name, worker::current_worker().unwrap_or(0)))
    }

    /// Enqueues `jobs` in order, untracked.
    pub fn split(&self, jobs: Vec<Job>) {
        self.enqueue_all(jobs, None);
    }

    /// Enqueues `jobs` in order, all reporting to a fresh chain set to their
    /// count.
    pub fn split_chained(&self, jobs: Vec<Job>) -> Chain {
        let chain = self.chains.acquire(jobs.len());
        self.enqueue_all(jobs, Some(chain));
        chain
    }

    fn enqueue_all(&self, jobs: Vec<Job>, chain: Option<Chain>) {
        for job in jobs {
            self.enqueue(EnqueuedJob::new(job, chain));
        }
    }

    fn enqueue(&self, mut record: EnqueuedJob) {
        let backoff = Backoff::new();
        loop {
            match self.queue.push(record) {
                Ok(()) => {
                    self.record(Event::JobEnqueued);
                    return;
                }
                Err(rejected) => record = rejected,
            }

            match self.overflow {
                OverflowPolicy::Abort if !record.job.is_shutdown() => {
                    tracing::error!(
                        capacity = self.queue.capacity(),
                        job = record.job.name(),
                        "job queue exhausted; size the queue for peak in-flight jobs"
                    );
                    std::process::abort();
                }
                _ => {
                    if !self.queue_full_reported.swap(true, Ordering::Relaxed) {
                        tracing::warn!(
                            capacity = self.queue.capacity(),
                            "job queue full, producer spinning until a worker drains it"
                        );
                    }
                    self.record(Event::QueueFullRetry);
                    backoff.snooze();
                }
            }
        }
    }

    /// Queues one shutdown job per worker. Each worker that runs one leaves
    /// its scheduling loop, so every worker consumes exactly one.
    pub fn broadcast_shutdown(&self) {
        self.broadcast_shutdown_to(self.threads.len());
    }

    pub fn broadcast_shutdown_to(&self, workers: usize) {
        tracing::debug!(workers, "broadcasting shutdown");
        for _ in 0..workers {
            self.enqueue(EnqueuedJob::new(Job::shutdown(), None));
        }
    }

    /// The home loop of worker `index`. `first` is run before anything is
    /// taken from the queue.
    pub fn drive(&self, index: usize, mut first: Option<EnqueuedJob>) {
        let slot = &self.threads[index];
        let mut parked: Option<Parked> = None;

        loop {
            let (fiber, input) = match first.take() {
                Some(record) => (self.acquire_free_fiber(), Resume::Start(record)),
                None => self.next_fiber(slot, &mut parked),
            };

            self.begin_driving(index, fiber);
            // SAFETY: `fiber` was claimed from the free or waiting list by this
            // thread, or is the parked fiber this thread never gave up.
            let suspended = unsafe { self.fibers.fiber_mut(fiber) }.resume(self, input);

            match suspended {
                Suspend::Complete => {
                    slot.end_driving();
                    self.fibers.release_to_free(fiber);
                }
                Suspend::Wait(chain) => {
                    // Stays owned by this thread until `next_fiber` decides.
                    parked = Some(Parked { fiber, chain });
                }
                Suspend::Shutdown => {
                    slot.end_driving();
                    self.fibers.release_to_free(fiber);
                    break;
                }
            }
        }

        debug_assert!(parked.is_none());
        slot.mark_exited();
    }

    fn next_fiber(&self, slot: &ThreadSlot, parked: &mut Option<Parked>) -> (usize, Resume) {
        let backoff = Backoff::new();
        loop {
            if let Some(fiber) = self.fibers.find_ready_waiting(&self.chains) {
                self.publish(slot, parked.take());
                self.record(Event::FiberResumed);
                tracing::trace!(fiber, "resuming waiting fiber");
                return (fiber, Resume::Continue);
            }

            if let Some(p) = *parked {
                if p.chain.is_none_or(|chain| self.chains.is_settled(chain)) {
                    // The chain settled before the fiber was ever published.
                    *parked = None;
                    self.record(Event::WaitCancelled);
                    tracing::trace!(fiber = p.fiber, "wait cancelled, resuming in place");
                    return (p.fiber, Resume::Continue);
                }
            }

            if let Some(record) = self.queue.pop() {
                self.publish(slot, parked.take());
                let fiber = self.acquire_free_fiber();
                tracing::trace!(fiber, job = record.job.name(), "starting job");
                return (fiber, Resume::Start(record));
            }

            backoff.snooze();
        }
    }

    fn begin_driving(&self, index: usize, fiber: usize) {
        debug_assert!(
            self.threads
                .iter()
                .enumerate()
                .all(|(other, slot)| other == index || slot.driving() != Some(fiber)),
            "fiber {fiber} is already driven by another worker"
        );
        self.threads[index].begin_driving(fiber);
    }

    fn acquire_free_fiber(&self) -> usize {
        let fiber = self
            .fibers
            .acquire_free(|| self.record(Event::FreeFiberSpin));
        self.record(Event::FiberStarted);
        fiber
    }

    fn publish(&self, slot: &ThreadSlot, parked: Option<Parked>) {
        if let Some(Parked { fiber, chain }) = parked {
            slot.end_driving();
            self.fibers.release_to_waiting(fiber, chain);
            self.record(Event::WaitPublished);
            tracing::trace!(fiber, ?chain, "fiber parked on waiting list");
        }
    }

    pub fn census(&self) -> FiberCensus {
        let mut census = FiberCensus::default();
        for fiber in 0..self.fibers.len() {
            let free = self.fibers.is_free(fiber);
            let waiting = self.fibers.is_waiting(fiber);
            let drivers = self
                .threads
                .iter()
                .filter(|slot| slot.driving() == Some(fiber))
                .count();

            census.free += free as usize;
            census.waiting += waiting as usize;
            census.driving += drivers;
            if free as usize + waiting as usize + drivers > 1 {
                census.conflicts.push(fiber);
            }
        }
        census
    }

    /// Jobs run by each fiber so far. Only called once every worker has gone
    /// home, when no fiber has an owner.
    #[cfg(test)]
    pub fn jobs_per_fiber(&self) -> Vec<usize> {
        debug_assert!(self.threads.iter().all(ThreadSlot::is_home));
        (0..self.fibers.len())
            // SAFETY: every worker has exited; nothing else touches the fibers.
            .map(|i| unsafe { self.fibers.fiber_mut(i) }.jobs_run())
            .collect()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // Dropping the fibers unwinds any that are still parked inside a job.
        self.tearing_down.store(true, Ordering::Release);
        let leftover = self.queued();
        if leftover > 0 {
            tracing::debug!(leftover, "dropping jobs queued after shutdown");
        }
        let held = self.chains.held();
        if held > 0 {
            tracing::debug!(held, "chains still held at teardown");
        }
        let jobs: usize = (0..self.fibers.len())
            // SAFETY: `&mut self`; no worker can be driving a fiber.
            .map(|i| unsafe { self.fibers.fiber_mut(i) }.jobs_run())
            .sum();
        tracing::debug!(jobs, "scheduler torn down");
    }
}
