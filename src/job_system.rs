//! High-level job system interface.
//!
//! A `JobSystem` is built in two phases. `JobSystem::new` validates the
//! configuration and reserves everything the scheduler will ever use: queue
//! cells, thread slots, fibers and their stacks, the free/waiting/chain slot
//! arrays. `JobSystem::run` then turns the calling thread into worker 0,
//! spawns the remaining workers, runs the main procedure as the first job and
//! returns only once every worker is back in its home context and joined.

use crate::PinningStrategy;
use crate::context::Context;
use crate::error::{ConfigError, JobSystemError};
use crate::fiber::FiberSlot;
use crate::job::{EnqueuedJob, Job};
use crate::queue::BoundedQueue;
use crate::scheduler::Scheduler;
use crate::topology::Topology;
use crate::worker::{self, ThreadSlot};
use crossbeam::utils::CachePadded;
use serde::{Deserialize, Serialize};
use std::mem::size_of;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

/// Smallest fiber stack accepted by `Config::validate`.
pub const MIN_STACK_SIZE: usize = 16 * 1024;
/// Accepted range of `log2_queue_capacity`.
pub const MIN_LOG2_QUEUE_CAPACITY: u32 = 1;
pub const MAX_LOG2_QUEUE_CAPACITY: u32 = 24;

const PAGE_SIZE: usize = 4096;

/// What `split` does when the job queue has no free cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OverflowPolicy {
    /// Spin until a worker drains a cell. With a single worker and a producer
    /// that never yields, this never returns.
    #[default]
    Spin,
    /// Treat exhaustion as a sizing error: log it and abort the process.
    Abort,
}

/// Configuration for the job system.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Stack size for each fiber in bytes. Default: 256KB.
    pub stack_size: usize,
    /// Number of fibers, fixed for the system's lifetime. Default: 128.
    pub fiber_count: usize,
    /// The queue holds `1 << log2_queue_capacity` jobs. Default: 12.
    pub log2_queue_capacity: u32,
    /// Worker threads, including the thread calling `run`. Default: one per
    /// logical core.
    pub thread_count: usize,
    /// Size of the chain pool. Default: 128.
    pub chain_count: usize,
    pub pinning: PinningStrategy,
    pub on_queue_full: OverflowPolicy,
    /// Record job spans for `timeline::export_to_file`.
    pub timeline: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stack_size: 256 * 1024,
            fiber_count: 128,
            log2_queue_capacity: 12,
            thread_count: Topology::detect().logical_cores(),
            chain_count: 128,
            pinning: PinningStrategy::Linear,
            on_queue_full: OverflowPolicy::Spin,
            timeline: false,
        }
    }
}

impl Config {
    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub fn with_fiber_count(mut self, fiber_count: usize) -> Self {
        self.fiber_count = fiber_count;
        self
    }

    pub fn with_log2_queue_capacity(mut self, log2: u32) -> Self {
        self.log2_queue_capacity = log2;
        self
    }

    pub fn with_thread_count(mut self, thread_count: usize) -> Self {
        self.thread_count = thread_count;
        self
    }

    pub fn with_chain_count(mut self, chain_count: usize) -> Self {
        self.chain_count = chain_count;
        self
    }

    pub fn with_pinning(mut self, pinning: PinningStrategy) -> Self {
        self.pinning = pinning;
        self
    }

    pub fn with_overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.on_queue_full = policy;
        self
    }

    pub fn with_timeline(mut self, enabled: bool) -> Self {
        self.timeline = enabled;
        self
    }

    /// `1 << log2_queue_capacity`, unclamped. Saturates at `usize::MAX` when
    /// the shift does not fit; `validate` rejects such configurations anyway.
    pub fn queue_capacity(&self) -> usize {
        1usize
            .checked_shl(self.log2_queue_capacity)
            .unwrap_or(usize::MAX)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.thread_count == 0 {
            return Err(ConfigError::NoThreads);
        }
        if self.fiber_count == 0 {
            return Err(ConfigError::NoFibers);
        }
        if self.chain_count == 0 {
            return Err(ConfigError::NoChains);
        }
        if self.stack_size < MIN_STACK_SIZE {
            return Err(ConfigError::StackTooSmall {
                stack_size: self.stack_size,
                minimum: MIN_STACK_SIZE,
            });
        }
        if !(MIN_LOG2_QUEUE_CAPACITY..=MAX_LOG2_QUEUE_CAPACITY).contains(&self.log2_queue_capacity) {
            return Err(ConfigError::QueueCapacity {
                log2: self.log2_queue_capacity,
                minimum: MIN_LOG2_QUEUE_CAPACITY,
                maximum: MAX_LOG2_QUEUE_CAPACITY,
            });
        }
        Ok(())
    }

    /// Bytes the system reserves for this configuration, rounded up to 16.
    ///
    /// Covers queue cells, thread slots, fiber records, the free, waiting and
    /// chain slot arrays, worker thread handles, fiber stacks (each rounded up
    /// to whole 4 KiB pages plus one guard page) and the shutdown jobs.
    pub fn footprint(&self) -> usize {
        let slot = size_of::<AtomicUsize>();
        let queue = BoundedQueue::<EnqueuedJob>::footprint(self.queue_capacity());
        let threads = self.thread_count * size_of::<ThreadSlot>();
        let handles = self.thread_count.saturating_sub(1) * size_of::<JoinHandle<()>>();
        let fibers = self.fiber_count * (size_of::<FiberSlot>() + 3 * slot);
        let chains = self.chain_count * size_of::<CachePadded<AtomicUsize>>();
        let stacks = self.fiber_count * (self.stack_size.div_ceil(PAGE_SIZE) + 1) * PAGE_SIZE;
        let shutdown_jobs = self.thread_count * size_of::<EnqueuedJob>();

        let total = [threads, handles, fibers, chains, stacks, shutdown_jobs]
            .into_iter()
            .fold(queue, usize::saturating_add);
        total.div_ceil(16).saturating_mul(16)
    }
}

/// The job system: owns the scheduler and everything it schedules.
///
/// # Example
///
/// ```no_run
/// use fiberchain::{Config, Job, JobSystem};
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// let config = Config::default().with_thread_count(4);
/// let total = JobSystem::launch(config, |ctx| {
///     let sum = Arc::new(AtomicUsize::new(0));
///     let jobs = (0..100).map(|i| {
///         let sum = sum.clone();
///         Job::new("add", move |_ctx| {
///             sum.fetch_add(i, Ordering::Relaxed);
///         })
///     });
///     ctx.split_and_unchain(jobs);
///     sum.load(Ordering::Relaxed)
/// })
/// .unwrap();
/// assert_eq!(total, 4950);
/// ```
pub struct JobSystem {
    config: Config,
    scheduler: Arc<Scheduler>,
    topology: Arc<Topology>,
}

impl JobSystem {
    /// Validates `config` and reserves every fiber stack, queue cell and slot
    /// array. No thread is started.
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        config.validate()?;
        let scheduler = Arc::new(Scheduler::new(&config)?);
        tracing::debug!(
            threads = config.thread_count,
            fibers = config.fiber_count,
            queue_capacity = config.queue_capacity(),
            bytes = config.footprint(),
            "job system constructed"
        );
        Ok(JobSystem {
            config,
            scheduler,
            topology: Arc::new(Topology::detect()),
        })
    }

    /// Sizing query: bytes a system built from `config` reserves.
    pub fn footprint(config: &Config) -> usize {
        config.footprint()
    }

    /// `JobSystem::new(config)?.run(main)`.
    pub fn launch<F, R>(config: Config, main: F) -> Result<R, JobSystemError>
    where
        F: FnOnce(&Context<'_>) -> R + Send + 'static,
        R: Send + 'static,
    {
        JobSystem::new(config)?.run(main)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs `main` as the first job on the calling thread (worker 0), with the
    /// other workers spawned alongside. When `main` returns, a shutdown job is
    /// broadcast to every worker; this call returns after all of them have
    /// been joined. Jobs still queued at that point are dropped.
    ///
    /// A panic in `main` is re-raised here once the workers are joined.
    pub fn run<F, R>(self, main: F) -> Result<R, JobSystemError>
    where
        F: FnOnce(&Context<'_>) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.execute(main).map(|(value, _)| value)
    }

    pub(crate) fn execute<F, R>(self, main: F) -> Result<(R, Arc<Scheduler>), JobSystemError>
    where
        F: FnOnce(&Context<'_>) -> R + Send + 'static,
        R: Send + 'static,
    {
        let JobSystem {
            config,
            scheduler,
            topology,
        } = self;

        let outcome: Arc<Mutex<Option<thread::Result<R>>>> = Arc::new(Mutex::new(None));
        let main_job = {
            let outcome = outcome.clone();
            Job::new("main", move |ctx| {
                let result = catch_unwind(AssertUnwindSafe(|| main(ctx)));
                *outcome.lock().unwrap_or_else(PoisonError::into_inner) = Some(result);
                ctx.scheduler().broadcast_shutdown();
            })
        };

        let mut handles = Vec::with_capacity(config.thread_count - 1);
        for index in 1..config.thread_count {
            match worker::spawn(index, scheduler.clone(), config.pinning, topology.clone()) {
                Ok(handle) => handles.push(handle),
                Err(source) => {
                    tracing::error!(worker = index, error = %source, "failed to spawn worker");
                    send_home(&scheduler, handles);
                    return Err(JobSystemError::Spawn { index, source });
                }
            }
        }

        tracing::debug!(workers = config.thread_count, "job system starting");
        scheduler.start_barrier().open();
        worker::worker_main(
            &scheduler,
            0,
            config.pinning,
            &topology,
            Some(EnqueuedJob::new(main_job, None)),
        );

        let panicked = join_workers(handles);
        tracing::debug!("job system shut down");
        if panicked > 0 {
            return Err(JobSystemError::WorkerPanicked(panicked));
        }

        let result = outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match result {
            Some(Ok(value)) => Ok((value, scheduler)),
            Some(Err(payload)) => resume_unwind(payload),
            None => unreachable!("shutdown is only broadcast after main returns"),
        }
    }
}

/// Sends workers that started before a spawn failure straight back home.
/// The barrier opens first: with more workers than queue cells the shutdown
/// jobs only fit once the workers are draining them.
fn send_home(scheduler: &Scheduler, handles: Vec<JoinHandle<()>>) -> usize {
    scheduler.start_barrier().open();
    scheduler.broadcast_shutdown_to(handles.len());
    join_workers(handles)
}

/// Joins every handle exactly once; returns how many workers panicked.
fn join_workers(handles: Vec<JoinHandle<()>>) -> usize {
    let mut panicked = 0;
    for (i, handle) in handles.into_iter().enumerate() {
        if handle.join().is_err() {
            panicked += 1;
            tracing::error!(worker = i + 1, "worker panicked during execution");
        }
    }
    panicked
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.stack_size, 256 * 1024);
        assert_eq!(config.fiber_count, 128);
        assert_eq!(config.log2_queue_capacity, 12);
        assert_eq!(config.queue_capacity(), 4096);
        assert_eq!(config.chain_count, 128);
        assert!(config.thread_count >= 1);
        assert_eq!(config.pinning, PinningStrategy::Linear);
        assert_eq!(config.on_queue_full, OverflowPolicy::Spin);
        assert!(!config.timeline);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let base = Config::default().with_thread_count(2);
        assert!(matches!(
            base.clone().with_thread_count(0).validate(),
            Err(ConfigError::NoThreads)
        ));
        assert!(matches!(
            base.clone().with_fiber_count(0).validate(),
            Err(ConfigError::NoFibers)
        ));
        assert!(matches!(
            base.clone().with_chain_count(0).validate(),
            Err(ConfigError::NoChains)
        ));
        assert!(matches!(
            base.clone().with_stack_size(1024).validate(),
            Err(ConfigError::StackTooSmall { .. })
        ));
        assert!(matches!(
            base.clone().with_log2_queue_capacity(25).validate(),
            Err(ConfigError::QueueCapacity { log2: 25, .. })
        ));
        assert!(matches!(
            base.clone().with_log2_queue_capacity(0).validate(),
            Err(ConfigError::QueueCapacity { log2: 0, .. })
        ));
        assert!(JobSystem::new(base.with_fiber_count(0)).is_err());
    }

    #[test]
    fn test_footprint_is_aligned_and_tracks_stacks() {
        let small = Config::default()
            .with_thread_count(4)
            .with_fiber_count(8)
            .with_stack_size(64 * 1024)
            .with_log2_queue_capacity(4);
        let bytes = JobSystem::footprint(&small);
        assert_eq!(bytes % 16, 0);
        assert!(bytes >= 8 * 64 * 1024);

        let more_fibers = small.clone().with_fiber_count(16);
        assert!(more_fibers.footprint() >= bytes + 8 * 64 * 1024);

        let bigger_queue = small.clone().with_log2_queue_capacity(8);
        assert!(bigger_queue.footprint() > bytes);
    }

    #[test]
    fn test_out_of_range_queue_is_sized_as_written() {
        let base = Config::default()
            .with_thread_count(2)
            .with_fiber_count(4)
            .with_stack_size(64 * 1024);

        let single = base.clone().with_log2_queue_capacity(0);
        assert_eq!(single.queue_capacity(), 1);
        assert!(single.validate().is_err());

        let largest = base.clone().with_log2_queue_capacity(MAX_LOG2_QUEUE_CAPACITY);
        let oversized = base.clone().with_log2_queue_capacity(MAX_LOG2_QUEUE_CAPACITY + 1);
        assert_eq!(oversized.queue_capacity(), 1 << (MAX_LOG2_QUEUE_CAPACITY + 1));
        assert!(oversized.footprint() > largest.footprint());
        assert!(oversized.validate().is_err());

        let absurd = base.with_log2_queue_capacity(200);
        assert_eq!(absurd.queue_capacity(), usize::MAX);
        assert_eq!(absurd.footprint() % 16, 0);
    }

    #[test]
    fn test_workers_sent_home_outnumber_queue_cells() {
        let config = Config::default()
            .with_thread_count(5)
            .with_fiber_count(8)
            .with_stack_size(64 * 1024)
            .with_log2_queue_capacity(1)
            .with_pinning(PinningStrategy::None);
        let scheduler = Arc::new(Scheduler::new(&config).unwrap());
        let topology = Arc::new(Topology::detect());

        // Four workers parked at the start barrier, two queue cells.
        let handles: Vec<_> = (1..5)
            .map(|index| {
                worker::spawn(index, scheduler.clone(), PinningStrategy::None, topology.clone())
                    .unwrap()
            })
            .collect();

        assert_eq!(send_home(&scheduler, handles), 0);
        assert!(scheduler.threads()[1..].iter().all(ThreadSlot::is_home));
        assert_eq!(scheduler.queued(), 0);
    }

    #[test]
    fn test_config_from_partial_json() {
        let config: Config =
            serde_json::from_str(r#"{"thread_count": 3, "on_queue_full": "Abort"}"#).unwrap();
        assert_eq!(config.thread_count, 3);
        assert_eq!(config.on_queue_full, OverflowPolicy::Abort);
        assert_eq!(config.fiber_count, 128);
    }

    #[test]
    fn test_job_system_run_returns_main_value() {
        let config = Config::default()
            .with_thread_count(2)
            .with_fiber_count(8)
            .with_stack_size(64 * 1024)
            .with_pinning(PinningStrategy::None);
        let value = JobSystem::launch(config, |_ctx| 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_job_system_multiple_jobs() {
        let config = Config::default()
            .with_thread_count(4)
            .with_fiber_count(16)
            .with_stack_size(64 * 1024)
            .with_pinning(PinningStrategy::None);
        let executed = Arc::new(AtomicUsize::new(0));
        let seen = executed.clone();

        JobSystem::launch(config, move |ctx| {
            let jobs = (0..10).map(|_| {
                let executed = executed.clone();
                Job::new("count", move |_ctx| {
                    executed.fetch_add(1, Ordering::SeqCst);
                })
            });
            ctx.split_and_unchain(jobs);
        })
        .unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 10);
    }
}
