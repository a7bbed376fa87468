//! Worker thread implementation.
//!
//! Every worker owns one `ThreadSlot` and runs the scheduler's home loop from
//! its native context until it picks up a shutdown job. The calling thread of
//! `JobSystem::run` is worker 0; the rest are spawned here.

use crate::PinningStrategy;
use crate::fiber_pool::NO_FIBER;
use crate::job::EnqueuedJob;
use crate::scheduler::Scheduler;
use crate::timeline;
use crate::topology::Topology;
use crossbeam::utils::Backoff;
use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

thread_local! {
    static WORKER_INDEX: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Index of the worker the calling OS thread is, if it is one.
///
/// A fiber may resume on a different worker after `unchain`, so callers must
/// re-query rather than cache the value across a wait.
pub fn current_worker() -> Option<usize> {
    WORKER_INDEX.get()
}

struct WorkerIndexGuard;

impl WorkerIndexGuard {
    fn enter(index: usize) -> Self {
        debug_assert!(WORKER_INDEX.get().is_none(), "thread is already a worker");
        WORKER_INDEX.set(Some(index));
        WorkerIndexGuard
    }
}

impl Drop for WorkerIndexGuard {
    fn drop(&mut self) {
        WORKER_INDEX.set(None);
    }
}

/// Per-worker bookkeeping: which fiber the thread is driving, and whether it
/// has left its scheduling loop.
pub(crate) struct ThreadSlot {
    driving: AtomicUsize,
    exited: AtomicBool,
    fibers_switched: AtomicUsize,
}

impl ThreadSlot {
    pub fn new() -> Self {
        ThreadSlot {
            driving: AtomicUsize::new(NO_FIBER),
            exited: AtomicBool::new(false),
            fibers_switched: AtomicUsize::new(0),
        }
    }

    pub fn begin_driving(&self, fiber: usize) {
        self.driving.store(fiber, Ordering::Release);
        self.fibers_switched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn end_driving(&self) {
        self.driving.store(NO_FIBER, Ordering::Release);
    }

    pub fn driving(&self) -> Option<usize> {
        match self.driving.load(Ordering::Acquire) {
            NO_FIBER => None,
            fiber => Some(fiber),
        }
    }

    pub fn mark_exited(&self) {
        self.exited.store(true, Ordering::Release);
    }

    /// True once the worker is back in its native context for good.
    pub fn is_home(&self) -> bool {
        self.exited.load(Ordering::Acquire) && self.driving().is_none()
    }

    pub fn fibers_switched(&self) -> usize {
        self.fibers_switched.load(Ordering::Relaxed)
    }
}

/// Store-once flag every worker spins on before it starts scheduling.
pub(crate) struct StartBarrier(AtomicBool);

impl StartBarrier {
    pub fn new() -> Self {
        StartBarrier(AtomicBool::new(false))
    }

    pub fn open(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn wait(&self) {
        let backoff = Backoff::new();
        while !self.0.load(Ordering::Acquire) {
            backoff.snooze();
        }
    }
}

/// Pins the thread, waits for the start barrier, then drives fibers until a
/// shutdown job sends this worker home.
pub(crate) fn worker_main(
    scheduler: &Scheduler,
    index: usize,
    pinning: PinningStrategy,
    topology: &Topology,
    first: Option<EnqueuedJob>,
) {
    if let Some(core) = topology.core_for(pinning, index) {
        if !core_affinity::set_for_current(core) {
            tracing::debug!(worker = index, core = core.id, "failed to pin worker");
        }
    }

    let _index = WorkerIndexGuard::enter(index);
    scheduler.start_barrier().wait();

    tracing::debug!(worker = index, "worker started");
    scheduler.drive(index, first);
    timeline::collect_local_trace();
    tracing::debug!(
        worker = index,
        switches = scheduler.threads()[index].fibers_switched(),
        "worker reached home context"
    );
}

/// Spawns worker `index` on a new OS thread.
pub(crate) fn spawn(
    index: usize,
    scheduler: Arc<Scheduler>,
    pinning: PinningStrategy,
    topology: Arc<Topology>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("fiberchain-worker-{index}"))
        .spawn(move || worker_main(&scheduler, index, pinning, &topology, None))
}
