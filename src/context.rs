//! Context type for access to job system capabilities from within jobs.

use crate::chain::Chain;
use crate::fiber::{FiberYielder, Resume, Suspend};
use crate::job::Job;
use crate::scheduler::{FiberCensus, Scheduler};
use crate::worker;

#[cfg(feature = "metrics")]
use crate::metrics::MetricsSnapshot;

/// Handed to every job. All submission and joining goes through it.
///
/// A context is tied to the fiber running the job, not to the OS thread: the
/// fiber may continue on another worker after `unchain`.
pub struct Context<'a> {
    scheduler: &'a Scheduler,
    yielder: &'a FiberYielder,
    fiber: usize,
}

impl<'a> Context<'a> {
    pub(crate) fn new(scheduler: &'a Scheduler, yielder: &'a FiberYielder, fiber: usize) -> Self {
        Context {
            scheduler,
            yielder,
            fiber,
        }
    }

    /// Enqueues `jobs` in the given order without tracking them.
    pub fn split<I>(&self, jobs: I)
    where
        I: IntoIterator<Item = Job>,
    {
        self.scheduler.split(jobs.into_iter().collect());
    }

    /// Enqueues `jobs` bound to a fresh chain counting all of them.
    ///
    /// Pass the chain to [`Context::unchain`] to wait for the batch.
    pub fn split_chained<I>(&self, jobs: I) -> Chain
    where
        I: IntoIterator<Item = Job>,
    {
        self.scheduler.split_chained(jobs.into_iter().collect())
    }

    /// Submits a single job and returns the chain tracking it.
    pub fn spawn_job<F>(&self, name: &'static str, work: F) -> Chain
    where
        F: FnOnce(&Context<'_>) + Send + 'static,
    {
        self.split_chained([Job::new(name, work)])
    }

    /// Waits for `chain` to settle without blocking the worker thread, then
    /// returns the chain to the pool.
    ///
    /// While the chain is outstanding this fiber sits on the waiting list and
    /// the worker runs other fibers. With `None` this is only a yield point.
    pub fn unchain(&self, chain: Option<Chain>) {
        let settled = chain.is_some_and(|c| self.scheduler.chains().is_settled(c));
        if !settled {
            self.suspend(Suspend::Wait(chain));
        }
        if let Some(chain) = chain {
            self.scheduler.chains().retire(chain);
        }
    }

    /// Submits `jobs` and waits for exactly those jobs to finish.
    pub fn split_and_unchain<I>(&self, jobs: I)
    where
        I: IntoIterator<Item = Job>,
    {
        let chain = self.split_chained(jobs);
        self.unchain(Some(chain));
    }

    /// Lets ready waiting fibers run before this one continues.
    pub fn yield_now(&self) {
        self.unchain(None);
    }

    /// Claims a free-standing chain with a count of one, for use as a manual
    /// join point outside any single split. Fibers that unchain on it wait
    /// until it is released.
    pub fn acquire_chain(&self) -> Chain {
        self.scheduler.chains().acquire(1)
    }

    /// Returns `chain` to the pool, settling it for anyone waiting on it.
    /// Not checked against other holders.
    pub fn release_chain(&self, chain: Chain) {
        self.scheduler.chains().release(chain);
    }

    /// Outstanding count of `chain`, or `None` once it went back to the pool.
    pub fn chain_value(&self, chain: Chain) -> Option<usize> {
        self.scheduler.chains().value(chain)
    }

    /// Worker currently driving this fiber. May change across `unchain`.
    pub fn worker_index(&self) -> usize {
        worker::current_worker().unwrap_or(0)
    }

    pub fn fiber_index(&self) -> usize {
        self.fiber
    }

    pub fn thread_count(&self) -> usize {
        self.scheduler.thread_count()
    }

    pub fn fiber_count(&self) -> usize {
        self.scheduler.fiber_count()
    }

    /// Where every fiber is right now.
    pub fn census(&self) -> FiberCensus {
        self.scheduler.census()
    }

    #[cfg(feature = "metrics")]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.scheduler.metrics().snapshot()
    }

    pub(crate) fn scheduler(&self) -> &Scheduler {
        self.scheduler
    }

    fn suspend(&self, reason: Suspend) {
        match self.yielder.suspend(reason) {
            Resume::Continue => {}
            Resume::Start(record) => {
                debug_assert!(false, "fiber {} handed a job while suspended", self.fiber);
                drop(record);
            }
        }
    }
}
