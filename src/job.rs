//! Job definitions.
//!
//! Jobs are the units of work scheduled onto fibers. A job is immutable once
//! submitted: it is owned by the queue until a fiber claims it, then by that
//! fiber until its procedure returns.

use crate::chain::Chain;
use crate::context::Context;
use std::fmt;

/// The procedure of a job. The closure captures its own argument.
pub type JobFn = Box<dyn FnOnce(&Context<'_>) + Send + 'static>;

pub(crate) enum Work {
    Run(JobFn),
    /// Sends the worker that runs it back to its home context for good.
    Shutdown,
}

/// A unit of work to be executed by the job system.
pub struct Job {
    name: &'static str,
    work: Work,
}

impl Job {
    /// Creates a named job. The name shows up in logs and timeline traces.
    pub fn new<F>(name: &'static str, work: F) -> Self
    where
        F: FnOnce(&Context<'_>) + Send + 'static,
    {
        Job {
            name,
            work: Work::Run(Box::new(work)),
        }
    }

    /// Creates a job named `"anonymous"`.
    pub fn from_fn<F>(work: F) -> Self
    where
        F: FnOnce(&Context<'_>) + Send + 'static,
    {
        Self::new("anonymous", work)
    }

    pub(crate) fn shutdown() -> Self {
        Job {
            name: "shutdown",
            work: Work::Shutdown,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        matches!(self.work, Work::Shutdown)
    }

    pub(crate) fn into_work(self) -> Work {
        self.work
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

/// A job as it sits in the queue: the job plus the chain it reports to.
#[derive(Debug)]
pub(crate) struct EnqueuedJob {
    pub job: Job,
    pub chain: Option<Chain>,
}

impl EnqueuedJob {
    pub fn new(job: Job, chain: Option<Chain>) -> Self {
        EnqueuedJob { job, chain }
    }
}
