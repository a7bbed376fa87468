//! # fiberchain - Fiber-Based Job Scheduler
//!
//! A job system that multiplexes a fixed set of fibers onto a fixed set of
//! worker threads. Work is submitted as batches of jobs; a job that needs the
//! results of a batch waits on the batch's *chain* without blocking its worker
//! thread: its fiber is parked and the thread moves on to other work.
//!
//! ## Architecture
//!
//! - **Job queue**: a bounded lock-free MPMC ring ([`BoundedQueue`]) shared by
//!   every worker.
//! - **Fibers**: stackful coroutines with preallocated stacks. Each is at any
//!   moment free, waiting on a chain, or driven by exactly one worker.
//! - **Chains**: atomic counters from a fixed pool, one per `split`. A fiber
//!   that unchains sleeps until the count reaches zero.
//! - **Workers**: OS threads running a scheduling loop from their home
//!   context. The thread calling [`JobSystem::run`] is worker 0.
//!
//! Everything is reserved up front; nothing grows while jobs run.
//!
//! ## Example
//!
//! ```no_run
//! use fiberchain::{Config, Job, JobSystem};
//!
//! let config = Config::default().with_thread_count(4);
//! JobSystem::launch(config, |ctx| {
//!     let chain = ctx.split_chained((0..8).map(|i| {
//!         Job::new("hello", move |ctx| {
//!             println!("job {i} on worker {}", ctx.worker_index());
//!         })
//!     }));
//!     ctx.unchain(Some(chain));
//! })
//! .unwrap();
//! ```

pub mod chain;
pub mod context;
pub mod error;
pub(crate) mod fiber;
pub(crate) mod fiber_pool;
pub mod job;
pub mod job_system;
pub mod metrics;
pub mod queue;
pub(crate) mod scheduler;
pub mod timeline;
pub mod topology;
pub mod worker;

use serde::{Deserialize, Serialize};

/// Strategy for pinning worker threads to CPU cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PinningStrategy {
    /// No pinning (standard OS scheduling).
    #[default]
    None,
    /// Worker i -> logical processor i, wrapping around.
    Linear,
    /// Even-numbered logical processors first, so workers land on distinct
    /// physical cores before sharing one through SMT.
    AvoidSMT,
}

pub use chain::Chain;
pub use context::Context;
pub use error::{ConfigError, JobSystemError};
pub use job::Job;
pub use job_system::{Config, JobSystem, OverflowPolicy};
pub use queue::BoundedQueue;
pub use scheduler::FiberCensus;
pub use topology::Topology;
pub use worker::current_worker;

#[cfg(feature = "metrics")]
pub use metrics::MetricsSnapshot;
