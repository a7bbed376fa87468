//! Fiber management and execution context.
//!
//! A fiber owns one fixed-size stack and, once armed, one `corosensei`
//! coroutine running the trampoline. The trampoline never returns: it runs a
//! job, reports completion to its chain, then suspends back to the worker's
//! home context to wait for the next job. Between jobs only the stack's
//! contents are discarded, never the stack itself.

use crate::context::Context;
use crate::job::{EnqueuedJob, Work};
use crate::scheduler::Scheduler;
use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use std::cell::UnsafeCell;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};

/// Value passed into a fiber when a worker switches to it.
pub(crate) enum Resume {
    /// Run a freshly dequeued job on an idle fiber.
    Start(EnqueuedJob),
    /// Continue a fiber that suspended inside `unchain`.
    Continue,
}

/// Value a fiber hands back to the worker's home context when it suspends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Suspend {
    /// The job finished; the fiber can go back to the free list.
    Complete,
    /// The job unchained on a chain that has not settled yet (or yielded).
    Wait(Option<crate::Chain>),
    /// A shutdown job ran; the worker must leave its scheduling loop.
    Shutdown,
}

pub(crate) type FiberYielder = Yielder<Resume, Suspend>;
type Trampoline = Coroutine<Resume, Suspend, (), DefaultStack>;

#[derive(Clone, Copy)]
struct SchedulerPtr(*const Scheduler);

// SAFETY: the scheduler outlives every fiber it owns; fibers are only resumed
// from worker threads while the scheduler is alive.
unsafe impl Send for SchedulerPtr {}

pub(crate) struct Fiber {
    index: usize,
    /// Stack reserved at construction, moved into the coroutine when armed.
    stack: Option<DefaultStack>,
    coroutine: Option<Trampoline>,
    jobs_run: usize,
}

impl Fiber {
    pub fn new(index: usize, stack_size: usize) -> std::io::Result<Self> {
        Ok(Fiber {
            index,
            stack: Some(DefaultStack::new(stack_size)?),
            coroutine: None,
            jobs_run: 0,
        })
    }

    pub fn is_armed(&self) -> bool {
        self.coroutine.is_some()
    }

    pub fn jobs_run(&self) -> usize {
        self.jobs_run
    }

    /// Builds the trampoline over this fiber's stack. Done once, the first
    /// time the fiber is pulled from the free list.
    fn arm(&mut self, scheduler: &Scheduler) {
        let Some(stack) = self.stack.take() else {
            return;
        };
        let scheduler = SchedulerPtr(scheduler as *const Scheduler);
        let index = self.index;

        let coroutine = Coroutine::with_stack(stack, move |yielder: &FiberYielder, input| {
            let SchedulerPtr(ptr) = scheduler;
            // SAFETY: see `SchedulerPtr`.
            weave(unsafe { &*ptr }, index, yielder, input);
        });
        self.coroutine = Some(coroutine);
    }

    /// Switches into the fiber until it suspends again.
    pub fn resume(&mut self, scheduler: &Scheduler, input: Resume) -> Suspend {
        if !self.is_armed() {
            self.arm(scheduler);
        }
        if matches!(input, Resume::Start(_)) {
            self.jobs_run += 1;
        }
        let Some(coroutine) = self.coroutine.as_mut() else {
            return Suspend::Complete;
        };
        match coroutine.resume(input) {
            CoroutineResult::Yield(suspend) => suspend,
            CoroutineResult::Return(()) => Suspend::Complete,
        }
    }
}

/// The trampoline every armed fiber runs.
fn weave(scheduler: &Scheduler, index: usize, yielder: &FiberYielder, mut input: Resume) {
    loop {
        let outcome = match input {
            Resume::Start(EnqueuedJob { job, chain }) => {
                let name = job.name();
                match job.into_work() {
                    Work::Shutdown => Suspend::Shutdown,
                    Work::Run(work) => {
                        let ctx = Context::new(scheduler, yielder, index);
                        let span = scheduler.timeline_span(name);
                        let result = catch_unwind(AssertUnwindSafe(|| work(&ctx)));
                        if let Err(payload) = result {
                            if scheduler.is_shutting_down() {
                                // Teardown is unwinding a parked fiber. The
                                // dropping thread has already handed its trace
                                // buffer over, so the span is not recorded.
                                if let Some(span) = span {
                                    span.discard();
                                }
                                resume_unwind(payload);
                            }
                            tracing::error!(
                                job = name,
                                fiber = index,
                                "job panicked: {}",
                                panic_message(&*payload)
                            );
                        }
                        drop(span);
                        // Everything the job leaves behind is published by the
                        // chain's decrement, so a released waiter sees it.
                        scheduler.note_job_completed();
                        if let Some(chain) = chain {
                            scheduler.chains().signal(chain);
                        }
                        Suspend::Complete
                    }
                }
            }
            Resume::Continue => {
                debug_assert!(false, "fiber {} continued while idle", index);
                Suspend::Complete
            }
        };
        input = yielder.suspend(outcome);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

/// Arena slot for a fiber. Exclusive access is granted by the free/waiting
/// list protocol in `fiber_pool`, never by this type.
pub(crate) struct FiberSlot(UnsafeCell<Fiber>);

// SAFETY: a fiber index is owned by at most one thread at a time (free slot,
// waiting slot, or one driving worker); only the owner touches the cell.
unsafe impl Send for FiberSlot {}
unsafe impl Sync for FiberSlot {}

impl FiberSlot {
    pub fn new(fiber: Fiber) -> Self {
        FiberSlot(UnsafeCell::new(fiber))
    }

    /// # Safety
    /// The caller must own this fiber's index.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self) -> &mut Fiber {
        unsafe { &mut *self.0.get() }
    }
}
