use fiberchain::{Config, ConfigError, Job, JobSystem, JobSystemError, PinningStrategy};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

fn config(threads: usize) -> Config {
    Config::default()
        .with_thread_count(threads)
        .with_fiber_count(16)
        .with_stack_size(64 * 1024)
        .with_pinning(PinningStrategy::None)
}

#[test]
fn test_run_with_nothing_to_do() {
    JobSystem::launch(config(4), |_ctx| {}).unwrap();
}

#[test]
fn test_single_worker_system() {
    let value = JobSystem::launch(config(1), |ctx| {
        assert_eq!(ctx.thread_count(), 1);
        assert_eq!(ctx.worker_index(), 0);
        let chain = ctx.spawn_job("solo", |_ctx| {});
        ctx.unchain(Some(chain));
        "done"
    })
    .unwrap();
    assert_eq!(value, "done");
}

#[test]
fn test_sequential_systems_on_one_thread() {
    for round in 0..5 {
        let result = JobSystem::launch(config(3), move |ctx| {
            let sum = Arc::new(AtomicUsize::new(0));
            ctx.split_and_unchain((0..10).map(|_| {
                let sum = sum.clone();
                Job::new("round", move |_ctx| {
                    sum.fetch_add(round, Ordering::SeqCst);
                })
            }));
            sum.load(Ordering::SeqCst)
        })
        .unwrap();
        assert_eq!(result, round * 10);
    }
}

#[test]
fn test_more_workers_than_cores() {
    let workers = JobSystem::launch(config(16).with_pinning(PinningStrategy::Linear), |ctx| {
        ctx.split_and_unchain((0..64).map(|_| Job::new("noop", |_ctx| {})));
        ctx.thread_count()
    })
    .unwrap();
    assert_eq!(workers, 16);
}

#[test]
fn test_jobs_queued_after_shutdown_are_dropped() {
    let ran = Arc::new(AtomicUsize::new(0));
    let marker = Arc::new(());
    let (ran_in, marker_in) = (ran.clone(), marker.clone());

    JobSystem::launch(config(2), move |ctx| {
        // Main returns at once; the straggler enqueues behind the shutdown jobs.
        ctx.split([Job::new("straggler", move |ctx| {
            std::thread::sleep(Duration::from_millis(50));
            ctx.split((0..10).map(|_| {
                let ran = ran_in.clone();
                let marker = marker_in.clone();
                Job::new("late", move |_ctx| {
                    let _marker = marker;
                    ran.fetch_add(1, Ordering::SeqCst);
                })
            }));
        })]);
    })
    .unwrap();

    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(Arc::strong_count(&marker), 1, "late jobs should be released");
}

#[test]
fn test_parked_fiber_is_unwound_at_teardown() {
    struct SetOnDrop(Arc<AtomicBool>);
    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    let dropped = Arc::new(AtomicBool::new(false));
    let flag = dropped.clone();

    JobSystem::launch(config(2), move |ctx| {
        let gate = ctx.acquire_chain();
        // Queued ahead of the shutdown jobs, so it always reaches its wait.
        ctx.split([Job::new("forever", move |ctx| {
            let _guard = SetOnDrop(flag);
            ctx.unchain(Some(gate));
            unreachable!("the gate is never released");
        })]);
    })
    .unwrap();

    assert!(dropped.load(Ordering::SeqCst), "stack of the parked job was not unwound");
}

#[test]
fn test_invalid_config_is_rejected_before_start() {
    let err = JobSystem::launch(config(0), |_ctx| {}).unwrap_err();
    assert!(matches!(err, JobSystemError::Config(ConfigError::NoThreads)));

    let err = JobSystem::new(config(2).with_stack_size(4096)).err().unwrap();
    assert!(matches!(err, ConfigError::StackTooSmall { .. }));
}
