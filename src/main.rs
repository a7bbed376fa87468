use fiberchain::{Config, Job, JobSystem, JobSystemError};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), JobSystemError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    println!("fiberchain - Fiber-Based Job Scheduler\n");

    let config = Config::default().with_thread_count(4);
    println!(
        "Job system with {} worker threads, {} fibers, {} queue cells ({} bytes reserved)\n",
        config.thread_count,
        config.fiber_count,
        config.queue_capacity(),
        JobSystem::footprint(&config)
    );

    JobSystem::launch(config, |ctx| {
        // Example 1: a single job, joined through its chain
        println!("Example 1: Simple job execution");
        let chain = ctx.spawn_job("hello", |ctx| {
            println!("  Hello from fiber {} on worker {}", ctx.fiber_index(), ctx.worker_index());
        });
        ctx.unchain(Some(chain));
        println!("  Job completed\n");

        // Example 2: parallel sum
        println!("Example 2: Parallel computation");
        let sum = Arc::new(AtomicUsize::new(0));
        let num_jobs = 100;
        let start = Instant::now();
        ctx.split_and_unchain((0..num_jobs).map(|i| {
            let sum = sum.clone();
            Job::new("sum", move |_ctx| {
                let mut local = 0usize;
                for j in 0..1000 {
                    local = local.wrapping_add(j);
                }
                std::hint::black_box(local);
                sum.fetch_add(i, Ordering::Relaxed);
            })
        }));
        let expected: usize = (0..num_jobs).sum();
        println!("  Executed {} jobs in {:?}", num_jobs, start.elapsed());
        println!("  Sum result: {} (expected: {})\n", sum.load(Ordering::Relaxed), expected);

        // Example 3: nested splits; every level waits without blocking a thread
        println!("Example 3: Nested parallelism");
        let leaves = Arc::new(AtomicUsize::new(0));
        let start = Instant::now();
        ctx.split_and_unchain((0..4).map(|_| {
            let leaves = leaves.clone();
            Job::new("branch", move |ctx| {
                ctx.split_and_unchain((0..16).map(|_| {
                    let leaves = leaves.clone();
                    Job::new("leaf", move |_ctx| {
                        leaves.fetch_add(1, Ordering::Relaxed);
                    })
                }));
            })
        }));
        println!(
            "  {} leaf jobs finished in {:?}\n",
            leaves.load(Ordering::Relaxed),
            start.elapsed()
        );

        // Example 4: throughput
        println!("Example 4: High-throughput benchmark");
        let num_jobs = 10_000;
        let start = Instant::now();
        ctx.split_and_unchain((0..num_jobs).map(|_| {
            Job::new("tiny", |_ctx| {
                std::hint::black_box((0..10).sum::<u32>());
            })
        }));
        let duration = start.elapsed();
        println!("  Executed {} jobs in {:?}", num_jobs, duration);
        println!(
            "  Throughput: {:.2} jobs/second\n",
            num_jobs as f64 / duration.as_secs_f64()
        );

        println!("Shutting down job system...");
    })?;

    println!("Done!");
    Ok(())
}
