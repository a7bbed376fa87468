use thiserror::Error;

/// Problems with a `Config`, reported before any thread is started.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("thread_count must be at least 1")]
    NoThreads,
    #[error("fiber_count must be at least 1")]
    NoFibers,
    #[error("chain_count must be at least 1")]
    NoChains,
    #[error("stack_size {stack_size} is below the {minimum}-byte minimum")]
    StackTooSmall { stack_size: usize, minimum: usize },
    #[error("log2_queue_capacity {log2} is outside {minimum}..={maximum}")]
    QueueCapacity { log2: u32, minimum: u32, maximum: u32 },
    #[error("failed to reserve a {stack_size}-byte fiber stack")]
    StackAllocation {
        stack_size: usize,
        #[source]
        source: std::io::Error,
    },
}

/// Failures of `JobSystem::run`.
#[derive(Debug, Error)]
pub enum JobSystemError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to spawn worker thread {index}")]
    Spawn {
        index: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} worker thread(s) panicked")]
    WorkerPanicked(usize),
}
