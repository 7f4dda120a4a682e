//! Executor pool running message-logging tasks.

/// Fixed-size worker pool and its queue.
pub mod worker_pool;
