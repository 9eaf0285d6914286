//! The worker pool's internals: the pool supervisor and the per-job pipeline driver.

mod job;
mod pool;

pub use pool::WorkerPool;
