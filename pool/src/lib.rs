//! Process-isolated speech recognition worker pool.
//!
//! The recognizer runs in disposable `spworker` processes so that native
//! memory it leaks is reclaimed by the OS when a worker is recycled.

pub mod audio;
pub mod config;
pub mod coordinator;
pub mod gauges;
pub mod logging;
pub mod monitor;
pub mod recognize;
pub mod sampler;
pub mod worker;

pub use coordinator::{PoolError, WorkerPool};
