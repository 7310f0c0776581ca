//! marketsnap -- scheduled market-data snapshot collection.
//!
//! One invocation performs one collection run: fetch a snapshot from the
//! configured source with bounded retries, persist it atomically as a dated
//! file, and notify operators. An external scheduler (cron, launchd, Task
//! Scheduler) decides when runs happen.

pub mod config;
pub mod fetch;
pub mod health;
pub mod notify;
pub mod runner;
pub mod storage;
pub mod system;
