//! Scheduling module.
//!
//! This module executes plans in dependency order, retries transient
//! provider failures and reports the outcome of every node.

mod executor;
mod report;
mod retry;

pub use executor::{Scheduler, SchedulerSettings, DEFAULT_CONCURRENCY};
pub use report::{NodeReport, NodeStatus, RunReport, RunStatus};
pub use retry::{retry_with_backoff, Attempted, RetryPolicy};
