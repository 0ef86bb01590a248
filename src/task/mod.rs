//! Asynchronous work off the message handler thread
//!
//! This module provides:
//! - Cancellation sources and joinable tokens with time budgets
//! - A bounded task pool with a per-peer soft limit

pub mod cancel;
pub mod pool;

pub use cancel::{
    BudgetPool, CancellationSource, CancellationToken, TaskError, TimedCancellationSource,
};
pub use pool::AsyncTaskPool;
