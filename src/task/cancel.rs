//! Cooperative cancellation
//!
//! A [`CancellationSource`] is owned by whoever may cancel; tasks observe a
//! [`CancellationToken`], which can be joined from several sources and may
//! carry a deadline. A [`TimedCancellationSource`] cancels itself once its
//! time budget is spent and, on drop, hands unused time back to a shared
//! [`BudgetPool`] so the next task in the same chain can use it.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken as Trigger;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
    #[error("task cancelled")]
    Cancelled,

    #[error("task pool is shut down")]
    PoolShutDown,
}

// =============================================================================
// Sources and tokens
// =============================================================================

/// The cancelling side
#[derive(Debug, Clone, Default)]
pub struct CancellationSource {
    trigger: Trigger,
}

impl CancellationSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.trigger.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.trigger.is_cancelled()
    }

    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            triggers: vec![self.trigger.clone()],
            deadline: None,
        }
    }
}

/// The observing side; cancelled when any joined source is, or once its
/// deadline passes
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    triggers: Vec<Trigger>,
    deadline: Option<Instant>,
}

impl CancellationToken {
    /// A token that is never cancelled
    pub fn never() -> Self {
        Self::default()
    }

    /// Combine tokens; the result is cancelled when any input is
    pub fn join(tokens: &[&CancellationToken]) -> Self {
        let mut joined = Self::default();
        for token in tokens {
            joined.triggers.extend(token.triggers.iter().cloned());
            joined.deadline = match (joined.deadline, token.deadline) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        }
        joined
    }

    pub fn is_cancelled(&self) -> bool {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return true;
            }
        }
        self.triggers.iter().any(|t| t.is_cancelled())
    }

    /// `Err(Cancelled)` once cancelled, for use with `?`
    pub fn check(&self) -> Result<(), TaskError> {
        if self.is_cancelled() {
            Err(TaskError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

// =============================================================================
// Timed sources
// =============================================================================

/// Leftover time shared by a chain of timed tasks
#[derive(Debug, Default)]
pub struct BudgetPool {
    leftover: Mutex<Duration>,
}

impl BudgetPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take everything currently in the pool
    pub fn take(&self) -> Duration {
        std::mem::take(&mut *self.leftover.lock())
    }

    pub fn give(&self, unused: Duration) {
        *self.leftover.lock() += unused;
    }

    pub fn available(&self) -> Duration {
        *self.leftover.lock()
    }
}

/// Cancellation source with a wall-clock budget
#[derive(Debug)]
pub struct TimedCancellationSource {
    source: CancellationSource,
    deadline: Instant,
    pool: Option<Arc<BudgetPool>>,
}

impl TimedCancellationSource {
    /// Start a budget of `budget` plus whatever the pool holds
    pub fn new(budget: Duration, pool: Option<Arc<BudgetPool>>) -> Self {
        let extra = pool.as_ref().map(|p| p.take()).unwrap_or_default();
        Self {
            source: CancellationSource::new(),
            deadline: Instant::now() + budget + extra,
            pool,
        }
    }

    pub fn cancel(&self) {
        self.source.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.source.is_cancelled() || Instant::now() >= self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn token(&self) -> CancellationToken {
        let mut token = self.source.token();
        token.deadline = Some(self.deadline);
        token
    }
}

impl Drop for TimedCancellationSource {
    fn drop(&mut self) {
        if let Some(pool) = &self.pool {
            if !self.source.is_cancelled() {
                pool.give(self.remaining());
            }
        }
    }
}
