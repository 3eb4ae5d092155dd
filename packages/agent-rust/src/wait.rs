//! Bounded polling.
//!
//! Every "wait until X" in the agent goes through [`poll_until`]: a check is
//! evaluated, and between evaluations the task sleeps on tokio's timer. Tests
//! pause tokio time, so multi-hour budgets complete instantly. Exhausting the
//! budget is always surfaced as `EngineError::WaitTimeout`.

use std::future::Future;
use std::time::Duration;

use ddb_core::ClockSource;
use tracing::debug;

use crate::error::{EngineError, EngineResult};

/// Poll cadence and attempt limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollBudget {
    pub interval: Duration,
    /// Sleeps allowed between the first and the last check.
    pub max_attempts: u32,
}

impl PollBudget {
    #[must_use]
    pub const fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Budget that polls every `step` until `timeout` has elapsed.
    #[must_use]
    pub fn within(step: Duration, timeout: Duration) -> Self {
        let step = step.max(Duration::from_millis(1));
        let attempts = timeout.as_millis().div_ceil(step.as_millis());
        Self::new(step, u32::try_from(attempts).unwrap_or(u32::MAX))
    }

    /// Longest time a wait with this budget can take.
    #[must_use]
    pub fn total(&self) -> Duration {
        self.interval.saturating_mul(self.max_attempts)
    }
}

/// Evaluates `check` until it yields a value or the budget is exhausted.
///
/// The check runs once immediately and once after each sleep, so a budget
/// of `n` attempts evaluates it `n + 1` times.
///
/// # Errors
///
/// Returns the check's own error as soon as it fails, or
/// `EngineError::WaitTimeout` naming `what` once the budget is spent.
pub async fn poll_until<T, F, Fut>(what: &str, budget: PollBudget, mut check: F) -> EngineResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = EngineResult<Option<T>>>,
{
    for attempt in 0..=budget.max_attempts {
        if let Some(value) = check().await? {
            return Ok(value);
        }
        if attempt < budget.max_attempts {
            debug!(what, attempt, "condition not met yet, sleeping {:?}", budget.interval);
            tokio::time::sleep(budget.interval).await;
        }
    }
    Err(EngineError::WaitTimeout {
        what: what.to_string(),
        budget: budget.total(),
    })
}

// ---------------------------------------------------------------------------
// TokioClock
// ---------------------------------------------------------------------------

/// Wall clock that advances with tokio's timer.
///
/// Anchored at `origin_ms` when constructed; under a paused runtime it moves
/// exactly as far as tokio's virtual time does.
#[derive(Debug, Clone)]
pub struct TokioClock {
    origin_ms: u64,
    origin: tokio::time::Instant,
}

impl TokioClock {
    #[must_use]
    pub fn new(origin_ms: u64) -> Self {
        Self {
            origin_ms,
            origin: tokio::time::Instant::now(),
        }
    }
}

impl ClockSource for TokioClock {
    fn now(&self) -> u64 {
        let elapsed = u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.origin_ms.saturating_add(elapsed)
    }
}
