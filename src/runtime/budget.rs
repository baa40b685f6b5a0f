use std::time::{Duration, Instant};

use crate::error::PipelineError;

/// Process-wide time budget. Copyable so every nested operation can derive its own
/// deadline from the same start instant.
#[derive(Debug, Clone, Copy)]
pub struct Budget {
    started: Instant,
    total: Option<Duration>,
}

impl Budget {
    pub fn new(total_ms: u64) -> Self {
        Self {
            started: Instant::now(),
            total: (total_ms > 0).then(|| Duration::from_millis(total_ms)),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(0)
    }

    #[cfg(test)]
    pub fn started_at(started: Instant, total_ms: u64) -> Self {
        Self {
            started,
            total: (total_ms > 0).then(|| Duration::from_millis(total_ms)),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.total
            .map(|total| total.saturating_sub(self.started.elapsed()))
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining().map(|value| value.is_zero()).unwrap_or(false)
    }

    /// `min(configured, remaining)`; nothing derived from the budget can outlive it.
    pub fn bounded(&self, configured: Duration) -> Duration {
        match self.remaining() {
            Some(remaining) => configured.min(remaining),
            None => configured,
        }
    }

    pub fn enforce(&self, stage: &str) -> Result<(), PipelineError> {
        if self.is_exhausted() {
            return Err(PipelineError::BudgetExhausted {
                stage: stage.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_budget_passes_configured_value_through() {
        let budget = Budget::unbounded();
        assert_eq!(budget.remaining(), None);
        assert_eq!(
            budget.bounded(Duration::from_secs(30)),
            Duration::from_secs(30)
        );
        assert!(budget.enforce("discover").is_ok());
    }

    #[test]
    fn bounded_never_exceeds_remaining() {
        let started = Instant::now() - Duration::from_millis(900);
        let budget = Budget::started_at(started, 1_000);
        let bounded = budget.bounded(Duration::from_secs(30));
        assert!(bounded <= Duration::from_millis(100));
    }

    #[test]
    fn exhausted_budget_reports_stage() {
        let started = Instant::now() - Duration::from_millis(50);
        let budget = Budget::started_at(started, 10);
        assert!(budget.is_exhausted());
        let err = budget.enforce("select").unwrap_err();
        assert_eq!(err.code(), "budget-exhausted");
        assert!(err.to_string().contains("select"));
    }
}
