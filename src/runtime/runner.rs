use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

use crate::config::StepPolicy;
use crate::error::{PipelineError, classify};
use crate::runtime::budget::Budget;
use crate::runtime::state::{RunStateStore, StepName};
use crate::telemetry::EventSink;

/// Per-attempt context handed to a step body. The token is cancelled when the attempt
/// deadline trips; every fetch and model call inside the step must observe it.
#[derive(Clone)]
pub struct StepContext {
    pub step: StepName,
    pub attempt: u32,
    pub cancel: CancellationToken,
    pub budget: Budget,
    pub deadline: Instant,
    pub events: EventSink,
}

impl StepContext {
    pub fn detached(step: StepName, budget: Budget, timeout: Duration) -> Self {
        Self {
            step,
            attempt: 1,
            cancel: CancellationToken::new(),
            budget,
            deadline: Instant::now() + budget.bounded(timeout),
            events: EventSink::disabled(),
        }
    }

    pub fn remaining(&self) -> Duration {
        let until_deadline = self.deadline.saturating_duration_since(Instant::now());
        self.budget.bounded(until_deadline)
    }

    /// Timer for a nested call: `min(configured, attempt remaining, global remaining)`.
    pub fn bounded(&self, configured: Duration) -> Duration {
        configured.min(self.remaining())
    }

    pub fn check_cancelled(&self) -> Result<(), PipelineError> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        self.budget.enforce(self.step.as_str())
    }
}

/// Races `operation` against a timer and the cancellation token.
pub async fn bounded_call<T, F>(
    cancel: &CancellationToken,
    timeout: Duration,
    stage: &str,
    operation: F,
) -> Result<T, PipelineError>
where
    F: Future<Output = Result<T, PipelineError>>,
{
    if timeout.is_zero() {
        return Err(PipelineError::StepTimeout {
            step: stage.to_string(),
            timeout_ms: 0,
        });
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PipelineError::Cancelled),
        result = tokio::time::timeout(timeout, operation) => match result {
            Ok(inner) => inner,
            Err(_) => Err(PipelineError::StepTimeout {
                step: stage.to_string(),
                timeout_ms: duration_ms(timeout),
            }),
        },
    }
}

pub fn duration_ms(value: Duration) -> u64 {
    u64::try_from(value.as_millis()).unwrap_or(u64::MAX)
}

/// Exponential backoff capped at `max_ms`, plus up to 50% jitter on top of the cap.
pub fn calculate_backoff_ms(attempt: u32, base_ms: u64, max_ms: u64) -> u64 {
    backoff_with_jitter(attempt, base_ms, max_ms, rand::random::<f64>())
}

pub fn backoff_with_jitter(attempt: u32, base_ms: u64, max_ms: u64, unit: f64) -> u64 {
    let exponent = attempt.saturating_sub(1).min(32);
    let raw = base_ms.saturating_mul(1_u64 << exponent);
    let capped = raw.min(max_ms);
    let unit = if unit.is_finite() {
        unit.clamp(0.0, 1.0 - f64::EPSILON)
    } else {
        0.0
    };
    let jitter = ((capped as f64) * 0.5 * unit) as u64;
    capped.saturating_add(jitter)
}

pub async fn run_step<T, F, Fut>(
    store: &mut RunStateStore,
    budget: Budget,
    events: &EventSink,
    policy: &StepPolicy,
    step: StepName,
    mut operation: F,
) -> Result<T>
where
    F: FnMut(StepContext) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0_u32;

    loop {
        attempt += 1;

        if let Err(err) = budget.enforce(step.as_str()) {
            store.mark_failed(step, &err.to_string(), err.code(), false)?;
            return Err(err.into());
        }

        store.mark_running(step, attempt)?;
        let timeout = budget.bounded(policy.timeout);
        let cancel = CancellationToken::new();
        let scoped = events.scoped(step.as_str(), attempt);
        scoped.emit(
            "step-attempt-start",
            json!({"timeoutMs": duration_ms(timeout), "maxAttempts": max_attempts}),
        );

        let ctx = StepContext {
            step,
            attempt,
            cancel: cancel.clone(),
            budget,
            deadline: Instant::now() + timeout,
            events: scoped.clone(),
        };

        let span = info_span!("step", step = %step, attempt);
        let outcome = drive_attempt(operation(ctx), &cancel, timeout, policy.heartbeat, step)
            .instrument(span)
            .await;

        let err = match outcome {
            Ok(value) => {
                store.mark_succeeded(step)?;
                scoped.emit("step-succeeded", json!({}));
                info!(step = %step, attempt, "step succeeded");
                return Ok(value);
            }
            Err(err) => err,
        };

        let (code, retryable) = classify(&err);
        let message = format!("{err:#}");
        store.mark_attempt_failed(step, &message, code, retryable)?;
        scoped.emit(
            "step-attempt-failed",
            json!({"code": code, "retryable": retryable, "message": message}),
        );

        if !retryable || attempt >= max_attempts || budget.is_exhausted() {
            store.mark_failed(step, &message, code, retryable)?;
            warn!(step = %step, attempt, code, retryable, error = %message, "step failed");
            return Err(err);
        }

        let delay = budget.bounded(Duration::from_millis(calculate_backoff_ms(
            attempt,
            policy.backoff_base_ms,
            policy.backoff_max_ms,
        )));
        warn!(
            step = %step,
            attempt,
            code,
            delay_ms = duration_ms(delay),
            error = %message,
            "step attempt failed; retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

async fn drive_attempt<T, Fut>(
    operation: Fut,
    cancel: &CancellationToken,
    timeout: Duration,
    heartbeat: Duration,
    step: StepName,
) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    let started = Instant::now();
    tokio::pin!(operation);
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let heartbeat = heartbeat.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);

    loop {
        tokio::select! {
            result = &mut operation => return result,
            _ = &mut deadline => {
                cancel.cancel();
                return Err(PipelineError::StepTimeout {
                    step: step.to_string(),
                    timeout_ms: duration_ms(timeout),
                }
                .into());
            }
            _ = ticker.tick() => {
                info!(elapsed_ms = duration_ms(started.elapsed()), "step heartbeat");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::runtime::state::StepStatus;

    fn fast_policy(max_attempts: u32, timeout_ms: u64) -> StepPolicy {
        StepPolicy {
            max_attempts,
            timeout: Duration::from_millis(timeout_ms),
            backoff_base_ms: 1,
            backoff_max_ms: 2,
            heartbeat: Duration::from_millis(5),
        }
    }

    #[test]
    fn backoff_first_attempt_stays_within_half_jitter() {
        for _ in 0..500 {
            let value = calculate_backoff_ms(1, 100, 800);
            assert!((100..150).contains(&value), "got {value}");
        }
        assert_eq!(backoff_with_jitter(1, 100, 800, 0.0), 100);
        assert_eq!(backoff_with_jitter(1, 100, 800, 0.999_999), 149);
    }

    #[test]
    fn backoff_saturates_at_cap() {
        for _ in 0..500 {
            let value = calculate_backoff_ms(5, 100, 800);
            assert!((800..1200).contains(&value), "got {value}");
        }
        assert_eq!(backoff_with_jitter(40, 100, 800, 0.0), 800);
    }

    #[tokio::test]
    async fn retryable_errors_are_retried_until_success() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = RunStateStore::load_or_init(dir.path(), "run-1", "c", "p").unwrap();
        let calls = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&calls);
        let value = run_step(
            &mut store,
            Budget::unbounded(),
            &EventSink::disabled(),
            &fast_policy(3, 1_000),
            StepName::Download,
            move |_ctx| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        return Err(PipelineError::network("reset").into());
                    }
                    Ok(7)
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let state = store.step(StepName::Download);
        assert_eq!(state.status, StepStatus::Succeeded);
        assert_eq!(state.attempts, 2);
    }

    #[tokio::test]
    async fn non_retryable_errors_halt_on_first_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = RunStateStore::load_or_init(dir.path(), "run-1", "c", "p").unwrap();
        let calls = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&calls);
        let result: Result<()> = run_step(
            &mut store,
            Budget::unbounded(),
            &EventSink::disabled(),
            &fast_policy(3, 1_000),
            StepName::Select,
            move |_ctx| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(PipelineError::quality("selection-preflight", "queue empty").into())
                }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let state = store.step(StepName::Select);
        assert_eq!(state.status, StepStatus::Failed);
        assert_eq!(state.last_error_code.as_deref(), Some("quality"));
        assert_eq!(state.retryable, Some(false));
    }

    #[tokio::test]
    async fn attempt_timeout_cancels_token_and_exhausts_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = RunStateStore::load_or_init(dir.path(), "run-1", "c", "p").unwrap();
        let observed_cancel = Arc::new(AtomicU32::new(0));

        let observed = Arc::clone(&observed_cancel);
        let result: Result<()> = run_step(
            &mut store,
            Budget::unbounded(),
            &EventSink::disabled(),
            &fast_policy(2, 20),
            StepName::Discover,
            move |ctx| {
                let observed = Arc::clone(&observed);
                async move {
                    let token = ctx.cancel.clone();
                    tokio::spawn(async move {
                        token.cancelled().await;
                        observed.fetch_add(1, Ordering::SeqCst);
                    });
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                }
            },
        )
        .await;

        let err = result.unwrap_err();
        assert_eq!(classify(&err), ("step-timeout", true));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(observed_cancel.load(Ordering::SeqCst), 2);
        assert_eq!(store.step(StepName::Discover).attempts, 2);
    }

    #[tokio::test]
    async fn bounded_call_reports_timeout_and_cancellation() {
        let cancel = CancellationToken::new();
        let slow = bounded_call(&cancel, Duration::from_millis(10), "fetch", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, PipelineError>(())
        })
        .await;
        assert!(matches!(slow, Err(PipelineError::StepTimeout { .. })));

        cancel.cancel();
        let cancelled = bounded_call(&cancel, Duration::from_secs(5), "fetch", async {
            Ok::<_, PipelineError>(1)
        })
        .await;
        assert!(matches!(cancelled, Err(PipelineError::Cancelled)));
    }
}
