use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};
use unicode_normalization::UnicodeNormalization;

use crate::cli::{CleanupMode, FailurePolicy};
use crate::config::{CleanupGate, CleanupPolicy};
use crate::error::PipelineError;
use crate::llm::json::decode_response;
use crate::llm::{ModelClient, ModelRequest};
use crate::model::{
    CleanupAction, CleanupCandidateRecord, CleanupFlag, CleanupMetrics, CleanupResultRecord,
    ExtractedRecord, HybridOutcome, SourceType, Target, clamp_unit,
};
use crate::runtime::runner::StepContext;
use crate::util::{normalize_whitespace, truncate_chars};
use crate::vocab;

mod canonical;
mod classify;
mod hybrid;
mod metrics;

pub use canonical::canonicalize;
pub(crate) use classify::record_has_signal;
use classify::*;
use hybrid::*;
pub use metrics::{compute_metrics, evaluate_cleanup_gate};

#[derive(Debug, Clone)]
pub(crate) struct CleanupOutcome {
    pub candidates: Vec<CleanupCandidateRecord>,
    pub results: Vec<CleanupResultRecord>,
    pub metrics: CleanupMetrics,
    pub hybrid: Option<HybridOutcome>,
}

impl CleanupOutcome {
    pub fn clean_records(&self) -> Vec<CleanupResultRecord> {
        self.results
            .iter()
            .filter(|record| record.action.is_clean())
            .cloned()
            .collect()
    }
}

/// What the caller should do with a source after the gate ran.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum GateVerdict {
    Passed,
    Skipped(Vec<String>),
    RawFallback(Vec<String>),
}

/// Deterministic pass, then the optional model review, then metrics and the gate.
pub(crate) async fn run_cleanup(
    records: &[ExtractedRecord],
    target: Target,
    source_type: SourceType,
    policy: &CleanupPolicy,
    model: &dyn ModelClient,
    model_timeout: Duration,
    ctx: &StepContext,
) -> Result<CleanupOutcome, PipelineError> {
    let candidates = records
        .iter()
        .map(candidate_from_record)
        .collect::<Vec<CleanupCandidateRecord>>();
    let mut results = candidates.iter().map(decide).collect::<Vec<CleanupResultRecord>>();

    let mut degraded = false;
    let mut hybrid = None;
    if policy.mode == CleanupMode::Hybrid && benefits_from_review(source_type) {
        let (outcome, failed) = review_with_model(
            model,
            ctx,
            policy,
            model_timeout,
            target,
            &candidates,
            &mut results,
        )
        .await?;
        degraded = failed;
        hybrid = Some(outcome);
    }

    let mut metrics = compute_metrics(target, &candidates, &results, degraded);
    metrics.veto_reasons = evaluate_cleanup_gate(&metrics, &policy.gate);

    info!(
        target = %target,
        total = metrics.total,
        clean = metrics.clean_count,
        pass_rate = metrics.pass_rate,
        noise_ratio = metrics.noise_ratio,
        degraded,
        "cleanup finished"
    );

    Ok(CleanupOutcome {
        candidates,
        results,
        metrics,
        hybrid,
    })
}

/// Maps gate failures onto the configured policy. `fail-run` aborts the step with a
/// quality error; a raw fallback is only honoured when explicitly allowed.
pub(crate) fn apply_failure_policy(
    source_id: &str,
    target: Target,
    reasons: &[String],
    policy: &CleanupPolicy,
) -> Result<GateVerdict, PipelineError> {
    if reasons.is_empty() {
        return Ok(GateVerdict::Passed);
    }

    match policy.failure_policy {
        FailurePolicy::Skip => Ok(GateVerdict::Skipped(reasons.to_vec())),
        FailurePolicy::FailRun => Err(PipelineError::quality(
            "cleanup",
            format!("{source_id}/{target}: {}", reasons.join(", ")),
        )),
        FailurePolicy::RawFallback if policy.allow_raw_fallback => {
            warn!(source_id, target = %target, reasons = %reasons.join(","), "accepting raw fallback");
            Ok(GateVerdict::RawFallback(reasons.to_vec()))
        }
        FailurePolicy::RawFallback => {
            let mut skipped = reasons.to_vec();
            skipped.push("raw-fallback-not-allowed".to_string());
            Ok(GateVerdict::Skipped(skipped))
        }
    }
}

/// Every non-empty record, kept as canonicalised, bypassing the noise filter.
pub(crate) fn raw_fallback_records(candidates: &[CleanupCandidateRecord]) -> Vec<CleanupResultRecord> {
    candidates
        .iter()
        .filter(|candidate| !candidate.has_flag(CleanupFlag::Empty))
        .map(|candidate| CleanupResultRecord {
            record_id: candidate.record_id.clone(),
            source_id: candidate.source_id.clone(),
            target: candidate.target,
            action: CleanupAction::Keep,
            text: candidate.canonical_text.clone(),
            confidence: 0.3,
            reason_tags: vec!["raw-fallback".to_string()],
            fields: candidate.fields.clone(),
            decided_by: "raw-fallback".to_string(),
        })
        .collect()
}
