use super::*;

/// Minimum canonical length for a categorised clean line to count as an item name.
const ITEM_TEXT_MIN_CHARS: usize = 4;

fn ratio(part: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    part as f64 / total as f64
}

fn feature_observed(feature: &str, clean: &[&CleanupResultRecord]) -> bool {
    match feature {
        "category" => clean.iter().any(|record| {
            vocab::has_any(&record.text, vocab::CATEGORY_KEYWORDS)
                || record
                    .fields
                    .values()
                    .any(|value| vocab::has_any(value, vocab::CATEGORY_KEYWORDS))
        }),
        "date-or-weekday" => clean.iter().any(|record| {
            vocab::has_date_or_weekday(&record.text)
                || record.fields.values().any(|value| vocab::has_date_or_weekday(value))
        }),
        "item-name" => clean.iter().any(|record| {
            record
                .fields
                .iter()
                .any(|(key, value)| vocab::has_any(key, vocab::ITEM_FIELD_KEYWORDS) && !value.is_empty())
                || (vocab::has_any(&record.text, vocab::CATEGORY_KEYWORDS)
                    && record.text.chars().count() >= ITEM_TEXT_MIN_CHARS)
        }),
        _ => false,
    }
}

pub fn compute_metrics(
    target: Target,
    candidates: &[CleanupCandidateRecord],
    results: &[CleanupResultRecord],
    degraded: bool,
) -> CleanupMetrics {
    let total = results.len();
    let kept = results.iter().filter(|r| r.action == CleanupAction::Keep).count();
    let renamed = results.iter().filter(|r| r.action == CleanupAction::Rename).count();
    let dropped = results.iter().filter(|r| r.action == CleanupAction::Drop).count();
    let clean = results
        .iter()
        .filter(|record| record.action.is_clean())
        .collect::<Vec<&CleanupResultRecord>>();
    let noise_count = candidates
        .iter()
        .filter(|candidate| candidate.has_flag(CleanupFlag::Noise))
        .count();

    let with_signal = clean
        .iter()
        .filter(|record| record_has_signal(&record.text, &record.fields, target))
        .count();

    let required = target.required_features();
    let observed = required
        .iter()
        .filter(|feature| feature_observed(feature, &clean))
        .count();

    let mean_confidence = if clean.is_empty() {
        0.0
    } else {
        clean.iter().map(|record| record.confidence).sum::<f64>() / clean.len() as f64
    };

    CleanupMetrics {
        total,
        kept,
        renamed,
        dropped,
        clean_count: clean.len(),
        noise_count,
        pass_rate: ratio(clean.len(), total),
        noise_ratio: ratio(noise_count, candidates.len()),
        schema_signal_rate: ratio(with_signal, clean.len()),
        required_field_coverage: ratio(observed, required.len()),
        mean_confidence: clamp_unit(mean_confidence),
        degraded,
        veto_reasons: Vec::new(),
    }
}

/// Reasons the cleaned output fails the quality gate; empty means it passes.
pub fn evaluate_cleanup_gate(metrics: &CleanupMetrics, gate: &CleanupGate) -> Vec<String> {
    let mut reasons = Vec::new();
    if metrics.clean_count == 0 {
        reasons.push("no-clean-records".to_string());
    }
    if metrics.pass_rate < gate.min_pass_rate {
        reasons.push(format!(
            "pass-rate-below-threshold:{:.3}<{:.3}",
            metrics.pass_rate, gate.min_pass_rate
        ));
    }
    if metrics.noise_ratio > gate.max_noise_ratio {
        reasons.push(format!(
            "noise-ratio-above-threshold:{:.3}>{:.3}",
            metrics.noise_ratio, gate.max_noise_ratio
        ));
    }
    if metrics.schema_signal_rate < gate.min_schema_signal_rate {
        reasons.push(format!(
            "schema-signal-below-threshold:{:.3}<{:.3}",
            metrics.schema_signal_rate, gate.min_schema_signal_rate
        ));
    }
    reasons
}
