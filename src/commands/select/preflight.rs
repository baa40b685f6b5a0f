use super::*;

/// Reasons `candidate` may not become a primary. Empty means it passes.
pub fn preflight_reasons(candidate: &RankedSource, gate: &PreflightGate) -> Vec<String> {
    let quality = &candidate.quality;
    let mut reasons = Vec::new();
    if candidate.records == 0 {
        reasons.push("no-records".to_string());
    }
    if quality.confidence < gate.min_confidence {
        reasons.push(format!(
            "confidence-below-threshold:{:.3}<{:.3}",
            quality.confidence, gate.min_confidence
        ));
    }
    if quality.noise_penalty > gate.max_noise_penalty {
        reasons.push(format!(
            "noise-penalty-above-threshold:{:.3}>{:.3}",
            quality.noise_penalty, gate.max_noise_penalty
        ));
    }
    if quality.parse_success < gate.min_parse_success {
        reasons.push(format!(
            "parse-success-below-threshold:{:.3}<{:.3}",
            quality.parse_success, gate.min_parse_success
        ));
    }
    reasons
}

/// Walks `queue` in order. The first candidate that passes the gate becomes primary and
/// the next passing ones (up to `max_secondaries`) its fallbacks; every candidate vetoed
/// before the primary is reported as `<id>:<reason>`.
pub fn walk_queue(
    target: Target,
    queue: &[&RankedSource],
    gate: &PreflightGate,
    max_secondaries: usize,
) -> Result<(String, Vec<String>, Vec<String>), PipelineError> {
    let mut primary: Option<String> = None;
    let mut secondaries = Vec::new();
    let mut veto_reasons = Vec::new();

    for candidate in queue {
        let reasons = preflight_reasons(candidate, gate);
        if !reasons.is_empty() {
            if primary.is_none() {
                debug!(target = %target, source_id = %candidate.source_id, reasons = %reasons.join(","), "candidate vetoed");
                veto_reasons.extend(
                    reasons
                        .into_iter()
                        .map(|reason| format!("{}:{reason}", candidate.source_id)),
                );
            }
            continue;
        }
        match primary {
            None => primary = Some(candidate.source_id.clone()),
            Some(_) if secondaries.len() < max_secondaries => {
                secondaries.push(candidate.source_id.clone());
            }
            Some(_) => break,
        }
    }

    match primary {
        Some(primary) => Ok((primary, secondaries, veto_reasons)),
        None if queue.is_empty() => Err(PipelineError::quality(
            "selection-preflight",
            format!("{target}: no cleaned candidate survived extraction"),
        )),
        None => Err(PipelineError::quality(
            "selection-preflight",
            format!(
                "{target}: all {} candidates vetoed ({})",
                queue.len(),
                veto_reasons.join("; ")
            ),
        )),
    }
}
