use super::*;

const REVIEW_TEXT_MAX_CHARS: usize = 400;

const SYSTEM_PROMPT: &str = "You review lines extracted from Japanese municipal waste-collection \
pages. For each line decide whether it is real data for the requested target (keep), real data \
whose wording needs a cleaned form (rename, give the cleaned text), or navigation/layout/noise \
(drop). Answer only with JSON matching the schema.";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ReviewDecision {
    pub id: String,
    pub action: String,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub reason_tags: Vec<String>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReviewDecisions {
    decisions: Vec<ReviewDecision>,
}

#[derive(Debug, Clone, PartialEq)]
pub(super) struct ReviewChunk {
    pub ids: Vec<String>,
    pub payload: String,
}

pub(super) fn benefits_from_review(source_type: SourceType) -> bool {
    matches!(source_type, SourceType::Html | SourceType::Pdf | SourceType::Image)
}

/// Packs review lines into byte-budgeted chunks. A line larger than the budget gets a
/// chunk of its own; lines beyond `max_chunks` are left with their deterministic decision.
pub(super) fn build_chunks(
    items: &[&CleanupCandidateRecord],
    max_bytes: usize,
    max_chunks: usize,
) -> (Vec<ReviewChunk>, usize) {
    let mut chunks: Vec<ReviewChunk> = Vec::new();
    let mut current = ReviewChunk {
        ids: Vec::new(),
        payload: String::new(),
    };
    let mut skipped = 0_usize;

    for item in items {
        let line = json!({
            "id": item.record_id,
            "text": truncate_chars(&item.canonical_text, REVIEW_TEXT_MAX_CHARS),
            "flags": item.flags,
        })
        .to_string();

        if !current.ids.is_empty() && current.payload.len() + line.len() + 1 > max_bytes {
            chunks.push(std::mem::replace(
                &mut current,
                ReviewChunk {
                    ids: Vec::new(),
                    payload: String::new(),
                },
            ));
        }
        if chunks.len() >= max_chunks {
            skipped += 1;
            continue;
        }
        current.ids.push(item.record_id.clone());
        current.payload.push_str(&line);
        current.payload.push('\n');
    }

    if !current.ids.is_empty() && chunks.len() < max_chunks {
        chunks.push(current);
    }
    (chunks, skipped)
}

fn parse_action(value: &str) -> Option<CleanupAction> {
    match value.trim().to_ascii_lowercase().as_str() {
        "keep" => Some(CleanupAction::Keep),
        "rename" => Some(CleanupAction::Rename),
        "drop" => Some(CleanupAction::Drop),
        _ => None,
    }
}

/// Applies a model decision to a record. Actions only move forward along
/// `keep -> rename -> drop`; a decision that would move backward is ignored.
pub(super) fn apply_override(
    current: &CleanupResultRecord,
    decision: &ReviewDecision,
) -> (CleanupResultRecord, bool) {
    let mut next = current.clone();
    let Some(action) = parse_action(&decision.action) else {
        next.reason_tags.push("override-unrecognized".to_string());
        return (next, false);
    };
    if action.stage() < current.action.stage() {
        next.reason_tags.push("override-blocked-regression".to_string());
        return (next, false);
    }

    next.action = action;
    next.decided_by = "hybrid".to_string();
    if action == CleanupAction::Rename {
        let proposed = decision.text.as_deref().unwrap_or(&current.text);
        let renamed = canonicalize(proposed);
        if renamed.is_empty() {
            next.action = CleanupAction::Drop;
            next.reason_tags.push("empty-rename".to_string());
        } else {
            next.text = renamed;
        }
    }
    if let Some(confidence) = decision.confidence {
        next.confidence = clamp_unit(confidence);
    }
    next.reason_tags.extend(
        decision
            .reason_tags
            .iter()
            .map(|tag| format!("model:{}", tag.trim()))
            .filter(|tag| tag.len() > "model:".len()),
    );
    (next, true)
}

fn review_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "decisions": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "id": {"type": "string"},
                        "action": {"type": "string", "enum": ["keep", "rename", "drop"]},
                        "confidence": {"type": "number"},
                        "reasonTags": {"type": "array", "items": {"type": "string"}},
                        "text": {"type": "string"}
                    },
                    "required": ["id", "action"]
                }
            }
        },
        "required": ["decisions"]
    })
}

fn review_prompt(target: Target, payload: &str) -> String {
    format!(
        "Target: {target}\nRequired features: {}\nLines (one JSON object per line):\n{payload}\n\
         Return {{\"decisions\": [{{\"id\", \"action\", \"confidence\", \"reasonTags\", \"text\"}}]}} \
         with one entry per id you are confident about.",
        target.required_features().join(", ")
    )
}

/// Sends ambiguous and layout-like records to the model in chunks. A failed chunk marks
/// the outcome degraded and is otherwise ignored; only cancellation stops the pass.
pub(super) async fn review_with_model(
    model: &dyn ModelClient,
    ctx: &StepContext,
    policy: &CleanupPolicy,
    model_timeout: Duration,
    target: Target,
    candidates: &[CleanupCandidateRecord],
    results: &mut [CleanupResultRecord],
) -> Result<(HybridOutcome, bool), PipelineError> {
    let review_items = candidates
        .iter()
        .zip(results.iter())
        .filter(|(candidate, result)| needs_review(candidate, result))
        .map(|(candidate, _)| candidate)
        .collect::<Vec<&CleanupCandidateRecord>>();

    let mut outcome = HybridOutcome {
        reviewed: review_items.len(),
        ..HybridOutcome::default()
    };
    if review_items.is_empty() {
        return Ok((outcome, false));
    }

    let (chunks, skipped) = build_chunks(&review_items, policy.chunk_max_bytes, policy.max_chunks);
    outcome.skipped_over_cap = skipped;
    let mut degraded = false;

    for (index, chunk) in chunks.iter().enumerate() {
        ctx.check_cancelled()?;
        outcome.chunks_sent += 1;

        let request = ModelRequest::new("cleanup-review", SYSTEM_PROMPT, review_prompt(target, &chunk.payload))
            .with_schema(review_schema())
            .with_timeout(ctx.bounded(model_timeout));
        let decisions = match model.generate(&request, None, &ctx.cancel).await {
            Ok(response) => decode_response::<ReviewDecisions>(response.structured.as_ref(), &response.text),
            Err(PipelineError::Cancelled) if ctx.cancel.is_cancelled() => {
                return Err(PipelineError::Cancelled);
            }
            Err(err) => Err(err),
        };

        let decisions = match decisions {
            Ok(decoded) => decoded.into_inner().decisions,
            Err(err) => {
                warn!(chunk = index, target = %target, error = %err, "cleanup review chunk failed");
                ctx.events.emit(
                    "cleanup-chunk-failed",
                    json!({"chunk": index, "target": target, "code": err.code(), "message": err.to_string()}),
                );
                outcome.chunks_failed += 1;
                degraded = true;
                continue;
            }
        };

        for decision in decisions {
            if !chunk.ids.contains(&decision.id) {
                continue;
            }
            let Some(slot) = results.iter_mut().find(|result| result.record_id == decision.id) else {
                continue;
            };
            let (next, applied) = apply_override(slot, &decision);
            if applied {
                outcome.overrides += 1;
            } else {
                outcome.blocked += 1;
            }
            *slot = next;
        }
    }

    Ok((outcome, degraded))
}
