use super::*;

const SYSTEM_PROMPT: &str = "You pick the single best data source for a Japanese municipal \
waste dataset. Choose only among the listed source ids, using the scores and sample lines. \
Answer only with JSON matching the schema.";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelChoice {
    primary_source_id: String,
    #[serde(default)]
    reason: Option<String>,
}

fn choice_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "primarySourceId": {"type": "string"},
            "reason": {"type": "string"}
        },
        "required": ["primarySourceId"],
        "additionalProperties": false
    })
}

/// First few clean lines for a source, for the model to compare content.
pub(super) fn evidence_snippets(layout: &RunLayout, source_id: &str, target: Target) -> Vec<String> {
    let path = layout.extract_dir(source_id, target).join(CLEAN_RECORDS_FILE);
    if !path.exists() {
        return Vec::new();
    }
    match read_ndjson::<CleanupResultRecord>(&path) {
        Ok(records) => records
            .iter()
            .take(EVIDENCE_SNIPPETS)
            .map(|record| truncate_chars(&record.text, EVIDENCE_SNIPPET_CHARS))
            .collect(),
        Err(err) => {
            warn!(source_id, target = %target, error = %err, "failed to read evidence snippets");
            Vec::new()
        }
    }
}

fn choice_prompt(target: Target, top: &[RankedSource], evidence: &BTreeMap<String, Vec<String>>) -> String {
    let listing = top
        .iter()
        .map(|candidate| {
            json!({
                "id": candidate.source_id,
                "score": (candidate.rank_score * 1000.0).round() / 1000.0,
                "records": candidate.records,
                "officialness": candidate.quality.officialness,
                "noisePenalty": candidate.quality.noise_penalty,
                "samples": evidence.get(&candidate.source_id).cloned().unwrap_or_default(),
            })
            .to_string()
        })
        .collect::<Vec<String>>()
        .join("\n");
    format!(
        "Target dataset: {target}\nCandidates (one JSON object per line):\n{listing}\n\nReturn {{\"primarySourceId\": <one of the ids>, \"reason\": <short reason>}}."
    )
}

/// Asks the model to choose among `top`. Any failure or an id outside `top` yields
/// `None` so the deterministic order stands; only cancellation is surfaced.
pub(super) async fn ask_model(
    model: &dyn ModelClient,
    ctx: &StepContext,
    model_timeout: Duration,
    target: Target,
    top: &[RankedSource],
    evidence: &BTreeMap<String, Vec<String>>,
) -> Result<Option<String>, PipelineError> {
    ctx.check_cancelled()?;
    let request = ModelRequest::new("select-primary", SYSTEM_PROMPT, choice_prompt(target, top, evidence))
        .with_schema(choice_schema())
        .with_timeout(ctx.bounded(model_timeout));

    let response = match model.generate(&request, None, &ctx.cancel).await {
        Ok(response) => response,
        Err(PipelineError::Cancelled) if ctx.cancel.is_cancelled() => {
            return Err(PipelineError::Cancelled);
        }
        Err(err) => {
            warn!(target = %target, error = %err, "selection model call failed; keeping deterministic order");
            return Ok(None);
        }
    };

    let choice = match decode_response::<ModelChoice>(response.structured.as_ref(), &response.text) {
        Ok(decoded) => decoded.into_inner(),
        Err(err) => {
            warn!(target = %target, error = %err, "selection model answer unreadable; keeping deterministic order");
            return Ok(None);
        }
    };

    let allowed = top
        .iter()
        .map(|candidate| candidate.source_id.as_str())
        .collect::<HashSet<&str>>();
    let chosen = choice.primary_source_id.trim();
    if !allowed.contains(chosen) {
        warn!(target = %target, chosen, "selection model chose an id outside the candidates");
        return Ok(None);
    }

    debug!(target = %target, chosen, reason = choice.reason.as_deref().unwrap_or(""), "model selection");
    Ok(Some(chosen.to_string()))
}
