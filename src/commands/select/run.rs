use super::*;

fn selection_inputs<'a>(
    target: Target,
    cleanup: &'a CleanupReport,
    execution: &ExecutionReport,
    plan: &ExtractionPlan,
) -> Vec<SelectionInput<'a>> {
    cleanup
        .accepted(target)
        .filter(|entry| entry.clean_records > 0)
        .map(|entry| SelectionInput {
            cleanup: entry,
            trust_score: plan
                .source(&entry.source_id)
                .map(|source| source.trust_score)
                .unwrap_or(0.0),
            parse_success: execution
                .task(&entry.source_id, target)
                .map(|task| task.parse_success)
                .unwrap_or(0.0),
            discover_rank: plan
                .tasks
                .iter()
                .find(|task| task.source_id == entry.source_id && task.target == target)
                .and_then(|task| task.rank),
        })
        .collect()
}

/// Ranks, optionally consults the model, then runs the preflight walk for one target.
pub async fn select_primary(
    deps: PipelineDeps<'_>,
    ctx: &StepContext,
    target: Target,
    ranked: &[RankedSource],
) -> Result<PrimarySelectionDecision, PipelineError> {
    let policy = &deps.options.selection;
    let top_k = policy.top_k.max(1).min(ranked.len());
    let top = &ranked[..top_k];

    let mut model_choice = None;
    if should_consult_model(policy, ranked) {
        let evidence = top
            .iter()
            .map(|candidate| {
                (
                    candidate.source_id.clone(),
                    evidence_snippets(deps.layout, &candidate.source_id, target),
                )
            })
            .collect::<BTreeMap<String, Vec<String>>>();
        model_choice = ask_model(deps.model, ctx, deps.options.model.timeout, target, top, &evidence).await?;
    }

    let mut queue = Vec::with_capacity(ranked.len());
    if let Some(chosen) = &model_choice
        && let Some(candidate) = ranked.iter().find(|candidate| &candidate.source_id == chosen)
    {
        queue.push(candidate);
    }
    queue.extend(
        ranked
            .iter()
            .filter(|candidate| Some(&candidate.source_id) != model_choice.as_ref()),
    );

    let (primary, secondaries, veto_reasons) = walk_queue(
        target,
        &queue,
        &policy.preflight,
        policy.top_k.saturating_sub(1),
    )?;

    Ok(PrimarySelectionDecision {
        target,
        primary_source_id: primary,
        secondary_source_ids: secondaries,
        vetoed: !veto_reasons.is_empty(),
        veto_reasons,
        mode: policy.mode.as_str().to_string(),
        model_choice,
    })
}

pub async fn run(deps: PipelineDeps<'_>, ctx: &StepContext) -> Result<SelectionReport> {
    let cleanup: CleanupReport = read_json(&deps.layout.file(CLEANUP_REPORT))?;
    let execution: ExecutionReport = read_json(&deps.layout.file(EXECUTION_REPORT))?;
    let plan: ExtractionPlan = read_json(&deps.layout.file(EXTRACTION_PLAN))?;

    let mut decisions = Vec::new();
    let mut ranked_by_target = BTreeMap::new();
    let mut failures = Vec::new();
    for target in Target::ALL {
        ctx.check_cancelled()?;
        let inputs = selection_inputs(target, &cleanup, &execution, &plan);
        let ranked = rank_sources(&inputs);

        match select_primary(deps, ctx, target, &ranked).await {
            Ok(decision) => {
                info!(
                    target = %target,
                    primary = %decision.primary_source_id,
                    secondaries = decision.secondary_source_ids.len(),
                    vetoed = decision.vetoed,
                    model_choice = decision.model_choice.as_deref().unwrap_or(""),
                    "primary selected"
                );
                ctx.events.emit(
                    "primary-selected",
                    json!({
                        "target": target,
                        "primary": decision.primary_source_id,
                        "vetoReasons": decision.veto_reasons,
                    }),
                );
                decisions.push(decision);
            }
            Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled.into()),
            Err(err) => {
                warn!(target = %target, error = %err, "no primary for target");
                failures.push(err);
            }
        }
        ranked_by_target.insert(target, ranked);
    }

    let report = SelectionReport {
        report_version: REPORT_VERSION,
        run_id: deps.run_id.to_string(),
        generated_at: now_utc_string(),
        decisions,
        ranked: ranked_by_target,
    };
    write_json_pretty(&deps.layout.file(SELECTION_REPORT), &report)?;

    if let Some(err) = failures.into_iter().next() {
        return Err(err.into());
    }
    Ok(report)
}
