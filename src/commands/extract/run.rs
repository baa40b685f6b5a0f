use super::*;

pub async fn run(deps: PipelineDeps<'_>, ctx: &StepContext) -> Result<(ExecutionReport, CleanupReport)> {
    let plan: ExtractionPlan = read_json(&deps.layout.file(EXTRACTION_PLAN))?;

    let mut tasks = Vec::with_capacity(plan.tasks.len());
    let mut sources = Vec::with_capacity(plan.tasks.len());
    for task in &plan.tasks {
        ctx.check_cancelled()?;
        let (execution, cleanup) = extract_task(deps, ctx, &plan, task).await?;
        ctx.events.emit(
            "extract-task-finished",
            serde_json::json!({
                "taskId": task.task_id,
                "executor": execution.executor,
                "records": execution.records,
                "gate": cleanup.status,
                "reasons": cleanup.reasons,
            }),
        );
        tasks.push(execution);
        sources.push(cleanup);
    }

    let generated_at = now_utc_string();
    let execution_report = ExecutionReport {
        report_version: REPORT_VERSION,
        run_id: deps.run_id.to_string(),
        generated_at: generated_at.clone(),
        tasks,
    };
    let cleanup_report = CleanupReport {
        report_version: REPORT_VERSION,
        run_id: deps.run_id.to_string(),
        generated_at,
        sources,
    };
    write_json_pretty(&deps.layout.file(EXECUTION_REPORT), &execution_report)?;
    write_json_pretty(&deps.layout.file(CLEANUP_REPORT), &cleanup_report)?;

    let accepted = cleanup_report
        .sources
        .iter()
        .filter(|entry| entry.status.is_accepted() && entry.clean_records > 0)
        .count();
    info!(
        tasks = execution_report.tasks.len(),
        accepted,
        "extraction and cleanup finished"
    );

    if accepted == 0 {
        return Err(PipelineError::quality(
            "extraction",
            format!(
                "none of {} tasks produced records that passed cleanup",
                execution_report.tasks.len()
            ),
        )
        .into());
    }

    Ok((execution_report, cleanup_report))
}

async fn extract_task(
    deps: PipelineDeps<'_>,
    ctx: &StepContext,
    plan: &ExtractionPlan,
    task: &ExtractionTask,
) -> Result<(TaskExecution, CleanupSourceReport)> {
    let source = plan.source(&task.source_id).ok_or_else(|| {
        PipelineError::Pipeline(format!(
            "task {} references source {} missing from the plan",
            task.task_id, task.source_id
        ))
    })?;
    let path = deps.layout.run_dir().join(&source.local_path);
    let bytes = fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
    let charset = source.charset.clone().or_else(|| sniff_meta_charset(&bytes));

    let dispatched = dispatch(
        task.executor_type,
        &task.fallback,
        &ExecutorInput {
            source_id: &source.id,
            target: task.target,
            depth: 0,
            record_prefix: task.task_id.clone(),
            base_url: &source.url,
            local_path: &source.local_path,
            bytes: &bytes,
            charset: charset.as_deref(),
        },
    );
    let parse_success = dispatched.parse_success();
    let executor = dispatched.executor;
    let mut attempts = dispatched.attempts;
    let mut records = dispatched.output.records;
    let links = dispatched.output.links;

    let followed = follow_links(deps, ctx, task, &links, &mut records, &mut attempts).await?;

    let dir = deps.layout.extract_dir(&task.source_id, task.target);
    write_ndjson(&dir.join(RAW_RECORDS_FILE), &records)?;

    let outcome = run_cleanup(
        &records,
        task.target,
        task.source_type,
        &deps.options.cleanup,
        deps.model,
        deps.options.model.timeout,
        ctx,
    )
    .await?;
    write_ndjson(&dir.join(CANDIDATE_RECORDS_FILE), &outcome.candidates)?;

    let verdict = apply_failure_policy(
        &task.source_id,
        task.target,
        &outcome.metrics.veto_reasons,
        &deps.options.cleanup,
    )?;
    let (status, reasons, clean) = match verdict {
        GateVerdict::Passed => (GateStatus::Passed, Vec::new(), outcome.clean_records()),
        GateVerdict::Skipped(reasons) => (GateStatus::Skipped, reasons, outcome.clean_records()),
        GateVerdict::RawFallback(reasons) => (
            GateStatus::RawFallback,
            reasons,
            raw_fallback_records(&outcome.candidates),
        ),
    };
    write_ndjson(&dir.join(CLEAN_RECORDS_FILE), &clean)?;

    if status == GateStatus::Skipped {
        warn!(
            task_id = %task.task_id,
            reasons = %reasons.join(","),
            "source skipped by cleanup gate"
        );
    }

    Ok((
        TaskExecution {
            task_id: task.task_id.clone(),
            source_id: task.source_id.clone(),
            target: task.target,
            source_type: task.source_type,
            executor,
            attempts,
            records: records.len(),
            followed_links: followed,
            parse_success,
        },
        CleanupSourceReport {
            task_id: task.task_id.clone(),
            source_id: task.source_id.clone(),
            target: task.target,
            source_type: task.source_type,
            status,
            reasons,
            clean_records: clean.len(),
            metrics: outcome.metrics,
            hybrid: outcome.hybrid,
        },
    ))
}

/// Fetches the best-scoring outbound links once and extracts them with their own
/// capability chain. A failed fetch is logged and skipped; cancellation is not.
async fn follow_links(
    deps: PipelineDeps<'_>,
    ctx: &StepContext,
    task: &ExtractionTask,
    links: &[LinkCandidate],
    records: &mut Vec<ExtractedRecord>,
    attempts: &mut Vec<ExecutorAttempt>,
) -> Result<Vec<String>, PipelineError> {
    let picks = links
        .iter()
        .filter(|link| link.score >= FOLLOW_LINK_MIN_SCORE)
        .take(deps.options.fetch.max_follow_links);

    let mut followed = Vec::new();
    for (index, link) in picks.enumerate() {
        ctx.check_cancelled()?;
        let timeout = ctx.bounded(deps.options.fetch.timeout);
        let document = match deps.fetcher.fetch(&link.url, &ctx.cancel, timeout).await {
            Ok(document) => document,
            Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
            Err(err) => {
                warn!(task_id = %task.task_id, url = %link.url, error = %err, "link fetch failed");
                continue;
            }
        };

        let (primary, fallback) = capability_chain(document.source_type());
        let dispatched = dispatch(
            primary,
            &fallback,
            &ExecutorInput {
                source_id: &task.source_id,
                target: task.target,
                depth: 1,
                record_prefix: format!("{}:l{}", task.task_id, index + 1),
                base_url: &document.final_url,
                local_path: &document.final_url,
                bytes: &document.bytes,
                charset: document.charset.as_deref(),
            },
        );
        attempts.extend(dispatched.attempts);
        if dispatched.executor.is_some() {
            records.extend(dispatched.output.records);
            followed.push(link.url.clone());
        }
    }

    if !followed.is_empty() {
        debug!(task_id = %task.task_id, followed = followed.len(), "followed links");
    }
    Ok(followed)
}
