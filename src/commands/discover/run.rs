use super::*;

/// Runs the discover rounds and writes the report, the curated candidate stream and the
/// selected output. The report is written even when discovery fails.
pub async fn run(deps: PipelineDeps<'_>, ctx: &StepContext) -> Result<DiscoverOutputV2> {
    let mut engine = DiscoverEngine::new(deps, ctx);
    let outcome = engine.discover().await;
    let report = engine.report(outcome.as_ref().err());
    write_json_pretty(&deps.layout.file(DISCOVER_REPORT), &report)?;

    let output = outcome?;
    write_ndjson(&deps.layout.file(DISCOVER_CANDIDATES), &output.candidates)?;
    write_json_pretty(&deps.layout.file(DISCOVER_SELECTED), &output)?;

    info!(
        rounds = report.rounds.len(),
        candidates = output.candidates.len(),
        schedule = output.selected.schedule.len(),
        separation = output.selected.separation.len(),
        fetches = report.fetches_used,
        "discover finished"
    );
    Ok(output)
}
