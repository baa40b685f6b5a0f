use std::collections::BTreeMap;

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::cli::RunArgs;
use crate::commands::convert::{self, CleanRecordConverter};
use crate::commands::{discover, download, extract, plan, select};
use crate::config::PipelineOptions;
use crate::error::PipelineError;
use crate::llm::ModelClient;
use crate::llm::openai::OpenAiClient;
use crate::model::{ExtractionPlan, SelectionReport, Target};
use crate::net::fetch::{DocumentFetcher, HttpFetcher};
use crate::runtime::artifacts::{
    CLEANUP_REPORT, COMMIT_REPORT, DISCOVER_REPORT, DISCOVER_SELECTED, EVENTS, EXECUTION_REPORT,
    EXTRACTION_PLAN, RunLayout, SELECTION_REPORT, SOURCE_MANIFEST, SUMMARY, default_run_id,
};
use crate::runtime::budget::Budget;
use crate::runtime::commit::{commit_dataset, staged_file};
use crate::runtime::lock::LockTiming;
use crate::runtime::runner::run_step;
use crate::runtime::state::{RunStateStore, StepName, StepStatus};
use crate::telemetry::EventSink;
use crate::util::{now_utc_string, read_json, write_json_pretty};

const SUMMARY_VERSION: u32 = 1;

/// Everything a step body needs besides its `StepContext`.
#[derive(Clone, Copy)]
pub struct PipelineDeps<'a> {
    pub options: &'a PipelineOptions,
    pub layout: &'a RunLayout,
    pub run_id: &'a str,
    pub fetcher: &'a dyn DocumentFetcher,
    pub model: &'a dyn ModelClient,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSummary {
    pub status: StepStatus,
    pub attempts: u32,
    pub skipped: bool,
    pub last_error_code: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalError {
    pub step: Option<StepName>,
    pub code: String,
    pub retryable: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub summary_version: u32,
    pub run_id: String,
    pub city_id: String,
    pub prefecture_id: String,
    pub status: String,
    pub started_at: String,
    pub finished_at: String,
    pub steps: BTreeMap<StepName, StepSummary>,
    pub primaries: BTreeMap<Target, String>,
    pub dataset_dir: Option<String>,
    pub error: Option<TerminalError>,
}

pub async fn run(args: RunArgs) -> Result<()> {
    let options = PipelineOptions::from_args(&args)?;
    let run_id = args.run_id.clone().unwrap_or_else(default_run_id);
    if options.model.api_key.is_none() {
        warn!("no model API key set; model calls will fail and fall back where they can");
    }

    let model = OpenAiClient::new(&options.model)?;
    let fetcher = HttpFetcher::new(&options.fetch)?;
    let summary = execute(
        &options,
        &run_id,
        args.rerun_from.map(StepName::from),
        &fetcher,
        &model,
    )
    .await?;

    info!(
        run_id = %summary.run_id,
        dataset_dir = summary.dataset_dir.as_deref().unwrap_or(""),
        "run completed"
    );
    Ok(())
}

/// Runs every pending step in order and always leaves `summary.json` behind.
pub async fn execute(
    options: &PipelineOptions,
    run_id: &str,
    rerun_from: Option<StepName>,
    fetcher: &dyn DocumentFetcher,
    model: &dyn ModelClient,
) -> Result<RunSummary> {
    let started_at = now_utc_string();
    let layout = RunLayout::new(&options.cache_root, run_id);
    layout.create()?;

    let mut store = RunStateStore::load_or_init(
        layout.run_dir(),
        run_id,
        &options.city.city_id,
        &options.city.prefecture_id,
    )?;
    if let Some(step) = rerun_from {
        info!(step = %step, "resetting steps for rerun");
        store.reset_from(step)?;
    }

    let events = EventSink::open(&layout.file(EVENTS), run_id)?;
    events.emit(
        "run-start",
        serde_json::json!({
            "cityId": options.city.city_id,
            "prefectureId": options.city.prefecture_id,
            "totalBudgetMs": options.total_budget_ms,
        }),
    );
    info!(
        run_id,
        city_id = %options.city.city_id,
        run_dir = %layout.run_dir().display(),
        "starting pipeline run"
    );

    let deps = PipelineDeps {
        options,
        layout: &layout,
        run_id,
        fetcher,
        model,
    };
    let budget = Budget::new(options.total_budget_ms);
    let mut skipped = Vec::new();
    let outcome = drive(&mut store, budget, &events, deps, &mut skipped).await;

    let error = outcome.as_ref().err().map(|(step, err)| terminal_error(*step, err));
    let summary = build_summary(&store, &layout, started_at, &skipped, error);
    write_json_pretty(&layout.file(SUMMARY), &summary)?;
    events.emit(
        "run-finished",
        serde_json::json!({"status": summary.status, "error": summary.error}),
    );

    match outcome {
        Ok(()) => Ok(summary),
        Err((_, err)) => Err(err),
    }
}

async fn drive(
    store: &mut RunStateStore,
    budget: Budget,
    events: &EventSink,
    deps: PipelineDeps<'_>,
    skipped: &mut Vec<StepName>,
) -> std::result::Result<(), (Option<StepName>, anyhow::Error)> {
    for step in StepName::ORDER {
        if store.is_succeeded(step) && deps.layout.outputs_present(step) {
            info!(step = %step, "step already succeeded; skipping");
            skipped.push(step);
            continue;
        }

        if let Err(err) = deps.layout.check_preconditions(step) {
            store
                .mark_failed(step, &err.to_string(), err.code(), err.retryable())
                .map_err(|store_err| (Some(step), store_err))?;
            return Err((Some(step), err.into()));
        }

        execute_step(store, budget, events, deps, step)
            .await
            .map_err(|err| (Some(step), err))?;
    }
    Ok(())
}

async fn execute_step(
    store: &mut RunStateStore,
    budget: Budget,
    events: &EventSink,
    deps: PipelineDeps<'_>,
    step: StepName,
) -> Result<()> {
    let policy = deps.options.step;
    let layout = deps.layout;

    match step {
        StepName::Discover => {
            run_step(store, budget, events, &policy, step, move |ctx| async move {
                discover::run(deps, &ctx).await
            })
            .await?;
            store.record_artifact(DISCOVER_REPORT, &layout.file(DISCOVER_REPORT))?;
            store.record_artifact(DISCOVER_SELECTED, &layout.file(DISCOVER_SELECTED))?;
        }
        StepName::Download => {
            let manifest = run_step(store, budget, events, &policy, step, move |ctx| async move {
                download::run(deps, &ctx).await
            })
            .await?;
            store.record_artifact(SOURCE_MANIFEST, &layout.file(SOURCE_MANIFEST))?;
            store.record_sources(manifest.sources)?;
        }
        StepName::ExtractionPlan => {
            run_step(store, budget, events, &policy, step, move |_ctx| async move {
                plan::run(deps.layout, deps.run_id)
            })
            .await?;
            store.record_artifact(EXTRACTION_PLAN, &layout.file(EXTRACTION_PLAN))?;
        }
        StepName::Extract => {
            run_step(store, budget, events, &policy, step, move |ctx| async move {
                extract::run(deps, &ctx).await
            })
            .await?;
            store.record_artifact(EXECUTION_REPORT, &layout.file(EXECUTION_REPORT))?;
            store.record_artifact(CLEANUP_REPORT, &layout.file(CLEANUP_REPORT))?;
        }
        StepName::Select => {
            run_step(store, budget, events, &policy, step, move |ctx| async move {
                select::run(deps, &ctx).await
            })
            .await?;
            store.record_artifact(SELECTION_REPORT, &layout.file(SELECTION_REPORT))?;
        }
        StepName::Convert => {
            run_step(store, budget, events, &policy, step, move |_ctx| async move {
                convert::run(deps.layout, &deps.options.city, &CleanRecordConverter)
            })
            .await?;
            for target in Target::ALL {
                store.record_artifact(
                    &format!("staged-{target}"),
                    &staged_file(&layout.staging_dir(), target),
                )?;
            }
        }
        StepName::Commit => {
            run_step(store, budget, events, &policy, step, move |_ctx| async move {
                let sources = primary_sources(deps.layout)?;
                let report = commit_dataset(
                    &deps.options.city,
                    deps.run_id,
                    &deps.layout.staging_dir(),
                    &deps.options.data_root,
                    &sources,
                    LockTiming::default(),
                )
                .await?;
                write_json_pretty(&deps.layout.file(COMMIT_REPORT), &report)?;
                Ok::<(), anyhow::Error>(())
            })
            .await?;
            store.record_artifact(COMMIT_REPORT, &layout.file(COMMIT_REPORT))?;
        }
    }
    Ok(())
}

/// Source URL of each target's committed primary, read back from the selection report and
/// the plan so a resumed commit does not depend on in-memory state.
fn primary_sources(layout: &RunLayout) -> Result<BTreeMap<Target, String>> {
    let selection: SelectionReport = read_json(&layout.file(SELECTION_REPORT))?;
    let plan: ExtractionPlan = read_json(&layout.file(EXTRACTION_PLAN))?;
    let mut sources = BTreeMap::new();
    for decision in &selection.decisions {
        let url = plan
            .source(&decision.primary_source_id)
            .map(|source| source.url.clone())
            .ok_or_else(|| {
                PipelineError::Pipeline(format!(
                    "primary {} is missing from the extraction plan",
                    decision.primary_source_id
                ))
            })?;
        sources.insert(decision.target, url);
    }
    Ok(sources)
}

fn terminal_error(step: Option<StepName>, err: &anyhow::Error) -> TerminalError {
    let (code, retryable) = crate::error::classify(err);
    TerminalError {
        step,
        code: code.to_string(),
        retryable,
        message: format!("{err:#}"),
    }
}

fn build_summary(
    store: &RunStateStore,
    layout: &RunLayout,
    started_at: String,
    skipped: &[StepName],
    error: Option<TerminalError>,
) -> RunSummary {
    let state = store.state();
    let steps = StepName::ORDER
        .iter()
        .map(|step| {
            let step_state = state.step(*step);
            (
                *step,
                StepSummary {
                    status: step_state.status,
                    attempts: step_state.attempts,
                    skipped: skipped.contains(step),
                    last_error_code: step_state.last_error_code,
                },
            )
        })
        .collect();

    let primaries = read_json::<SelectionReport>(&layout.file(SELECTION_REPORT))
        .map(|report| {
            report
                .decisions
                .into_iter()
                .map(|decision| (decision.target, decision.primary_source_id))
                .collect()
        })
        .unwrap_or_default();
    let dataset_dir = read_json::<Value>(&layout.file(COMMIT_REPORT))
        .ok()
        .and_then(|report| report["datasetDir"].as_str().map(str::to_string));

    RunSummary {
        summary_version: SUMMARY_VERSION,
        run_id: state.run_id.clone(),
        city_id: state.city_id.clone(),
        prefecture_id: state.prefecture_id.clone(),
        status: if error.is_some() { "failed" } else { "succeeded" }.to_string(),
        started_at,
        finished_at: now_utc_string(),
        steps,
        primaries,
        dataset_dir,
        error,
    }
}
