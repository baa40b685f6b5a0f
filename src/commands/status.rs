use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::runtime::artifacts::{RunLayout, SUMMARY, latest_run_id};
use crate::runtime::state::{RunState, StepName};
use crate::util::read_json;

pub fn run(args: StatusArgs) -> Result<()> {
    info!(cache_root = %args.cache_root.display(), "status requested");

    let Some(run_id) = resolve_run_id(&args)? else {
        warn!(cache_root = %args.cache_root.display(), "no runs found");
        return Ok(());
    };
    let layout = RunLayout::new(&args.cache_root, &run_id);
    let state_path = layout.run_state();
    if !state_path.exists() {
        warn!(path = %state_path.display(), "run-state missing");
        return Ok(());
    }

    let state = load_state(&state_path)?;
    info!(
        run_id = %state.run_id,
        city_id = %state.city_id,
        prefecture_id = %state.prefecture_id,
        created_at = %state.created_at,
        updated_at = %state.updated_at,
        sources = state.sources.as_ref().map(Vec::len).unwrap_or(0),
        "loaded run-state"
    );

    for step in StepName::ORDER {
        let step_state = state.step(step);
        info!(
            step = %step,
            status = step_state.status.as_str(),
            attempts = step_state.attempts,
            finished_at = %step_state.finished_at.unwrap_or_default(),
            error_code = %step_state.last_error_code.unwrap_or_default(),
            error = %step_state.last_error.unwrap_or_default(),
            "step status"
        );
    }

    for (name, path) in &state.artifacts {
        info!(artifact = %name, path = %path, "artifact");
    }

    let summary_path = layout.file(SUMMARY);
    if summary_path.exists() {
        let summary: serde_json::Value = read_json(&summary_path)?;
        info!(
            status = summary["status"].as_str().unwrap_or_default(),
            finished_at = summary["finishedAt"].as_str().unwrap_or_default(),
            dataset_dir = summary["datasetDir"].as_str().unwrap_or_default(),
            "last run summary"
        );
    } else {
        warn!(path = %summary_path.display(), "run summary missing");
    }

    Ok(())
}

fn resolve_run_id(args: &StatusArgs) -> Result<Option<String>> {
    match &args.run_id {
        Some(run_id) => Ok(Some(run_id.clone())),
        None => latest_run_id(&args.cache_root),
    }
}

fn load_state(path: &Path) -> Result<RunState> {
    read_json(path).with_context(|| format!("failed to load run-state {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::state::RunStateStore;

    #[test]
    fn reports_the_latest_run_when_no_id_is_given() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RunLayout::new(dir.path(), "run-a");
        layout.create().unwrap();
        let mut store =
            RunStateStore::load_or_init(layout.run_dir(), "run-a", "example-city", "example-pref")
                .unwrap();
        store.mark_running(StepName::Discover, 1).unwrap();
        store.mark_succeeded(StepName::Discover).unwrap();

        let args = StatusArgs {
            cache_root: dir.path().to_path_buf(),
            run_id: None,
        };
        assert_eq!(resolve_run_id(&args).unwrap().as_deref(), Some("run-a"));
        run(args).unwrap();

        let state = load_state(&layout.run_state()).unwrap();
        assert!(state.step(StepName::Discover).finished_at.is_some());
    }

    #[test]
    fn empty_cache_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let args = StatusArgs {
            cache_root: dir.path().join("missing"),
            run_id: None,
        };
        assert!(resolve_run_id(&args).unwrap().is_none());
        run(args).unwrap();

        let args = StatusArgs {
            cache_root: dir.path().to_path_buf(),
            run_id: Some("never-ran".to_string()),
        };
        run(args).unwrap();
    }
}
