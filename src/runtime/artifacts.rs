use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;

use crate::error::PipelineError;
use crate::model::Target;
use crate::runtime::state::{RUN_STATE_FILE, StepName};
use crate::util::{ensure_directory, utc_compact_string};

pub const DISCOVER_REPORT: &str = "discover-report.json";
pub const DISCOVER_CANDIDATES: &str = "discover-candidates.ndjson";
pub const DISCOVER_SELECTED: &str = "discover-selected.json";
pub const SOURCE_MANIFEST: &str = "source-manifest.json";
pub const EXTRACTION_PLAN: &str = "extraction-plan.json";
pub const EXECUTION_REPORT: &str = "execution-report.json";
pub const CLEANUP_REPORT: &str = "cleanup-report.json";
pub const SELECTION_REPORT: &str = "selection-report.json";
pub const COMMIT_REPORT: &str = "commit-report.json";
pub const SUMMARY: &str = "summary.json";
pub const EVENTS: &str = "events.jsonl";

pub fn default_run_id() -> String {
    format!("run-{}", utc_compact_string(Utc::now()))
}

/// File layout of `<cache_root>/runs/<run_id>/`.
#[derive(Debug, Clone)]
pub struct RunLayout {
    run_dir: PathBuf,
}

impl RunLayout {
    pub fn new(cache_root: &Path, run_id: &str) -> Self {
        Self {
            run_dir: runs_dir(cache_root).join(run_id),
        }
    }

    pub fn create(&self) -> Result<()> {
        ensure_directory(&self.run_dir)
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.run_dir.join(name)
    }

    pub fn run_state(&self) -> PathBuf {
        self.file(RUN_STATE_FILE)
    }

    pub fn sources_dir(&self) -> PathBuf {
        self.run_dir.join("sources")
    }

    pub fn extract_dir(&self, source_id: &str, target: Target) -> PathBuf {
        self.run_dir
            .join("extract")
            .join(source_id)
            .join(target.as_str())
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.run_dir.join("staging")
    }

    /// Artifacts a step leaves behind; a resumed run only skips a succeeded step when
    /// every one of them is still on disk.
    pub fn outputs(&self, step: StepName) -> Vec<PathBuf> {
        match step {
            StepName::Discover => vec![
                self.file(DISCOVER_REPORT),
                self.file(DISCOVER_CANDIDATES),
                self.file(DISCOVER_SELECTED),
            ],
            StepName::Download => vec![self.file(SOURCE_MANIFEST)],
            StepName::ExtractionPlan => vec![self.file(EXTRACTION_PLAN)],
            StepName::Extract => vec![self.file(EXECUTION_REPORT), self.file(CLEANUP_REPORT)],
            StepName::Select => vec![self.file(SELECTION_REPORT)],
            StepName::Convert => Target::ALL
                .iter()
                .map(|target| self.staging_dir().join(format!("{}.json", target.as_str())))
                .collect(),
            StepName::Commit => vec![self.file(COMMIT_REPORT)],
        }
    }

    pub fn outputs_present(&self, step: StepName) -> bool {
        self.outputs(step).iter().all(|path| path.exists())
    }

    /// Inputs a step needs from its predecessors.
    pub fn preconditions(&self, step: StepName) -> Vec<PathBuf> {
        match step {
            StepName::Discover => Vec::new(),
            StepName::Download => vec![self.file(DISCOVER_SELECTED)],
            StepName::ExtractionPlan => vec![self.file(SOURCE_MANIFEST)],
            StepName::Extract => vec![self.file(EXTRACTION_PLAN)],
            StepName::Select => vec![
                self.file(CLEANUP_REPORT),
                self.file(SOURCE_MANIFEST),
                self.file(EXTRACTION_PLAN),
            ],
            StepName::Convert => vec![self.file(SELECTION_REPORT)],
            StepName::Commit => self.outputs(StepName::Convert),
        }
    }

    pub fn check_preconditions(&self, step: StepName) -> Result<(), PipelineError> {
        match self
            .preconditions(step)
            .into_iter()
            .find(|path| !path.exists())
        {
            Some(missing) => Err(PipelineError::Pipeline(format!(
                "step {step} requires missing artifact {}",
                missing.display()
            ))),
            None => Ok(()),
        }
    }
}

pub fn runs_dir(cache_root: &Path) -> PathBuf {
    cache_root.join("runs")
}

/// Most recently modified run directory that holds a run-state file.
pub fn latest_run_id(cache_root: &Path) -> Result<Option<String>> {
    let dir = runs_dir(cache_root);
    if !dir.exists() {
        return Ok(None);
    }

    let mut best: Option<(std::time::SystemTime, String)> = None;
    for entry in fs::read_dir(&dir).with_context(|| format!("failed to list {}", dir.display()))? {
        let entry = entry.with_context(|| format!("failed to read entry in {}", dir.display()))?;
        let state_path = entry.path().join(RUN_STATE_FILE);
        let Ok(modified) = fs::metadata(&state_path).and_then(|meta| meta.modified()) else {
            continue;
        };
        let name = entry.file_name().to_string_lossy().to_string();
        let newer = best
            .as_ref()
            .map(|(current, _)| modified > *current)
            .unwrap_or(true);
        if newer {
            best = Some((modified, name));
        }
    }
    Ok(best.map(|(_, name)| name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_use_compact_utc_stamp() {
        let id = default_run_id();
        assert!(id.starts_with("run-"));
        assert!(id.ends_with('Z'));
        assert_eq!(id.len(), "run-20240101T000000Z".len());
    }

    #[test]
    fn missing_precondition_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RunLayout::new(dir.path(), "run-1");
        layout.create().unwrap();

        assert!(layout.check_preconditions(StepName::Discover).is_ok());
        let err = layout.check_preconditions(StepName::Download).unwrap_err();
        assert_eq!(err.code(), "pipeline");
        assert!(err.to_string().contains(DISCOVER_SELECTED));
    }

    #[test]
    fn latest_run_is_found_by_state_file() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(latest_run_id(dir.path()).unwrap(), None);

        let layout = RunLayout::new(dir.path(), "run-a");
        layout.create().unwrap();
        fs::write(layout.run_state(), "{}").unwrap();
        fs::create_dir_all(runs_dir(dir.path()).join("not-a-run")).unwrap();

        assert_eq!(latest_run_id(dir.path()).unwrap(), Some("run-a".to_string()));
    }
}
