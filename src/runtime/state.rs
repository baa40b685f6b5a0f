use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cli::StepArg;
use crate::model::SourceManifestEntry;
use crate::util::{now_utc_string, read_json, write_json_pretty};

pub const RUN_STATE_FILE: &str = "run-state.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepName {
    Discover,
    Download,
    ExtractionPlan,
    Extract,
    Select,
    Convert,
    Commit,
}

impl StepName {
    pub const ORDER: [StepName; 7] = [
        StepName::Discover,
        StepName::Download,
        StepName::ExtractionPlan,
        StepName::Extract,
        StepName::Select,
        StepName::Convert,
        StepName::Commit,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Discover => "discover",
            Self::Download => "download",
            Self::ExtractionPlan => "extraction-plan",
            Self::Extract => "extract",
            Self::Select => "select",
            Self::Convert => "convert",
            Self::Commit => "commit",
        }
    }

    pub fn position(self) -> usize {
        Self::ORDER
            .iter()
            .position(|step| *step == self)
            .unwrap_or(Self::ORDER.len())
    }
}

impl From<StepArg> for StepName {
    fn from(value: StepArg) -> Self {
        match value {
            StepArg::Discover => Self::Discover,
            StepArg::Download => Self::Download,
            StepArg::ExtractionPlan => Self::ExtractionPlan,
            StepArg::Extract => Self::Extract,
            StepArg::Select => Self::Select,
            StepArg::Convert => Self::Convert,
            StepArg::Commit => Self::Commit,
        }
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepState {
    pub status: StepStatus,
    pub attempts: u32,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub last_error: Option<String>,
    pub last_error_code: Option<String>,
    pub retryable: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub state_version: u32,
    pub run_id: String,
    pub city_id: String,
    pub prefecture_id: String,
    pub created_at: String,
    pub updated_at: String,
    pub step_statuses: BTreeMap<StepName, StepState>,
    pub artifacts: BTreeMap<String, String>,
    pub sources: Option<Vec<SourceManifestEntry>>,
}

impl RunState {
    pub fn new(run_id: &str, city_id: &str, prefecture_id: &str) -> Self {
        let now = now_utc_string();
        Self {
            state_version: 1,
            run_id: run_id.to_string(),
            city_id: city_id.to_string(),
            prefecture_id: prefecture_id.to_string(),
            created_at: now.clone(),
            updated_at: now,
            step_statuses: StepName::ORDER
                .iter()
                .map(|step| (*step, StepState::default()))
                .collect(),
            artifacts: BTreeMap::new(),
            sources: None,
        }
    }

    pub fn step(&self, step: StepName) -> StepState {
        self.step_statuses.get(&step).cloned().unwrap_or_default()
    }
}

/// Single-writer store for one run. Every mutation is persisted before the method
/// returns, so a crash never loses a recorded transition.
#[derive(Debug)]
pub struct RunStateStore {
    path: PathBuf,
    state: RunState,
}

impl RunStateStore {
    pub fn load_or_init(
        run_dir: &Path,
        run_id: &str,
        city_id: &str,
        prefecture_id: &str,
    ) -> Result<Self> {
        let path = run_dir.join(RUN_STATE_FILE);
        let state = if path.exists() {
            let mut state: RunState = read_json(&path)?;
            for step in StepName::ORDER {
                state.step_statuses.entry(step).or_default();
            }
            // An attempt interrupted mid-flight is retried from scratch on resume.
            for step_state in state.step_statuses.values_mut() {
                if step_state.status == StepStatus::Running {
                    step_state.status = StepStatus::Pending;
                }
            }
            info!(path = %path.display(), run_id = %state.run_id, "resuming run-state");
            state
        } else {
            RunState::new(run_id, city_id, prefecture_id)
        };

        let mut store = Self { path, state };
        store.persist()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn step(&self, step: StepName) -> StepState {
        self.state.step(step)
    }

    pub fn is_succeeded(&self, step: StepName) -> bool {
        self.step(step).status == StepStatus::Succeeded
    }

    pub fn artifact(&self, name: &str) -> Option<&str> {
        self.state.artifacts.get(name).map(String::as_str)
    }

    fn persist(&mut self) -> Result<()> {
        self.state.updated_at = now_utc_string();
        write_json_pretty(&self.path, &self.state)
    }

    fn update_step(&mut self, step: StepName, apply: impl FnOnce(&mut StepState)) -> Result<()> {
        let entry = self.state.step_statuses.entry(step).or_default();
        apply(entry);
        self.persist()
    }

    pub fn mark_running(&mut self, step: StepName, attempt: u32) -> Result<()> {
        self.update_step(step, |state| {
            state.status = StepStatus::Running;
            state.attempts = attempt;
            if state.started_at.is_none() {
                state.started_at = Some(now_utc_string());
            }
            state.finished_at = None;
        })
    }

    pub fn mark_attempt_failed(
        &mut self,
        step: StepName,
        message: &str,
        code: &str,
        retryable: bool,
    ) -> Result<()> {
        self.update_step(step, |state| {
            state.last_error = Some(message.to_string());
            state.last_error_code = Some(code.to_string());
            state.retryable = Some(retryable);
        })
    }

    pub fn mark_succeeded(&mut self, step: StepName) -> Result<()> {
        self.update_step(step, |state| {
            state.status = StepStatus::Succeeded;
            state.finished_at = Some(now_utc_string());
            state.last_error = None;
            state.last_error_code = None;
            state.retryable = None;
        })
    }

    pub fn mark_failed(
        &mut self,
        step: StepName,
        message: &str,
        code: &str,
        retryable: bool,
    ) -> Result<()> {
        self.update_step(step, |state| {
            state.status = StepStatus::Failed;
            state.finished_at = Some(now_utc_string());
            state.last_error = Some(message.to_string());
            state.last_error_code = Some(code.to_string());
            state.retryable = Some(retryable);
        })
    }

    pub fn record_artifact(&mut self, name: &str, path: &Path) -> Result<()> {
        self.state
            .artifacts
            .insert(name.to_string(), path.display().to_string());
        self.persist()
    }

    pub fn record_sources(&mut self, sources: Vec<SourceManifestEntry>) -> Result<()> {
        self.state.sources = Some(sources);
        self.persist()
    }

    /// Resets `from` and every later step to pending.
    pub fn reset_from(&mut self, from: StepName) -> Result<()> {
        for step in StepName::ORDER {
            if step.position() >= from.position() {
                self.state.step_statuses.insert(step, StepState::default());
            }
        }
        if from.position() <= StepName::Download.position() {
            self.state.sources = None;
        }
        self.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_transition_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = RunStateStore::load_or_init(dir.path(), "run-1", "131016", "13").unwrap();
        store.mark_running(StepName::Discover, 1).unwrap();

        let on_disk: RunState = read_json(&dir.path().join(RUN_STATE_FILE)).unwrap();
        assert_eq!(
            on_disk.step(StepName::Discover).status,
            StepStatus::Running
        );

        store.mark_succeeded(StepName::Discover).unwrap();
        let on_disk: RunState = read_json(&dir.path().join(RUN_STATE_FILE)).unwrap();
        assert_eq!(
            on_disk.step(StepName::Discover).status,
            StepStatus::Succeeded
        );
    }

    #[test]
    fn resume_demotes_running_steps_to_pending() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store =
                RunStateStore::load_or_init(dir.path(), "run-1", "131016", "13").unwrap();
            store.mark_succeeded(StepName::Discover).unwrap();
            store.mark_running(StepName::Download, 2).unwrap();
        }

        let store = RunStateStore::load_or_init(dir.path(), "run-1", "131016", "13").unwrap();
        assert!(store.is_succeeded(StepName::Discover));
        let download = store.step(StepName::Download);
        assert_eq!(download.status, StepStatus::Pending);
        assert_eq!(download.attempts, 2);
    }

    #[test]
    fn reset_from_clears_later_steps_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = RunStateStore::load_or_init(dir.path(), "run-1", "131016", "13").unwrap();
        for step in StepName::ORDER {
            store.mark_succeeded(step).unwrap();
        }

        store.reset_from(StepName::Extract).unwrap();
        assert!(store.is_succeeded(StepName::ExtractionPlan));
        assert!(!store.is_succeeded(StepName::Extract));
        assert!(!store.is_succeeded(StepName::Commit));
    }

    #[test]
    fn step_names_serialize_as_map_keys() {
        let state = RunState::new("run-1", "c", "p");
        let value = serde_json::to_value(&state).unwrap();
        assert!(value["stepStatuses"].get("extraction-plan").is_some());
        let parsed: RunState = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.step_statuses.len(), StepName::ORDER.len());
    }
}
