use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::CityTarget;
use crate::error::PipelineError;
use crate::model::Target;
use crate::runtime::lock::{FileLock, LockTiming};
use crate::util::{now_utc_string, read_json, write_bytes_atomic, write_json_pretty};

pub const REGISTRY_FILE: &str = "cities.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CityRegistryEntry {
    pub city_id: String,
    pub prefecture_id: String,
    pub city_name: String,
    pub run_id: String,
    pub updated_at: String,
    pub sources: BTreeMap<Target, String>,
}

pub type CityRegistry = BTreeMap<String, CityRegistryEntry>;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitReport {
    pub dataset_dir: String,
    pub files: Vec<String>,
    pub registry_key: String,
    pub committed_at: String,
}

pub fn registry_key(city: &CityTarget) -> String {
    format!("{}/{}", city.prefecture_id, city.city_id)
}

pub fn dataset_dir(data_root: &Path, city: &CityTarget) -> PathBuf {
    data_root
        .join("jp")
        .join(&city.prefecture_id)
        .join(&city.city_id)
}

pub fn staged_file(staging_dir: &Path, target: Target) -> PathBuf {
    staging_dir.join(format!("{}.json", target.as_str()))
}

/// Copies every staged target file into the dataset directory and records the run in
/// `cities.json`. Staged files are checked before anything is written, so a missing file
/// leaves the dataset untouched. The registry lock is held across the file writes and the
/// registry update.
pub async fn commit_dataset(
    city: &CityTarget,
    run_id: &str,
    staging_dir: &Path,
    data_root: &Path,
    sources: &BTreeMap<Target, String>,
    timing: LockTiming,
) -> Result<CommitReport> {
    let mut staged = Vec::with_capacity(Target::ALL.len());
    for target in Target::ALL {
        let path = staged_file(staging_dir, target);
        if !path.exists() {
            return Err(PipelineError::Pipeline(format!(
                "staged file missing before commit: {}",
                path.display()
            ))
            .into());
        }
        let bytes =
            fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
        staged.push((target, bytes));
    }

    let key = registry_key(city);
    let _lock = lock_registry(data_root, &key, timing).await?;

    let dir = dataset_dir(data_root, city);
    let mut files = Vec::with_capacity(staged.len());
    for (target, bytes) in staged {
        let destination = dir.join(format!("{}.json", target.as_str()));
        write_bytes_atomic(&destination, &bytes)?;
        files.push(destination.display().to_string());
    }

    update_registry(data_root, |registry| {
        registry.insert(
            key.clone(),
            CityRegistryEntry {
                city_id: city.city_id.clone(),
                prefecture_id: city.prefecture_id.clone(),
                city_name: city.city_name.clone(),
                run_id: run_id.to_string(),
                updated_at: now_utc_string(),
                sources: sources.clone(),
            },
        );
    })?;

    info!(dataset_dir = %dir.display(), registry_key = %key, files = files.len(), "dataset committed");

    Ok(CommitReport {
        dataset_dir: dir.display().to_string(),
        files,
        registry_key: key,
        committed_at: now_utc_string(),
    })
}

async fn lock_registry(data_root: &Path, key: &str, timing: LockTiming) -> Result<FileLock> {
    let lock_path = data_root.join(format!("{REGISTRY_FILE}.lock"));
    FileLock::acquire_with(&lock_path, timing)
        .await
        .with_context(|| format!("failed to lock registry for {key}"))
}

/// Read-modify-write of `cities.json`; the caller holds the registry lock.
fn update_registry(data_root: &Path, apply: impl FnOnce(&mut CityRegistry)) -> Result<()> {
    let registry_path = data_root.join(REGISTRY_FILE);
    let mut registry: CityRegistry = if registry_path.exists() {
        read_json(&registry_path)?
    } else {
        CityRegistry::new()
    };
    apply(&mut registry);
    write_json_pretty(&registry_path, &registry)
}
