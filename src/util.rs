use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};

pub fn now_utc_string() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn utc_compact_string(ts: DateTime<Utc>) -> String {
    ts.format("%Y%m%dT%H%M%SZ").to_string()
}

pub fn ensure_directory(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("failed to create directory: {}", path.display()))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub fn normalize_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<&str>>().join(" ")
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("artifact");
    let stamp = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    path.with_file_name(format!(".{}.tmp.{}.{}", name, std::process::id(), stamp))
}

/// Writes `bytes` next to `path` and renames over it, so readers only ever observe a
/// complete file.
pub fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_directory(parent)?;
    }

    let tmp = temp_path_for(path);
    let mut file = File::create(&tmp)
        .with_context(|| format!("failed to create temp file: {}", tmp.display()))?;
    file.write_all(bytes)
        .with_context(|| format!("failed to write temp file: {}", tmp.display()))?;
    file.sync_all()
        .with_context(|| format!("failed to sync temp file: {}", tmp.display()))?;
    drop(file);

    fs::rename(&tmp, path).with_context(|| {
        format!(
            "failed to rename {} into {}",
            tmp.display(),
            path.display()
        )
    })?;

    Ok(())
}

pub fn write_json_pretty<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut data = serde_json::to_vec_pretty(value)
        .with_context(|| format!("failed to serialize json: {}", path.display()))?;
    data.push(b'\n');
    write_bytes_atomic(path, &data)
}

pub fn write_ndjson<T: Serialize>(path: &Path, values: &[T]) -> Result<()> {
    let mut data = Vec::<u8>::new();
    for value in values {
        serde_json::to_writer(&mut data, value)
            .with_context(|| format!("failed to serialize ndjson line: {}", path.display()))?;
        data.push(b'\n');
    }
    write_bytes_atomic(path, &data)
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

pub fn read_ndjson<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let raw =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(index, line)| {
            serde_json::from_str(line).with_context(|| {
                format!("failed to parse line {} of {}", index + 1, path.display())
            })
        })
        .collect()
}

pub fn truncate_chars(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_json_write_replaces_previous_content_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        write_json_pretty(&path, &serde_json::json!({"a": 1})).unwrap();
        write_json_pretty(&path, &serde_json::json!({"a": 2})).unwrap();

        let value: serde_json::Value = read_json(&path).unwrap();
        assert_eq!(value["a"], 2);

        let leftovers = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().contains(".tmp."))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn ndjson_round_trip_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.ndjson");
        write_ndjson(&path, &[serde_json::json!({"id": 1}), serde_json::json!({"id": 2})])
            .unwrap();
        let mut raw = fs::read_to_string(&path).unwrap();
        raw.push('\n');
        fs::write(&path, raw).unwrap();

        let rows: Vec<serde_json::Value> = read_ndjson(&path).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn truncate_chars_respects_multibyte_boundaries() {
        assert_eq!(truncate_chars("燃やすごみ", 3), "燃やす");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
