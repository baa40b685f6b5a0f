use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::util::{ensure_directory, now_utc_string};

pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const LOCK_TOTAL_WAIT: Duration = Duration::from_secs(10);
pub const LOCK_STALE_AFTER: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy)]
pub struct LockTiming {
    pub poll: Duration,
    pub total_wait: Duration,
    pub stale_after: Duration,
}

impl Default for LockTiming {
    fn default() -> Self {
        Self {
            poll: LOCK_POLL_INTERVAL,
            total_wait: LOCK_TOTAL_WAIT,
            stale_after: LOCK_STALE_AFTER,
        }
    }
}

/// Advisory cross-process lock held by the existence of `path`. Released on drop.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    pub async fn acquire_with(path: &Path, timing: LockTiming) -> Result<Self> {
        if let Some(parent) = path.parent() {
            ensure_directory(parent)?;
        }

        let started = Instant::now();
        loop {
            match try_create(path) {
                Ok(()) => {
                    debug!(path = %path.display(), "acquired file lock");
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if is_stale(path, timing.stale_after) {
                        warn!(path = %path.display(), "removing stale lock file");
                        let _ = fs::remove_file(path);
                        continue;
                    }
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to create lock file: {}", path.display()));
                }
            }

            if started.elapsed() >= timing.total_wait {
                return Err(PipelineError::LockBusy {
                    path: path.display().to_string(),
                    waited_ms: u64::try_from(timing.total_wait.as_millis()).unwrap_or(u64::MAX),
                }
                .into());
            }
            tokio::time::sleep(timing.poll).await;
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn try_create(path: &Path) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let payload = format!("pid={}\nacquired_at={}\n", std::process::id(), now_utc_string());
    file.write_all(payload.as_bytes())?;
    Ok(())
}

fn is_stale(path: &Path, stale_after: Duration) -> bool {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .map(|age| age >= stale_after)
        .unwrap_or(false)
}
