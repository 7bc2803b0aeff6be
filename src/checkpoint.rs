//! Durable ingestion progress
//!
//! The checkpoint is the only state the engine owns. It records the marker of
//! the last message whose derived content is durably routed, and is replaced
//! atomically so an interrupted save leaves either the old or the new file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::error::{Result, SyncError};
use crate::models::Marker;

pub const CHECKPOINT_FILE: &str = "checkpoint.json";
pub const LOCK_FILE: &str = "sync.lock";
const CHECKPOINT_VERSION: u32 = 1;

/// A message past the marker that failed in one or more runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedMessage {
    pub marker: Marker,
    pub runs: u32,
    pub last_error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// None means "beginning of time"
    pub last_marker: Option<Marker>,
    pub processed_count: u64,
    pub updated_at: Option<DateTime<Utc>>,
    pub last_run_id: Option<String>,
    /// Messages past `last_marker` already resolved, held back by an earlier failure
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resolved_ahead: Vec<Marker>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<FailedMessage>,
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    CHECKPOINT_VERSION
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self {
            last_marker: None,
            processed_count: 0,
            updated_at: None,
            last_run_id: None,
            resolved_ahead: Vec::new(),
            failures: Vec::new(),
            version: CHECKPOINT_VERSION,
        }
    }
}

impl Checkpoint {
    /// Record a committed prefix ending at `marker`
    ///
    /// Within one UIDVALIDITY epoch the marker never moves backwards.
    pub fn advance(&mut self, marker: Marker, newly_resolved: u64, run_id: &str) {
        self.last_marker = Some(match self.last_marker {
            Some(old) if old.same_epoch(&marker) => old.max(marker),
            _ => marker,
        });
        self.processed_count += newly_resolved;
        self.updated_at = Some(Utc::now());
        self.last_run_id = Some(run_id.to_string());

        let last = self.last_marker;
        self.resolved_ahead.retain(|m| beyond(last, m));
        self.failures.retain(|f| beyond(last, &f.marker));
    }

    pub fn is_resolved_ahead(&self, marker: Marker) -> bool {
        self.resolved_ahead.contains(&marker)
    }

    pub fn failed_runs(&self, marker: Marker) -> u32 {
        self.failures
            .iter()
            .find(|f| f.marker == marker)
            .map_or(0, |f| f.runs)
    }

    /// Note a resolved message; one past the marker is remembered until the marker catches up
    pub fn mark_resolved(&mut self, marker: Marker) {
        self.failures.retain(|f| f.marker != marker);
        if beyond(self.last_marker, &marker) && !self.resolved_ahead.contains(&marker) {
            self.resolved_ahead.push(marker);
            self.resolved_ahead.sort_unstable();
        }
    }

    /// Count one more failed run for `marker` and return the total
    pub fn record_failure(&mut self, marker: Marker, error: &str) -> u32 {
        match self.failures.iter_mut().find(|f| f.marker == marker) {
            Some(failure) => {
                failure.runs += 1;
                failure.last_error = error.to_string();
                failure.runs
            }
            None => {
                self.failures.push(FailedMessage {
                    marker,
                    runs: 1,
                    last_error: error.to_string(),
                });
                1
            }
        }
    }
}

/// Whether `marker` lies past `last` in the same epoch
fn beyond(last: Option<Marker>, marker: &Marker) -> bool {
    match last {
        Some(last) => last.same_epoch(marker) && *marker > last,
        None => true,
    }
}

/// Loads and atomically replaces the checkpoint file
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(CHECKPOINT_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// Load the checkpoint, or a zero-value one if none was ever saved.
    ///
    /// A file that exists but does not parse is an error; it is never
    /// mistaken for "no checkpoint".
    pub async fn load(&self) -> Result<Checkpoint> {
        let json = match tokio::fs::read_to_string(&self.path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No existing checkpoint found, starting fresh");
                return Ok(Checkpoint::default());
            }
            Err(e) => return Err(e.into()),
        };

        let checkpoint: Checkpoint =
            serde_json::from_str(&json).map_err(|e| SyncError::CheckpointCorrupted {
                path: self.path.display().to_string(),
                reason: e.to_string(),
            })?;

        if checkpoint.version > CHECKPOINT_VERSION {
            return Err(SyncError::CheckpointCorrupted {
                path: self.path.display().to_string(),
                reason: format!("unsupported version {}", checkpoint.version),
            });
        }

        tracing::debug!(
            "Loaded checkpoint: marker={:?}, processed={}",
            checkpoint.last_marker,
            checkpoint.processed_count
        );
        Ok(checkpoint)
    }

    /// Write to a sibling temp file, fsync, rename over the old file, fsync the directory
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(checkpoint)?;
        let temp = self.temp_path();

        let mut file = tokio::fs::File::create(&temp).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&temp, &self.path).await?;
        sync_dir(self.path.parent()).await?;

        tracing::debug!("Saved checkpoint to {:?}", self.path);
        Ok(())
    }

    /// Forget all progress
    pub async fn reset(&self) -> Result<bool> {
        let _ = tokio::fs::remove_file(self.temp_path()).await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                tracing::info!("Removed checkpoint {:?}", self.path);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(unix)]
async fn sync_dir(dir: Option<&Path>) -> Result<()> {
    let dir = match dir {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    tokio::fs::File::open(dir).await?.sync_all().await?;
    Ok(())
}

#[cfg(not(unix))]
async fn sync_dir(_dir: Option<&Path>) -> Result<()> {
    Ok(())
}

/// Exclusive claim on the state directory for one sync run.
///
/// The lock file is removed when the guard is dropped. A lock file left by a
/// process that no longer exists (killed, crashed, power loss) is reclaimed.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(state_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_dir)?;
        let path = state_dir.join(LOCK_FILE);

        let mut file = match create_lock_file(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if !reclaim_stale_lock(&path)? {
                    return Err(SyncError::Locked(path.display().to_string()));
                }
                // A concurrent run may have reclaimed it first
                match create_lock_file(&path) {
                    Ok(file) => file,
                    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                        return Err(SyncError::Locked(path.display().to_string()));
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Err(e) => return Err(e.into()),
        };
        writeln!(file, "pid={}", std::process::id())?;
        writeln!(file, "started_at={}", Utc::now().to_rfc3339())?;

        tracing::debug!("Acquired run lock {:?}", path);
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn create_lock_file(path: &Path) -> std::io::Result<std::fs::File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}

/// Pid recorded in a lock file, if it can be read
fn lock_holder(path: &Path) -> Option<u32> {
    let contents = std::fs::read_to_string(path).ok()?;
    contents
        .lines()
        .find_map(|line| line.strip_prefix("pid="))
        .and_then(|pid| pid.trim().parse().ok())
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    // Signal 0 only checks existence; EPERM still means the process is there
    !matches!(kill(Pid::from_raw(raw), None), Err(Errno::ESRCH))
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

/// Move aside a lock whose holder is gone; false if the lock is live
///
/// A lock without a readable pid is treated as live.
fn reclaim_stale_lock(path: &Path) -> Result<bool> {
    let Some(holder) = lock_holder(path) else {
        return Ok(false);
    };
    if process_alive(holder) {
        return Ok(false);
    }

    tracing::warn!("Reclaiming run lock {:?} left by exited process {}", path, holder);
    let mut aside = path.as_os_str().to_owned();
    aside.push(format!(".stale-{}", uuid::Uuid::new_v4()));
    let aside = PathBuf::from(aside);

    match std::fs::rename(path, &aside) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e.into()),
    }
    if lock_holder(&aside) != Some(holder) {
        // Another run reclaimed it in between; that was its live lock
        std::fs::rename(&aside, path)?;
        return Ok(false);
    }
    let _ = std::fs::remove_file(&aside);
    Ok(true)
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!("Failed to remove run lock {:?}: {}", self.path, e);
        }
    }
}
