//! Run summary

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use crate::models::{Category, Marker};
use crate::sync::{SyncMode, SyncState};

/// Pipeline step at which a message failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Classify,
    Route,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Fetch => "fetch",
            Stage::Classify => "classify",
            Stage::Route => "route",
        };
        f.write_str(s)
    }
}

/// A message left unresolved this run; it will be listed again next run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedMessage {
    pub marker: Marker,
    pub message_id: Option<String>,
    pub subject: Option<String>,
    pub stage: Stage,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub run_id: String,
    pub mode: SyncMode,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub state: SyncState,
    pub cancelled: bool,
    /// Messages returned by the delta listing
    pub listed: usize,
    /// Listed messages left for the next run by the per-run cap
    pub deferred: usize,
    /// Routed, ignored and filtered messages
    pub processed: usize,
    pub routed: usize,
    pub ignored: usize,
    pub filtered: usize,
    pub skipped: Vec<SkippedMessage>,
    /// Messages given up on after failing in too many runs; counted as processed
    pub abandoned: Vec<SkippedMessage>,
    pub categories: BTreeMap<Category, usize>,
    pub documents_written: BTreeSet<PathBuf>,
    pub entries_written: usize,
    /// Entries whose tag was already present
    pub duplicates: usize,
    pub checkpoint_before: Option<Marker>,
    pub checkpoint_after: Option<Marker>,
}

impl SyncReport {
    pub fn new(run_id: String, mode: SyncMode) -> Self {
        Self {
            run_id,
            mode,
            started_at: Utc::now(),
            completed_at: None,
            state: SyncState::Idle,
            cancelled: false,
            listed: 0,
            deferred: 0,
            processed: 0,
            routed: 0,
            ignored: 0,
            filtered: 0,
            skipped: Vec::new(),
            abandoned: Vec::new(),
            categories: BTreeMap::new(),
            documents_written: BTreeSet::new(),
            entries_written: 0,
            duplicates: 0,
            checkpoint_before: None,
            checkpoint_after: None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, SyncState::Failed(_))
    }

    pub fn duration_seconds(&self) -> i64 {
        self.completed_at
            .map(|end| (end - self.started_at).num_seconds())
            .unwrap_or(0)
    }
}

fn marker_or_none(marker: Option<Marker>) -> String {
    marker.map_or_else(|| "none".to_string(), |m| m.to_string())
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match (&self.state, self.cancelled) {
            (SyncState::Failed(reason), _) => format!("FAILED: {}", reason),
            (_, true) => "interrupted".to_string(),
            (state, false) => state.to_string(),
        };

        writeln!(f, "Sync report ({} run {})", self.mode, self.run_id)?;
        writeln!(f, "  Status:        {}", status)?;
        writeln!(
            f,
            "  Started:       {}",
            self.started_at.format("%Y-%m-%d %H:%M:%S UTC")
        )?;
        writeln!(f, "  Duration:      {}s", self.duration_seconds())?;
        writeln!(f, "  Listed:        {}", self.listed)?;
        if self.deferred > 0 {
            writeln!(f, "  Deferred:      {} (next run)", self.deferred)?;
        }
        writeln!(f, "  Processed:     {}", self.processed)?;
        writeln!(f, "    routed:      {}", self.routed)?;
        writeln!(f, "    ignored:     {}", self.ignored)?;
        writeln!(f, "    filtered:    {}", self.filtered)?;
        writeln!(f, "  Skipped:       {}", self.skipped.len())?;
        if !self.abandoned.is_empty() {
            writeln!(f, "  Abandoned:     {}", self.abandoned.len())?;
        }

        if !self.categories.is_empty() {
            writeln!(f, "  Categories:")?;
            for (category, count) in &self.categories {
                writeln!(f, "    {:<14} {}", category.as_str(), count)?;
            }
        }

        writeln!(
            f,
            "  Entries:       {} written, {} already present",
            self.entries_written, self.duplicates
        )?;
        if !self.documents_written.is_empty() {
            writeln!(f, "  Documents:")?;
            for document in &self.documents_written {
                writeln!(f, "    {}", document.display())?;
            }
        }

        writeln!(
            f,
            "  Checkpoint:    {} -> {}",
            marker_or_none(self.checkpoint_before),
            marker_or_none(self.checkpoint_after)
        )?;

        if !self.skipped.is_empty() {
            writeln!(f, "  Skipped messages:")?;
            for skipped in &self.skipped {
                writeln!(
                    f,
                    "    {} [{}] {}: {}",
                    skipped.marker,
                    skipped.stage,
                    skipped.subject.as_deref().unwrap_or("(not fetched)"),
                    skipped.error
                )?;
            }
        }

        if !self.abandoned.is_empty() {
            writeln!(f, "  Abandoned messages (no longer retried):")?;
            for abandoned in &self.abandoned {
                writeln!(
                    f,
                    "    {} [{}] {}: {}",
                    abandoned.marker,
                    abandoned.stage,
                    abandoned.subject.as_deref().unwrap_or("(not fetched)"),
                    abandoned.error
                )?;
            }
        }

        Ok(())
    }
}
