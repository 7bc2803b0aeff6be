//! Sync orchestration
//!
//! One run walks `Idle -> FetchingDelta -> Processing(i) -> Committing -> Done`,
//! or ends in `Failed` on an error that touches shared state. Fetch, filter and
//! classify are pipelined up to the configured concurrency; routing and
//! checkpoint advancement happen strictly in delta order.
//!
//! The checkpoint only moves to a message once that message and every
//! earlier message in the delta are resolved (routed, ignored or filtered).
//! A skipped message pins the checkpoint before it, so it is listed again on
//! the next run; later messages that did get routed are deduplicated then by
//! their entry tags.

use chrono::{Duration as ChronoDuration, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checkpoint::{Checkpoint, CheckpointStore, RunLock};
use crate::classifier::Classifier;
use crate::error::{Result, SyncError};
use crate::filters::EmailFilter;
use crate::mailbox::{Delta, DeltaQuery, MailboxConnector, MailboxSession};
use crate::models::{Category, ClassificationResult, Marker, Message, MessageSummary};
use crate::report::{SkippedMessage, Stage, SyncReport};
use crate::retry::RetryPolicy;
use crate::router::{ApplyOutcome, Router};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Everything after the checkpoint
    Incremental,
    /// The whole lookback window, regardless of the checkpoint
    Full,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Incremental => f.write_str("incremental"),
            SyncMode::Full => f.write_str("full"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    FetchingDelta,
    Processing(usize),
    Committing,
    Done,
    Failed(String),
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncState::Idle => f.write_str("idle"),
            SyncState::FetchingDelta => f.write_str("fetching delta"),
            SyncState::Processing(i) => write!(f, "processing message {}", i + 1),
            SyncState::Committing => f.write_str("committing"),
            SyncState::Done => f.write_str("done"),
            SyncState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Progress notifications for UIs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Connecting,
    DeltaListed { total: usize, deferred: usize },
    MessageDone { index: usize, marker: Marker, resolved: bool },
    CheckpointSaved { marker: Marker },
}

pub type ProgressCallback = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub days_lookback: u32,
    pub max_messages_per_run: usize,
    pub concurrency: usize,
    pub checkpoint_interval: usize,
    /// Failed runs after which a message is abandoned; 0 keeps retrying forever
    pub max_failed_runs: u32,
    pub retry: RetryPolicy,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            days_lookback: 7,
            max_messages_per_run: 200,
            concurrency: 4,
            checkpoint_interval: 25,
            max_failed_runs: 5,
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&crate::config::SyncConfig> for SyncOptions {
    fn from(config: &crate::config::SyncConfig) -> Self {
        Self {
            days_lookback: config.days_lookback,
            max_messages_per_run: config.max_messages_per_run,
            concurrency: config.concurrency,
            checkpoint_interval: config.checkpoint_interval,
            max_failed_runs: config.max_failed_runs,
            retry: config.retry.policy(),
        }
    }
}

/// Tracks which delta positions are resolved and how far the checkpoint may move
#[derive(Debug, Clone)]
pub struct CommitTracker {
    markers: Vec<Marker>,
    resolved: Vec<Option<bool>>,
    /// Length of the resolved prefix
    committed: usize,
}

impl CommitTracker {
    pub fn new(markers: Vec<Marker>) -> Self {
        let len = markers.len();
        Self {
            markers,
            resolved: vec![None; len],
            committed: 0,
        }
    }

    /// Record the outcome of the message at `index`
    pub fn record(&mut self, index: usize, resolved: bool) {
        if let Some(slot) = self.resolved.get_mut(index) {
            *slot = Some(resolved);
        }
        while let Some(Some(true)) = self.resolved.get(self.committed) {
            self.committed += 1;
        }
    }

    /// Number of leading messages that are all resolved
    pub fn committed_len(&self) -> usize {
        self.committed
    }

    /// Marker of the last message in the resolved prefix
    pub fn high_water(&self) -> Option<Marker> {
        self.committed
            .checked_sub(1)
            .map(|last| self.markers[last])
    }

    /// Resolved prefix messages that lie beyond `previous`
    pub fn resolved_beyond(&self, previous: Option<Marker>) -> u64 {
        self.markers[..self.committed]
            .iter()
            .filter(|m| match previous {
                Some(prev) if prev.same_epoch(m) => **m > prev,
                _ => true,
            })
            .count() as u64
    }
}

/// Length of the delta prefix a run works on
///
/// Only messages not yet resolved count towards `cap`.
fn cap_position(messages: &[MessageSummary], checkpoint: &Checkpoint, cap: usize) -> usize {
    let mut work = 0;
    for (index, summary) in messages.iter().enumerate() {
        if checkpoint.is_resolved_ahead(summary.marker) {
            continue;
        }
        if work == cap {
            return index;
        }
        work += 1;
    }
    messages.len()
}

/// Result of the pipelined part of one message
enum Prepared {
    Filtered { message: Message, reason: String },
    Classified {
        message: Message,
        result: ClassificationResult,
    },
    Skipped(SkippedMessage),
}

/// Per-message outcome after routing
enum MessageOutcome {
    Routed {
        category: Category,
        written: Vec<PathBuf>,
        duplicates: usize,
    },
    Ignored,
    Filtered,
    Skipped(SkippedMessage),
    /// Failed in too many runs; resolved so the checkpoint can move on
    Abandoned(SkippedMessage),
}

impl MessageOutcome {
    fn is_resolved(&self) -> bool {
        !matches!(self, MessageOutcome::Skipped(_))
    }
}

/// A run that ended in `Failed`, with the report of what was done before
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct SyncFailure {
    pub report: Box<SyncReport>,
    pub error: SyncError,
}

/// Read-only look at what the next run would process
#[derive(Debug, Clone)]
pub struct Preview {
    pub checkpoint: Checkpoint,
    pub uid_validity: u32,
    pub pending: usize,
    pub deferred: usize,
    /// (marker, sender, subject) of the oldest pending messages
    pub samples: Vec<(Marker, String, String)>,
}

pub struct SyncEngine {
    connector: Arc<dyn MailboxConnector>,
    classifier: Arc<dyn Classifier>,
    router: Router,
    filter: EmailFilter,
    store: CheckpointStore,
    state_dir: PathBuf,
    options: SyncOptions,
    progress: Option<ProgressCallback>,
    cancel: CancellationToken,
}

impl SyncEngine {
    pub fn new(
        connector: Arc<dyn MailboxConnector>,
        classifier: Arc<dyn Classifier>,
        router: Router,
        filter: EmailFilter,
        state_dir: impl Into<PathBuf>,
        options: SyncOptions,
    ) -> Self {
        let state_dir = state_dir.into();
        Self {
            connector,
            classifier,
            router,
            filter,
            store: CheckpointStore::new(&state_dir),
            state_dir,
            options,
            progress: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn checkpoint_store(&self) -> &CheckpointStore {
        &self.store
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(progress) = &self.progress {
            progress(event);
        }
    }

    /// Fetch, filter and classify one message
    ///
    /// Per-message failures become `Prepared::Skipped`; only fatal errors are returned.
    async fn prepare(&self, session: &dyn MailboxSession, summary: MessageSummary) -> Result<Prepared> {
        let marker = summary.marker;
        let retry = &self.options.retry;

        let message = match retry.run("fetch", || session.fetch(marker)).await {
            Ok(message) => message,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!("Skipping {}: fetch failed: {}", marker, e);
                return Ok(Prepared::Skipped(SkippedMessage {
                    marker,
                    message_id: None,
                    subject: None,
                    stage: Stage::Fetch,
                    error: e.to_string(),
                }));
            }
        };

        if !self.filter.should_process(&message) {
            let reason = self.filter.reason(&message);
            return Ok(Prepared::Filtered { message, reason });
        }

        match retry.run("classify", || self.classifier.classify(&message)).await {
            Ok(result) => Ok(Prepared::Classified { message, result }),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!("Skipping {}: classification failed: {}", marker, e);
                Ok(Prepared::Skipped(SkippedMessage {
                    marker,
                    message_id: Some(message.id.clone()),
                    subject: Some(message.subject.clone()),
                    stage: Stage::Classify,
                    error: e.to_string(),
                }))
            }
        }
    }

    /// Write every target of a classified message
    async fn route(&self, message: &Message, result: &ClassificationResult) -> MessageOutcome {
        let targets = self.router.route(result, message);
        if targets.is_empty() {
            return MessageOutcome::Ignored;
        }

        let mut written = Vec::new();
        let mut duplicates = 0;
        for target in &targets {
            let applied = self
                .options
                .retry
                .run_if(
                    "write",
                    |e| matches!(e, SyncError::IoError(_)),
                    || self.router.apply(target),
                )
                .await;

            match applied {
                Ok(ApplyOutcome::Written) => written.push(target.document.clone()),
                Ok(ApplyOutcome::AlreadyPresent) => duplicates += 1,
                Err(e) => {
                    warn!(
                        "Skipping {}: writing {} failed: {}",
                        message.marker,
                        target.document.display(),
                        e
                    );
                    return MessageOutcome::Skipped(SkippedMessage {
                        marker: message.marker,
                        message_id: Some(message.id.clone()),
                        subject: Some(message.subject.clone()),
                        stage: Stage::Route,
                        error: e.to_string(),
                    });
                }
            }
        }

        MessageOutcome::Routed {
            category: result.category,
            written,
            duplicates,
        }
    }

    fn record(&self, report: &mut SyncReport, outcome: MessageOutcome) {
        match outcome {
            MessageOutcome::Routed {
                category,
                written,
                duplicates,
            } => {
                report.processed += 1;
                report.routed += 1;
                *report.categories.entry(category).or_default() += 1;
                report.entries_written += written.len();
                report.documents_written.extend(written);
                report.duplicates += duplicates;
            }
            MessageOutcome::Ignored => {
                report.processed += 1;
                report.ignored += 1;
                *report.categories.entry(Category::Ignore).or_default() += 1;
            }
            MessageOutcome::Filtered => {
                report.processed += 1;
                report.filtered += 1;
            }
            MessageOutcome::Skipped(skipped) => report.skipped.push(skipped),
            MessageOutcome::Abandoned(skipped) => {
                report.processed += 1;
                report.abandoned.push(skipped);
            }
        }
    }

    /// Carry a skip into the checkpoint's failure ledger
    ///
    /// After `max_failed_runs` failed runs the message is abandoned instead,
    /// so one bad message cannot pin the checkpoint forever.
    fn settle(&self, checkpoint: &mut Checkpoint, outcome: MessageOutcome) -> MessageOutcome {
        let skipped = match outcome {
            MessageOutcome::Skipped(skipped) => skipped,
            other => return other,
        };

        let runs = checkpoint.record_failure(skipped.marker, &skipped.error);
        let limit = self.options.max_failed_runs;
        if limit > 0 && runs >= limit {
            warn!(
                "Giving up on {} after {} failed runs: {}",
                skipped.marker, runs, skipped.error
            );
            MessageOutcome::Abandoned(skipped)
        } else {
            MessageOutcome::Skipped(skipped)
        }
    }

    /// Move the checkpoint to the committed prefix and persist it
    async fn persist(
        &self,
        checkpoint: &mut Checkpoint,
        tracker: &CommitTracker,
        previous: Option<Marker>,
        counted: &mut u64,
        run_id: &str,
    ) -> Result<()> {
        let Some(high_water) = tracker.high_water() else {
            return Ok(());
        };
        let resolved = tracker.resolved_beyond(previous);
        checkpoint.advance(high_water, resolved.saturating_sub(*counted), run_id);
        *counted = resolved;

        self.store.save(checkpoint).await?;
        if let Some(marker) = checkpoint.last_marker {
            self.emit(ProgressEvent::CheckpointSaved { marker });
        }
        Ok(())
    }

    fn fail(mut report: SyncReport, error: SyncError) -> SyncFailure {
        warn!("Sync run {} failed: {}", report.run_id, error);
        report.state = SyncState::Failed(error.to_string());
        report.completed_at = Some(Utc::now());
        SyncFailure {
            report: Box::new(report),
            error,
        }
    }

    /// Run one sync
    pub async fn run(&self, mode: SyncMode) -> std::result::Result<SyncReport, SyncFailure> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let mut report = SyncReport::new(run_id.clone(), mode);
        info!("Starting {} sync run {}", mode, run_id);

        let _lock = match RunLock::acquire(&self.state_dir) {
            Ok(lock) => lock,
            Err(e) => return Err(Self::fail(report, e)),
        };

        let mut checkpoint = match self.store.load().await {
            Ok(checkpoint) => checkpoint,
            Err(e) => return Err(Self::fail(report, e)),
        };
        report.checkpoint_before = checkpoint.last_marker;
        report.checkpoint_after = checkpoint.last_marker;

        report.state = SyncState::FetchingDelta;
        self.emit(ProgressEvent::Connecting);
        let session = match self.connector.connect().await {
            Ok(session) => session,
            Err(e) => return Err(Self::fail(report, e)),
        };

        let result = self
            .process(session.as_ref(), mode, &mut checkpoint, &mut report)
            .await;

        if let Err(e) = session.logout().await {
            debug!("Logout failed: {}", e);
        }

        report.checkpoint_after = checkpoint.last_marker;
        match result {
            Ok(()) => {
                report.state = SyncState::Done;
                report.completed_at = Some(Utc::now());
                info!(
                    "Sync run {} done: {} processed, {} skipped, checkpoint {:?}",
                    run_id,
                    report.processed,
                    report.skipped.len(),
                    report.checkpoint_after
                );
                Ok(report)
            }
            Err(e) => Err(Self::fail(report, e)),
        }
    }

    async fn process(
        &self,
        session: &dyn MailboxSession,
        mode: SyncMode,
        checkpoint: &mut Checkpoint,
        report: &mut SyncReport,
    ) -> Result<()> {
        let run_id = report.run_id.clone();
        let previous = checkpoint.last_marker;

        let mut delta =
            list_delta(session, mode, checkpoint, self.options.days_lookback).await?;
        report.listed = delta.len();

        // Messages already resolved in an earlier run are re-evaluated but do not use up the cap
        let cutoff = cap_position(&delta.messages, checkpoint, self.options.max_messages_per_run);
        if cutoff < delta.len() {
            report.deferred = delta.messages[cutoff..]
                .iter()
                .filter(|m| !checkpoint.is_resolved_ahead(m.marker))
                .count();
            delta.messages.truncate(cutoff);
            info!(
                "Processing the oldest {} of {} messages, {} deferred",
                delta.len(),
                report.listed,
                report.deferred
            );
        }
        self.emit(ProgressEvent::DeltaListed {
            total: delta.len(),
            deferred: report.deferred,
        });
        info!(
            "Delta: {} messages (UIDVALIDITY {})",
            delta.len(),
            delta.uid_validity
        );

        let mut tracker = CommitTracker::new(delta.messages.iter().map(|m| m.marker).collect());
        let mut counted = 0u64;
        let mut saved_len = 0usize;
        let mut ledger_changed = false;

        let prepared = stream::iter(delta.messages.iter().cloned().enumerate())
            .map(|(index, summary)| async move { (index, self.prepare(session, summary).await) })
            .buffered(self.options.concurrency.max(1));
        let mut prepared = std::pin::pin!(prepared);

        let mut fatal = None;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    warn!("Cancellation requested, stopping after the last committed message");
                    report.cancelled = true;
                    break;
                }
                next = prepared.next() => next,
            };
            let Some((index, prepared)) = next else {
                break;
            };
            report.state = SyncState::Processing(index);

            let outcome = match prepared {
                Ok(Prepared::Filtered { message, reason }) => {
                    debug!("Filtered {} ({})", message.marker, reason);
                    MessageOutcome::Filtered
                }
                Ok(Prepared::Classified { message, result }) => {
                    debug!("{} classified as {}", message.marker, result.category);
                    self.route(&message, &result).await
                }
                Ok(Prepared::Skipped(skipped)) => MessageOutcome::Skipped(skipped),
                Err(e) => {
                    fatal = Some(e);
                    break;
                }
            };

            let marker = delta.messages[index].marker;
            let outcome = self.settle(checkpoint, outcome);
            let resolved = outcome.is_resolved();
            if resolved {
                checkpoint.mark_resolved(marker);
            }
            ledger_changed = true;

            tracker.record(index, resolved);
            self.record(report, outcome);
            self.emit(ProgressEvent::MessageDone {
                index,
                marker,
                resolved,
            });

            if tracker.committed_len() - saved_len >= self.options.checkpoint_interval {
                self.persist(checkpoint, &tracker, previous, &mut counted, &run_id)
                    .await?;
                saved_len = tracker.committed_len();
                ledger_changed = false;
            }
        }

        report.state = SyncState::Committing;
        if let Some(e) = fatal {
            // The committed prefix is exact progress even when the run fails
            if tracker.committed_len() > saved_len {
                self.persist(checkpoint, &tracker, previous, &mut counted, &run_id)
                    .await?;
            } else if ledger_changed {
                self.store.save(checkpoint).await?;
            }
            return Err(e);
        }

        if tracker.committed_len() > saved_len {
            self.persist(checkpoint, &tracker, previous, &mut counted, &run_id)
                .await?;
        } else if ledger_changed || (saved_len == 0 && !report.cancelled) {
            // Nothing newly committed: still record the run and its failures
            checkpoint.updated_at = Some(Utc::now());
            checkpoint.last_run_id = Some(run_id.clone());
            self.store.save(checkpoint).await?;
        }

        Ok(())
    }

    /// List pending messages without taking the lock or changing any state
    pub async fn preview(&self, sample_limit: usize) -> Result<Preview> {
        self.emit(ProgressEvent::Connecting);
        preview(self.connector.as_ref(), &self.store, &self.options, sample_limit).await
    }
}

/// Ask the mailbox for the messages a run should consider
async fn list_delta(
    session: &dyn MailboxSession,
    mode: SyncMode,
    checkpoint: &Checkpoint,
    days_lookback: u32,
) -> Result<Delta> {
    let lookback = || {
        DeltaQuery::Since(Utc::now() - ChronoDuration::days(i64::from(days_lookback)))
    };

    let marker = match (mode, checkpoint.last_marker) {
        (SyncMode::Full, _) | (SyncMode::Incremental, None) => {
            return session.list_since(&lookback()).await;
        }
        (SyncMode::Incremental, Some(marker)) => marker,
    };

    let delta = session.list_since(&DeltaQuery::After(Some(marker))).await?;
    if delta.uid_validity != marker.uid_validity {
        warn!(
            "Mailbox UIDVALIDITY changed ({} -> {}), falling back to the {}-day window",
            marker.uid_validity, delta.uid_validity, days_lookback
        );
        return session.list_since(&lookback()).await;
    }
    Ok(delta)
}

/// Read-only look at what the next incremental run would process
///
/// Needs only the mailbox and the checkpoint file: no classifier, no lock,
/// and nothing is created or written.
pub async fn preview(
    connector: &dyn MailboxConnector,
    store: &CheckpointStore,
    options: &SyncOptions,
    sample_limit: usize,
) -> Result<Preview> {
    let checkpoint = store.load().await?;
    let session = connector.connect().await?;

    let listed = list_delta(
        session.as_ref(),
        SyncMode::Incremental,
        &checkpoint,
        options.days_lookback,
    )
    .await;
    let delta = match listed {
        Ok(delta) => delta,
        Err(e) => {
            let _ = session.logout().await;
            return Err(e);
        }
    };

    let cutoff = cap_position(&delta.messages, &checkpoint, options.max_messages_per_run);
    let pending = delta.messages[..cutoff]
        .iter()
        .filter(|m| !checkpoint.is_resolved_ahead(m.marker))
        .count();
    let deferred = delta.messages[cutoff..]
        .iter()
        .filter(|m| !checkpoint.is_resolved_ahead(m.marker))
        .count();

    let mut samples = Vec::new();
    let unresolved = delta.messages[..cutoff]
        .iter()
        .filter(|m| !checkpoint.is_resolved_ahead(m.marker));
    for summary in unresolved.take(sample_limit) {
        match session.fetch(summary.marker).await {
            Ok(message) => samples.push((summary.marker, message.sender, message.subject)),
            Err(e) if e.is_fatal() => {
                let _ = session.logout().await;
                return Err(e);
            }
            Err(e) => warn!("Could not fetch {} for preview: {}", summary.marker, e),
        }
    }

    if let Err(e) = session.logout().await {
        debug!("Logout failed: {}", e);
    }

    Ok(Preview {
        checkpoint,
        uid_validity: delta.uid_validity,
        pending,
        deferred,
        samples,
    })
}
