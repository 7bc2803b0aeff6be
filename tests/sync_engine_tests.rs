//! End-to-end runs of the sync engine against an in-memory mailbox
//!
//! These tests cover the checkpoint contract: the marker only moves over a
//! fully resolved prefix of the delta, re-runs never duplicate entries, and
//! failures that touch shared state end the run without losing progress.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use common::*;
use email_kb_sync::checkpoint::{CheckpointStore, RunLock, CHECKPOINT_FILE, LOCK_FILE};
use email_kb_sync::error::SyncError;
use email_kb_sync::filters::EmailFilter;
use email_kb_sync::mailbox::DeltaQuery;
use email_kb_sync::models::{Category, EntryTag, Marker, Message};
use email_kb_sync::report::Stage;
use email_kb_sync::sync::{preview, ProgressCallback, ProgressEvent, SyncMode, SyncState};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct Workspace {
    _root: TempDir,
    kb: std::path::PathBuf,
    state: std::path::PathBuf,
}

fn workspace() -> Workspace {
    let root = TempDir::new().unwrap();
    let kb = root.path().join("kb");
    let state = root.path().join("state");
    std::fs::create_dir_all(&kb).unwrap();
    std::fs::create_dir_all(&state).unwrap();
    Workspace {
        _root: root,
        kb,
        state,
    }
}

fn tag(message: &Message) -> String {
    EntryTag::for_message(&message.id).marker()
}

fn work_messages() -> Vec<Message> {
    vec![
        create_test_message(1, "Boss <boss@corp.io>", "work: Ship the release"),
        create_test_message(2, "Boss <boss@corp.io>", "work: Review the budget"),
        create_test_message(3, "Boss <boss@corp.io>", "work: Book the offsite"),
    ]
}

#[tokio::test]
async fn test_all_messages_routed_after_transient_classify_failures() {
    let ws = workspace();
    let messages = vec![
        create_test_message(1, "Boss <boss@corp.io>", "work: Ship the release"),
        create_test_message(2, "Ann Lee <ann@corp.io>", "Quarterly numbers are in"),
        create_test_message(3, "Jane Roe <jane@corp.io>", "person: Jane Roe"),
    ];
    let mailbox = FakeMailbox::new(messages.clone());

    let calls_for_m2 = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls_for_m2);
    let mut classifier = MockClassifier::new();
    classifier.expect_classify().returning(move |m| {
        if m.marker.uid == 2 && counter.fetch_add(1, Ordering::SeqCst) < 2 {
            return Err(SyncError::ServiceError("overloaded".to_string()));
        }
        Ok(classify_by_subject(m))
    });

    let engine = create_engine(
        &mailbox,
        classifier,
        allow_domains(&["corp.io"]),
        &ws.kb,
        &ws.state,
        test_options(),
    );
    let report = engine.run(SyncMode::Incremental).await.unwrap();

    assert_eq!(report.state, SyncState::Done);
    assert_eq!(report.processed, 3);
    assert_eq!(report.routed, 3);
    assert!(report.skipped.is_empty());
    assert_eq!(calls_for_m2.load(Ordering::SeqCst), 3);

    let work = read_doc(&ws.kb, "work.md");
    assert!(work.contains("## TODO"));
    assert!(work.contains("Ship the release"));
    assert!(work.contains(&tag(&messages[0])));

    let log_name = format!("logs/{}.md", messages[1].received_at.format("%Y-%m-%d"));
    let log = read_doc(&ws.kb, &log_name);
    assert!(log.contains("Quarterly numbers are in"));
    assert!(log.contains(&tag(&messages[1])));

    let person = read_doc(&ws.kb, "people/jane-roe.md");
    assert!(person.contains("## Interactions"));
    assert!(person.contains(&tag(&messages[2])));

    let checkpoint = CheckpointStore::new(&ws.state).load().await.unwrap();
    assert_eq!(checkpoint.last_marker, Some(Marker::new(UID_VALIDITY, 3)));
    assert_eq!(checkpoint.processed_count, 3);
    assert_eq!(checkpoint.last_run_id.as_deref(), Some(report.run_id.as_str()));
    assert!(!ws.state.join(LOCK_FILE).exists());
}

#[tokio::test]
async fn test_failed_fetch_pins_checkpoint_and_is_retried_next_run() {
    let ws = workspace();
    let messages = work_messages();
    let mailbox = FakeMailbox::new(messages.clone());
    mailbox.fail_fetch(2, 3, FetchFailure::Network);

    let mut options = test_options();
    options.concurrency = 4;

    let engine = create_engine(
        &mailbox,
        subject_classifier(),
        EmailFilter::permissive(),
        &ws.kb,
        &ws.state,
        options.clone(),
    );
    let report = engine.run(SyncMode::Incremental).await.unwrap();

    assert_eq!(report.routed, 2);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].marker, Marker::new(UID_VALIDITY, 2));
    assert_eq!(report.skipped[0].stage, Stage::Fetch);
    // m3 was written but the checkpoint stops before m2
    assert_eq!(report.checkpoint_after, Some(Marker::new(UID_VALIDITY, 1)));
    assert!(read_doc(&ws.kb, "work.md").contains(&tag(&messages[2])));
    assert!(!read_doc(&ws.kb, "work.md").contains(&tag(&messages[1])));

    // The fetch failures are used up; the next run lists m2 again
    let engine = create_engine(
        &mailbox,
        subject_classifier(),
        EmailFilter::permissive(),
        &ws.kb,
        &ws.state,
        options,
    );
    let report = engine.run(SyncMode::Incremental).await.unwrap();

    assert!(matches!(
        mailbox.queries().last(),
        Some(DeltaQuery::After(Some(m))) if *m == Marker::new(UID_VALIDITY, 1)
    ));
    assert_eq!(report.listed, 2);
    assert_eq!(report.entries_written, 1);
    assert_eq!(report.duplicates, 1);
    assert!(report.skipped.is_empty());

    let work = read_doc(&ws.kb, "work.md");
    for message in &messages {
        assert_eq!(work.matches(&tag(message)).count(), 1);
    }

    let checkpoint = CheckpointStore::new(&ws.state).load().await.unwrap();
    assert_eq!(checkpoint.last_marker, Some(Marker::new(UID_VALIDITY, 3)));
    assert_eq!(checkpoint.processed_count, 3);
}

#[tokio::test]
async fn test_full_resync_does_not_duplicate_entries() {
    let ws = workspace();
    let messages = work_messages();
    let mailbox = FakeMailbox::new(messages.clone());

    let engine = create_engine(
        &mailbox,
        subject_classifier(),
        EmailFilter::permissive(),
        &ws.kb,
        &ws.state,
        test_options(),
    );
    engine.run(SyncMode::Incremental).await.unwrap();
    let before = read_doc(&ws.kb, "work.md");

    let report = engine.run(SyncMode::Full).await.unwrap();
    assert!(matches!(mailbox.queries().last(), Some(DeltaQuery::Since(_))));
    assert_eq!(report.listed, 3);
    assert_eq!(report.entries_written, 0);
    assert_eq!(report.duplicates, 3);
    assert_eq!(read_doc(&ws.kb, "work.md"), before);

    // The marker never moves backwards and nothing is counted twice
    let checkpoint = CheckpointStore::new(&ws.state).load().await.unwrap();
    assert_eq!(checkpoint.last_marker, Some(Marker::new(UID_VALIDITY, 3)));
    assert_eq!(checkpoint.processed_count, 3);
}

#[tokio::test]
async fn test_blocked_sender_never_reaches_classifier() {
    let ws = workspace();
    let mailbox = FakeMailbox::new(vec![
        create_test_message(1, "Promo <deals@other.com>", "work: Buy now"),
        create_test_message(2, "Boss <boss@corp.io>", "work: Real task"),
    ]);

    let mut classifier = MockClassifier::new();
    classifier
        .expect_classify()
        .withf(|m: &Message| m.sender.ends_with("@corp.io>"))
        .times(1)
        .returning(|m| Ok(classify_by_subject(m)));

    let engine = create_engine(
        &mailbox,
        classifier,
        allow_domains(&["corp.io"]),
        &ws.kb,
        &ws.state,
        test_options(),
    );
    let report = engine.run(SyncMode::Incremental).await.unwrap();

    assert_eq!(report.filtered, 1);
    assert_eq!(report.routed, 1);
    assert_eq!(report.processed, 2);
    // Filtered messages are resolved, so the checkpoint moves past them
    assert_eq!(report.checkpoint_after, Some(Marker::new(UID_VALIDITY, 2)));
    assert!(!read_doc(&ws.kb, "work.md").contains("Buy now"));
}

#[tokio::test]
async fn test_ignored_message_writes_nothing() {
    let ws = workspace();
    let mailbox = FakeMailbox::new(vec![create_test_message(
        1,
        "News <news@corp.io>",
        "ignore: weekly digest",
    )]);

    let engine = create_engine(
        &mailbox,
        subject_classifier(),
        EmailFilter::permissive(),
        &ws.kb,
        &ws.state,
        test_options(),
    );
    let report = engine.run(SyncMode::Incremental).await.unwrap();

    assert_eq!(report.ignored, 1);
    assert_eq!(report.categories.get(&Category::Ignore), Some(&1));
    assert!(report.documents_written.is_empty());
    assert_eq!(std::fs::read_dir(&ws.kb).unwrap().count(), 0);
    assert_eq!(report.checkpoint_after, Some(Marker::new(UID_VALIDITY, 1)));
}

#[tokio::test]
async fn test_fatal_error_persists_committed_prefix() {
    let ws = workspace();
    let mailbox = FakeMailbox::new(work_messages());

    let mut classifier = MockClassifier::new();
    classifier.expect_classify().returning(|m| {
        if m.marker.uid == 2 {
            Err(SyncError::AuthError("invalid x-api-key".to_string()))
        } else {
            Ok(classify_by_subject(m))
        }
    });

    let engine = create_engine(
        &mailbox,
        classifier,
        EmailFilter::permissive(),
        &ws.kb,
        &ws.state,
        test_options(),
    );
    let failure = engine.run(SyncMode::Incremental).await.unwrap_err();

    assert!(matches!(failure.error, SyncError::AuthError(_)));
    assert!(failure.report.is_failed());
    assert_eq!(failure.report.routed, 1);

    let checkpoint = CheckpointStore::new(&ws.state).load().await.unwrap();
    assert_eq!(checkpoint.last_marker, Some(Marker::new(UID_VALIDITY, 1)));
    assert!(!ws.state.join(LOCK_FILE).exists());
}

#[tokio::test]
async fn test_fatal_fetch_error_fails_run() {
    let ws = workspace();
    let mailbox = FakeMailbox::new(work_messages());
    mailbox.fail_fetch(1, 1, FetchFailure::Auth);

    let engine = create_engine(
        &mailbox,
        subject_classifier(),
        EmailFilter::permissive(),
        &ws.kb,
        &ws.state,
        test_options(),
    );
    let failure = engine.run(SyncMode::Incremental).await.unwrap_err();

    assert!(matches!(failure.report.state, SyncState::Failed(_)));
    // Auth errors are not retried
    assert_eq!(mailbox.fetch_calls(), 1);
    assert!(!ws.state.join(CHECKPOINT_FILE).exists());
}

#[tokio::test]
async fn test_cancelled_run_keeps_checkpoint() {
    let ws = workspace();
    let mailbox = FakeMailbox::new(work_messages());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let engine = create_engine(
        &mailbox,
        subject_classifier(),
        EmailFilter::permissive(),
        &ws.kb,
        &ws.state,
        test_options(),
    )
    .with_cancellation(cancel);
    let report = engine.run(SyncMode::Incremental).await.unwrap();

    assert!(report.cancelled);
    assert_eq!(report.processed, 0);
    assert_eq!(report.checkpoint_after, None);
    assert!(!ws.state.join(CHECKPOINT_FILE).exists());
    assert!(report.to_string().contains("interrupted"));
}

#[tokio::test]
async fn test_second_run_is_locked_out() {
    let ws = workspace();
    let mailbox = FakeMailbox::new(work_messages());
    let _lock = RunLock::acquire(&ws.state).unwrap();

    let engine = create_engine(
        &mailbox,
        subject_classifier(),
        EmailFilter::permissive(),
        &ws.kb,
        &ws.state,
        test_options(),
    );
    let failure = engine.run(SyncMode::Incremental).await.unwrap_err();

    assert!(matches!(failure.error, SyncError::Locked(_)));
    assert!(mailbox.queries().is_empty());
    assert!(ws.state.join(LOCK_FILE).exists());
}

#[tokio::test]
async fn test_corrupted_checkpoint_aborts_without_touching_it() {
    let ws = workspace();
    let path = ws.state.join(CHECKPOINT_FILE);
    std::fs::write(&path, "{ not json").unwrap();
    let mailbox = FakeMailbox::new(work_messages());

    let engine = create_engine(
        &mailbox,
        subject_classifier(),
        EmailFilter::permissive(),
        &ws.kb,
        &ws.state,
        test_options(),
    );
    let failure = engine.run(SyncMode::Incremental).await.unwrap_err();

    assert!(matches!(failure.error, SyncError::CheckpointCorrupted { .. }));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "{ not json");
    assert!(!ws.state.join(LOCK_FILE).exists());
}

#[tokio::test]
async fn test_per_run_cap_defers_newest_messages() {
    let ws = workspace();
    let mailbox = FakeMailbox::new(work_messages());
    let mut options = test_options();
    options.max_messages_per_run = 2;

    let engine = create_engine(
        &mailbox,
        subject_classifier(),
        EmailFilter::permissive(),
        &ws.kb,
        &ws.state,
        options,
    );
    let report = engine.run(SyncMode::Incremental).await.unwrap();
    assert_eq!(report.listed, 3);
    assert_eq!(report.deferred, 1);
    assert_eq!(report.processed, 2);
    assert_eq!(report.checkpoint_after, Some(Marker::new(UID_VALIDITY, 2)));

    let report = engine.run(SyncMode::Incremental).await.unwrap();
    assert_eq!(report.listed, 1);
    assert_eq!(report.deferred, 0);
    assert_eq!(report.checkpoint_after, Some(Marker::new(UID_VALIDITY, 3)));
}

#[tokio::test]
async fn test_uid_validity_change_falls_back_to_lookback_window() {
    let ws = workspace();
    let mailbox = FakeMailbox::new(work_messages());

    let engine = create_engine(
        &mailbox,
        subject_classifier(),
        EmailFilter::permissive(),
        &ws.kb,
        &ws.state,
        test_options(),
    );
    engine.run(SyncMode::Incremental).await.unwrap();

    mailbox.renumber(2);
    let report = engine.run(SyncMode::Incremental).await.unwrap();

    let queries = mailbox.queries();
    assert!(matches!(queries[queries.len() - 2], DeltaQuery::After(Some(_))));
    assert!(matches!(queries[queries.len() - 1], DeltaQuery::Since(_)));
    assert_eq!(report.listed, 3);
    assert_eq!(report.entries_written, 0);
    assert_eq!(report.checkpoint_after, Some(Marker::new(2, 103)));
}

#[tokio::test]
async fn test_new_mail_is_picked_up_incrementally() {
    let ws = workspace();
    let mailbox = FakeMailbox::new(work_messages());

    let engine = create_engine(
        &mailbox,
        subject_classifier(),
        EmailFilter::permissive(),
        &ws.kb,
        &ws.state,
        test_options(),
    );
    engine.run(SyncMode::Incremental).await.unwrap();

    let report = engine.run(SyncMode::Incremental).await.unwrap();
    assert_eq!(report.listed, 0);
    assert_eq!(report.state, SyncState::Done);

    mailbox.push(create_test_message(4, "Boss <boss@corp.io>", "work: Fourth"));
    let report = engine.run(SyncMode::Incremental).await.unwrap();
    assert_eq!(report.listed, 1);
    assert_eq!(report.routed, 1);

    let checkpoint = CheckpointStore::new(&ws.state).load().await.unwrap();
    assert_eq!(checkpoint.last_marker, Some(Marker::new(UID_VALIDITY, 4)));
    assert_eq!(checkpoint.processed_count, 4);
}

#[tokio::test]
async fn test_checkpoint_saved_every_interval() {
    let ws = workspace();
    let mailbox = FakeMailbox::new(work_messages());
    let mut options = test_options();
    options.checkpoint_interval = 1;

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let progress: ProgressCallback = Arc::new(move |event| sink.lock().unwrap().push(event));

    let engine = create_engine(
        &mailbox,
        subject_classifier(),
        EmailFilter::permissive(),
        &ws.kb,
        &ws.state,
        options,
    )
    .with_progress(progress);
    engine.run(SyncMode::Incremental).await.unwrap();

    let events = events.lock().unwrap();
    assert_eq!(events.first(), Some(&ProgressEvent::Connecting));
    assert!(events.contains(&ProgressEvent::DeltaListed {
        total: 3,
        deferred: 0
    }));
    let saved: Vec<Marker> = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::CheckpointSaved { marker } => Some(*marker),
            _ => None,
        })
        .collect();
    assert_eq!(
        saved,
        vec![
            Marker::new(UID_VALIDITY, 1),
            Marker::new(UID_VALIDITY, 2),
            Marker::new(UID_VALIDITY, 3)
        ]
    );
}

#[tokio::test]
async fn test_preview_changes_nothing() {
    let ws = workspace();
    let mailbox = FakeMailbox::new(work_messages());

    let mut classifier = MockClassifier::new();
    classifier.expect_classify().never();

    let engine = create_engine(
        &mailbox,
        classifier,
        EmailFilter::permissive(),
        &ws.kb,
        &ws.state,
        test_options(),
    );
    let preview = engine.preview(2).await.unwrap();

    assert_eq!(preview.pending, 3);
    assert_eq!(preview.deferred, 0);
    assert_eq!(preview.samples.len(), 2);
    assert_eq!(preview.samples[0].2, "work: Ship the release");
    assert!(!ws.state.join(CHECKPOINT_FILE).exists());
    assert!(!ws.state.join(LOCK_FILE).exists());
    assert_eq!(std::fs::read_dir(&ws.kb).unwrap().count(), 0);
}

#[tokio::test]
async fn test_preview_needs_only_mailbox_and_checkpoint() {
    let ws = workspace();
    let mailbox = FakeMailbox::new(work_messages());
    let state = ws.kb.with_file_name("never-created");

    let store = CheckpointStore::new(&state);
    let pending = preview(&mailbox, &store, &test_options(), 0).await.unwrap();

    assert_eq!(pending.pending, 3);
    assert!(pending.samples.is_empty());
    assert_eq!(mailbox.fetch_calls(), 0);
    assert!(!state.exists());
}

#[tokio::test]
async fn test_failed_document_write_pins_checkpoint() {
    let ws = workspace();
    let messages = vec![
        create_test_message(1, "Ann Lee <ann@corp.io>", "Quarterly numbers are in"),
        create_test_message(2, "Boss <boss@corp.io>", "work: Ship the release"),
        create_test_message(3, "Ann Lee <ann@corp.io>", "Offsite agenda"),
    ];
    let mailbox = FakeMailbox::new(messages.clone());
    // A directory where the work list should be makes every write fail
    std::fs::create_dir_all(ws.kb.join("work.md")).unwrap();

    let engine = create_engine(
        &mailbox,
        subject_classifier(),
        EmailFilter::permissive(),
        &ws.kb,
        &ws.state,
        test_options(),
    );
    let report = engine.run(SyncMode::Incremental).await.unwrap();

    assert_eq!(report.state, SyncState::Done);
    assert_eq!(report.routed, 2);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].marker, Marker::new(UID_VALIDITY, 2));
    assert_eq!(report.skipped[0].stage, Stage::Route);
    assert_eq!(report.checkpoint_after, Some(Marker::new(UID_VALIDITY, 1)));

    let checkpoint = CheckpointStore::new(&ws.state).load().await.unwrap();
    assert_eq!(checkpoint.last_marker, Some(Marker::new(UID_VALIDITY, 1)));
    assert!(checkpoint.is_resolved_ahead(Marker::new(UID_VALIDITY, 3)));

    std::fs::remove_dir(ws.kb.join("work.md")).unwrap();
    let report = engine.run(SyncMode::Incremental).await.unwrap();
    assert!(report.skipped.is_empty());
    assert!(read_doc(&ws.kb, "work.md").contains(&tag(&messages[1])));
    assert_eq!(report.checkpoint_after, Some(Marker::new(UID_VALIDITY, 3)));
}

#[tokio::test]
async fn test_listing_failure_aborts_before_classification() {
    let ws = workspace();
    let mailbox = FakeMailbox::new(work_messages());

    let engine = create_engine(
        &mailbox,
        subject_classifier(),
        EmailFilter::permissive(),
        &ws.kb,
        &ws.state,
        test_options(),
    );
    engine.run(SyncMode::Incremental).await.unwrap();
    let saved = std::fs::read_to_string(ws.state.join(CHECKPOINT_FILE)).unwrap();

    mailbox.push(create_test_message(4, "Boss <boss@corp.io>", "work: Fourth"));
    mailbox.fail_listing(1, FetchFailure::Network);
    let fetches_before = mailbox.fetch_calls();

    let mut classifier = MockClassifier::new();
    classifier.expect_classify().never();
    let engine = create_engine(
        &mailbox,
        classifier,
        EmailFilter::permissive(),
        &ws.kb,
        &ws.state,
        test_options(),
    );
    let failure = engine.run(SyncMode::Incremental).await.unwrap_err();

    assert!(matches!(failure.error, SyncError::NetworkError(_)));
    assert!(failure.report.is_failed());
    assert_eq!(failure.report.listed, 0);
    assert_eq!(mailbox.fetch_calls(), fetches_before);
    assert_eq!(
        std::fs::read_to_string(ws.state.join(CHECKPOINT_FILE)).unwrap(),
        saved
    );
    assert!(!ws.state.join(LOCK_FILE).exists());
}

#[tokio::test]
async fn test_rate_limited_classification_is_retried_in_run() {
    let ws = workspace();
    let messages = work_messages();
    let mailbox = FakeMailbox::new(messages.clone());

    let calls_for_m2 = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls_for_m2);
    let mut classifier = MockClassifier::new();
    classifier.expect_classify().returning(move |m| {
        if m.marker.uid == 2 && counter.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(SyncError::RateLimitExceeded { retry_after: 30 });
        }
        Ok(classify_by_subject(m))
    });

    let engine = create_engine(
        &mailbox,
        classifier,
        EmailFilter::permissive(),
        &ws.kb,
        &ws.state,
        test_options(),
    );
    let started = std::time::Instant::now();
    let report = engine.run(SyncMode::Incremental).await.unwrap();

    // retry_after is capped by the policy's max backoff
    assert!(started.elapsed() < std::time::Duration::from_secs(5));
    assert_eq!(calls_for_m2.load(Ordering::SeqCst), 2);
    assert_eq!(report.routed, 3);
    assert!(report.skipped.is_empty());
    assert!(read_doc(&ws.kb, "work.md").contains(&tag(&messages[1])));
    assert_eq!(report.checkpoint_after, Some(Marker::new(UID_VALIDITY, 3)));
}

#[tokio::test]
async fn test_stuck_message_does_not_starve_capped_runs() {
    let ws = workspace();
    let messages: Vec<Message> = (1..=5)
        .map(|uid| create_test_message(uid, "Boss <boss@corp.io>", &format!("work: Task {}", uid)))
        .collect();
    let mailbox = FakeMailbox::new(messages.clone());
    mailbox.fail_fetch(1, 10_000, FetchFailure::Network);

    let mut options = test_options();
    options.max_messages_per_run = 2;

    let engine = create_engine(
        &mailbox,
        subject_classifier(),
        EmailFilter::permissive(),
        &ws.kb,
        &ws.state,
        options,
    );

    let mut deferred = Vec::new();
    for _ in 0..4 {
        let report = engine.run(SyncMode::Incremental).await.unwrap();
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.checkpoint_after, None);
        deferred.push(report.deferred);
    }
    assert_eq!(deferred, vec![3, 2, 1, 0]);

    let work = read_doc(&ws.kb, "work.md");
    for message in &messages[1..] {
        assert_eq!(work.matches(&tag(message)).count(), 1);
    }

    let checkpoint = CheckpointStore::new(&ws.state).load().await.unwrap();
    assert_eq!(checkpoint.last_marker, None);
    assert_eq!(checkpoint.failed_runs(Marker::new(UID_VALIDITY, 1)), 4);
    assert_eq!(checkpoint.resolved_ahead.len(), 4);
}

#[tokio::test]
async fn test_message_failing_every_run_is_abandoned() {
    let ws = workspace();
    let messages = work_messages();
    let mailbox = FakeMailbox::new(messages.clone());
    mailbox.fail_fetch(2, 10_000, FetchFailure::Network);

    let mut options = test_options();
    options.max_failed_runs = 2;

    let engine = create_engine(
        &mailbox,
        subject_classifier(),
        EmailFilter::permissive(),
        &ws.kb,
        &ws.state,
        options,
    );

    let report = engine.run(SyncMode::Incremental).await.unwrap();
    assert_eq!(report.skipped.len(), 1);
    assert!(report.abandoned.is_empty());
    assert_eq!(report.checkpoint_after, Some(Marker::new(UID_VALIDITY, 1)));

    let report = engine.run(SyncMode::Incremental).await.unwrap();
    assert!(report.skipped.is_empty());
    assert_eq!(report.abandoned.len(), 1);
    assert_eq!(report.abandoned[0].marker, Marker::new(UID_VALIDITY, 2));
    assert_eq!(report.abandoned[0].stage, Stage::Fetch);
    assert_eq!(report.checkpoint_after, Some(Marker::new(UID_VALIDITY, 3)));
    assert!(report.to_string().contains("Abandoned:     1"));

    let checkpoint = CheckpointStore::new(&ws.state).load().await.unwrap();
    assert_eq!(checkpoint.processed_count, 3);
    assert!(checkpoint.failures.is_empty());
    assert!(checkpoint.resolved_ahead.is_empty());
}
