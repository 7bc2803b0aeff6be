//! Common test utilities and fixtures

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use email_kb_sync::classifier::Classifier;
use email_kb_sync::config::{FilterConfig, FilterMode};
use email_kb_sync::error::{Result, SyncError};
use email_kb_sync::filters::EmailFilter;
use email_kb_sync::mailbox::{Delta, DeltaQuery, MailboxConnector, MailboxSession};
use email_kb_sync::models::{Category, ClassificationResult, Marker, Message, MessageSummary};
use email_kb_sync::retry::RetryPolicy;
use email_kb_sync::router::Router;
use email_kb_sync::sync::{SyncEngine, SyncOptions};
use mockall::mock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const UID_VALIDITY: u32 = 1;

/// Create a test message received a day ago; later uids are newer
pub fn create_test_message(uid: u32, sender: &str, subject: &str) -> Message {
    Message {
        marker: Marker::new(UID_VALIDITY, uid),
        id: format!("<m{}@test.example>", uid),
        sender: sender.to_string(),
        subject: subject.to_string(),
        body: format!("Body of message {}.\nSecond line.", uid),
        received_at: Utc::now() - ChronoDuration::days(1) + ChronoDuration::seconds(i64::from(uid)),
    }
}

/// Deterministic classification keyed on the subject prefix
///
/// `work: x` -> work_task, `person: Name` -> person_info about Name,
/// `ignore: x` -> ignore, anything else -> log_entry.
pub fn classify_by_subject(message: &Message) -> ClassificationResult {
    let subject = message.subject.as_str();
    if let Some(rest) = subject.strip_prefix("work: ") {
        ClassificationResult::new(Category::WorkTask, rest)
    } else if let Some(name) = subject.strip_prefix("person: ") {
        let mut result = ClassificationResult::new(Category::PersonInfo, format!("Met {}", name));
        result.entity_ref = Some(name.to_string());
        result
    } else if let Some(rest) = subject.strip_prefix("ignore: ") {
        ClassificationResult::new(Category::Ignore, rest)
    } else {
        ClassificationResult::new(Category::LogEntry, subject)
    }
}

/// Error injected into a fetch
#[derive(Debug, Clone, Copy)]
pub enum FetchFailure {
    Network,
    Auth,
}

impl FetchFailure {
    fn to_error(self, uid: u32) -> SyncError {
        match self {
            FetchFailure::Network => SyncError::NetworkError(format!("connection reset fetching {}", uid)),
            FetchFailure::Auth => SyncError::AuthError("session expired".to_string()),
        }
    }
}

#[derive(Debug, Default)]
pub struct MailboxState {
    pub uid_validity: u32,
    pub messages: Vec<Message>,
    /// uid -> (remaining failures, kind)
    pub fetch_failures: HashMap<u32, (usize, FetchFailure)>,
    /// (remaining failures, kind) for delta listings
    pub list_failures: Option<(usize, FetchFailure)>,
    pub fetch_calls: usize,
    pub queries: Vec<DeltaQuery>,
    pub logouts: usize,
}

/// In-memory mailbox shared between the connector and its sessions
#[derive(Clone)]
pub struct FakeMailbox {
    pub state: Arc<Mutex<MailboxState>>,
}

impl FakeMailbox {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MailboxState {
                uid_validity: UID_VALIDITY,
                messages,
                ..MailboxState::default()
            })),
        }
    }

    pub fn fail_fetch(&self, uid: u32, times: usize, kind: FetchFailure) {
        self.state.lock().unwrap().fetch_failures.insert(uid, (times, kind));
    }

    pub fn fail_listing(&self, times: usize, kind: FetchFailure) {
        self.state.lock().unwrap().list_failures = Some((times, kind));
    }

    pub fn push(&self, message: Message) {
        self.state.lock().unwrap().messages.push(message);
    }

    /// Simulate the server renumbering the folder
    pub fn renumber(&self, uid_validity: u32) {
        let mut state = self.state.lock().unwrap();
        state.uid_validity = uid_validity;
        for message in &mut state.messages {
            message.marker = Marker::new(uid_validity, message.marker.uid + 100);
        }
    }

    pub fn fetch_calls(&self) -> usize {
        self.state.lock().unwrap().fetch_calls
    }

    pub fn queries(&self) -> Vec<DeltaQuery> {
        self.state.lock().unwrap().queries.clone()
    }
}

#[async_trait]
impl MailboxConnector for FakeMailbox {
    async fn connect(&self) -> Result<Box<dyn MailboxSession>> {
        Ok(Box::new(self.clone()))
    }
}

#[async_trait]
impl MailboxSession for FakeMailbox {
    async fn list_since(&self, query: &DeltaQuery) -> Result<Delta> {
        let mut state = self.state.lock().unwrap();
        state.queries.push(*query);
        if let Some((remaining, kind)) = state.list_failures.as_mut() {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(kind.to_error(0));
            }
        }
        let uid_validity = state.uid_validity;

        let mut messages: Vec<MessageSummary> = state
            .messages
            .iter()
            .filter(|m| match query {
                DeltaQuery::After(Some(marker)) => {
                    marker.uid_validity == uid_validity && m.marker.uid > marker.uid
                }
                DeltaQuery::After(None) => true,
                DeltaQuery::Since(since) => m.received_at >= *since,
            })
            .map(|m| MessageSummary {
                marker: m.marker,
                received_at: m.received_at,
            })
            .collect();
        messages.sort_by_key(|m| m.marker);

        Ok(Delta {
            uid_validity,
            messages,
        })
    }

    async fn fetch(&self, marker: Marker) -> Result<Message> {
        let mut state = self.state.lock().unwrap();
        state.fetch_calls += 1;

        if let Some((remaining, kind)) = state.fetch_failures.get_mut(&marker.uid) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(kind.to_error(marker.uid));
            }
        }

        state
            .messages
            .iter()
            .find(|m| m.marker == marker)
            .cloned()
            .ok_or_else(|| SyncError::MessageNotFound(marker.to_string()))
    }

    async fn logout(&self) -> Result<()> {
        self.state.lock().unwrap().logouts += 1;
        Ok(())
    }
}

// Mock implementation of Classifier for testing
mock! {
    pub Classifier {}

    #[async_trait::async_trait]
    impl Classifier for Classifier {
        async fn classify(&self, message: &Message) -> Result<ClassificationResult>;
        fn name(&self) -> &str;
    }
}

/// Classifier mock that answers every call with [`classify_by_subject`]
pub fn subject_classifier() -> MockClassifier {
    let mut classifier = MockClassifier::new();
    classifier
        .expect_classify()
        .returning(|m| Ok(classify_by_subject(m)));
    classifier
}

/// Fast retries so tests do not sleep for real backoff intervals
pub fn test_options() -> SyncOptions {
    SyncOptions {
        days_lookback: 7,
        max_messages_per_run: 200,
        concurrency: 1,
        checkpoint_interval: 25,
        max_failed_runs: 0,
        retry: RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5)),
    }
}

pub fn allow_domains(domains: &[&str]) -> EmailFilter {
    EmailFilter::from_config(&FilterConfig {
        mode: FilterMode::Allow,
        domains: domains.iter().map(|d| d.to_string()).collect(),
        ..FilterConfig::default()
    })
    .unwrap()
}

pub fn create_engine(
    mailbox: &FakeMailbox,
    classifier: MockClassifier,
    filter: EmailFilter,
    kb_dir: &Path,
    state_dir: &Path,
    options: SyncOptions,
) -> SyncEngine {
    SyncEngine::new(
        Arc::new(mailbox.clone()),
        Arc::new(classifier),
        Router::new(kb_dir),
        filter,
        state_dir,
        options,
    )
}

pub fn read_doc(kb_dir: &Path, relative: &str) -> String {
    std::fs::read_to_string(kb_dir.join(relative)).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_test_message() {
        let msg = create_test_message(3, "Boss <boss@corp.io>", "work: ship it");
        assert_eq!(msg.marker, Marker::new(UID_VALIDITY, 3));
        assert_eq!(msg.id, "<m3@test.example>");
        assert!(msg.received_at < Utc::now());
    }

    #[test]
    fn test_classify_by_subject() {
        let msg = create_test_message(1, "a@b.c", "person: Jane Roe");
        let result = classify_by_subject(&msg);
        assert_eq!(result.category, Category::PersonInfo);
        assert_eq!(result.entity_ref.as_deref(), Some("Jane Roe"));

        let msg = create_test_message(2, "a@b.c", "hello");
        assert_eq!(classify_by_subject(&msg).category, Category::LogEntry);
    }
}
