//! Routing of classified messages into knowledge base documents
//!
//! [`Router::route`] turns a classification into a list of targets without
//! touching the filesystem. [`Router::apply`] performs one idempotent write:
//! every entry carries the message's [`EntryTag`], and a document that
//! already contains the tag is left alone.

use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::document::{append_block, insert_under_heading, new_document, slugify};
use crate::error::{Result, SyncError};
use crate::models::{
    truncate_chars, Category, ClassificationResult, EntryTag, Message, Priority, RoutingTarget,
    WriteOperation,
};

pub const TODO_HEADING: &str = "## TODO";
pub const INTERACTIONS_HEADING: &str = "## Interactions";
pub const EMAIL_ACTIVITY_HEADING: &str = "## Email Activity";

/// Longest body excerpt copied into a knowledge block
const KNOWLEDGE_EXCERPT_CHARS: usize = 1000;
/// Topic slugs are derived from at most this many characters
const TOPIC_SLUG_CHARS: usize = 50;
/// Task lines name at most this many people
const MAX_TASK_PEOPLE: usize = 2;
/// Re-merges after a concurrent external edit before giving up
const MAX_MERGE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Written,
    AlreadyPresent,
}

pub struct Router {
    root: PathBuf,
}

impl Router {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Destinations for one classified message; empty for `ignore`
    pub fn route(&self, result: &ClassificationResult, message: &Message) -> Vec<RoutingTarget> {
        let tag = EntryTag::for_message(&message.id);
        let date = message.received_at.format("%Y-%m-%d").to_string();
        let mut targets = Vec::new();

        match result.category {
            Category::Ignore => return targets,
            Category::WorkTask => targets.push(task_target("work.md", "Work", result, &date, &tag)),
            Category::PersonalTask => {
                targets.push(task_target("personal.md", "Personal", result, &date, &tag))
            }
            Category::HomeTask => targets.push(task_target("home.md", "Home", result, &date, &tag)),
            Category::PersonInfo => {
                let mut people = result.entities();
                if people.is_empty() {
                    people.push(message.sender_name());
                }
                for person in people {
                    let entry = format!("- {}: {} (via email) {}", date, result.summary, tag.marker());
                    targets.push(person_target(&person, entry, &tag));
                }
            }
            Category::Knowledge => targets.push(knowledge_target(result, message, &date, &tag)),
            Category::LogEntry => {
                let mut entry = format!(
                    "- **Email from {}**: {} {}",
                    message.sender_name(),
                    result.summary,
                    tag.marker()
                );
                for item in &result.action_items {
                    entry.push_str(&format!("\n  - [ ] {}", item));
                }
                targets.push(RoutingTarget {
                    document: PathBuf::from("logs").join(format!("{}.md", date)),
                    operation: WriteOperation::AppendEntry {
                        heading: EMAIL_ACTIVITY_HEADING.to_string(),
                    },
                    title: date.clone(),
                    content: entry,
                    tag: tag.clone(),
                });
            }
        }

        if result.category != Category::PersonInfo {
            for person in result.entities() {
                let entry = format!(
                    "- {}: Email regarding: {} {}",
                    date,
                    result.summary,
                    tag.marker()
                );
                targets.push(person_target(&person, entry, &tag));
            }
        }

        // Two names can collapse onto one slug
        let mut seen = std::collections::HashSet::new();
        targets.retain(|t| seen.insert(t.document.clone()));
        targets
    }

    /// Write one target unless its tag is already in the document
    ///
    /// The merge is computed against the document as read, written to a temp
    /// file and renamed over the target. If the document changed in between,
    /// the merge is recomputed from the fresh content.
    pub async fn apply(&self, target: &RoutingTarget) -> Result<ApplyOutcome> {
        let path = self.root.join(&target.document);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        for attempt in 1..=MAX_MERGE_ATTEMPTS {
            let original = read_optional(&path).await?;
            if let Some(text) = &original {
                if target.tag.is_present_in(text) {
                    debug!("{} already contains {}", target.document.display(), target.tag.token());
                    return Ok(ApplyOutcome::AlreadyPresent);
                }
            }

            let base = original
                .clone()
                .unwrap_or_else(|| new_document(&target.title));
            let merged = merge(&base, target);

            let temp = temp_path(&path);
            write_synced(&temp, &merged).await?;

            if read_optional(&path).await? != original {
                warn!(
                    "{} changed while writing (attempt {}/{}), re-merging",
                    target.document.display(),
                    attempt,
                    MAX_MERGE_ATTEMPTS
                );
                let _ = tokio::fs::remove_file(&temp).await;
                continue;
            }

            if let Err(e) = tokio::fs::rename(&temp, &path).await {
                let _ = tokio::fs::remove_file(&temp).await;
                return Err(e.into());
            }
            debug!("Wrote entry {} to {}", target.tag.token(), target.document.display());
            return Ok(ApplyOutcome::Written);
        }

        Err(SyncError::IoError(std::io::Error::new(
            std::io::ErrorKind::WouldBlock,
            format!(
                "{} kept changing during write",
                target.document.display()
            ),
        )))
    }
}

fn merge(base: &str, target: &RoutingTarget) -> String {
    match &target.operation {
        WriteOperation::AppendEntry { heading } => {
            insert_under_heading(base, heading, &target.content)
        }
        WriteOperation::UpsertEntitySection { heading, .. } => {
            insert_under_heading(base, heading, &target.content)
        }
        WriteOperation::AppendBlock => append_block(base, &target.content),
    }
}

fn task_target(
    file: &str,
    title: &str,
    result: &ClassificationResult,
    date: &str,
    tag: &EntryTag,
) -> RoutingTarget {
    let priority = result.priority.unwrap_or(Priority::P3);
    let mut parts = vec![format!("- [{}]", priority), result.summary.clone()];

    if let Some(deadline) = &result.deadline {
        parts.push(format!("@deadline:{}", deadline));
    }
    for person in result.people.iter().take(MAX_TASK_PEOPLE) {
        parts.push(format!("@person:{}", person));
    }
    if result.tags.iter().any(|t| t.eq_ignore_ascii_case("waiting")) {
        parts.push("@waiting".to_string());
    }
    if result.tags.iter().any(|t| t.eq_ignore_ascii_case("followup")) {
        parts.push("@followup".to_string());
    }
    parts.push(format!("({})", date));
    parts.push(tag.marker());

    RoutingTarget {
        document: PathBuf::from(file),
        operation: WriteOperation::AppendEntry {
            heading: TODO_HEADING.to_string(),
        },
        title: title.to_string(),
        content: parts.join(" "),
        tag: tag.clone(),
    }
}

fn person_target(person: &str, entry: String, tag: &EntryTag) -> RoutingTarget {
    let mut slug = slugify(person);
    if slug.is_empty() {
        slug = "unknown".to_string();
    }
    RoutingTarget {
        document: PathBuf::from("people").join(format!("{}.md", slug)),
        operation: WriteOperation::UpsertEntitySection {
            entity: person.trim().to_string(),
            heading: INTERACTIONS_HEADING.to_string(),
        },
        title: person.trim().to_string(),
        content: entry,
        tag: tag.clone(),
    }
}

fn knowledge_target(
    result: &ClassificationResult,
    message: &Message,
    date: &str,
    tag: &EntryTag,
) -> RoutingTarget {
    let title = result
        .title
        .clone()
        .unwrap_or_else(|| result.summary.clone());
    let mut slug = slugify(truncate_chars(&title, TOPIC_SLUG_CHARS));
    if slug.is_empty() {
        slug = "misc".to_string();
    }

    let excerpt = truncate_chars(message.body.trim(), KNOWLEDGE_EXCERPT_CHARS);
    let block = format!(
        "## {}\n*Source: Email from {} on {}* {}\n\n{}\n\n---\n",
        result.summary,
        message.sender,
        date,
        tag.marker(),
        excerpt
    );

    RoutingTarget {
        document: PathBuf::from("knowledge")
            .join("references")
            .join(format!("{}.md", slug)),
        operation: WriteOperation::AppendBlock,
        title,
        content: block,
        tag: tag.clone(),
    }
}

async fn read_optional(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4().simple()))
}

async fn write_synced(path: &Path, contents: &str) -> Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(contents.as_bytes()).await?;
    file.sync_all().await?;
    Ok(())
}
