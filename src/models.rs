use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;

/// Position of a message in the mailbox: IMAP UID within a UIDVALIDITY epoch.
///
/// Ordering compares the epoch first, then the uid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Marker {
    pub uid_validity: u32,
    pub uid: u32,
}

impl Marker {
    pub fn new(uid_validity: u32, uid: u32) -> Self {
        Self { uid_validity, uid }
    }

    pub fn same_epoch(&self, other: &Marker) -> bool {
        self.uid_validity == other.uid_validity
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.uid_validity, self.uid)
    }
}

/// One entry of a delta listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSummary {
    pub marker: Marker,
    pub received_at: DateTime<Utc>,
}

/// A fetched email
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub marker: Marker,
    /// Stable unique token: the Message-ID header, or a content fingerprint
    pub id: String,
    /// Raw From header, e.g. `Jane Doe <jane@example.com>`
    pub sender: String,
    pub subject: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

impl Message {
    /// Derive the stable message token.
    ///
    /// Uses the Message-ID header when present, otherwise a SHA-256 of
    /// sender, subject and date.
    pub fn fingerprint(
        message_id: Option<&str>,
        sender: &str,
        subject: &str,
        date: &DateTime<Utc>,
    ) -> String {
        if let Some(id) = message_id.map(str::trim).filter(|id| !id.is_empty()) {
            return id.to_string();
        }

        let content = format!("{}|{}|{}", sender, subject, date.to_rfc3339());
        hex::encode(Sha256::digest(content.as_bytes()))
    }

    /// Bare sender address, lowercased
    pub fn sender_address(&self) -> Option<String> {
        extract_address(&self.sender)
    }

    /// Display name of the sender, falling back to the raw header
    pub fn sender_name(&self) -> String {
        let name = self
            .sender
            .split('<')
            .next()
            .unwrap_or("")
            .trim()
            .trim_matches('"')
            .trim();
        if name.is_empty() {
            self.sender.trim().to_string()
        } else {
            name.to_string()
        }
    }
}

/// Extract the address from a From header.
///
/// `"John Doe <john@example.com>"` -> `john@example.com`
pub fn extract_address(from: &str) -> Option<String> {
    let from = from.trim().to_lowercase();
    if let (Some(start), Some(end)) = (from.find('<'), from.rfind('>')) {
        if start < end {
            let address = from[start + 1..end].trim();
            if !address.is_empty() {
                return Some(address.to_string());
            }
        }
    }
    if from.contains('@') && !from.contains(char::is_whitespace) {
        return Some(from);
    }
    None
}

/// Domain part of an address
pub fn extract_domain(address: &str) -> Option<String> {
    address
        .rsplit_once('@')
        .map(|(_, domain)| domain.trim().to_lowercase())
        .filter(|domain| !domain.is_empty())
}

/// Truncate to at most `max` characters without splitting a code point
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Closed content taxonomy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    WorkTask,
    PersonalTask,
    HomeTask,
    PersonInfo,
    Knowledge,
    LogEntry,
    Ignore,
}

impl Category {
    pub const ALL: [Category; 7] = [
        Category::WorkTask,
        Category::PersonalTask,
        Category::HomeTask,
        Category::PersonInfo,
        Category::Knowledge,
        Category::LogEntry,
        Category::Ignore,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::WorkTask => "work_task",
            Category::PersonalTask => "personal_task",
            Category::HomeTask => "home_task",
            Category::PersonInfo => "person_info",
            Category::Knowledge => "knowledge",
            Category::LogEntry => "log_entry",
            Category::Ignore => "ignore",
        }
    }

    /// Parse a category name, returning None for anything outside the taxonomy
    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().to_lowercase().replace(['-', ' '], "_");
        Self::ALL
            .iter()
            .copied()
            .find(|category| category.as_str() == normalized)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    P1,
    P2,
    P3,
}

impl Priority {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_uppercase().as_str() {
            "P1" => Some(Priority::P1),
            "P2" => Some(Priority::P2),
            "P3" => Some(Priority::P3),
            _ => None,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::P1 => "P1",
            Priority::P2 => "P2",
            Priority::P3 => "P3",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassificationResult {
    pub category: Category,
    /// Person or organisation the message is about
    pub entity_ref: Option<String>,
    pub summary: String,
    /// Short topic title, used as the knowledge document key
    pub title: Option<String>,
    pub priority: Option<Priority>,
    #[serde(default)]
    pub people: Vec<String>,
    pub deadline: Option<String>,
    #[serde(default)]
    pub action_items: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl ClassificationResult {
    /// Minimal result with only a category and summary
    pub fn new(category: Category, summary: impl Into<String>) -> Self {
        Self {
            category,
            entity_ref: None,
            summary: summary.into(),
            title: None,
            priority: None,
            people: Vec::new(),
            deadline: None,
            action_items: Vec::new(),
            tags: Vec::new(),
        }
    }

    /// People the router should write about: entity_ref first, then people
    pub fn entities(&self) -> Vec<String> {
        let mut entities: Vec<String> = Vec::new();
        for name in self.entity_ref.iter().chain(self.people.iter()) {
            let trimmed = name.trim();
            if trimmed.is_empty() {
                continue;
            }
            if !entities.iter().any(|e| e.eq_ignore_ascii_case(trimmed)) {
                entities.push(trimmed.to_string());
            }
        }
        entities
    }
}

/// How a routed entry is written into its document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOperation {
    /// Insert a line entry under a heading, creating the heading if missing
    AppendEntry { heading: String },
    /// Ensure the per-entity document and section exist, then insert the entry
    UpsertEntitySection { entity: String, heading: String },
    /// Append a self-contained block at the end of the document
    AppendBlock,
}

/// A single idempotent write derived from one message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTarget {
    /// Path relative to the knowledge base root
    pub document: PathBuf,
    pub operation: WriteOperation,
    /// Title used when the document has to be created
    pub title: String,
    /// Rendered entry, including the tag marker
    pub content: String,
    pub tag: EntryTag,
}

/// Marker embedded in every written entry so re-application can be detected
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryTag(String);

impl EntryTag {
    pub fn for_message(message_id: &str) -> Self {
        let digest = Sha256::digest(message_id.as_bytes());
        Self(hex::encode(&digest[..8]))
    }

    pub fn token(&self) -> &str {
        &self.0
    }

    /// The exact text written into documents
    pub fn marker(&self) -> String {
        format!("<!-- email:{} -->", self.0)
    }

    pub fn is_present_in(&self, text: &str) -> bool {
        text.contains(&self.marker())
    }
}
