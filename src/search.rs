//! Natural-language search over the knowledge base
//!
//! Every tagged entry the sync engine wrote is one result unit: a task or
//! log line together with its indented sub-items, or a knowledge block from
//! its heading down to the closing `---`.

use chrono::{Duration as ChronoDuration, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::document::heading_level;
use crate::error::{Result, SyncError};

pub const DEFAULT_LIMIT: usize = 20;

/// Longest "last N days" range honoured; larger values are clamped
const MAX_QUERY_DAYS: i64 = 36_500;
const CONTEXT_CHARS: usize = 40;
const MAX_CONTEXTS: usize = 3;

static SENDER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bfrom\s+(\w+(?:\s+\w+)?)").unwrap());
static WEEK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(last|this|past)\s+week\b").unwrap());
static MONTH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(last|this|past)\s+month\b").unwrap());
static LAST_DAYS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\blast\s+(\d+)\s+days?\b").unwrap());
static WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\w+\b").unwrap());
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*<!-- email:[0-9a-f]{16} -->").unwrap());
static DATE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d{4}-\d{2}-\d{2})\b").unwrap());
static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

static STOPWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "find", "search", "show", "get", "any", "all", "me", "my", "emails", "email", "messages",
        "message", "mail", "about", "regarding", "concerning", "mentioning", "containing", "with",
        "the", "a", "an", "and", "or", "for", "in", "on", "from", "to", "last", "this", "past",
        "week", "month", "day", "days", "yesterday", "today", "what", "did", "say", "said", "says",
        "anything", "something", "everything", "recent", "new", "old",
    ]
    .into_iter()
    .collect()
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchQuery {
    pub keywords: Vec<String>,
    pub sender: Option<String>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    #[serde(skip)]
    pub limit: usize,
}

/// Parse a query such as "tasks from jane about the budget last week"
///
/// Relative dates resolve against `today`.
pub fn parse_natural_query(query: &str, today: NaiveDate) -> SearchQuery {
    let lower = query.to_lowercase();

    let sender = SENDER_RE
        .captures(&lower)
        .map(|caps| caps[1].to_string());

    let mut date_from = None;
    let mut date_to = None;
    if WEEK_RE.is_match(&lower) {
        date_from = Some(today - ChronoDuration::days(7));
    } else if MONTH_RE.is_match(&lower) {
        date_from = Some(today - ChronoDuration::days(30));
    } else if lower.contains("yesterday") {
        date_from = Some(today - ChronoDuration::days(1));
        date_to = Some(today);
    } else if lower.contains("today") {
        date_from = Some(today);
    }
    if let Some(caps) = LAST_DAYS_RE.captures(&lower) {
        let days = caps[1].parse::<i64>().unwrap_or(i64::MAX).min(MAX_QUERY_DAYS);
        date_from = today
            .checked_sub_signed(ChronoDuration::days(days))
            .or(Some(NaiveDate::MIN));
    }

    let sender_words: Vec<&str> = sender
        .as_deref()
        .map(|s| s.split_whitespace().collect())
        .unwrap_or_default();
    let keywords = WORD_RE
        .find_iter(&lower)
        .map(|m| m.as_str())
        .filter(|w| w.chars().count() > 2 && !STOPWORDS.contains(w))
        .filter(|w| !sender_words.contains(w))
        .map(str::to_string)
        .collect();

    SearchQuery {
        keywords,
        sender,
        date_from,
        date_to,
        limit: DEFAULT_LIMIT,
    }
}

/// One tagged entry found in a document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub document: String,
    pub heading: String,
    pub date: Option<NaiveDate>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub document: String,
    pub heading: String,
    pub date: Option<NaiveDate>,
    pub text: String,
    pub match_context: String,
    pub relevance_score: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchOutput<'a> {
    pub query: &'a SearchQuery,
    pub result_count: usize,
    pub results: &'a [SearchHit],
}

fn first_date(text: &str) -> Option<NaiveDate> {
    DATE_RE
        .captures_iter(text)
        .find_map(|caps| NaiveDate::parse_from_str(&caps[1], "%Y-%m-%d").ok())
}

fn heading_text(line: &str) -> String {
    line.trim_start_matches('#').trim().to_string()
}

/// Split a document into its tagged entries
///
/// `document` is the path relative to the knowledge root, used for the
/// result and as the date fallback for daily logs.
pub fn extract_entries(document: &str, content: &str) -> Vec<Entry> {
    let lines: Vec<&str> = content.lines().collect();
    let fallback_date = Path::new(document)
        .file_stem()
        .and_then(|s| s.to_str())
        .and_then(|stem| NaiveDate::parse_from_str(stem, "%Y-%m-%d").ok());

    let mut entries = Vec::new();
    let mut heading = String::new();
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        if heading_level(line).is_some() {
            // A heading followed directly by a tagged non-list line opens a knowledge block
            let tagged_next = lines
                .get(i + 1)
                .is_some_and(|next| TAG_RE.is_match(next) && !next.trim_start().starts_with('-'));
            if !tagged_next {
                heading = heading_text(line);
                i += 1;
                continue;
            }

            let mut end = i + 1;
            while end < lines.len() && lines[end].trim() != "---" && heading_level(lines[end]).is_none() {
                end += 1;
            }
            let body = lines[i + 1..end].join("\n");
            entries.push(Entry {
                document: document.to_string(),
                heading: heading_text(line),
                date: first_date(&body).or(fallback_date),
                text: TAG_RE.replace_all(&body, "").trim().to_string(),
            });
            i = if end < lines.len() && lines[end].trim() == "---" { end + 1 } else { end };
            continue;
        }

        if TAG_RE.is_match(line) {
            let mut end = i + 1;
            while end < lines.len() && lines[end].starts_with(char::is_whitespace) && !lines[end].trim().is_empty() {
                end += 1;
            }
            let body = lines[i..end].join("\n");
            entries.push(Entry {
                document: document.to_string(),
                heading: heading.clone(),
                date: first_date(&body).or(fallback_date),
                text: TAG_RE.replace_all(&body, "").trim().to_string(),
            });
            i = end;
            continue;
        }

        i += 1;
    }

    entries
}

fn floor_boundary(s: &str, mut index: usize) -> usize {
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_boundary(s: &str, mut index: usize) -> usize {
    while index < s.len() && !s.is_char_boundary(index) {
        index += 1;
    }
    index
}

/// Text around the first occurrence of `keyword`, whitespace collapsed
fn snippet(text: &str, keyword: &str) -> Option<String> {
    let lower = text.to_lowercase();
    let idx = lower.find(keyword)?;
    // Lowercasing can change byte lengths; fall back to the lowered text then
    let source = if lower.len() == text.len() { text } else { lower.as_str() };

    let start = floor_boundary(source, idx.saturating_sub(CONTEXT_CHARS));
    let end = ceil_boundary(source, (idx + keyword.len() + CONTEXT_CHARS).min(source.len()));
    let mut out = WHITESPACE_RE
        .replace_all(source[start..end].trim(), " ")
        .into_owned();
    if start > 0 {
        out.insert_str(0, "...");
    }
    if end < source.len() {
        out.push_str("...");
    }
    Some(out)
}

/// Score one entry; `None` when it is excluded by sender, date or keywords
pub fn score_entry(entry: &Entry, query: &SearchQuery) -> Option<SearchHit> {
    let text_lower = entry.text.to_lowercase();

    if let Some(sender) = &query.sender {
        if !text_lower.contains(sender.as_str()) {
            return None;
        }
    }
    if query.date_from.is_some() || query.date_to.is_some() {
        let date = entry.date?;
        if query.date_from.is_some_and(|from| date < from) || query.date_to.is_some_and(|to| date > to) {
            return None;
        }
    }

    let location = format!("{} {}", entry.document, entry.heading).to_lowercase();
    let mut score = 0.0;
    let mut contexts = Vec::new();
    for keyword in &query.keywords {
        if location.contains(keyword.as_str()) {
            score += 2.0;
            contexts.push(format!("Heading: '{}'", keyword));
        }
        if text_lower.contains(keyword.as_str()) {
            score += 1.0;
            if let Some(s) = snippet(&entry.text, keyword) {
                contexts.push(s);
            }
        }
    }
    if query.keywords.is_empty() {
        score = 1.0;
    }
    if score <= 0.0 {
        return None;
    }

    contexts.truncate(MAX_CONTEXTS);
    Some(SearchHit {
        document: entry.document.clone(),
        heading: entry.heading.clone(),
        date: entry.date,
        text: entry.text.clone(),
        match_context: contexts.join(" | "),
        relevance_score: score,
    })
}

/// Search every markdown document under `root`
pub fn search(root: &Path, query: &SearchQuery) -> Result<Vec<SearchHit>> {
    if !root.exists() {
        return Err(SyncError::ConfigError(format!(
            "Knowledge directory {} does not exist",
            root.display()
        )));
    }

    let mut hits = Vec::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));

    for dir_entry in walker {
        let dir_entry = match dir_entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable path: {}", e);
                continue;
            }
        };
        let path = dir_entry.path();
        if !dir_entry.file_type().is_file() || path.extension().and_then(|e| e.to_str()) != Some("md") {
            continue;
        }

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                warn!("Skipping {}: {}", path.display(), e);
                continue;
            }
        };
        let document = path
            .strip_prefix(root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");

        let entries = extract_entries(&document, &content);
        debug!("{}: {} entries", document, entries.len());
        hits.extend(entries.iter().filter_map(|entry| score_entry(entry, query)));
    }

    hits.sort_by(|a, b| {
        b.relevance_score
            .total_cmp(&a.relevance_score)
            .then_with(|| b.date.cmp(&a.date))
    });
    hits.truncate(query.limit);
    Ok(hits)
}

/// Pretty JSON for the `search` command
pub fn format_results_json(query: &SearchQuery, results: &[SearchHit]) -> Result<String> {
    let output = SearchOutput {
        query,
        result_count: results.len(),
        results,
    };
    Ok(serde_json::to_string_pretty(&output)?)
}
