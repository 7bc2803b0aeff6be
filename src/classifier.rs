//! Message classification into the content taxonomy
//!
//! [`Classifier`] is the capability the sync engine consumes. Two providers
//! exist: [`crate::llm::LlmClassifier`] calls an external model, and
//! [`RuleClassifier`] applies deterministic regex rules offline. Both share
//! the lenient response parser in [`parse_classification`].

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::warn;

use crate::error::Result;
use crate::models::{
    extract_address, extract_domain, truncate_chars, Category, ClassificationResult, Message,
    Priority,
};

/// Summaries are kept to one short line
pub const MAX_SUMMARY_CHARS: usize = 100;

#[async_trait]
pub trait Classifier: Send + Sync {
    /// Classify one message. Called at most once per message per attempt.
    async fn classify(&self, message: &Message) -> Result<ClassificationResult>;

    /// Provider name for logs and reports
    fn name(&self) -> &str;
}

/// Sender local parts that indicate automated mail
static AUTOMATED_PREFIXES: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "noreply@",
        "no-reply@",
        "donotreply@",
        "do-not-reply@",
        "notifications@",
        "notify@",
        "alerts@",
        "marketing@",
        "promo@",
        "promotions@",
        "deals@",
        "newsletter@",
        "news@",
        "updates@",
        "automated@",
        "bot@",
        "system@",
        "mailer-daemon@",
    ]
});

/// Bulk mail delivery services
static COMMERCIAL_DOMAINS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "amazonses.com",
        "mailchimp.com",
        "sendgrid.net",
        "mailgun.org",
        "sparkpostmail.com",
        "mandrillapp.com",
        "postmarkapp.com",
    ]
});

static PATTERNS: Lazy<RulePatterns> = Lazy::new(|| RulePatterns {
    bulk: Regex::new(
        r"(?i)(newsletter|digest|unsubscribe|% off|sale|discount|promo|coupon|webinar|do not reply|this is an automated)",
    )
    .unwrap(),

    introduction: Regex::new(
        r"(?i)(introduc|nice to meet|great meeting|meet my|connect you|contact (info|details)|new phone number|my new address)",
    )
    .unwrap(),

    knowledge: Regex::new(
        r"(?i)(article|tutorial|guide|how to|how-to|docs|documentation|paper|worth reading|check out|til|resource|cheat ?sheet)",
    )
    .unwrap(),

    link: Regex::new(r"https?://\S+").unwrap(),

    task: Regex::new(
        r"(?i)(todo|to-do|task|action required|please|can you|could you|deadline|due|review|follow.?up|reminder|asap)",
    )
    .unwrap(),

    home: Regex::new(
        r"(?i)(home|house|apartment|rent|landlord|plumb|repair|garden|groceries|kids|school|utility|utilities|electricity)",
    )
    .unwrap(),

    personal: Regex::new(
        r"(?i)(gym|fitness|doctor|dentist|appointment|birthday|vacation|holiday|personal|course|marathon)",
    )
    .unwrap(),

    urgent: Regex::new(r"(?i)(urgent|asap|immediately|today|eod|critical)").unwrap(),

    important: Regex::new(r"(?i)(important|this week|soon|deadline|by friday|by monday)").unwrap(),

    deadline: Regex::new(r"\b(\d{4}-\d{2}-\d{2})\b").unwrap(),

    waiting: Regex::new(r"(?i)(waiting (on|for)|blocked on|pending your)").unwrap(),

    followup: Regex::new(r"(?i)follow.?up").unwrap(),

    action_line: Regex::new(r"(?im)^\s*(?:-\s*\[ \]|todo:|action:)\s*(.+)$").unwrap(),
});

struct RulePatterns {
    bulk: Regex,
    introduction: Regex,
    knowledge: Regex,
    link: Regex,
    task: Regex,
    home: Regex,
    personal: Regex,
    urgent: Regex,
    important: Regex,
    deadline: Regex,
    waiting: Regex,
    followup: Regex,
    action_line: Regex,
}

/// Deterministic offline classifier
#[derive(Debug, Default, Clone)]
pub struct RuleClassifier;

impl RuleClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Check if the sender looks automated
    pub fn is_automated_sender(&self, message: &Message) -> bool {
        let Some(address) = extract_address(&message.sender) else {
            return false;
        };

        if AUTOMATED_PREFIXES
            .iter()
            .any(|prefix| address.starts_with(prefix))
        {
            return true;
        }

        extract_domain(&address).is_some_and(|domain| {
            COMMERCIAL_DOMAINS
                .iter()
                .any(|commercial| domain.ends_with(commercial))
        })
    }

    /// Detect the category from sender, subject and body
    pub fn detect_category(&self, message: &Message) -> Category {
        let subject = message.subject.as_str();
        let text = format!("{}\n{}", message.subject, message.body);

        if self.is_automated_sender(message) || PATTERNS.bulk.is_match(&text) {
            return Category::Ignore;
        }

        if PATTERNS.introduction.is_match(&text) {
            return Category::PersonInfo;
        }

        if PATTERNS.task.is_match(subject) {
            if PATTERNS.home.is_match(&text) {
                return Category::HomeTask;
            }
            if PATTERNS.personal.is_match(&text) {
                return Category::PersonalTask;
            }
            return Category::WorkTask;
        }

        if PATTERNS.link.is_match(&message.body) && PATTERNS.knowledge.is_match(&text) {
            return Category::Knowledge;
        }

        Category::LogEntry
    }

    pub fn detect_priority(&self, message: &Message) -> Priority {
        let text = format!("{}\n{}", message.subject, message.body);
        if PATTERNS.urgent.is_match(&text) {
            Priority::P1
        } else if PATTERNS.important.is_match(&text) {
            Priority::P2
        } else {
            Priority::P3
        }
    }

    fn classify_sync(&self, message: &Message) -> ClassificationResult {
        let category = self.detect_category(message);
        let mut result = ClassificationResult::new(category, default_summary(message));
        if category == Category::Ignore {
            return result;
        }

        let text = format!("{}\n{}", message.subject, message.body);
        result.priority = Some(self.detect_priority(message));
        result.deadline = PATTERNS
            .deadline
            .captures(&text)
            .map(|c| c[1].to_string());
        result.action_items = PATTERNS
            .action_line
            .captures_iter(&message.body)
            .map(|c| c[1].trim().to_string())
            .filter(|item| !item.is_empty())
            .collect();

        if PATTERNS.waiting.is_match(&text) {
            result.tags.push("waiting".to_string());
        }
        if PATTERNS.followup.is_match(&text) {
            result.tags.push("followup".to_string());
        }

        let sender_name = message.sender_name();
        let named_sender = !sender_name.contains('@') && !sender_name.is_empty();

        match category {
            Category::PersonInfo if named_sender => {
                result.entity_ref = Some(sender_name);
            }
            Category::WorkTask | Category::PersonalTask | Category::HomeTask if named_sender => {
                result.people.push(sender_name);
            }
            Category::Knowledge => {
                result.title = Some(message.subject.trim().to_string());
            }
            _ => {}
        }

        result
    }
}

#[async_trait]
impl Classifier for RuleClassifier {
    async fn classify(&self, message: &Message) -> Result<ClassificationResult> {
        Ok(self.classify_sync(message))
    }

    fn name(&self) -> &str {
        "rules"
    }
}

fn default_summary(message: &Message) -> String {
    let subject = message.subject.trim();
    if subject.is_empty() {
        "(no subject)".to_string()
    } else {
        truncate_chars(subject, MAX_SUMMARY_CHARS).to_string()
    }
}

/// Remove a surrounding markdown code fence, if any
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (e.g. `json`) on the opening line
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

fn string_field(data: &Value, key: &str) -> Option<String> {
    data.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn string_list(data: &Value, key: &str) -> Vec<String> {
    data.get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Interpret a classifier response leniently
///
/// Text that is not JSON becomes a `log_entry` carrying the subject. A
/// category outside the taxonomy becomes `ignore`, and an unknown priority
/// becomes P3.
pub fn parse_classification(raw: &str, message: &Message) -> ClassificationResult {
    let data: Value = match serde_json::from_str(strip_code_fence(raw)) {
        Ok(value @ Value::Object(_)) => value,
        Ok(_) | Err(_) => {
            warn!(
                "Classifier response for {} is not a JSON object, logging it as log_entry",
                message.marker
            );
            let mut fallback = ClassificationResult::new(Category::LogEntry, default_summary(message));
            fallback.priority = Some(Priority::P3);
            return fallback;
        }
    };

    let category = match string_field(&data, "category") {
        None => Category::LogEntry,
        Some(name) => Category::parse(&name).unwrap_or_else(|| {
            warn!(
                "Classifier returned unknown category '{}' for {}, ignoring message",
                name, message.marker
            );
            Category::Ignore
        }),
    };

    let priority = string_field(&data, "priority")
        .and_then(|p| Priority::parse(&p))
        .unwrap_or(Priority::P3);

    let summary = string_field(&data, "summary")
        .map(|s| truncate_chars(&s, MAX_SUMMARY_CHARS * 2).to_string())
        .unwrap_or_else(|| default_summary(message));

    // Models sometimes echo JSON null as the string "null"
    let deadline = string_field(&data, "deadline").filter(|d| !d.eq_ignore_ascii_case("null"));

    ClassificationResult {
        category,
        entity_ref: string_field(&data, "entity").or_else(|| string_field(&data, "entity_ref")),
        summary,
        title: string_field(&data, "title"),
        priority: Some(priority),
        people: string_list(&data, "people"),
        deadline,
        action_items: string_list(&data, "action_items"),
        tags: string_list(&data, "tags"),
    }
}
