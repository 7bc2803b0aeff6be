//! Classification through the Anthropic Messages API

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::classifier::{parse_classification, Classifier};
use crate::config::ClassifierConfig;
use crate::error::{parse_retry_after, Result, SyncError};
use crate::models::{truncate_chars, ClassificationResult, Message};

const ANTHROPIC_VERSION: &str = "2023-06-01";

static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{(from|subject|date|body)\}").unwrap());

const CLASSIFICATION_PROMPT: &str = r#"Analyze this email and extract structured information.

Email:
From: {from}
Subject: {subject}
Date: {date}

Body:
{body}

---

Classify and extract information as JSON with these fields:

- category: One of:
  - "work_task" - Work-related action items, project tasks, deadlines
  - "personal_task" - Personal goals, fitness, self-improvement tasks
  - "home_task" - Household, family, errands
  - "person_info" - Contact details, relationship context, meeting someone new
  - "knowledge" - Tools, concepts, learning materials worth saving
  - "log_entry" - FYI, general context, updates (no action needed)
  - "ignore" - Spam, newsletters, automated notifications, marketing

- priority: "P1" (urgent/today), "P2" (important/this week), "P3" (normal)

- entity: For person_info, the full name of the person the email is about, null otherwise

- title: For knowledge, a short topic title (under 60 chars), null otherwise

- people: Array of names mentioned (extract first name + last name if available)

- deadline: ISO date string if deadline mentioned, null otherwise

- summary: One concise sentence summarizing the email (under 100 chars)

- action_items: Array of specific actions needed (empty if none)

- tags: Array of relevant tags like "meeting", "followup", "waiting", "review"

Respond with ONLY valid JSON, no other text."#;

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<RequestMessage>,
}

#[derive(Debug, Serialize)]
struct RequestMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

pub struct LlmClassifier {
    http: reqwest::Client,
    api_url: String,
    api_key: SecretString,
    model: String,
    max_tokens: u32,
    max_body_chars: usize,
}

impl LlmClassifier {
    pub fn new(config: &ClassifierConfig, api_key: SecretString) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.timeout_secs.min(30)))
            .build()
            .map_err(|e| SyncError::ConfigError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            api_url: config.api_url.clone(),
            api_key,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            max_body_chars: config.max_body_chars,
        })
    }

    /// Fill the template in one pass, so placeholders inside the email stay literal
    fn prompt(&self, message: &Message) -> String {
        let date = message.received_at.to_rfc3339();
        let body = truncate_chars(&message.body, self.max_body_chars);
        PLACEHOLDER_RE
            .replace_all(CLASSIFICATION_PROMPT, |caps: &regex::Captures| {
                match &caps[1] {
                    "from" => message.sender.as_str(),
                    "subject" => message.subject.as_str(),
                    "date" => date.as_str(),
                    _ => body,
                }
                .to_string()
            })
            .into_owned()
    }

    async fn complete(&self, prompt: String) -> Result<String> {
        let request = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            messages: vec![RequestMessage {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .http
            .post(&self.api_url)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, retry_after.as_deref(), &body));
        }

        let parsed: MessagesResponse = response.json().await?;
        parsed
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .find_map(|block| block.text)
            .ok_or_else(|| SyncError::ServiceError("response contained no text block".to_string()))
    }
}

/// Map a non-success HTTP status to an error
fn status_error(status: StatusCode, retry_after: Option<&str>, body: &str) -> SyncError {
    let body = truncate_chars(body.trim(), 300);
    match status.as_u16() {
        429 => SyncError::RateLimitExceeded {
            retry_after: parse_retry_after(retry_after),
        },
        401 | 403 => SyncError::AuthError(format!("classification service rejected API key: {}", body)),
        404 => SyncError::ConfigError(format!(
            "classification endpoint or model not found (HTTP 404): {}",
            body
        )),
        400 | 413 | 422 => {
            SyncError::InvalidMessageFormat(format!("classification request rejected (HTTP {}): {}", status, body))
        }
        _ => SyncError::ServiceError(format!("HTTP {}: {}", status, body)),
    }
}

#[async_trait]
impl Classifier for LlmClassifier {
    async fn classify(&self, message: &Message) -> Result<ClassificationResult> {
        debug!("Classifying {} with {}", message.marker, self.model);
        let text = self.complete(self.prompt(message)).await?;
        Ok(parse_classification(&text, message))
    }

    fn name(&self) -> &str {
        &self.model
    }
}
