//! Sender filtering applied before classification
//!
//! Messages rejected here never reach the classifier. In block mode a match
//! drops the message; in allow mode only matching messages pass.

use regex::{Regex, RegexBuilder};
use std::collections::HashSet;
use std::fmt;

use crate::config::{FilterConfig, FilterMode};
use crate::error::{Result, SyncError};
use crate::models::{extract_address, extract_domain, Message};

/// Which rule matched a sender
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterMatch {
    Domain(String),
    Address(String),
    Pattern(String),
}

impl fmt::Display for FilterMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterMatch::Domain(domain) => write!(f, "domain:{}", domain),
            FilterMatch::Address(address) => write!(f, "address:{}", address),
            FilterMatch::Pattern(pattern) => write!(f, "pattern:{}", pattern),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmailFilter {
    mode: FilterMode,
    domains: HashSet<String>,
    addresses: HashSet<String>,
    patterns: Vec<Regex>,
}

impl EmailFilter {
    pub fn from_config(config: &FilterConfig) -> Result<Self> {
        let patterns = config
            .patterns
            .iter()
            .map(|pattern| {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| {
                        SyncError::ConfigError(format!(
                            "Invalid filter pattern '{}': {}",
                            pattern, e
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            mode: config.mode,
            domains: config
                .domains
                .iter()
                .map(|d| d.trim().trim_start_matches('@').to_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
            addresses: config
                .addresses
                .iter()
                .map(|a| a.trim().to_lowercase())
                .filter(|a| !a.is_empty())
                .collect(),
            patterns,
        })
    }

    /// Filter that lets everything through
    pub fn permissive() -> Self {
        Self {
            mode: FilterMode::Block,
            domains: HashSet::new(),
            addresses: HashSet::new(),
            patterns: Vec::new(),
        }
    }

    pub fn mode(&self) -> FilterMode {
        self.mode
    }

    /// Whether the message should be classified and routed
    pub fn should_process(&self, message: &Message) -> bool {
        let matched = self.matches(&message.sender).is_some();
        match self.mode {
            FilterMode::Block => !matched,
            FilterMode::Allow => matched,
        }
    }

    /// Human-readable reason for a filtering decision
    pub fn reason(&self, message: &Message) -> String {
        match self.matches(&message.sender) {
            Some(matched) => matched.to_string(),
            None => "no match".to_string(),
        }
    }

    /// First rule matching the From header, checked domain, address, then pattern
    pub fn matches(&self, from: &str) -> Option<FilterMatch> {
        let address = extract_address(from);

        if let Some(domain) = address.as_deref().and_then(extract_domain) {
            if let Some(listed) = self.domains.iter().find(|listed| domain_matches(&domain, listed)) {
                return Some(FilterMatch::Domain(listed.clone()));
            }
        }

        if let Some(address) = address {
            if self.addresses.contains(&address) {
                return Some(FilterMatch::Address(address));
            }
        }

        self.patterns
            .iter()
            .find(|pattern| pattern.is_match(from))
            .map(|pattern| FilterMatch::Pattern(pattern.as_str().to_string()))
    }
}

/// Exact match or subdomain of the listed domain
fn domain_matches(domain: &str, listed: &str) -> bool {
    domain == listed
        || domain
            .strip_suffix(listed)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Marker;
    use chrono::Utc;

    fn message_from(sender: &str) -> Message {
        Message {
            marker: Marker::new(1, 1),
            id: "<id@example.com>".to_string(),
            sender: sender.to_string(),
            subject: "Subject".to_string(),
            body: String::new(),
            received_at: Utc::now(),
        }
    }

    fn filter(mode: FilterMode, domains: &[&str], addresses: &[&str], patterns: &[&str]) -> EmailFilter {
        EmailFilter::from_config(&FilterConfig {
            mode,
            domains: domains.iter().map(|s| s.to_string()).collect(),
            addresses: addresses.iter().map(|s| s.to_string()).collect(),
            patterns: patterns.iter().map(|s| s.to_string()).collect(),
        })
        .unwrap()
    }

    #[test]
    fn test_block_mode_by_domain() {
        let f = filter(FilterMode::Block, &["linkedin.com"], &[], &[]);
        assert!(!f.should_process(&message_from("LinkedIn <news@LinkedIn.com>")));
        assert!(!f.should_process(&message_from("jobs@mail.linkedin.com")));
        assert!(f.should_process(&message_from("Bob <bob@notlinkedin.com>")));
        assert_eq!(
            f.reason(&message_from("news@linkedin.com")),
            "domain:linkedin.com"
        );
    }

    #[test]
    fn test_allow_mode() {
        let f = filter(FilterMode::Allow, &["example.com"], &["boss@corp.io"], &[]);
        assert!(f.should_process(&message_from("Jane <jane@example.com>")));
        assert!(f.should_process(&message_from("The Boss <Boss@corp.io>")));
        assert!(!f.should_process(&message_from("other@corp.io")));
        assert_eq!(f.reason(&message_from("other@corp.io")), "no match");
    }

    #[test]
    fn test_patterns_are_case_insensitive() {
        let f = filter(FilterMode::Block, &[], &[], &["^newsletter", "no-?reply"]);
        assert!(!f.should_process(&message_from("NEWSLETTER <n@shop.com>")));
        assert!(!f.should_process(&message_from("NoReply <noreply@shop.com>")));
        assert!(f.should_process(&message_from("Alice <alice@shop.com>")));
        assert_eq!(
            f.matches("No-Reply <x@y.z>"),
            Some(FilterMatch::Pattern("no-?reply".to_string()))
        );
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let result = EmailFilter::from_config(&FilterConfig {
            mode: FilterMode::Block,
            domains: vec![],
            addresses: vec![],
            patterns: vec!["[".to_string()],
        });
        assert!(matches!(result, Err(SyncError::ConfigError(_))));
    }

    #[test]
    fn test_permissive_processes_everything() {
        let f = EmailFilter::permissive();
        assert!(f.should_process(&message_from("anyone@anywhere.org")));
        assert!(f.should_process(&message_from("Undisclosed recipients")));
    }

    #[test]
    fn test_domain_matches() {
        assert!(domain_matches("example.com", "example.com"));
        assert!(domain_matches("mail.example.com", "example.com"));
        assert!(!domain_matches("badexample.com", "example.com"));
    }
}
