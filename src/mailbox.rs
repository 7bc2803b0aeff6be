//! Mailbox capability consumed by the sync engine

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{Marker, Message, MessageSummary};

/// What part of the mailbox to list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaQuery {
    /// Everything after the marker; None lists the whole folder
    After(Option<Marker>),
    /// Everything received on or after the timestamp
    Since(DateTime<Utc>),
}

/// Result of a delta listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta {
    pub uid_validity: u32,
    /// Ordered oldest first
    pub messages: Vec<MessageSummary>,
}

impl Delta {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Opens authenticated sessions
#[async_trait]
pub trait MailboxConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn MailboxSession>>;
}

/// Read-only view of one mailbox folder
#[async_trait]
pub trait MailboxSession: Send + Sync {
    /// List message summaries matching the query, oldest first
    async fn list_since(&self, query: &DeltaQuery) -> Result<Delta>;

    /// Fetch one full message
    async fn fetch(&self, marker: Marker) -> Result<Message>;

    /// Close the session
    async fn logout(&self) -> Result<()>;
}
