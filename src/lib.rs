//! Email to knowledge base sync
//!
//! Pulls new messages from an IMAP inbox, classifies each one and appends
//! the result to markdown documents in a personal knowledge base, keeping a
//! durable checkpoint so every run picks up exactly where the last one
//! committed.
//!
//! # Overview
//!
//! - **Mailbox**: read-only IMAP over TLS, incremental listing by UID
//! - **Classification**: Anthropic Messages API, or offline rules
//! - **Routing**: idempotent, tagged entries in work/personal/home TODO lists,
//!   people notes, knowledge references and daily logs
//! - **Checkpointing**: atomic, never advancing past an unresolved message
//! - **Search**: natural-language queries over the written entries
//!
//! # Example Usage
//!
//! ```no_run
//! use email_kb_sync::{cli, config::Config, sync::SyncMode};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml".as_ref()).await?;
//!     let engine = cli::build_engine(&config).await?;
//!
//!     let report = engine.run(SyncMode::Incremental).await?;
//!     println!("{}", report);
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - [`checkpoint`] - Durable progress marker and the run lock
//! - [`mailbox`] - Mailbox capability traits
//! - [`imap`] - IMAP implementation of the mailbox traits
//! - [`classifier`] - Classification trait, rule classifier, response parsing
//! - [`llm`] - Classification through the Anthropic Messages API
//! - [`router`] - Classification to document targets, idempotent writes
//! - [`document`] - Markdown splicing helpers
//! - [`sync`] - Run orchestration
//! - [`search`] - Natural-language search over the knowledge base
//! - [`config`] - Configuration management
//! - [`secrets`] - Secret lookup (env, command, keychain)
//! - [`filters`] - Sender allow/block lists
//! - [`retry`] - Bounded exponential backoff
//! - [`report`] - Run summary
//! - [`error`] - Error types and result aliases
//! - [`models`] - Core data structures

pub mod checkpoint;
pub mod classifier;
pub mod cli;
pub mod config;
pub mod document;
pub mod error;
pub mod filters;
pub mod imap;
pub mod llm;
pub mod mailbox;
pub mod models;
pub mod report;
pub mod retry;
pub mod router;
pub mod search;
pub mod secrets;
pub mod sync;

pub use error::{Result, SyncError};

pub use models::{
    Category, ClassificationResult, EntryTag, Marker, Message, MessageSummary, Priority,
    RoutingTarget, WriteOperation,
};

pub use checkpoint::{Checkpoint, CheckpointStore, RunLock};
pub use classifier::{Classifier, RuleClassifier};
pub use config::Config;
pub use filters::EmailFilter;
pub use llm::LlmClassifier;
pub use mailbox::{Delta, DeltaQuery, MailboxConnector, MailboxSession};
pub use report::{SkippedMessage, Stage, SyncReport};
pub use retry::RetryPolicy;
pub use router::{ApplyOutcome, Router};
pub use sync::{
    CommitTracker, ProgressCallback, ProgressEvent, SyncEngine, SyncFailure, SyncMode,
    SyncOptions, SyncState,
};

pub use cli::{Cli, Commands, ProgressReporter};
