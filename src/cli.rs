//! Command-line interface

use clap::{Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::checkpoint::{CheckpointStore, RunLock, LOCK_FILE};
use crate::classifier::{Classifier, RuleClassifier};
use crate::config::{ClassifierConfig, Config};
use crate::error::{Result, SyncError};
use crate::filters::EmailFilter;
use crate::imap::ImapConnector;
use crate::llm::LlmClassifier;
use crate::report::SyncReport;
use crate::router::Router;
use crate::search::{format_results_json, parse_natural_query, search};
use crate::mailbox::MailboxConnector;
use crate::sync::{
    preview, ProgressCallback, ProgressEvent, SyncEngine, SyncMode, SyncOptions, SyncState,
};

#[derive(Parser, Debug)]
#[command(name = "email-kb")]
#[command(version)]
#[command(about = "Sync an email inbox into a markdown knowledge base", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Process new emails into the knowledge base
    Sync {
        /// Re-scan the whole lookback window instead of starting at the checkpoint
        #[arg(long)]
        full: bool,
    },

    /// Show how many emails are waiting, without processing them
    Check {
        /// List sender and subject of pending emails
        #[arg(short, long)]
        verbose: bool,

        /// How many pending emails to list with --verbose
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },

    /// Show the checkpoint and paths
    Status,

    /// Search the knowledge base with a natural-language query
    Search {
        /// e.g. "from jane about the budget last week"
        query: String,

        /// Max results to return
        #[arg(short, long, default_value_t = crate::search::DEFAULT_LIMIT)]
        limit: usize,
    },

    /// Forget the checkpoint; the next sync re-scans the lookback window
    Reset {
        /// Skip the confirmation prompt
        #[arg(long)]
        force: bool,
    },

    /// Generate example configuration file
    InitConfig {
        /// Path to create config file
        #[arg(short, long, default_value = "config.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(long)]
        force: bool,
    },
}

/// Truncate a string to max_len characters, adding "..." if truncated
fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max_len.saturating_sub(3)).collect::<String>())
    }
}

/// Progress reporter using indicatif
pub struct ProgressReporter {
    multi: MultiProgress,
    spinner_style: ProgressStyle,
    bar_style: ProgressStyle,
}

impl ProgressReporter {
    pub fn with_multi_progress(multi: MultiProgress) -> Self {
        let spinner_style = ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed:>6}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ");

        let bar_style = ProgressStyle::default_bar()
            .template("[{elapsed:>6}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-");

        Self {
            multi,
            spinner_style,
            bar_style,
        }
    }

    pub fn multi_progress(&self) -> &MultiProgress {
        &self.multi
    }

    pub fn add_spinner(&self, msg: &str) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new_spinner());
        pb.set_style(self.spinner_style.clone());
        pb.set_message(msg.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }

    /// Finish a spinner and clear it from the multi-progress display
    pub fn finish_spinner(&self, pb: &ProgressBar, msg: &str) {
        pb.finish_and_clear();
        let _ = self.multi.println(format!("  ✓ {}", msg));
    }

    /// Engine callback driving one spinner that turns into a bar once the delta is known
    pub fn sync_progress(&self) -> (ProgressCallback, ProgressBar) {
        let pb = self.add_spinner("Preparing...");
        let bar = pb.clone();
        let bar_style = self.bar_style.clone();

        let callback: ProgressCallback = Arc::new(move |event| match event {
            ProgressEvent::Connecting => bar.set_message("Connecting to mailbox..."),
            ProgressEvent::DeltaListed { total, deferred } => {
                bar.set_style(bar_style.clone());
                bar.set_length(total as u64);
                bar.set_position(0);
                if deferred > 0 {
                    bar.set_message(format!("Processing ({} deferred to next run)", deferred));
                } else {
                    bar.set_message("Processing");
                }
            }
            ProgressEvent::MessageDone { .. } => bar.inc(1),
            ProgressEvent::CheckpointSaved { marker } => {
                bar.set_message(format!("Checkpoint {}", marker))
            }
        });

        (callback, pb)
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::with_multi_progress(MultiProgress::new())
    }
}

async fn build_classifier(config: &ClassifierConfig) -> Result<Arc<dyn Classifier>> {
    match config.mode.as_str() {
        "rules" => Ok(Arc::new(RuleClassifier::new())),
        _ => {
            let api_key = config.api_key.resolve("api_key").await?;
            Ok(Arc::new(LlmClassifier::new(config, api_key)?))
        }
    }
}

/// IMAP connector for the configured mailbox
pub async fn build_connector(config: &Config) -> Result<Arc<dyn MailboxConnector>> {
    config.require_mailbox()?;
    let password = config.mailbox.password.resolve(&config.mailbox.address).await?;
    Ok(Arc::new(ImapConnector::new(config.mailbox.clone(), password)))
}

/// Wire up the engine from configuration and secrets
pub async fn build_engine(config: &Config) -> Result<SyncEngine> {
    let connector = build_connector(config).await?;
    let classifier = build_classifier(&config.classifier).await?;
    info!("Using classifier {}", classifier.name());

    let knowledge_dir = config.paths.knowledge_dir();
    let state_dir = config.paths.state_dir();
    tokio::fs::create_dir_all(&state_dir).await?;

    Ok(SyncEngine::new(
        connector,
        classifier,
        Router::new(knowledge_dir),
        EmailFilter::from_config(&config.filters)?,
        state_dir,
        SyncOptions::from(&config.sync),
    ))
}

/// Process exit status for a finished run
///
/// Only a run that ended in `Failed` is an error; an interrupted run that
/// stopped cleanly at its last commit exits 0 like any other completed run.
pub fn exit_code(report: &SyncReport) -> i32 {
    match report.state {
        SyncState::Failed(_) => 1,
        _ => 0,
    }
}

/// Run one sync and print its report
///
/// A run that ends in `Failed` still prints its report, then returns the error.
pub async fn run_sync(
    cli: &Cli,
    full: bool,
    multi: MultiProgress,
    cancel: CancellationToken,
) -> Result<SyncReport> {
    let reporter = ProgressReporter::with_multi_progress(multi);

    let config_spinner = reporter.add_spinner("Loading configuration...");
    let config = Config::load(&cli.config).await?;
    let engine = build_engine(&config).await?;
    reporter.finish_spinner(&config_spinner, &format!("Configuration loaded from {:?}", cli.config));

    let (progress, pb) = reporter.sync_progress();
    let engine = engine.with_progress(progress).with_cancellation(cancel);

    let mode = if full { SyncMode::Full } else { SyncMode::Incremental };
    let outcome = engine.run(mode).await;
    pb.finish_and_clear();

    match outcome {
        Ok(report) => {
            println!("\n{}", report);
            Ok(report)
        }
        Err(failure) => {
            println!("\n{}", failure.report);
            Err(failure.error)
        }
    }
}

pub async fn run_check(cli: &Cli, verbose: bool, limit: usize, multi: MultiProgress) -> Result<()> {
    let reporter = ProgressReporter::with_multi_progress(multi);
    let config = Config::load(&cli.config).await?;
    let connector = build_connector(&config).await?;
    let store = CheckpointStore::new(&config.paths.state_dir());

    let spinner = reporter.add_spinner("Checking mailbox...");
    let preview = preview(
        connector.as_ref(),
        &store,
        &SyncOptions::from(&config.sync),
        if verbose { limit } else { 0 },
    )
    .await?;
    reporter.finish_spinner(&spinner, "Mailbox checked");

    match preview.checkpoint.last_marker {
        Some(marker) => println!("Checkpoint: {}", marker),
        None => println!(
            "Checkpoint: none (first sync scans the last {} days)",
            config.sync.days_lookback
        ),
    }
    println!("Pending emails: {}", preview.pending);
    if preview.deferred > 0 {
        println!(
            "Beyond this run's cap of {}: {}",
            config.sync.max_messages_per_run, preview.deferred
        );
    }

    if verbose && !preview.samples.is_empty() {
        println!();
        for (marker, sender, subject) in &preview.samples {
            println!(
                "  {:<10} {:<32} {}",
                marker.to_string(),
                truncate_string(sender, 32),
                truncate_string(subject, 60)
            );
        }
        if preview.pending > preview.samples.len() {
            println!("  ... and {} more", preview.pending - preview.samples.len());
        }
    }

    Ok(())
}

pub async fn show_status(cli: &Cli) -> Result<()> {
    let config = Config::load(&cli.config).await?;
    let state_dir = config.paths.state_dir();
    let store = CheckpointStore::new(&state_dir);
    let checkpoint = store.load().await?;

    println!("\n========================================");
    println!("Sync Status");
    println!("========================================");
    println!(
        "Mailbox: {}",
        if config.mailbox.address.is_empty() {
            "(not configured)"
        } else {
            config.mailbox.address.as_str()
        }
    );
    match checkpoint.last_marker {
        Some(marker) => println!("Last marker: {}", marker),
        None => println!("Last marker: none (never synced)"),
    }
    println!("Emails processed: {}", checkpoint.processed_count);
    if let Some(updated_at) = checkpoint.updated_at {
        println!("Last sync: {}", updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(run_id) = &checkpoint.last_run_id {
        println!("Last run ID: {}", run_id);
    }
    if state_dir.join(LOCK_FILE).exists() {
        println!("Lock: held ({})", state_dir.join(LOCK_FILE).display());
    }
    println!("Knowledge base: {}", config.paths.knowledge_dir().display());
    println!("State file: {}", store.path().display());
    println!("========================================");

    Ok(())
}

pub async fn run_search(cli: &Cli, query: &str, limit: usize) -> Result<()> {
    let config = Config::load(&cli.config).await?;
    let mut parsed = parse_natural_query(query, chrono::Utc::now().date_naive());
    parsed.limit = limit;

    let root = config.paths.knowledge_dir();
    let search_query = parsed.clone();
    let results = tokio::task::spawn_blocking(move || search(&root, &search_query))
        .await
        .map_err(|e| SyncError::Unknown(format!("search task failed: {}", e)))??;

    println!("{}", format_results_json(&parsed, &results)?);
    Ok(())
}

pub async fn run_reset(cli: &Cli, force: bool) -> Result<()> {
    let config = Config::load(&cli.config).await?;
    let state_dir = config.paths.state_dir();
    let store = CheckpointStore::new(&state_dir);

    if !force {
        let confirmed = inquire::Confirm::new(&format!(
            "Reset the checkpoint? The next sync re-scans the last {} days.",
            config.sync.days_lookback
        ))
        .with_default(false)
        .prompt()
        .map_err(|e| SyncError::OperationCancelled(e.to_string()))?;
        if !confirmed {
            println!("Aborted.");
            return Ok(());
        }
    }

    tokio::fs::create_dir_all(&state_dir).await?;
    let _lock = RunLock::acquire(&state_dir)?;
    if store.reset().await? {
        println!("Checkpoint removed: {}", store.path().display());
    } else {
        println!("No checkpoint to reset.");
    }
    Ok(())
}

pub async fn init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        return Err(SyncError::ConfigError(format!(
            "Configuration file already exists at {:?}. Use --force to overwrite.",
            output
        )));
    }

    Config::create_example(output).await?;

    println!("Created example configuration file at: {:?}", output);
    println!("\nPlease edit this file to customize your settings.");
    println!("Key settings to review:");
    println!("  - mailbox.address: The inbox to sync");
    println!("  - mailbox.password / classifier.api_key: Where secrets are looked up");
    println!("  - paths.knowledge_dir: Root of the markdown knowledge base");
    println!("  - filters: Allow or block list of sender domains and addresses");

    Ok(())
}
