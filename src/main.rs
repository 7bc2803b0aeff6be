use anyhow::Result;
use clap::Parser;
use email_kb_sync::cli::{self, Cli, Commands};
use email_kb_sync::error::SyncError;
use indicatif::MultiProgress;
use std::io::Write;
use std::process;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// A writer that prints through MultiProgress to avoid progress bar conflicts
#[derive(Clone)]
struct MultiProgressWriter {
    multi: Arc<MultiProgress>,
    buffer: Arc<std::sync::Mutex<Vec<u8>>>,
}

impl MultiProgressWriter {
    fn new(multi: Arc<MultiProgress>) -> Self {
        Self {
            multi,
            buffer: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }
}

impl Write for MultiProgressWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut buffer = self
            .buffer
            .lock()
            .map_err(|_| std::io::Error::other("log buffer poisoned"))?;
        buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut buffer = self
            .buffer
            .lock()
            .map_err(|_| std::io::Error::other("log buffer poisoned"))?;
        if !buffer.is_empty() {
            let msg = String::from_utf8_lossy(&buffer);
            let msg = msg.trim_end_matches('\n');
            if !msg.is_empty() {
                let _ = self.multi.println(msg);
            }
            buffer.clear();
        }
        Ok(())
    }
}

impl Drop for MultiProgressWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// MakeWriter implementation for tracing
#[derive(Clone)]
struct MultiProgressMakeWriter {
    multi: Arc<MultiProgress>,
}

impl<'a> MakeWriter<'a> for MultiProgressMakeWriter {
    type Writer = MultiProgressWriter;

    fn make_writer(&'a self) -> Self::Writer {
        MultiProgressWriter::new(Arc::clone(&self.multi))
    }
}

#[tokio::main]
async fn main() {
    match run().await {
        Ok(code) => process::exit(code),
        Err(e) => {
            display_error(&e);
            eprintln!("\nFor help, run: email-kb --help");
            process::exit(1);
        }
    }
}

async fn run() -> Result<i32> {
    // rustls needs exactly one process-wide provider: aws-lc-rs, or ring on Windows
    #[cfg(not(windows))]
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    #[cfg(windows)]
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("email_kb_sync=debug,info"))
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("email_kb_sync=info,warn"))
    };

    // Logs print above progress bars
    let multi_progress = Arc::new(MultiProgress::new());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(MultiProgressMakeWriter {
            multi: Arc::clone(&multi_progress),
        })
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    match &cli.command {
        Commands::Sync { full } => {
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupt received, finishing the current message...");
                    on_signal.cancel();
                }
            });

            let report = cli::run_sync(&cli, *full, (*multi_progress).clone(), cancel).await?;
            Ok(cli::exit_code(&report))
        }

        Commands::Check { verbose, limit } => {
            cli::run_check(&cli, *verbose, *limit, (*multi_progress).clone()).await?;
            Ok(0)
        }

        Commands::Status => {
            cli::show_status(&cli).await?;
            Ok(0)
        }

        Commands::Search { query, limit } => {
            cli::run_search(&cli, query, *limit).await?;
            Ok(0)
        }

        Commands::Reset { force } => {
            cli::run_reset(&cli, *force).await?;
            Ok(0)
        }

        Commands::InitConfig { output, force } => {
            tracing::info!("Generating example configuration file");
            cli::init_config(output, *force).await?;
            Ok(0)
        }
    }
}

/// Display error with context
fn display_error(error: &anyhow::Error) {
    eprintln!("Error: {}", error);

    let mut cause = error.source();
    while let Some(e) = cause {
        eprintln!("  Caused by: {}", e);
        cause = e.source();
    }

    if let Some(sync_err) = error.downcast_ref::<SyncError>() {
        match sync_err {
            SyncError::AuthError(_) => {
                eprintln!("\nHint: The mailbox or classification service rejected the credentials.");
                eprintln!("      For Gmail, use an app password rather than the account password.");
            }
            SyncError::SecretError(_) => {
                eprintln!("\nHint: Check mailbox.password and classifier.api_key in your config.");
                eprintln!("      Keychain entries can be added with: security add-generic-password -s <service> -a <account> -w");
            }
            SyncError::NetworkError(_) | SyncError::ServiceError(_) => {
                eprintln!("\nHint: This may be a temporary error.");
                eprintln!("      Progress up to the failure is saved; run the command again.");
            }
            SyncError::RateLimitExceeded { .. } => {
                eprintln!("\nHint: The classification service is rate limiting requests.");
                eprintln!("      Consider reducing sync.concurrency in config.");
            }
            SyncError::ConfigError(_) => {
                eprintln!("\nHint: Check your configuration file for errors.");
                eprintln!("      Run: email-kb init-config --force");
            }
            SyncError::CheckpointCorrupted { .. } => {
                eprintln!("\nHint: The checkpoint file could not be read.");
                eprintln!("      Run: email-kb reset   (the next sync re-scans the lookback window)");
            }
            SyncError::Locked(_) => {
                eprintln!("\nHint: Another sync is running. Locks left by exited processes are reclaimed automatically.");
            }
            _ => {}
        }
    }
}
