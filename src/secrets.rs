//! Credential lookup from external secret stores
//!
//! Passwords and API keys never live in the config file. The config names
//! where to find them: an environment variable, an arbitrary command that
//! prints the secret on stdout, or the macOS keychain.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::error::{Result, SyncError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SecretSource {
    /// Read from an environment variable
    Env(String),
    /// Run a command and use its trimmed stdout
    Command(Vec<String>),
    /// macOS keychain generic password; account defaults to the caller's
    Keychain {
        service: String,
        #[serde(default)]
        account: Option<String>,
    },
}

impl SecretSource {
    pub fn validate(&self, field: &str) -> Result<()> {
        match self {
            SecretSource::Env(var) if var.trim().is_empty() => Err(SyncError::ConfigError(
                format!("{}: env variable name cannot be empty", field),
            )),
            SecretSource::Command(argv) if argv.is_empty() || argv[0].trim().is_empty() => {
                Err(SyncError::ConfigError(format!(
                    "{}: command cannot be empty",
                    field
                )))
            }
            SecretSource::Keychain { service, .. } if service.trim().is_empty() => Err(
                SyncError::ConfigError(format!("{}: keychain service cannot be empty", field)),
            ),
            _ => Ok(()),
        }
    }

    /// Fetch the secret
    ///
    /// `default_account` is used for keychain entries without an explicit account.
    pub async fn resolve(&self, default_account: &str) -> Result<SecretString> {
        let value = match self {
            SecretSource::Env(var) => std::env::var(var).map_err(|_| {
                SyncError::SecretError(format!("environment variable {} is not set", var))
            })?,
            SecretSource::Command(argv) => run_secret_command(argv).await?,
            SecretSource::Keychain { service, account } => {
                let account = account.as_deref().unwrap_or(default_account);
                let argv = vec![
                    "security".to_string(),
                    "find-generic-password".to_string(),
                    "-s".to_string(),
                    service.clone(),
                    "-a".to_string(),
                    account.to_string(),
                    "-w".to_string(),
                ];
                run_secret_command(&argv).await.map_err(|e| {
                    SyncError::SecretError(format!(
                        "keychain lookup for {}/{} failed: {}",
                        service, account, e
                    ))
                })?
            }
        };

        if value.is_empty() {
            return Err(SyncError::SecretError(format!(
                "secret from {} is empty",
                self.describe()
            )));
        }

        Ok(SecretString::from(value))
    }

    /// Human-readable origin, safe to log
    pub fn describe(&self) -> String {
        match self {
            SecretSource::Env(var) => format!("env:{}", var),
            SecretSource::Command(argv) => format!("command:{}", argv.first().map(String::as_str).unwrap_or("")),
            SecretSource::Keychain { service, .. } => format!("keychain:{}", service),
        }
    }
}

async fn run_secret_command(argv: &[String]) -> Result<String> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| SyncError::SecretError("empty secret command".to_string()))?;

    debug!("Reading secret via command {}", program);
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| SyncError::SecretError(format!("failed to run {}: {}", program, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SyncError::SecretError(format!(
            "{} exited with {}: {}",
            program,
            output.status,
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
