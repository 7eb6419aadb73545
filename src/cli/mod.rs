//! CLI module for the ghapp-broker command-line interface.
//!
//! Provides subcommands around the credential broker:
//! - `token <owner>` - Print an installation access token for an account
//! - `installations [--repos]` - List accounts the App is installed on
//! - `repos <owner>` - List repositories visible to an account's installation
//! - `convert-key <input> <output>` - Convert a PKCS#1 key to PKCS#8 PEM
//! - `connectivity` - Check that the GitHub API is reachable
//! - `config check` - Validate configuration file

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::crypto::{self, KeyEncoding};
use crate::github::CredentialBroker;

/// CLI arguments structure
#[derive(Parser, Debug)]
#[command(name = "ghapp-broker")]
#[command(author, version, about = "GitHub App credential broker", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "ghapp-broker.toml")]
    pub config: PathBuf,

    /// Override log level
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// GitHub App ID (overrides github_app.app_id)
    #[arg(long, env = "GITHUB_APP_ID")]
    pub app_id: Option<String>,

    /// Path to the App's private key (overrides github_app.private_key_path)
    #[arg(long, env = "GITHUB_APP_PRIVATE_KEY_PATH")]
    pub private_key: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print an installation access token for an account
    Token {
        /// Account login (user or organization)
        owner: String,
        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// List accounts the App is installed on
    Installations {
        /// Also count the repositories each installation can access
        #[arg(long)]
        repos: bool,
    },

    /// List repositories accessible through an account's installation
    Repos {
        /// Account login (user or organization)
        owner: String,
    },

    /// Convert a PKCS#1 (RSA PRIVATE KEY) PEM into PKCS#8 (PRIVATE KEY)
    ConvertKey {
        /// Input PEM file
        input: PathBuf,
        /// Output PEM file (must not exist)
        output: PathBuf,
    },

    /// Check that the GitHub API is reachable
    Connectivity,

    /// Configuration management commands
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Validate configuration file
    Check,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Load the configuration file with command line overrides applied.
pub fn load_config(cli: &Cli) -> Result<Config> {
    Ok(Config::load(&cli.config)?.with_overrides(cli.app_id.clone(), cli.private_key.clone()))
}

fn broker(config: &Config) -> Result<CredentialBroker> {
    CredentialBroker::from_config(config).context("Failed to initialize GitHub App credentials")
}

/// Run a CLI command
pub async fn run_command(cli: &Cli, config: &Config, cancel: &CancellationToken) -> Result<()> {
    match &cli.command {
        Commands::Token { owner, format } => cmd_token(config, owner, *format, cancel).await,
        Commands::Installations { repos } => cmd_installations(config, *repos, cancel).await,
        Commands::Repos { owner } => cmd_repos(config, owner, cancel).await,
        Commands::ConvertKey { input, output } => cmd_convert_key(input, output),
        Commands::Connectivity => cmd_connectivity(config, cancel).await,
        Commands::Config(ConfigCommands::Check) => cmd_config_check(cli, config),
    }
}

/// Print a token for `owner`
async fn cmd_token(
    config: &Config,
    owner: &str,
    format: OutputFormat,
    cancel: &CancellationToken,
) -> Result<()> {
    let broker = broker(config)?;
    let credential = broker
        .get_client_for(owner, cancel)
        .await
        .with_context(|| format!("Failed to obtain a token for {}", owner))?;

    match format {
        OutputFormat::Text => println!("{}", credential.token),
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&credential).context("Failed to encode token")?
        ),
    }

    let remaining = (credential.expires_at - Utc::now()).num_seconds().max(0) as u64;
    eprintln!(
        "[OK] Installation {} token valid for {}",
        credential.installation_id,
        format_duration(remaining)
    );
    Ok(())
}

/// List installations
async fn cmd_installations(config: &Config, with_repos: bool, cancel: &CancellationToken) -> Result<()> {
    let broker = broker(config)?;
    let installations = broker
        .list_accessible_accounts(cancel)
        .await
        .context("Failed to list installations")?;

    if installations.is_empty() {
        println!("The App is not installed on any account.");
        return Ok(());
    }

    // One token exchange and listing per installation, run concurrently
    let repo_counts: Vec<Option<String>> = if with_repos {
        let listings = installations
            .iter()
            .map(|installation| broker.list_repositories(&installation.account_login, cancel));
        futures::future::join_all(listings)
            .await
            .into_iter()
            .zip(&installations)
            .map(|(result, installation)| match result {
                Ok(repos) => Some(repos.len().to_string()),
                Err(e) => {
                    tracing::warn!(account = %installation.account_login, error = %e, "Failed to list repositories");
                    Some("error".to_string())
                }
            })
            .collect()
    } else {
        vec![None; installations.len()]
    };

    println!();
    println!("{:<14}  {:<30}  {:<12}  {:<6}", "INSTALLATION", "ACCOUNT", "TYPE", "REPOS");
    println!("{}", "-".repeat(68));
    for (installation, repos) in installations.iter().zip(repo_counts) {
        println!(
            "{:<14}  {:<30}  {:<12}  {:<6}",
            installation.id,
            truncate(&installation.account_login, 30),
            format!("{:?}", installation.account_type),
            repos.as_deref().unwrap_or("-")
        );
    }
    println!();
    Ok(())
}

/// List repositories for `owner`
async fn cmd_repos(config: &Config, owner: &str, cancel: &CancellationToken) -> Result<()> {
    let broker = broker(config)?;
    let repositories = broker
        .list_repositories(owner, cancel)
        .await
        .with_context(|| format!("Failed to list repositories for {}", owner))?;

    if repositories.is_empty() {
        println!("No repositories accessible for {}.", owner);
        return Ok(());
    }

    println!();
    println!("{:<50}  {:<16}  {:<8}", "REPOSITORY", "LANGUAGE", "PRIVATE");
    println!("{}", "-".repeat(80));
    for repo in &repositories {
        println!(
            "{:<50}  {:<16}  {:<8}",
            truncate(&repo.full_name, 50),
            repo.language.as_deref().unwrap_or("Unknown"),
            if repo.is_private { "yes" } else { "no" }
        );
    }
    println!();
    println!("{} repositories", repositories.len());
    Ok(())
}

/// Convert a private key to PKCS#8
fn cmd_convert_key(input: &Path, output: &Path) -> Result<()> {
    let encoding = crypto::convert_key_file(input, output)?;
    match encoding {
        KeyEncoding::LegacyRsa => println!(
            "[OK] Converted {} (PKCS#1) to {} (PKCS#8)",
            input.display(),
            output.display()
        ),
        KeyEncoding::Pkcs8 => println!(
            "[OK] {} was already PKCS#8; re-encoded to {}",
            input.display(),
            output.display()
        ),
    }
    Ok(())
}

/// Check API reachability
async fn cmd_connectivity(config: &Config, cancel: &CancellationToken) -> Result<()> {
    let broker = broker(config)?;
    println!("Connecting to {}...", config.http.api_base_url);

    match broker.check_connectivity(cancel).await {
        Ok(rate) => {
            println!("[OK] GitHub API reachable");
            println!("  Rate limit: {}/{} remaining", rate.remaining, rate.limit);
            Ok(())
        }
        Err(e) => {
            println!("[!!] GitHub API not reachable: {}", e);
            anyhow::bail!("Connectivity check failed");
        }
    }
}

fn cmd_config_check(cli: &Cli, config: &Config) -> Result<()> {
    let config_path = &cli.config;

    println!("Checking configuration file: {}", config_path.display());
    println!();

    if !config_path.exists() {
        println!("[!!] Configuration file not found: {}", config_path.display());
        println!("Defaults and command line overrides will be used.");
        println!("To create a custom configuration, copy ghapp-broker.example.toml to ghapp-broker.toml");
        println!();
    }

    match config.validate() {
        Ok(()) => {
            println!("[OK] Configuration is valid!");
            println!();
            println!("=== Configuration Summary ===");
            println!();
            println!("GitHub App:");
            println!("  App ID:            {}", config.github_app.app_id);
            println!("  Private Key:       {}", config.github_app.private_key_path.display());
            println!("  Clock Skew:        {}s", config.github_app.clock_skew_allowance_seconds);
            println!("  Assertion Life:    {}s", config.github_app.assertion_lifetime_seconds);
            println!("  Refresh Margin:    {}s", config.github_app.token_refresh_margin_seconds);
            println!("  Exchange Retries:  {}", config.github_app.max_exchange_retries);
            println!();
            println!("HTTP:");
            println!("  API URL:           {}", config.http.api_base_url);
            println!("  Timeout:           {}s", config.http.request_timeout_seconds);
            println!(
                "  Backoff:           {}ms .. {}ms",
                config.http.retry_initial_backoff_ms, config.http.retry_max_backoff_ms
            );
            println!();

            let warnings = config.warnings();
            if !warnings.is_empty() {
                println!("Warnings:");
                for warning in warnings {
                    println!("  [!] {}", warning);
                }
                println!();
            }

            Ok(())
        }
        Err(e) => {
            println!("[!!] Configuration is invalid!");
            println!();
            println!("Error: {}", e);
            println!();
            anyhow::bail!("Invalid configuration");
        }
    }
}

/// Format duration to human-readable string
fn format_duration(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Truncate a string to max length with ellipsis
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
