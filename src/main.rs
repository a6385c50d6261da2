use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::BufReader;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use gitlab_sshd::command::two_factor_recovery;
use gitlab_sshd::config::{self, Config};
use gitlab_sshd::gitlabnet;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "gitlab-sshd", about = "SSH front door for GitLab")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, env = "GITLAB_SSHD_CONFIG", default_value = "/etc/gitlab-shell/config.yml")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the SSH listener (default).
    Serve,
    /// Regenerate two-factor recovery codes for the user owning a key.
    RecoveryCodes {
        /// Key-id recorded for the authenticated session.
        #[arg(long, default_value = "")]
        key_id: String,
    },
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn serve(config: Arc<Config>) -> Result<()> {
    tokio::select! {
        result = gitlab_sshd::sshd::start_ssh_server(config) => result,
        () = shutdown_signal() => Ok(()),
    }
}

async fn recovery_codes(config: &Config, key_id: &str) -> Result<()> {
    let client = gitlabnet::two_factor_recovery::Client::new(config)
        .context("failed to build internal API client")?;

    let mut input = BufReader::new(tokio::io::stdin());
    let mut output = tokio::io::stdout();
    two_factor_recovery::execute(&client, key_id, &mut input, &mut output)
        .await
        .context("failed to run recovery codes command")
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Tracing ----
    // stdout belongs to the interactive commands.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    // ---- Config ----
    let config = Arc::new(config::load_config(&cli.config)?);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            tracing::info!(config_path = %cli.config, "starting gitlab-sshd");
            serve(config).await?;
            tracing::info!("gitlab-sshd shut down cleanly");
        }
        Command::RecoveryCodes { key_id } => recovery_codes(&config, &key_id).await?,
    }

    Ok(())
}
