//! kopia-admin - credential provisioning for a containerized Kopia server
//!
//! Builds the configuration once, initializes logging and metrics, and runs
//! a single list/add/remove operation against the server container.

use std::io::BufRead;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use secrecy::SecretString;
use tracing::{debug, info, warn};

use kopia_admin::build_orchestrator;
use kopia_admin::config::AppConfig;
use kopia_admin::logging::init_logging;

/// Environment variable the `add` password is read from
const SECRET_VAR: &str = "KOPIA_ADMIN_SECRET";

/// Manage Kopia repository server users inside a running container
#[derive(Parser)]
#[command(name = "kopia-admin")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Manage Kopia server users in a running container", long_about = None)]
struct Cli {
    /// Configuration file (TOML or YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List server users as JSON
    List {
        /// Decode and pretty-print the listing
        #[arg(long)]
        pretty: bool,
    },

    /// Add a user; the password is read from KOPIA_ADMIN_SECRET or stdin
    Add {
        /// User identity, usually user@host
        identity: String,

        /// Wait for the password dialogue to finish instead of the settle delay
        #[arg(long)]
        wait: bool,
    },

    /// Remove a user
    Remove {
        /// User identity, usually user@host
        identity: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = AppConfig::load_with(cli.config.as_deref())?;

    // Initialize logging
    init_logging(&config.log_level, config.log_dir.as_deref())?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        container = %config.provisioning.container_name,
        "Starting kopia-admin"
    );

    if kopia_admin::metrics::init_metrics(&config.metrics)? {
        info!(addr = %config.metrics.listen_addr, "Prometheus exporter listening");
    }

    let orchestrator = build_orchestrator(&config)?;

    match cli.command {
        Commands::List { pretty } => {
            let listing = orchestrator.list_credentials().await?;
            if pretty {
                match serde_json::from_str::<serde_json::Value>(listing.as_str()) {
                    Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                    Err(e) => {
                        warn!(error = %e, "User listing is not valid JSON");
                        println!("{}", listing);
                    }
                }
            } else {
                println!("{}", listing);
            }
        }
        Commands::Add { identity, wait } => {
            let secret = read_secret()?;
            if wait {
                let provisioned = orchestrator.create_credential_and_wait(&identity, secret).await?;
                println!("{}", serde_json::to_string(&provisioned)?);
            } else {
                let (provisioned, dialogue) = orchestrator.create_credential_tracked(&identity, secret).await?;
                println!("{}", serde_json::to_string(&provisioned)?);

                // Keep the runtime up until the driver exits so its outcome gets logged
                debug!(%dialogue, "Waiting for dialogue driver to exit");
                let outcome = dialogue.wait().await;
                debug!(outcome = outcome.label(), "Dialogue driver exited");
            }
        }
        Commands::Remove { identity } => {
            let provisioned = orchestrator.remove_credential(&identity).await?;
            println!("{}", serde_json::to_string(&provisioned)?);
        }
    }

    Ok(())
}

/// Read the password without it ever appearing in argv
fn read_secret() -> Result<SecretString> {
    if let Ok(value) = std::env::var(SECRET_VAR) {
        return Ok(SecretString::from(value));
    }

    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read password from stdin")?;

    let secret = line.trim_end_matches(['\r', '\n']).to_string();
    if secret.is_empty() {
        anyhow::bail!("No password given on stdin or in {}", SECRET_VAR);
    }

    Ok(SecretString::from(secret))
}
