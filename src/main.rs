use agentboot::app::{App, StdioCoordinator};
use agentboot::errors::LaunchError;
use agentboot::managers::host_keys::HostIdentity;
use agentboot::services::logger::Logger;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "agentboot", version, about = "Bootstrap a remote agent process over SSH")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect, deploy, start the agent, and bridge it to stdin/stdout.
    Launch {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        credentials: Option<PathBuf>,
    },
    /// Inspect or change pinned host keys of trust-on-first-use targets.
    Trust {
        #[command(subcommand)]
        action: TrustAction,
    },
}

#[derive(Subcommand)]
enum TrustAction {
    /// Show the host key queued for manual approval.
    Pending {
        #[arg(long)]
        target: String,
        #[arg(long)]
        store_dir: Option<PathBuf>,
    },
    /// Trust the queued host key.
    Approve {
        #[arg(long)]
        target: String,
        #[arg(long)]
        store_dir: Option<PathBuf>,
    },
    /// Drop the pinned and queued keys so the next contact starts over.
    Forget {
        #[arg(long)]
        target: String,
        #[arg(long)]
        store_dir: Option<PathBuf>,
    },
}

fn key_summary(target: &str, key: &HostIdentity) -> serde_json::Value {
    serde_json::json!({
        "target_id": target,
        "algorithm": key.algorithm(),
        "fingerprint": key.fingerprint_sha256(),
        "key": key.to_line(),
    })
}

fn run_trust(app: &App, action: TrustAction) -> Result<(), LaunchError> {
    match action {
        TrustAction::Pending { target, store_dir } => {
            match app.pending_host_key(&target, store_dir.as_deref())? {
                Some(key) => println!("{}", key_summary(&target, &key)),
                None => println!("{}", serde_json::json!({"target_id": target, "pending": null})),
            }
        }
        TrustAction::Approve { target, store_dir } => {
            let key = app.approve_host_key(&target, store_dir.as_deref())?;
            println!("{}", key_summary(&target, &key));
        }
        TrustAction::Forget { target, store_dir } => {
            app.forget_host_key(&target, store_dir.as_deref())?;
        }
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<(), LaunchError> {
    match cli.command {
        Command::Launch {
            config,
            credentials,
        } => {
            let coordinator = Arc::new(StdioCoordinator::new(Logger::new("agentboot")));
            let app = App::initialize(credentials, coordinator)?;
            let handle = app.launch_from_file(&config).await?;
            tokio::select! {
                _ = handle.closed() => {}
                _ = tokio::signal::ctrl_c() => {
                    app.logger.info("interrupted, tearing down", None);
                }
            }
            app.shutdown().await;
            Ok(())
        }
        Command::Trust { action } => {
            let coordinator = Arc::new(StdioCoordinator::new(Logger::new("agentboot")));
            let app = App::initialize(None, coordinator)?;
            run_trust(&app, action)
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("agentboot: [{}] {}", err.code, err);
        std::process::exit(1);
    }
}
