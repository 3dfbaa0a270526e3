// forgepadd: standalone daemon entry point.

use anyhow::Context;
use clap::{Parser, Subcommand};
use forgepad_daemon::config::GlobalConfig;
use forgepad_daemon::runtime::{run_standalone, DaemonOptions};
use forgepad_daemon::security::{delete_secret, get_secret, set_secret, SecretSlot};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "forgepadd", version, about = "Forgepad workspace daemon")]
struct Args {
    /// Use the in-memory sandbox and project backend.
    #[arg(long)]
    dry_run: bool,

    #[command(subcommand)]
    command: Option<AdminCommand>,
}

#[derive(Debug, Subcommand)]
enum AdminCommand {
    /// Manage the backend bearer token kept in the OS keychain
    #[command(subcommand)]
    Token(TokenCommand),
}

#[derive(Debug, Subcommand)]
enum TokenCommand {
    /// Store a token
    Set { token: String },
    /// Remove the stored token
    Clear,
    /// Report whether a token is stored
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    if let Some(AdminCommand::Token(command)) = args.command {
        return run_token_command(command);
    }

    let config = GlobalConfig::load();
    info!(dry_run = args.dry_run, "starting forgepad daemon");
    run_standalone(config, DaemonOptions { dry_run: args.dry_run })
        .await
        .context("daemon terminated unexpectedly")
}

fn run_token_command(command: TokenCommand) -> anyhow::Result<()> {
    match command {
        TokenCommand::Set { token } => {
            set_secret(SecretSlot::BackendToken, token.trim())?;
            println!("backend token stored");
        }
        TokenCommand::Clear => {
            delete_secret(SecretSlot::BackendToken)?;
            println!("backend token cleared");
        }
        TokenCommand::Status => match get_secret(SecretSlot::BackendToken)? {
            Some(_) => println!("backend token: stored in keychain"),
            None => println!("backend token: not set (persistence is local-only)"),
        },
    }
    Ok(())
}
