// CLI subcommand dispatch.

use std::future::Future;

use anyhow::{Context, Result};
use clap::Subcommand;

use crate::client::DaemonClient;
use crate::daemon_launcher::ensure_daemon_running;
use crate::output::OutputFormat;

pub mod cat;
pub mod diff;
pub mod errors;
pub mod ls;
pub mod new;
pub mod parse;
pub mod status;
pub mod stream;
pub mod switch;
pub mod term;

#[derive(Subcommand)]
pub enum Command {
    /// Parse a saved assistant reply offline and print its file mutations
    Parse(parse::ParseArgs),
    /// Start a new conversation and make it active
    New(new::NewArgs),
    /// Switch to an existing conversation
    Switch(switch::SwitchArgs),
    /// Stream an assistant reply into the active conversation
    Stream(stream::StreamArgs),
    /// List files in the active workspace
    Ls(ls::LsArgs),
    /// Print one workspace file
    Cat(cat::CatArgs),
    /// Show changes since the previous assistant turn
    Diff(diff::DiffArgs),
    /// List or dismiss queued errors
    Errors(errors::ErrorsArgs),
    /// Manage terminal sessions
    #[command(subcommand)]
    Term(term::TermCommand),
    /// Show sandbox, sync and persistence status
    Status(status::StatusArgs),
}

pub fn run(cmd: Command, format: OutputFormat) -> Result<()> {
    match cmd {
        Command::Parse(args) => parse::run(args, format),
        Command::New(args) => new::run(args, format),
        Command::Switch(args) => switch::run(args, format),
        Command::Stream(args) => stream::run(args, format),
        Command::Ls(args) => ls::run(args, format),
        Command::Cat(args) => cat::run(args, format),
        Command::Diff(args) => diff::run(args, format),
        Command::Errors(args) => errors::run(args, format),
        Command::Term(cmd) => term::run(cmd, format),
        Command::Status(args) => status::run(args, format),
    }
}

/// Drive one command's future on a fresh current-thread runtime.
pub(crate) fn block_on<F: Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    Ok(runtime.block_on(future))
}

/// A client for the default socket, launching the daemon if needed.
pub(crate) async fn connect() -> Result<DaemonClient> {
    let client = DaemonClient::default();
    ensure_daemon_running(client.socket_path()).await?;
    Ok(client)
}
