// `forgepad term` — manage terminal sessions in the sandbox.

use anyhow::Result;
use clap::{Args, Subcommand};
use forgepad_common::protocol::rpc_methods::{
    TERMINAL_CLOSE, TERMINAL_CREATE, TERMINAL_LIST, TERMINAL_READ, TERMINAL_SELECT,
    TERMINAL_WRITE,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::commands::{block_on, connect};
use crate::output::{self, OutputFormat};

#[derive(Debug, Subcommand)]
pub enum TermCommand {
    /// List sessions
    List,
    /// Open a new session and make it active
    New,
    /// Send input to a session
    Write(WriteArgs),
    /// Print a session's buffered output
    Read(SessionArgs),
    /// Make a session active
    Select(SessionArgs),
    /// Close a session
    Close(SessionArgs),
}

#[derive(Debug, Args)]
pub struct SessionArgs {
    pub process_id: String,
}

#[derive(Debug, Args)]
pub struct WriteArgs {
    pub process_id: String,
    /// Input to send; a newline is appended unless `--raw` is given.
    pub data: String,
    #[arg(long)]
    pub raw: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionList {
    #[serde(default)]
    pub sessions: Vec<SessionInfo>,
    #[serde(default)]
    pub active: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub process_id: String,
    pub state: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub history_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOutput {
    pub process_id: String,
    pub state: String,
    #[serde(default)]
    pub output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveSession {
    #[serde(default)]
    pub process_id: Option<String>,
    #[serde(default)]
    pub active: Option<String>,
}

pub fn run(cmd: TermCommand, format: OutputFormat) -> Result<()> {
    match cmd {
        TermCommand::List => {
            let list: SessionList = block_on(call(TERMINAL_LIST, None))??;
            output::print_output(format, &list, format_list)?;
        }
        TermCommand::New => {
            let created: ActiveSession = block_on(call(TERMINAL_CREATE, None))??;
            output::print_output(format, &created, |created| {
                format!("Opened terminal {}", created.process_id.as_deref().unwrap_or("?"))
            })?;
        }
        TermCommand::Write(args) => {
            let data = input_line(args.data, args.raw);
            let params = json!({ "process_id": args.process_id, "data": data });
            let ack: Value = block_on(call(TERMINAL_WRITE, Some(params)))??;
            output::print_output(format, &ack, |_| "ok".to_string())?;
        }
        TermCommand::Read(args) => {
            let params = json!({ "process_id": args.process_id });
            let session: SessionOutput = block_on(call(TERMINAL_READ, Some(params)))??;
            output::print_output(format, &session, |session| session.output.clone())?;
        }
        TermCommand::Select(args) => {
            let params = json!({ "process_id": args.process_id });
            let selected: ActiveSession = block_on(call(TERMINAL_SELECT, Some(params)))??;
            output::print_output(format, &selected, format_active)?;
        }
        TermCommand::Close(args) => {
            let params = json!({ "process_id": args.process_id });
            let closed: ActiveSession = block_on(call(TERMINAL_CLOSE, Some(params)))??;
            output::print_output(format, &closed, format_active)?;
        }
    }
    Ok(())
}

async fn call<R>(method: &str, params: Option<Value>) -> Result<R>
where
    R: serde::de::DeserializeOwned,
{
    let client = connect().await?;
    client.call(method, params).await
}

fn input_line(data: String, raw: bool) -> String {
    if raw || data.ends_with('\n') {
        data
    } else {
        data + "\n"
    }
}

fn format_list(list: &SessionList) -> String {
    if list.sessions.is_empty() {
        return "No terminal sessions.".into();
    }

    list.sessions
        .iter()
        .map(|session| {
            let marker = if session.active { "*" } else { " " };
            format!(
                "{marker} {} {} ({} bytes buffered)",
                session.process_id, session.state, session.history_bytes
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_active(session: &ActiveSession) -> String {
    match &session.active {
        Some(active) => format!("Active terminal: {active}"),
        None => "No active terminal.".into(),
    }
}
