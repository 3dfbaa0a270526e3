// `forgepad status` — sandbox, sync and persistence health.

use anyhow::Result;
use clap::Args;
use forgepad_common::protocol::rpc_methods::{PROJECT_STATUS, SANDBOX_UNBLOCK};
use forgepad_common::types::ProjectRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::commands::{block_on, connect};
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Clear a latched sandbox failure before reporting.
    #[arg(long)]
    pub unblock: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResult {
    pub gateway: String,
    pub bridge: BridgeState,
    pub sandbox: SandboxPhase,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub project: Option<ProjectRecord>,
    #[serde(default)]
    pub errors_queued: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeState {
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxPhase {
    pub phase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub fn run(args: StatusArgs, format: OutputFormat) -> Result<()> {
    let result = block_on(call_status(args.unblock))??;
    output::print_output(format, &result, format_human)?;
    Ok(())
}

async fn call_status(unblock: bool) -> Result<StatusResult> {
    let client = connect().await?;
    if unblock {
        client.call::<Value>(SANDBOX_UNBLOCK, None).await?;
    }
    client.call(PROJECT_STATUS, None).await
}

fn with_reason(label: &str, reason: Option<&str>) -> String {
    match reason {
        Some(reason) => format!("{label} ({reason})"),
        None => label.to_string(),
    }
}

fn format_human(result: &StatusResult) -> String {
    let mut lines = Vec::new();
    lines.push(format!(
        "conversation: {}",
        result.conversation_id.as_deref().unwrap_or("(none)")
    ));
    if let Some(project) = &result.project {
        lines.push(format!("project:      {} ({})", project.name, project.id));
    }
    lines.push(format!(
        "sandbox:      {}",
        with_reason(&result.sandbox.phase, result.sandbox.reason.as_deref())
    ));
    lines.push(format!(
        "sync:         {}",
        with_reason(&result.bridge.state, result.bridge.reason.as_deref())
    ));
    lines.push(format!("persistence:  {}", result.gateway));
    lines.push(format!("errors:       {} queued", result.errors_queued));
    lines.join("\n")
}
