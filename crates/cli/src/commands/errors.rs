// `forgepad errors` — list or dismiss queued errors.

use anyhow::{bail, Result};
use clap::Args;
use forgepad_common::protocol::rpc_methods::{ERRORS_CLEAR, ERRORS_LIST, ERRORS_REMOVE};
use forgepad_common::types::{ErrorRecord, Severity};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::commands::{block_on, connect};
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct ErrorsArgs {
    /// Dismiss the error at this queue index.
    #[arg(long, conflicts_with = "clear")]
    pub remove: Option<usize>,

    /// Dismiss every queued error.
    #[arg(long)]
    pub clear: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorsResult {
    #[serde(default)]
    pub errors: Vec<ErrorRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RemoveResult {
    removed: Option<ErrorRecord>,
}

pub fn run(args: ErrorsArgs, format: OutputFormat) -> Result<()> {
    let result = block_on(call_errors(args.remove, args.clear))??;
    output::print_output(format, &result, format_human)?;
    Ok(())
}

/// Apply the requested dismissal, then return the queue as it now stands.
async fn call_errors(remove: Option<usize>, clear: bool) -> Result<ErrorsResult> {
    let client = connect().await?;
    if let Some(index) = remove {
        let removed: RemoveResult =
            client.call(ERRORS_REMOVE, Some(json!({ "index": index }))).await?;
        if removed.removed.is_none() {
            bail!("no queued error at index {index}");
        }
    }
    if clear {
        client.call::<Value>(ERRORS_CLEAR, None).await?;
    }
    client.call(ERRORS_LIST, None).await
}

fn format_human(result: &ErrorsResult) -> String {
    if result.errors.is_empty() {
        return "No queued errors.".into();
    }

    let mut lines = Vec::new();
    for (index, error) in result.errors.iter().enumerate() {
        let severity = match error.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        };
        let repeats = if error.occurrence_count > 1 {
            format!(" (x{})", error.occurrence_count)
        } else {
            String::new()
        };
        lines.push(format!("[{index}] {severity} {}: {}{repeats}", error.code, error.message));
    }
    lines.join("\n")
}
