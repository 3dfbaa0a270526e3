// `forgepad ls` — list files in the active workspace.

use anyhow::Result;
use clap::Args;
use forgepad_common::protocol::rpc_methods::WORKSPACE_FILES;
use serde::{Deserialize, Serialize};

use crate::commands::{block_on, connect};
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct LsArgs {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LsResult {
    pub conversation_id: String,
    #[serde(default)]
    pub files: Vec<FileEntry>,
    #[serde(default)]
    pub selected_path: Option<String>,
    #[serde(default)]
    pub project_root: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub bytes: usize,
}

pub fn run(_args: LsArgs, format: OutputFormat) -> Result<()> {
    let result = block_on(call_ls())??;
    output::print_output(format, &result, format_human)?;
    Ok(())
}

async fn call_ls() -> Result<LsResult> {
    let client = connect().await?;
    client.call(WORKSPACE_FILES, None).await
}

fn format_human(result: &LsResult) -> String {
    if result.files.is_empty() {
        return format!("No files in conversation {}.", result.conversation_id);
    }

    let mut lines = Vec::new();
    lines.push(format!("{} file(s) in {}", result.files.len(), result.conversation_id));
    for file in &result.files {
        let marker =
            if result.selected_path.as_deref() == Some(file.path.as_str()) { "*" } else { " " };
        lines.push(format!("{marker} {} ({} bytes)", file.path, file.bytes));
    }
    lines.join("\n")
}
