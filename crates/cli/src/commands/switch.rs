// `forgepad switch` — make an existing conversation active.

use anyhow::Result;
use clap::Args;
use forgepad_common::protocol::rpc_methods::CONVERSATION_SWITCH;
use forgepad_common::types::ProjectRecord;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::commands::{block_on, connect};
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct SwitchArgs {
    /// Conversation to activate. Unknown ids start an empty workspace.
    pub conversation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchResult {
    pub conversation_id: String,
    /// Project bound to the conversation, when the backend knows one.
    #[serde(default)]
    pub project: Option<ProjectRecord>,
}

pub fn run(args: SwitchArgs, format: OutputFormat) -> Result<()> {
    let result = block_on(call_switch(args.conversation_id))??;
    output::print_output(format, &result, format_human)?;
    Ok(())
}

async fn call_switch(conversation_id: String) -> Result<SwitchResult> {
    let client = connect().await?;
    client.call(CONVERSATION_SWITCH, Some(json!({ "conversation_id": conversation_id }))).await
}

fn format_human(result: &SwitchResult) -> String {
    match &result.project {
        Some(project) => format!(
            "Switched to {} ({}, {} message(s), {} file(s))",
            result.conversation_id,
            project.name,
            project.chat_messages.len(),
            project.builder_state.files.len()
        ),
        None => format!("Switched to {} (no saved project)", result.conversation_id),
    }
}
