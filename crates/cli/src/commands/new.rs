// `forgepad new` — start a conversation and make it active.

use anyhow::Result;
use clap::Args;
use forgepad_common::protocol::rpc_methods::CONVERSATION_CREATE;
use serde::{Deserialize, Serialize};

use crate::commands::{block_on, connect};
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct NewArgs {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewResult {
    pub conversation_id: String,
}

pub fn run(_args: NewArgs, format: OutputFormat) -> Result<()> {
    let result = block_on(call_new())??;
    output::print_output(format, &result, format_human)?;
    Ok(())
}

async fn call_new() -> Result<NewResult> {
    let client = connect().await?;
    client.call(CONVERSATION_CREATE, None).await
}

fn format_human(result: &NewResult) -> String {
    format!("Started conversation {}", result.conversation_id)
}
