// `forgepad stream` — replay an assistant reply into the active conversation.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use forgepad_common::protocol::rpc_methods::{
    CHAT_ASSISTANT_CHUNK, CHAT_ASSISTANT_DONE, CHAT_USER_MESSAGE,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::client::DaemonClient;
use crate::commands::parse::{chunk_str, read_input};
use crate::commands::{block_on, connect};
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct StreamArgs {
    /// File holding the assistant reply; `-` reads stdin.
    pub file: PathBuf,

    /// Record this user message before the reply.
    #[arg(long)]
    pub prompt: Option<String>,

    /// Characters per streamed chunk (0 = one chunk).
    #[arg(long, default_value_t = 256)]
    pub chunk_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChunkApplied {
    mutations: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StreamFinished {
    message_id: String,
    mutations: usize,
    #[serde(default)]
    unparsed: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamReport {
    pub message_id: String,
    pub chunks: usize,
    pub mutations: usize,
    pub unparsed: String,
}

pub fn run(args: StreamArgs, format: OutputFormat) -> Result<()> {
    let text = read_input(&args.file)?;
    let report = block_on(stream_reply(text, args.prompt, args.chunk_size))??;
    if !report.unparsed.is_empty() {
        output::print_warning(
            format,
            "UNCLOSED_ARTIFACT",
            &format!("{} byte(s) at the end never closed", report.unparsed.len()),
        );
    }
    output::print_output(format, &report, format_human)?;
    Ok(())
}

async fn stream_reply(
    text: String,
    prompt: Option<String>,
    chunk_size: usize,
) -> Result<StreamReport> {
    let client = connect().await?;
    if let Some(prompt) = prompt {
        client.call::<Value>(CHAT_USER_MESSAGE, Some(json!({ "text": prompt }))).await?;
    }
    send_chunks(&client, &text, chunk_size).await
}

async fn send_chunks(
    client: &DaemonClient,
    text: &str,
    chunk_size: usize,
) -> Result<StreamReport> {
    let chunks = chunk_str(text, chunk_size);
    for chunk in &chunks {
        let applied: ChunkApplied =
            client.call(CHAT_ASSISTANT_CHUNK, Some(json!({ "chunk": chunk }))).await?;
        debug!(mutations = applied.mutations, "chunk applied");
    }
    let finished: StreamFinished = client.call(CHAT_ASSISTANT_DONE, None).await?;
    Ok(StreamReport {
        message_id: finished.message_id,
        chunks: chunks.len(),
        mutations: finished.mutations,
        unparsed: finished.unparsed,
    })
}

fn format_human(report: &StreamReport) -> String {
    format!(
        "Streamed {} chunk(s); {} file mutation(s) applied",
        report.chunks, report.mutations
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_format_counts_chunks_and_mutations() {
        let report = StreamReport {
            message_id: "m-1".into(),
            chunks: 3,
            mutations: 2,
            unparsed: String::new(),
        };
        assert_eq!(format_human(&report), "Streamed 3 chunk(s); 2 file mutation(s) applied");
    }

    #[test]
    fn decodes_finished_outcome() {
        let finished: StreamFinished = serde_json::from_value(json!({
            "type": "stream_finished",
            "message_id": "6a3e0b6c-0f4c-4d3e-9a65-9f1d6a1f0f10",
            "mutations": 1,
            "unparsed": ""
        }))
        .expect("outcome should decode");
        assert_eq!(finished.mutations, 1);
        assert!(finished.unparsed.is_empty());
    }
}
