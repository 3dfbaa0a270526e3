// `forgepad diff` — show what changed since the previous assistant turn.

use anyhow::Result;
use clap::Args;
use forgepad_common::diff::{ChangeKind, FileChange};
use forgepad_common::protocol::rpc_methods::WORKSPACE_DIFF;
use serde::{Deserialize, Serialize};

use crate::commands::{block_on, connect};
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct DiffArgs {
    /// Only show this path.
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffResult {
    #[serde(default)]
    pub changes: Vec<FileChange>,
}

pub fn run(args: DiffArgs, format: OutputFormat) -> Result<()> {
    let mut result = block_on(call_diff())??;
    if let Some(path) = args.path.as_deref() {
        let path = path.trim_start_matches("./");
        result.changes.retain(|change| change.path == path);
    }
    output::print_output(format, &result, format_human)?;
    Ok(())
}

async fn call_diff() -> Result<DiffResult> {
    let client = connect().await?;
    client.call(WORKSPACE_DIFF, None).await
}

fn format_human(result: &DiffResult) -> String {
    if result.changes.is_empty() {
        return "No changes since the previous turn.".into();
    }

    let mut lines = Vec::new();
    for change in &result.changes {
        let marker = match change.kind {
            ChangeKind::Added => "A",
            ChangeKind::Modified => "M",
            ChangeKind::Deleted => "D",
        };
        lines.push(format!(
            "{marker} {} +{} -{}",
            change.path, change.added_lines, change.removed_lines
        ));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_result() -> DiffResult {
        DiffResult {
            changes: vec![
                FileChange {
                    path: "index.html".into(),
                    kind: ChangeKind::Modified,
                    added_lines: 5,
                    removed_lines: 2,
                },
                FileChange {
                    path: "old.css".into(),
                    kind: ChangeKind::Deleted,
                    added_lines: 0,
                    removed_lines: 9,
                },
            ],
        }
    }

    #[test]
    fn human_format_shows_changes() {
        let output = format_human(&sample_result());
        assert!(output.contains("M index.html +5 -2"));
        assert!(output.contains("D old.css +0 -9"));
    }

    #[test]
    fn human_format_no_changes() {
        let result = DiffResult { changes: vec![] };
        assert!(format_human(&result).contains("No changes"));
    }

    #[test]
    fn json_format_roundtrips() {
        let mut buf = Vec::new();
        output::write_output(&mut buf, OutputFormat::Json, &sample_result(), format_human)
            .expect("json output should be written");
        let parsed: DiffResult = serde_json::from_slice(&buf).expect("result should decode");
        assert_eq!(parsed.changes, sample_result().changes);
    }
}
