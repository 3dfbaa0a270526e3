// `forgepad cat` — print one workspace file.

use anyhow::{bail, Result};
use clap::Args;
use forgepad_common::protocol::rpc_methods::WORKSPACE_READ;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::commands::{block_on, connect};
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct CatArgs {
    /// Workspace-relative path.
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatResult {
    pub path: String,
    #[serde(default)]
    pub content: Option<String>,
    pub exists: bool,
}

pub fn run(args: CatArgs, format: OutputFormat) -> Result<()> {
    let result = block_on(call_read(args.path))??;
    if !result.exists {
        bail!("`{}` is not in the workspace", result.path);
    }
    output::print_output(format, &result, format_human)?;
    Ok(())
}

async fn call_read(path: String) -> Result<CatResult> {
    let client = connect().await?;
    client.call(WORKSPACE_READ, Some(json!({ "path": path }))).await
}

fn format_human(result: &CatResult) -> String {
    let content = result.content.as_deref().unwrap_or_default();
    content.strip_suffix('\n').unwrap_or(content).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_format_prints_raw_content() {
        let result = CatResult {
            path: "a.txt".into(),
            content: Some("line 1\nline 2\n".into()),
            exists: true,
        };
        // print_output appends the final newline.
        assert_eq!(format_human(&result), "line 1\nline 2");
    }

    #[test]
    fn decodes_missing_file() {
        let result: CatResult =
            serde_json::from_value(json!({ "path": "gone.txt", "content": null, "exists": false }))
                .expect("result should decode");
        assert!(!result.exists);
        assert_eq!(format_human(&result), "");
    }
}
