// `forgepad parse` — run the artifact parser offline over a saved reply.

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use forgepad_common::artifact::{ArtifactHeader, ArtifactStream};
use forgepad_common::types::Mutation;
use serde::{Deserialize, Serialize};

use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct ParseArgs {
    /// File holding the assistant reply; `-` reads stdin.
    pub file: PathBuf,

    /// Feed the parser this many characters at a time (0 = whole file).
    #[arg(long, default_value_t = 0)]
    pub chunk_size: usize,

    /// Include file contents in human output.
    #[arg(long)]
    pub content: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParseReport {
    pub chunks: usize,
    pub artifacts: Vec<ArtifactHeader>,
    pub mutations: Vec<Mutation>,
    /// Text left over when the input ended inside an unclosed block.
    pub unparsed: String,
}

pub fn run(args: ParseArgs, format: OutputFormat) -> Result<()> {
    let text = read_input(&args.file)?;
    let report = parse_text(&text, args.chunk_size);
    if !report.unparsed.is_empty() {
        output::print_warning(
            format,
            "UNCLOSED_ARTIFACT",
            &format!("{} byte(s) at the end never closed", report.unparsed.len()),
        );
    }
    let show_content = args.content;
    output::print_output(format, &report, |report| format_human(report, show_content))?;
    Ok(())
}

pub(crate) fn read_input(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut text = String::new();
        std::io::stdin().read_to_string(&mut text).context("failed to read stdin")?;
        return Ok(text);
    }
    std::fs::read_to_string(path).with_context(|| format!("failed to read `{}`", path.display()))
}

pub fn parse_text(text: &str, chunk_size: usize) -> ParseReport {
    let mut stream = ArtifactStream::new();
    let mut mutations = Vec::new();
    let chunks = chunk_str(text, chunk_size);
    for chunk in &chunks {
        mutations.extend(stream.push(chunk));
    }
    let artifacts = stream.artifacts().to_vec();
    ParseReport { chunks: chunks.len(), artifacts, mutations, unparsed: stream.finish() }
}

/// Split `text` into pieces of at most `size` characters. Zero keeps it whole.
pub(crate) fn chunk_str(text: &str, size: usize) -> Vec<&str> {
    if size == 0 || text.is_empty() {
        return vec![text];
    }
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut count = 0;
    for (offset, _) in text.char_indices() {
        if count == size {
            chunks.push(&text[start..offset]);
            start = offset;
            count = 0;
        }
        count += 1;
    }
    chunks.push(&text[start..]);
    chunks
}

fn format_human(report: &ParseReport, show_content: bool) -> String {
    if report.mutations.is_empty() {
        return "No file mutations found.".into();
    }

    let mut lines = Vec::new();
    lines.push(format!(
        "{} mutation(s) from {} artifact(s) in {} chunk(s)",
        report.mutations.len(),
        report.artifacts.len(),
        report.chunks
    ));
    for artifact in &report.artifacts {
        match &artifact.title {
            Some(title) => lines.push(format!("artifact {} ({title})", artifact.id)),
            None => lines.push(format!("artifact {}", artifact.id)),
        }
    }
    for mutation in &report.mutations {
        lines.push(format!("  {} ({} bytes)", mutation.path, mutation.content.len()));
        if show_content {
            for line in mutation.content.lines() {
                lines.push(format!("    | {line}"));
            }
        }
    }
    lines.join("\n")
}
