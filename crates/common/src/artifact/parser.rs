use serde::{Deserialize, Serialize};

use crate::path::{is_denylisted, normalize_path};
use crate::types::{Mutation, MutationBatch};

use super::scan::{attribute, next_tag, parse_attributes, tag_end, TagHit};

const BLOCK_TAGS: &[&str] = &["artifact", "boltArtifact"];
const BLOCK_CLOSERS: &[&str] = &["</artifact>", "</boltArtifact>"];
const DIRECTIVE_TAGS: &[&str] = &["file", "boltAction"];
const DIRECTIVE_CLOSERS: &[&str] = &["</file>", "</boltAction>"];

/// Identity of a fully closed artifact block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactHeader {
    pub id: String,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseOutcome {
    /// Mutations from every closed block, in document order.
    pub mutations: MutationBatch,
    /// Closed blocks that carried an id, in document order.
    pub artifacts: Vec<ArtifactHeader>,
    /// Unconsumed suffix: starts at the first unclosed block, or at a tail
    /// that may still grow into a block start tag.
    pub trailing_text: String,
}

enum Block {
    Closed { end: usize, header: Option<ArtifactHeader>, mutations: MutationBatch },
    Incomplete,
}

/// Extract file mutations from (possibly truncated) assistant text.
///
/// Only blocks whose end marker has arrived produce mutations. Feeding
/// `trailing_text + next_chunk` back in yields exactly the mutations a
/// single pass over the whole text would, with nothing emitted twice.
/// Never fails: malformed directives are skipped.
pub fn parse_artifacts(text: &str) -> ParseOutcome {
    let mut outcome = ParseOutcome::default();
    let mut cursor = 0;

    loop {
        match next_tag(text, cursor, BLOCK_TAGS, &[]) {
            None => break,
            Some(TagHit::Partial { start }) => {
                outcome.trailing_text = text[start..].to_string();
                break;
            }
            Some(TagHit::Open { start, name_index }) => match parse_block(text, start, name_index) {
                Block::Incomplete => {
                    outcome.trailing_text = text[start..].to_string();
                    break;
                }
                Block::Closed { end, header, mutations } => {
                    if let Some(header) = header {
                        outcome.artifacts.push(header);
                        outcome.mutations.extend(mutations);
                    }
                    cursor = end;
                }
            },
            Some(TagHit::Close { end, .. }) => cursor = end,
        }
    }

    outcome
}

fn parse_block(text: &str, start: usize, name_index: usize) -> Block {
    let Some(open_end) = tag_end(text, start) else {
        return Block::Incomplete;
    };
    let tag_source = &text[start + 1 + BLOCK_TAGS[name_index].len()..open_end];
    let attributes = parse_attributes(tag_source);
    let header = attribute(&attributes, "id").filter(|id| !id.trim().is_empty()).map(|id| {
        ArtifactHeader {
            id: id.to_string(),
            title: attribute(&attributes, "title").map(str::to_string),
        }
    });

    if tag_source.trim_end().ends_with('/') {
        return Block::Closed { end: open_end + 1, header, mutations: Vec::new() };
    }

    let closer = BLOCK_CLOSERS[name_index];
    let mut mutations = Vec::new();
    let mut cursor = open_end + 1;

    loop {
        match next_tag(text, cursor, DIRECTIVE_TAGS, &[closer]) {
            None | Some(TagHit::Partial { .. }) => return Block::Incomplete,
            Some(TagHit::Close { end, .. }) => {
                return Block::Closed { end, header, mutations };
            }
            Some(TagHit::Open { start, name_index }) => {
                let Some(directive_end) = tag_end(text, start) else {
                    return Block::Incomplete;
                };
                let tag_source = &text[start + 1 + DIRECTIVE_TAGS[name_index].len()..directive_end];
                let attributes = parse_attributes(tag_source);

                let body = if tag_source.trim_end().ends_with('/') {
                    cursor = directive_end + 1;
                    ""
                } else {
                    let directive_closer = DIRECTIVE_CLOSERS[name_index];
                    let body_start = directive_end + 1;
                    let Some(offset) = text[body_start..].find(directive_closer) else {
                        return Block::Incomplete;
                    };
                    cursor = body_start + offset + directive_closer.len();
                    strip_framing_newlines(&text[body_start..body_start + offset])
                };

                if let Some(mutation) = directive_mutation(DIRECTIVE_TAGS[name_index], &attributes, body) {
                    mutations.push(mutation);
                }
            }
        }
    }
}

fn directive_mutation(tag: &str, attributes: &[(String, String)], body: &str) -> Option<Mutation> {
    if tag == "boltAction" && attribute(attributes, "type") != Some("file") {
        return None;
    }
    let raw_path = attribute(attributes, "filePath").or_else(|| attribute(attributes, "path"))?;
    let path = normalize_path(raw_path).ok()?;
    if is_denylisted(&path) {
        return None;
    }
    Some(Mutation { path, content: body.to_string() })
}

fn strip_framing_newlines(body: &str) -> &str {
    let body = body.strip_prefix('\n').unwrap_or(body);
    body.strip_suffix('\n').unwrap_or(body)
}
