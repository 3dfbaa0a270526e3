use crate::types::MutationBatch;

use super::parser::{parse_artifacts, ArtifactHeader};

/// Incremental parser state for one assistant message.
///
/// Each pushed chunk is appended to the carried-over `trailing_text` and
/// re-parsed, so a block split across any number of chunks is emitted once,
/// when its end marker arrives.
#[derive(Debug, Default)]
pub struct ArtifactStream {
    carry: String,
    artifacts: Vec<ArtifactHeader>,
}

impl ArtifactStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) -> MutationBatch {
        self.carry.push_str(chunk);
        let outcome = parse_artifacts(&self.carry);
        self.carry = outcome.trailing_text;
        self.artifacts.extend(outcome.artifacts);
        outcome.mutations
    }

    /// Text still waiting for more input.
    pub fn pending(&self) -> &str {
        &self.carry
    }

    /// Closed blocks seen so far.
    pub fn artifacts(&self) -> &[ArtifactHeader] {
        &self.artifacts
    }

    /// Ends the message, returning whatever never closed.
    pub fn finish(self) -> String {
        self.carry
    }
}
