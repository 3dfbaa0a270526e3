// Artifact markup: file-mutation directives embedded in assistant output.
//
//   <artifact id="todo" title="Todo app">
//   <file path="src/main.ts">
//   ...content...
//   </file>
//   </artifact>
//
// The `<boltArtifact>` / `<boltAction type="file" filePath="...">` dialect is
// accepted as well.

mod parser;
mod scan;
mod stream;

pub use parser::{parse_artifacts, ArtifactHeader, ParseOutcome};
pub use stream::ArtifactStream;

use crate::types::Mutation;

/// Render mutations as one artifact block using the framing-newline
/// convention, so `parse_artifacts(serialize_artifact(..))` reproduces each
/// content byte for byte. Content containing a literal `</file>` cannot be
/// represented.
pub fn serialize_artifact(id: &str, title: Option<&str>, mutations: &[Mutation]) -> String {
    let mut out = format!("<artifact id=\"{}\"", escape_attribute(id));
    if let Some(title) = title {
        out.push_str(&format!(" title=\"{}\"", escape_attribute(title)));
    }
    out.push_str(">\n");
    for mutation in mutations {
        out.push_str(&format!("<file path=\"{}\">\n", escape_attribute(&mutation.path)));
        out.push_str(&mutation.content);
        out.push_str("\n</file>\n");
    }
    out.push_str("</artifact>");
    out
}

fn escape_attribute(value: &str) -> String {
    value.replace('&', "&amp;").replace('"', "&quot;").replace('<', "&lt;")
}
