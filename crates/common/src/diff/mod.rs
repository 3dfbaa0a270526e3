// Workspace diffs: what changed between the prior snapshot and the live files.

pub mod lines;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use lines::{diff_lines, LineEdit, LineStats};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

/// One changed path between two workspace snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileChange {
    pub path: String,
    pub kind: ChangeKind,
    pub added_lines: usize,
    pub removed_lines: usize,
}

/// Compare two path → content maps. Unchanged paths are omitted; output is
/// sorted by path.
pub fn diff_workspaces<'a, P, C>(prior: P, current: C) -> Vec<FileChange>
where
    P: IntoIterator<Item = (&'a String, &'a String)>,
    C: IntoIterator<Item = (&'a String, &'a String)>,
{
    let prior: BTreeMap<&str, &str> = prior
        .into_iter()
        .map(|(path, content)| (path.as_str(), content.as_str()))
        .collect();
    let current: BTreeMap<&str, &str> = current
        .into_iter()
        .map(|(path, content)| (path.as_str(), content.as_str()))
        .collect();

    let mut changes = Vec::new();
    for (path, new_content) in &current {
        match prior.get(path) {
            None => {
                let stats = LineStats::of(&diff_lines("", new_content));
                changes.push(FileChange {
                    path: (*path).to_string(),
                    kind: ChangeKind::Added,
                    added_lines: stats.added,
                    removed_lines: 0,
                });
            }
            Some(old_content) if old_content != new_content => {
                let stats = LineStats::of(&diff_lines(old_content, new_content));
                changes.push(FileChange {
                    path: (*path).to_string(),
                    kind: ChangeKind::Modified,
                    added_lines: stats.added,
                    removed_lines: stats.removed,
                });
            }
            Some(_) => {}
        }
    }
    for (path, old_content) in &prior {
        if !current.contains_key(path) {
            let stats = LineStats::of(&diff_lines(old_content, ""));
            changes.push(FileChange {
                path: (*path).to_string(),
                kind: ChangeKind::Deleted,
                added_lines: 0,
                removed_lines: stats.removed,
            });
        }
    }

    changes.sort_by(|a, b| a.path.cmp(&b.path));
    changes
}
