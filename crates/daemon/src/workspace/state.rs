// Per-conversation workspace: files, the prior-turn snapshot, and resync bookkeeping.

use std::collections::{BTreeMap, BTreeSet};

use forgepad_common::diff::{diff_workspaces, FileChange};
use forgepad_common::path::normalize::is_within;
use forgepad_common::types::{BuilderState, Mutation, SyncOrigin};
use serde::Serialize;

/// Content seeded into empty folders so they exist as files.
pub const FOLDER_PLACEHOLDER: &str = ".gitkeep";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkspaceState {
    pub files: BTreeMap<String, String>,
    /// Files as of the previous assistant turn. Replaced wholesale.
    pub prior_snapshot: BTreeMap<String, String>,
    /// Paths written by a turn's first payload and not yet synced.
    pub needs_initial_sync: BTreeMap<String, bool>,
    /// Paths edited after their first sync. Never set while the same path
    /// is still pending its initial sync.
    pub needs_incremental_sync: BTreeMap<String, bool>,
    /// Paths removed since the last sync; the sandbox must delete them.
    pub pending_removals: BTreeSet<String>,
    pub selected_path: Option<String>,
    pub project_root: Option<String>,
}

impl WorkspaceState {
    pub fn from_builder_state(builder: BuilderState) -> Self {
        Self {
            files: builder.files,
            selected_path: builder.selected_path,
            project_root: builder.project_root,
            ..Self::default()
        }
    }

    pub fn to_builder_state(&self) -> BuilderState {
        BuilderState {
            files: self.files.clone(),
            selected_path: self.selected_path.clone(),
            project_root: self.project_root.clone(),
        }
    }

    /// Write already-normalized mutations in order. Returns the touched paths,
    /// deduplicated, in first-touch order.
    pub fn apply_mutations(&mut self, batch: &[Mutation], origin: SyncOrigin) -> Vec<String> {
        let mut touched: Vec<String> = Vec::new();
        for mutation in batch {
            self.write(&mutation.path, mutation.content.clone(), origin);
            if !touched.contains(&mutation.path) {
                touched.push(mutation.path.clone());
            }
        }
        touched
    }

    pub(crate) fn write(&mut self, path: &str, content: String, origin: SyncOrigin) {
        self.files.insert(path.to_string(), content);
        self.pending_removals.remove(path);
        match origin {
            SyncOrigin::Initial => {
                self.needs_initial_sync.insert(path.to_string(), true);
                self.needs_incremental_sync.remove(path);
            }
            SyncOrigin::Incremental => self.mark_incremental(path),
        }
    }

    fn mark_incremental(&mut self, path: &str) {
        let pending_initial = self.needs_initial_sync.get(path).copied().unwrap_or(false);
        if pending_initial {
            self.needs_incremental_sync.remove(path);
        } else {
            self.needs_incremental_sync.insert(path.to_string(), true);
        }
    }

    pub fn content(&self, path: &str) -> String {
        self.files.get(path).cloned().unwrap_or_default()
    }

    /// Paths equal to `prefix` or nested under `prefix/`.
    pub fn paths_within(&self, prefix: &str) -> Vec<String> {
        self.files.keys().filter(|path| is_within(path, prefix)).cloned().collect()
    }

    /// Move a file, or every file under a folder prefix. Returns `(old, new)` pairs.
    pub fn rename(&mut self, old_prefix: &str, new_prefix: &str) -> Vec<(String, String)> {
        let moves: Vec<(String, String)> = self
            .paths_within(old_prefix)
            .into_iter()
            .map(|old| {
                let new = format!("{new_prefix}{}", &old[old_prefix.len()..]);
                (old, new)
            })
            .collect();

        for (old, new) in &moves {
            let Some(content) = self.files.remove(old) else {
                continue;
            };
            let pending_initial = self.needs_initial_sync.remove(old).unwrap_or(false);
            self.needs_incremental_sync.remove(old);
            self.pending_removals.insert(old.clone());

            let origin = if pending_initial { SyncOrigin::Initial } else { SyncOrigin::Incremental };
            self.write(new, content, origin);

            if self.selected_path.as_deref() == Some(old.as_str()) {
                self.selected_path = Some(new.clone());
            }
        }
        moves
    }

    /// Delete `prefix` and everything nested under it. Returns removed paths.
    pub fn delete(&mut self, prefix: &str) -> Vec<String> {
        let removed = self.paths_within(prefix);
        for path in &removed {
            self.files.remove(path);
            self.needs_initial_sync.remove(path);
            self.needs_incremental_sync.remove(path);
            self.pending_removals.insert(path.clone());
        }
        if self.selected_path.as_deref().is_some_and(|selected| is_within(selected, prefix)) {
            self.selected_path = None;
        }
        removed
    }

    /// Seed `{folder}/.gitkeep` unless something already lives under `folder/`.
    pub fn create_folder(&mut self, folder: &str) -> Option<String> {
        let prefix = format!("{folder}/");
        if self.files.keys().any(|path| path.starts_with(&prefix)) {
            return None;
        }
        let placeholder = format!("{folder}/{FOLDER_PLACEHOLDER}");
        self.write(&placeholder, String::new(), SyncOrigin::Incremental);
        Some(placeholder)
    }

    pub fn reset_sync_flags(&mut self) {
        self.needs_initial_sync.clear();
        self.needs_incremental_sync.clear();
        self.pending_removals.clear();
    }

    /// Clear only the bookkeeping a mount of `mounted` satisfied. Flags for
    /// paths whose content moved on, and removals recorded after `mounted`
    /// was read, stay pending for the next pass.
    pub fn settle_mounted(&mut self, mounted: &WorkspaceState) {
        let files = &self.files;
        let written = |path: &String| {
            mounted.files.get(path).is_some_and(|content| files.get(path) == Some(content))
        };
        self.needs_initial_sync.retain(|path, _| !written(path));
        self.needs_incremental_sync.retain(|path, _| !written(path));
        self.pending_removals
            .retain(|path| !mounted.pending_removals.contains(path) || files.contains_key(path));
    }

    pub fn diff_against_prior(&self) -> Vec<FileChange> {
        diff_workspaces(&self.prior_snapshot, &self.files)
    }
}
