// Chat workspace store: one isolated workspace per conversation, an active
// pointer, and a shared error queue. Mutations raise `WorkspaceEvent`s for
// the sync bridge and autosave; nothing here performs I/O.

pub mod errors;
pub mod registry;
pub mod state;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use forgepad_common::diff::FileChange;
use forgepad_common::path::{is_denylisted, normalize_path, PathError};
use forgepad_common::types::{
    BuilderState, ConversationId, ErrorRecord, ErrorSignal, Mutation, ProcessId, SyncOrigin,
};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

pub use errors::{ErrorQueue, PushOutcome};
pub use registry::WorkspaceRegistry;
pub use state::WorkspaceState;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkspaceEvent {
    FilesChanged { conversation_id: ConversationId, paths: Vec<String> },
    Switched { previous: Option<ConversationId>, current: ConversationId },
    /// The whole workspace was replaced by a bulk load.
    Replaced { conversation_id: ConversationId },
    Cleared { conversation_id: ConversationId },
    /// Selection, project root or prior snapshot changed; files did not.
    StateChanged { conversation_id: ConversationId },
    ErrorsChanged,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkspaceError {
    #[error("invalid path: {0}")]
    InvalidPath(#[from] PathError),
    #[error("path is excluded from workspaces: {0}")]
    Denylisted(String),
    #[error("no file or folder at `{0}`")]
    NotFound(String),
    #[error("`{0}` already exists")]
    AlreadyExists(String),
}

#[derive(Clone)]
pub struct ChatWorkspaceStore {
    inner: Arc<StdMutex<WorkspaceRegistry>>,
    events: broadcast::Sender<WorkspaceEvent>,
}

/// Suppresses error-queue pushes while history is replayed. Released on drop.
pub struct BulkLoadGuard {
    store: ChatWorkspaceStore,
}

impl Drop for BulkLoadGuard {
    fn drop(&mut self) {
        self.store.lock().exit_bulk_load();
    }
}

impl ChatWorkspaceStore {
    pub fn new(error_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { inner: Arc::new(StdMutex::new(WorkspaceRegistry::new(error_capacity))), events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkspaceEvent> {
        self.events.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, WorkspaceRegistry> {
        self.inner.lock().expect("workspace registry lock poisoned")
    }

    fn emit(&self, event: WorkspaceEvent) {
        // No receivers is fine: nothing is listening yet.
        let _ = self.events.send(event);
    }

    // ── Active conversation ────────────────────────────────────────

    pub fn active_id(&self) -> Option<ConversationId> {
        self.lock().active_id().cloned()
    }

    pub fn is_active(&self, id: &ConversationId) -> bool {
        self.lock().is_active(id)
    }

    /// Swap the active workspace, creating an empty one for unknown ids.
    /// Returns true when a workspace was created.
    pub fn switch_conversation(&self, id: ConversationId) -> bool {
        let (previous, created) = self.lock().switch_to(id.clone());
        if previous.as_ref() != Some(&id) {
            debug!(conversation_id = %id, created, "switched active workspace");
            self.emit(WorkspaceEvent::Switched { previous, current: id });
        }
        created
    }

    /// Destroy a conversation's workspace.
    pub fn clear_conversation(&self, id: &ConversationId) -> bool {
        let removed = self.lock().remove(id).is_some();
        if removed {
            self.emit(WorkspaceEvent::Cleared { conversation_id: id.clone() });
        }
        removed
    }

    /// Replace a conversation's workspace with a persisted snapshot. Sync
    /// bookkeeping starts clean; every file is pending its initial sync.
    pub fn replace_workspace(&self, id: &ConversationId, builder: BuilderState) {
        let mut state = WorkspaceState::from_builder_state(builder);
        state.needs_initial_sync = state.files.keys().map(|path| (path.clone(), true)).collect();
        state.prior_snapshot = state.files.clone();
        self.lock().replace(id.clone(), state);
        self.emit(WorkspaceEvent::Replaced { conversation_id: id.clone() });
    }

    pub fn conversation_ids(&self) -> Vec<ConversationId> {
        self.lock().conversation_ids()
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub fn active_state(&self) -> Option<WorkspaceState> {
        self.lock().active().cloned()
    }

    pub fn state_of(&self, id: &ConversationId) -> Option<WorkspaceState> {
        self.lock().get(id).cloned()
    }

    /// Empty string when absent or no conversation is active.
    pub fn get_content(&self, path: &str) -> String {
        let Ok(path) = normalize_path(path) else {
            return String::new();
        };
        self.lock().active().map(|state| state.content(&path)).unwrap_or_default()
    }

    pub fn files(&self) -> BTreeMap<String, String> {
        self.lock().active().map(|state| state.files.clone()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().active().map_or(true, |state| state.files.is_empty())
    }

    pub fn builder_state(&self, id: &ConversationId) -> Option<BuilderState> {
        self.lock().get(id).map(WorkspaceState::to_builder_state)
    }

    pub fn diff_against_prior(&self) -> Vec<FileChange> {
        self.lock().active().map(WorkspaceState::diff_against_prior).unwrap_or_default()
    }

    // ── Mutations (active conversation only) ───────────────────────

    /// Apply a batch in order. Paths are re-normalized; denylisted or invalid
    /// paths are dropped. Returns how many mutations were applied.
    pub fn apply_mutation_batch(&self, batch: &[Mutation], origin: SyncOrigin) -> usize {
        let accepted: Vec<Mutation> = batch
            .iter()
            .filter_map(|mutation| {
                let path = normalize_path(&mutation.path).ok()?;
                (!is_denylisted(&path)).then(|| Mutation { path, content: mutation.content.clone() })
            })
            .collect();
        if accepted.is_empty() {
            return 0;
        }

        let changed = {
            let mut registry = self.lock();
            let Some((id, state)) = registry.active_mut() else {
                return 0;
            };
            let paths = state.apply_mutations(&accepted, origin);
            (id.clone(), paths)
        };
        debug!(conversation_id = %changed.0, count = accepted.len(), ?origin, "applied mutation batch");
        self.emit(WorkspaceEvent::FilesChanged { conversation_id: changed.0, paths: changed.1 });
        accepted.len()
    }

    /// A user edit to one file.
    pub fn update_file(&self, path: &str, content: String) -> Result<bool, WorkspaceError> {
        let path = checked_path(path)?;
        self.mutate_active(|state| {
            state.write(&path, content, SyncOrigin::Incremental);
            Ok(vec![path.clone()])
        })
        .map(|changed| changed.is_some())
    }

    pub fn rename(&self, old_path: &str, new_path: &str) -> Result<bool, WorkspaceError> {
        let old_path = normalize_path(old_path)?;
        let new_path = checked_path(new_path)?;
        self.mutate_active(|state| {
            if state.paths_within(&old_path).is_empty() {
                return Err(WorkspaceError::NotFound(old_path.clone()));
            }
            if old_path == new_path
                || forgepad_common::path::normalize::is_within(&new_path, &old_path)
                || !state.paths_within(&new_path).is_empty()
            {
                return Err(WorkspaceError::AlreadyExists(new_path.clone()));
            }
            let moves = state.rename(&old_path, &new_path);
            Ok(moves.into_iter().flat_map(|(old, new)| [old, new]).collect())
        })
        .map(|changed| changed.is_some())
    }

    /// Delete a file, or a folder and everything nested under it. Returns
    /// the number of files removed.
    pub fn delete(&self, path: &str) -> Result<usize, WorkspaceError> {
        let path = normalize_path(path)?;
        self.mutate_active(|state| {
            let removed = state.delete(&path);
            if removed.is_empty() {
                return Err(WorkspaceError::NotFound(path.clone()));
            }
            Ok(removed)
        })
        .map(|changed| changed.map_or(0, |paths| paths.len()))
    }

    /// No-op (returns false) when the folder already has contents.
    pub fn create_folder(&self, path: &str) -> Result<bool, WorkspaceError> {
        let path = checked_path(path)?;
        self.mutate_active(|state| Ok(state.create_folder(&path).into_iter().collect()))
            .map(|changed| changed.is_some())
    }

    pub fn select_path(&self, path: Option<&str>) -> Result<(), WorkspaceError> {
        let path = path.map(normalize_path).transpose()?;
        self.update_active(|state| replace_if_changed(&mut state.selected_path, path));
        Ok(())
    }

    pub fn set_project_root(&self, root: Option<String>) {
        self.update_active(|state| replace_if_changed(&mut state.project_root, root));
    }

    /// Clears the active workspace's sync bookkeeping.
    pub fn reset_sync_flags(&self) {
        if let Some((_, state)) = self.lock().active_mut() {
            state.reset_sync_flags();
        }
    }

    /// After a mount of `mounted` for `id`, clear what that pass synced.
    pub fn settle_mount(&self, id: &ConversationId, mounted: &WorkspaceState) {
        if let Some(state) = self.lock().get_mut(id) {
            state.settle_mounted(mounted);
        }
    }

    /// Store a read-only copy for diff views; replaces the previous one.
    pub fn snapshot_prior(&self, files: BTreeMap<String, String>) {
        self.update_active(|state| replace_if_changed(&mut state.prior_snapshot, files));
    }

    /// Snapshot the live files as the prior state (start of an assistant turn).
    pub fn snapshot_prior_from_live(&self) {
        self.update_active(|state| {
            let files = state.files.clone();
            replace_if_changed(&mut state.prior_snapshot, files)
        });
    }

    /// Apply a non-file change to the active workspace; `apply` reports
    /// whether anything changed.
    fn update_active<F>(&self, apply: F)
    where
        F: FnOnce(&mut WorkspaceState) -> bool,
    {
        let conversation_id = {
            let mut registry = self.lock();
            let Some((id, state)) = registry.active_mut() else {
                return;
            };
            if !apply(state) {
                return;
            }
            id.clone()
        };
        self.emit(WorkspaceEvent::StateChanged { conversation_id });
    }

    fn mutate_active<F>(&self, apply: F) -> Result<Option<Vec<String>>, WorkspaceError>
    where
        F: FnOnce(&mut WorkspaceState) -> Result<Vec<String>, WorkspaceError>,
    {
        let (id, paths) = {
            let mut registry = self.lock();
            let Some((id, state)) = registry.active_mut() else {
                return Ok(None);
            };
            let paths = apply(state)?;
            (id.clone(), paths)
        };
        if paths.is_empty() {
            return Ok(None);
        }
        self.emit(WorkspaceEvent::FilesChanged { conversation_id: id, paths: paths.clone() });
        Ok(Some(paths))
    }

    // ── Error queue ────────────────────────────────────────────────

    /// Queue an error. Ignored while a bulk load is in progress.
    pub fn push_error(&self, signal: ErrorSignal, process_id: Option<ProcessId>) -> Option<PushOutcome> {
        let outcome = {
            let mut registry = self.lock();
            if registry.is_bulk_loading() {
                return None;
            }
            registry.errors.push(signal, process_id)
        };
        self.emit(WorkspaceEvent::ErrorsChanged);
        Some(outcome)
    }

    pub fn remove_error(&self, index: usize) -> Option<ErrorRecord> {
        let removed = self.lock().errors.remove(index);
        if removed.is_some() {
            self.emit(WorkspaceEvent::ErrorsChanged);
        }
        removed
    }

    pub fn clear_errors(&self) {
        self.lock().errors.clear();
        self.emit(WorkspaceEvent::ErrorsChanged);
    }

    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.lock().errors.records()
    }

    pub fn begin_bulk_load(&self) -> BulkLoadGuard {
        self.lock().enter_bulk_load();
        BulkLoadGuard { store: self.clone() }
    }

    pub fn is_bulk_loading(&self) -> bool {
        self.lock().is_bulk_loading()
    }
}

fn checked_path(path: &str) -> Result<String, WorkspaceError> {
    let path = normalize_path(path)?;
    if is_denylisted(&path) {
        return Err(WorkspaceError::Denylisted(path));
    }
    Ok(path)
}

fn replace_if_changed<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use forgepad_common::types::Severity;

    fn mutation(path: &str, content: &str) -> Mutation {
        Mutation { path: path.into(), content: content.into() }
    }

    fn signal(code: &str) -> ErrorSignal {
        ErrorSignal { message: "boom".into(), code: code.into(), severity: Severity::Error }
    }

    fn store_with(id: &str) -> ChatWorkspaceStore {
        let store = ChatWorkspaceStore::new(4);
        store.switch_conversation(ConversationId::new(id));
        store
    }

    // ── No active conversation ─────────────────────────────────────

    #[test]
    fn operations_are_noops_without_active_conversation() {
        let store = ChatWorkspaceStore::new(4);
        assert_eq!(store.apply_mutation_batch(&[mutation("a.ts", "1")], SyncOrigin::Initial), 0);
        assert_eq!(store.update_file("a.ts", "1".into()), Ok(false));
        assert_eq!(store.delete("a.ts"), Ok(0));
        assert_eq!(store.get_content("a.ts"), "");
        assert!(store.is_empty());
    }

    // ── Mutations ──────────────────────────────────────────────────

    #[test]
    fn apply_filters_denylisted_and_raises_event() {
        let store = store_with("c1");
        let mut events = store.subscribe();

        let applied = store.apply_mutation_batch(
            &[mutation("./src/a.ts", "a"), mutation("node_modules/x.js", "x")],
            SyncOrigin::Initial,
        );

        assert_eq!(applied, 1);
        assert_eq!(store.get_content("src/a.ts"), "a");
        assert_eq!(
            events.try_recv().expect("event should be queued"),
            WorkspaceEvent::FilesChanged {
                conversation_id: ConversationId::new("c1"),
                paths: vec!["src/a.ts".into()]
            }
        );
    }

    #[test]
    fn selection_change_raises_state_event_once() {
        let store = store_with("c1");
        store.apply_mutation_batch(&[mutation("a.ts", "a")], SyncOrigin::Initial);
        let mut events = store.subscribe();

        store.select_path(Some("a.ts")).expect("select should succeed");
        store.select_path(Some("./a.ts")).expect("select should succeed");

        assert_eq!(
            events.try_recv().expect("event should be queued"),
            WorkspaceEvent::StateChanged { conversation_id: ConversationId::new("c1") }
        );
        assert!(events.try_recv().is_err(), "unchanged selection should stay quiet");
        assert_eq!(store.active_state().expect("active").selected_path.as_deref(), Some("a.ts"));
    }

    #[test]
    fn update_rejects_denylisted_path() {
        let store = store_with("c1");
        assert_eq!(
            store.update_file("dist/out.js", String::new()),
            Err(WorkspaceError::Denylisted("dist/out.js".into()))
        );
    }

    #[test]
    fn rename_errors() {
        let store = store_with("c1");
        store.apply_mutation_batch(&[mutation("a.ts", "a"), mutation("b.ts", "b")], SyncOrigin::Initial);

        assert_eq!(store.rename("missing.ts", "c.ts"), Err(WorkspaceError::NotFound("missing.ts".into())));
        assert_eq!(store.rename("a.ts", "b.ts"), Err(WorkspaceError::AlreadyExists("b.ts".into())));
        assert_eq!(store.rename("a.ts", "c.ts"), Ok(true));
        assert_eq!(store.get_content("c.ts"), "a");
    }

    #[test]
    fn create_folder_is_noop_when_populated() {
        let store = store_with("c1");
        store.apply_mutation_batch(&[mutation("src/a.ts", "a")], SyncOrigin::Initial);
        assert_eq!(store.create_folder("src"), Ok(false));
        assert_eq!(store.create_folder("public"), Ok(true));
        assert!(store.files().contains_key("public/.gitkeep"));
    }

    // ── Isolation ──────────────────────────────────────────────────

    #[test]
    fn switching_back_restores_files_exactly() {
        let store = store_with("a");
        store.apply_mutation_batch(&[mutation("x.ts", "from a")], SyncOrigin::Initial);
        let snapshot = store.files();

        store.switch_conversation(ConversationId::new("b"));
        assert!(store.files().is_empty());
        store.apply_mutation_batch(&[mutation("x.ts", "from b")], SyncOrigin::Initial);

        store.switch_conversation(ConversationId::new("a"));
        assert_eq!(store.files(), snapshot);
    }

    #[test]
    fn clear_conversation_destroys_state() {
        let store = store_with("a");
        store.apply_mutation_batch(&[mutation("x.ts", "1")], SyncOrigin::Initial);
        assert!(store.clear_conversation(&ConversationId::new("a")));
        assert!(store.active_id().is_none());
        assert!(store.state_of(&ConversationId::new("a")).is_none());
    }

    #[test]
    fn replace_workspace_marks_all_files_initial() {
        let store = store_with("a");
        let mut builder = BuilderState::default();
        builder.files.insert("index.html".into(), "<h1/>".into());
        store.replace_workspace(&ConversationId::new("a"), builder);

        let state = store.active_state().expect("workspace should exist");
        assert_eq!(state.needs_initial_sync.get("index.html"), Some(&true));
        assert!(store.diff_against_prior().is_empty());
    }

    // ── Error queue ────────────────────────────────────────────────

    #[test]
    fn push_error_is_ignored_during_bulk_load() {
        let store = ChatWorkspaceStore::new(4);
        {
            let _guard = store.begin_bulk_load();
            assert!(store.push_error(signal("E1"), None).is_none());
        }
        assert!(!store.is_bulk_loading());
        assert_eq!(store.push_error(signal("E1"), None), Some(PushOutcome::Inserted));
        assert_eq!(store.errors().len(), 1);
    }

    #[test]
    fn error_queue_does_not_require_active_conversation() {
        let store = ChatWorkspaceStore::new(2);
        store.push_error(signal("A"), None);
        store.push_error(signal("B"), None);
        store.push_error(signal("C"), None);
        let codes: Vec<_> = store.errors().into_iter().map(|r| r.code).collect();
        assert_eq!(codes, vec!["B", "C"]);
        assert_eq!(store.remove_error(0).map(|r| r.code), Some("B".into()));
        store.clear_errors();
        assert!(store.errors().is_empty());
    }
}
