use std::collections::HashMap;

use forgepad_common::types::ConversationId;

use super::errors::ErrorQueue;
use super::state::WorkspaceState;

/// Owns every live conversation's workspace plus the active pointer.
///
/// Plain data; the shared handle in `ChatWorkspaceStore` adds locking and
/// change notifications.
#[derive(Debug)]
pub struct WorkspaceRegistry {
    workspaces: HashMap<ConversationId, WorkspaceState>,
    active: Option<ConversationId>,
    pub(crate) errors: ErrorQueue,
    bulk_load_depth: usize,
}

impl WorkspaceRegistry {
    pub fn new(error_capacity: usize) -> Self {
        Self {
            workspaces: HashMap::new(),
            active: None,
            errors: ErrorQueue::new(error_capacity),
            bulk_load_depth: 0,
        }
    }

    pub fn active_id(&self) -> Option<&ConversationId> {
        self.active.as_ref()
    }

    pub fn active(&self) -> Option<&WorkspaceState> {
        self.active.as_ref().and_then(|id| self.workspaces.get(id))
    }

    pub fn active_mut(&mut self) -> Option<(&ConversationId, &mut WorkspaceState)> {
        let id = self.active.as_ref()?;
        self.workspaces.get_mut(id).map(|state| (id, state))
    }

    pub fn get(&self, id: &ConversationId) -> Option<&WorkspaceState> {
        self.workspaces.get(id)
    }

    pub fn get_mut(&mut self, id: &ConversationId) -> Option<&mut WorkspaceState> {
        self.workspaces.get_mut(id)
    }

    pub fn contains(&self, id: &ConversationId) -> bool {
        self.workspaces.contains_key(id)
    }

    pub fn is_active(&self, id: &ConversationId) -> bool {
        self.active.as_ref() == Some(id)
    }

    /// Make `id` active, creating an empty workspace if needed. Returns the
    /// previously active id and whether a workspace was created.
    pub fn switch_to(&mut self, id: ConversationId) -> (Option<ConversationId>, bool) {
        let created = !self.workspaces.contains_key(&id);
        self.workspaces.entry(id.clone()).or_default();
        let previous = self.active.replace(id);
        (previous, created)
    }

    /// Destroy a conversation's workspace. Drops the active pointer if it
    /// pointed there.
    pub fn remove(&mut self, id: &ConversationId) -> Option<WorkspaceState> {
        if self.is_active(id) {
            self.active = None;
        }
        self.workspaces.remove(id)
    }

    pub fn replace(&mut self, id: ConversationId, state: WorkspaceState) {
        self.workspaces.insert(id, state);
    }

    pub fn conversation_ids(&self) -> Vec<ConversationId> {
        let mut ids: Vec<_> = self.workspaces.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub(crate) fn enter_bulk_load(&mut self) {
        self.bulk_load_depth += 1;
    }

    pub(crate) fn exit_bulk_load(&mut self) {
        self.bulk_load_depth = self.bulk_load_depth.saturating_sub(1);
    }

    pub fn is_bulk_loading(&self) -> bool {
        self.bulk_load_depth > 0
    }
}
