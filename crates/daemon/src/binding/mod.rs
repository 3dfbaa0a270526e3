// Conversation ↔ project binding.
//
// Every conversation is backed by one project record whose id equals the
// conversation id. Records are cached here; the cache also holds the local
// copy of each transcript so the chat stays consistent while the backend is
// unreachable.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use chrono::Utc;
use forgepad_common::types::{ChatMessage, ConversationId, NewProject, ProjectRecord};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backend::{BackendError, ProjectBackend};
use crate::persistence::SavePayload;
use crate::workspace::ChatWorkspaceStore;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BindingError {
    #[error(transparent)]
    Backend(#[from] BackendError),
}

struct Binding {
    record: ProjectRecord,
    /// False for a local placeholder that the backend has not confirmed.
    persisted: bool,
}

#[derive(Default)]
struct BindingState {
    bindings: HashMap<ConversationId, Binding>,
    active: Option<ConversationId>,
    /// Conversations whose persisted snapshot was already loaded into the
    /// store this session. Later switches keep the local copy.
    loaded: HashSet<ConversationId>,
}

struct Inner {
    backend: Arc<dyn ProjectBackend>,
    store: ChatWorkspaceStore,
    state: StdMutex<BindingState>,
}

#[derive(Clone)]
pub struct ProjectBindingService {
    inner: Arc<Inner>,
}

impl ProjectBindingService {
    pub fn new(backend: Arc<dyn ProjectBackend>, store: ChatWorkspaceStore) -> Self {
        Self {
            inner: Arc::new(Inner { backend, store, state: StdMutex::new(BindingState::default()) }),
        }
    }

    fn state(&self) -> MutexGuard<'_, BindingState> {
        self.inner.state.lock().expect("binding state lock poisoned")
    }

    pub fn backend(&self) -> &Arc<dyn ProjectBackend> {
        &self.inner.backend
    }

    pub fn active(&self) -> Option<ConversationId> {
        self.state().active.clone()
    }

    pub fn record(&self, id: &ConversationId) -> Option<ProjectRecord> {
        self.state().bindings.get(id).map(|binding| binding.record.clone())
    }

    pub fn transcript(&self, id: &ConversationId) -> Vec<ChatMessage> {
        self.state()
            .bindings
            .get(id)
            .map(|binding| binding.record.chat_messages.clone())
            .unwrap_or_default()
    }

    /// Look up the project for `id`, creating it when the backend has none.
    ///
    /// Two callers racing on a new id may both attempt the create; the loser
    /// sees `Conflict`, re-fetches and adopts the winner's record. Without a
    /// credential a local placeholder is bound instead.
    pub async fn ensure_project_for(&self, id: &ConversationId) -> Result<ProjectRecord, BindingError> {
        if let Some(binding) = self.state().bindings.get(id) {
            if binding.persisted {
                return Ok(binding.record.clone());
            }
        }

        if let Some(found) = self.fetch_remote(id).await? {
            return Ok(self.bind(id, found, true));
        }

        if !self.inner.backend.has_credentials() {
            debug!(conversation_id = %id, "no backend credential; binding local project");
            let placeholder = ProjectRecord::from_new(NewProject::for_conversation(id), Utc::now());
            return Ok(self.bind(id, placeholder, false));
        }

        match self.inner.backend.create_project(NewProject::for_conversation(id)).await {
            Ok(created) => {
                info!(conversation_id = %id, "project created");
                Ok(self.bind(id, created, true))
            }
            Err(BackendError::Conflict(reason)) => {
                debug!(conversation_id = %id, %reason, "project created concurrently; adopting existing record");
                match self.fetch_remote(id).await? {
                    Some(winner) => Ok(self.bind(id, winner, true)),
                    None => Err(BackendError::Conflict(reason).into()),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn fetch_remote(&self, id: &ConversationId) -> Result<Option<ProjectRecord>, BackendError> {
        let projects = self.inner.backend.list_projects().await?;
        Ok(projects.into_iter().find(|project| project.id == id.as_str()))
    }

    /// Cache `record`, keeping a newer local transcript over the remote one.
    fn bind(&self, id: &ConversationId, mut record: ProjectRecord, persisted: bool) -> ProjectRecord {
        let mut state = self.state();
        if let Some(existing) = state.bindings.get(id) {
            if record.chat_messages.is_empty() {
                record.chat_messages = existing.record.chat_messages.clone();
            }
        }
        state.bindings.insert(id.clone(), Binding { record: record.clone(), persisted });
        record
    }

    /// Make `id` the active binding and, the first time this session, load
    /// its persisted transcript and workspace. A loaded snapshot replaces the
    /// conversation's workspace; it never merges.
    pub async fn switch_to(&self, id: &ConversationId) -> Result<ProjectRecord, BindingError> {
        self.state().active = Some(id.clone());
        let record = self.ensure_project_for(id).await?;

        if self.state().loaded.contains(id) {
            return Ok(record);
        }
        if !self.is_persisted(id) {
            return Ok(record);
        }

        let project_id = record.id.clone();
        let transcript = self.inner.backend.load_chat(project_id.clone()).await;
        let snapshot = self.inner.backend.load_builder(project_id).await;

        let transcript = match transcript {
            Ok(messages) => messages,
            Err(BackendError::NotFound(_)) => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        let snapshot = match snapshot {
            Ok(snapshot) => snapshot,
            Err(BackendError::NotFound(_)) => None,
            Err(err) => return Err(err.into()),
        };

        {
            let mut state = self.state();
            if !state.loaded.insert(id.clone()) {
                // A concurrent switch finished loading first.
                return Ok(state.bindings.get(id).map(|b| b.record.clone()).unwrap_or(record));
            }
            if let Some(binding) = state.bindings.get_mut(id) {
                if binding.record.chat_messages.len() <= transcript.len() {
                    binding.record.chat_messages = transcript;
                }
            }
        }

        if let Some(builder) = snapshot {
            let _bulk = self.inner.store.begin_bulk_load();
            self.inner.store.replace_workspace(id, builder.clone());
            let mut state = self.state();
            if let Some(binding) = state.bindings.get_mut(id) {
                binding.record.builder_state = builder;
            }
        }

        info!(conversation_id = %id, "project loaded");
        Ok(self.record(id).unwrap_or(record))
    }

    fn is_persisted(&self, id: &ConversationId) -> bool {
        self.state().bindings.get(id).is_some_and(|binding| binding.persisted)
    }

    /// Delete the project remotely and drop the binding. The workspace is
    /// cleared when the conversation is the active one.
    pub async fn delete_project(&self, id: &ConversationId) -> Result<(), BindingError> {
        let persisted = self.is_persisted(id);
        if persisted || self.inner.backend.has_credentials() {
            match self.inner.backend.delete_project(id.to_string()).await {
                Ok(()) | Err(BackendError::NotFound(_)) => {}
                Err(BackendError::MissingCredential) if !persisted => {}
                Err(err) => return Err(err.into()),
            }
        }

        {
            let mut state = self.state();
            state.bindings.remove(id);
            state.loaded.remove(id);
            if state.active.as_ref() == Some(id) {
                state.active = None;
            }
        }
        if self.inner.store.is_active(id) {
            self.inner.store.clear_conversation(id);
        }
        info!(conversation_id = %id, "project deleted");
        Ok(())
    }

    /// Append a message to the local transcript, returning the full list.
    pub fn push_message(&self, id: &ConversationId, message: ChatMessage) -> Vec<ChatMessage> {
        let mut state = self.state();
        let binding = state.bindings.entry(id.clone()).or_insert_with(|| Binding {
            record: ProjectRecord::from_new(NewProject::for_conversation(id), Utc::now()),
            persisted: false,
        });
        binding.record.chat_messages.push(message);
        binding.record.chat_messages.clone()
    }

    /// Replace the content of the last assistant message (streaming update),
    /// or append one when the transcript does not end with an assistant turn.
    pub fn upsert_assistant_message(&self, id: &ConversationId, message: ChatMessage) -> Vec<ChatMessage> {
        let mut state = self.state();
        let binding = state.bindings.entry(id.clone()).or_insert_with(|| Binding {
            record: ProjectRecord::from_new(NewProject::for_conversation(id), Utc::now()),
            persisted: false,
        });
        let messages = &mut binding.record.chat_messages;
        match messages.last_mut() {
            Some(last) if last.id == message.id => *last = message,
            _ => messages.push(message),
        }
        messages.clone()
    }

    /// Mirror a scheduled save into the cached record.
    pub fn apply_local(&self, project_id: &str, payload: &SavePayload) {
        let id = ConversationId::new(project_id);
        let mut state = self.state();
        let binding = state.bindings.entry(id.clone()).or_insert_with(|| Binding {
            record: ProjectRecord::from_new(NewProject::for_conversation(&id), Utc::now()),
            persisted: false,
        });
        match payload {
            SavePayload::Chat(messages) => binding.record.chat_messages = messages.clone(),
            SavePayload::Workspace(builder) => binding.record.builder_state = builder.clone(),
            SavePayload::Activity(at) => {
                binding.record.last_activity = binding.record.last_activity.max(*at);
            }
        }
    }

    /// Forget cached state for a conversation without touching the backend.
    pub fn forget(&self, id: &ConversationId) {
        let mut state = self.state();
        state.bindings.remove(id);
        state.loaded.remove(id);
        if state.active.as_ref() == Some(id) {
            warn!(conversation_id = %id, "forgetting the active binding");
            state.active = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryProjectBackend;
    use forgepad_common::types::{BuilderState, ChatRole, GenerationStatus, SyncOrigin, Mutation};
    use std::time::Duration;

    fn service(backend: &MemoryProjectBackend) -> (ChatWorkspaceStore, ProjectBindingService) {
        let store = ChatWorkspaceStore::new(4);
        let binding = ProjectBindingService::new(Arc::new(backend.clone()), store.clone());
        (store, binding)
    }

    fn cid(value: &str) -> ConversationId {
        ConversationId::new(value)
    }

    // ── ensure_project_for ──────────────────────────────────────────

    #[tokio::test]
    async fn creates_context_only_project_once() {
        let backend = MemoryProjectBackend::new();
        let (_store, binding) = service(&backend);

        let first = binding.ensure_project_for(&cid("c1")).await.expect("ensure should succeed");
        let second = binding.ensure_project_for(&cid("c1")).await.expect("ensure should succeed");

        assert_eq!(first.id, "c1");
        assert_eq!(first.generation_status, GenerationStatus::ContextOnly);
        assert_eq!(second.id, first.id);
        assert_eq!(backend.call_count("create_project"), 1);
        assert_eq!(backend.call_count("list_projects"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_ensure_adopts_the_winner() {
        let backend = MemoryProjectBackend::new();
        backend.set_latency(Some(Duration::from_millis(50)));
        let (_store, binding) = service(&backend);
        let other = binding.clone();

        let c1 = cid("c1");
        let (a, b) = tokio::join!(binding.ensure_project_for(&c1), other.ensure_project_for(&c1));

        let a = a.expect("first caller should succeed");
        let b = b.expect("second caller should succeed");
        assert_eq!(a.id, b.id);
        assert_eq!(backend.project_count(), 1);
        assert_eq!(backend.call_count("create_project"), 2);
    }

    #[tokio::test]
    async fn without_credentials_binds_a_local_placeholder() {
        let backend = MemoryProjectBackend::new();
        backend.set_credentials(false);
        let (_store, binding) = service(&backend);

        let record = binding.ensure_project_for(&cid("c1")).await.expect("ensure should succeed");
        assert_eq!(record.id, "c1");
        assert_eq!(backend.project_count(), 0);
        assert_eq!(backend.call_count("create_project"), 0);
    }

    #[tokio::test]
    async fn unreachable_backend_is_an_error() {
        let backend = MemoryProjectBackend::new();
        backend.set_unreachable(true);
        let (_store, binding) = service(&backend);
        assert!(matches!(
            binding.ensure_project_for(&cid("c1")).await,
            Err(BindingError::Backend(BackendError::Unreachable(_)))
        ));
    }

    // ── switch_to ───────────────────────────────────────────────────

    #[tokio::test]
    async fn switch_replaces_workspace_with_snapshot_and_loads_transcript() {
        let backend = MemoryProjectBackend::new();
        let mut record = ProjectRecord::from_new(NewProject::for_conversation(&cid("c1")), Utc::now());
        record.chat_messages.push(ChatMessage::new(ChatRole::User, "build a todo app"));
        record.builder_state = BuilderState {
            files: [("index.html".to_string(), "<ul></ul>".to_string())].into(),
            selected_path: Some("index.html".into()),
            project_root: None,
        };
        backend.seed(record);
        let (store, binding) = service(&backend);

        store.switch_conversation(cid("c1"));
        store.apply_mutation_batch(
            &[Mutation { path: "stale.ts".into(), content: "old".into() }],
            SyncOrigin::Initial,
        );
        binding.switch_to(&cid("c1")).await.expect("switch should succeed");

        let files = store.files();
        assert_eq!(files.keys().collect::<Vec<_>>(), vec!["index.html"]);
        assert_eq!(binding.transcript(&cid("c1")).len(), 1);
        assert_eq!(binding.active(), Some(cid("c1")));
        assert!(!store.is_bulk_loading());
    }

    #[tokio::test]
    async fn second_switch_keeps_local_workspace() {
        let backend = MemoryProjectBackend::new();
        let (store, binding) = service(&backend);
        store.switch_conversation(cid("c1"));
        binding.switch_to(&cid("c1")).await.expect("switch should succeed");
        backend
            .save_builder("c1".into(), BuilderState::default())
            .await
            .expect("save should succeed");

        store.apply_mutation_batch(
            &[Mutation { path: "a.ts".into(), content: "local".into() }],
            SyncOrigin::Initial,
        );
        binding.switch_to(&cid("c1")).await.expect("switch should succeed");

        assert_eq!(store.get_content("a.ts"), "local");
        assert_eq!(backend.call_count("load_builder"), 1);
    }

    // ── delete / local copies ───────────────────────────────────────

    #[tokio::test]
    async fn delete_clears_active_workspace() {
        let backend = MemoryProjectBackend::new();
        let (store, binding) = service(&backend);
        store.switch_conversation(cid("c1"));
        binding.switch_to(&cid("c1")).await.expect("switch should succeed");
        store.apply_mutation_batch(
            &[Mutation { path: "a.ts".into(), content: "x".into() }],
            SyncOrigin::Initial,
        );

        binding.delete_project(&cid("c1")).await.expect("delete should succeed");

        assert_eq!(backend.project_count(), 0);
        assert!(binding.record(&cid("c1")).is_none());
        assert_eq!(binding.active(), None);
        assert!(store.active_id().is_none());
    }

    #[tokio::test]
    async fn apply_local_and_streaming_upsert() {
        let backend = MemoryProjectBackend::new();
        let (_store, binding) = service(&backend);
        let id = cid("c1");

        binding.push_message(&id, ChatMessage::new(ChatRole::User, "hi"));
        let mut reply = ChatMessage::new(ChatRole::Assistant, "Hel");
        binding.upsert_assistant_message(&id, reply.clone());
        reply.content = "Hello".into();
        let transcript = binding.upsert_assistant_message(&id, reply);
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[1].content, "Hello");

        binding.apply_local("c1", &SavePayload::Chat(Vec::new()));
        assert!(binding.transcript(&id).is_empty());
    }
}
