// Command fan-out.
//
// UI intents arrive as typed `Command`s and are applied to the components in
// a fixed order: workspace store, sync bridge, project binding, persistence.
// The bridge reacts to store events on its own loop, so "bridge" here means
// explicit mount requests (view activation).

use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use forgepad_common::artifact::ArtifactStream;
use forgepad_common::types::{
    ChatMessage, ChatRole, ConversationId, ProcessId, ProjectRecord, SyncOrigin, View,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::backend::ProjectBackend;
use crate::binding::{BindingError, ProjectBindingService};
use crate::config::GlobalConfig;
use crate::persistence::{PersistenceGateway, SavePayload};
use crate::sandbox::{Sandbox, SandboxError, SandboxHost};
use crate::sync::{MountMode, MountReport, WorkspaceSyncBridge};
use crate::terminal::TerminalSessionManager;
use crate::workspace::{ChatWorkspaceStore, WorkspaceEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    CreateConversation,
    SwitchConversation(ConversationId),
    ActivateView(View),
    UserMessage(String),
    AssistantChunk(String),
    AssistantDone,
    ClearConversation(ConversationId),
    DeleteProject(ConversationId),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandOutcome {
    Created { conversation_id: ConversationId },
    Switched { conversation_id: ConversationId, project: Option<ProjectRecord> },
    BuilderReady { mount: MountReport },
    TerminalReady { process_id: Option<ProcessId> },
    ChatReady,
    MessageRecorded { message_id: uuid::Uuid },
    ChunkApplied { mutations: usize, pending_bytes: usize },
    StreamFinished { message_id: uuid::Uuid, mutations: usize, unparsed: String },
    Cleared { existed: bool },
    Deleted { conversation_id: ConversationId },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("no active conversation")]
    NoActiveConversation,
    #[error("no assistant message is streaming")]
    NoActiveStream,
    #[error("sandbox: {0}")]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Binding(#[from] BindingError),
}

/// Parser state of the assistant message currently streaming.
struct AssistantStream {
    conversation_id: ConversationId,
    parser: ArtifactStream,
    origin: SyncOrigin,
    message: ChatMessage,
    mutations: usize,
}

struct Inner {
    store: ChatWorkspaceStore,
    bridge: WorkspaceSyncBridge,
    terminals: TerminalSessionManager,
    binding: ProjectBindingService,
    gateway: PersistenceGateway,
    stream: StdMutex<Option<AssistantStream>>,
}

#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(
        store: ChatWorkspaceStore,
        bridge: WorkspaceSyncBridge,
        terminals: TerminalSessionManager,
        binding: ProjectBindingService,
        gateway: PersistenceGateway,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                bridge,
                terminals,
                binding,
                gateway,
                stream: StdMutex::new(None),
            }),
        }
    }

    /// Wire every component around one store, sandbox, and backend using the
    /// configured queue size and timings.
    pub fn assemble(
        sandbox: Arc<dyn Sandbox>,
        backend: Arc<dyn ProjectBackend>,
        config: &GlobalConfig,
    ) -> Self {
        let store = ChatWorkspaceStore::new(config.errors.effective_capacity());
        let host = Arc::new(SandboxHost::new(sandbox));
        let bridge =
            WorkspaceSyncBridge::new(store.clone(), Arc::clone(&host), config.sync.mount_debounce());
        let terminals = TerminalSessionManager::new(host, store.clone());
        let binding = ProjectBindingService::new(backend, store.clone());
        let gateway = PersistenceGateway::new(
            binding.clone(),
            store.clone(),
            config.sync.save_debounce(),
            config.sync.liveness_timeout(),
        );
        Self::new(store, bridge, terminals, binding, gateway)
    }

    pub fn store(&self) -> &ChatWorkspaceStore {
        &self.inner.store
    }

    pub fn bridge(&self) -> &WorkspaceSyncBridge {
        &self.inner.bridge
    }

    pub fn terminals(&self) -> &TerminalSessionManager {
        &self.inner.terminals
    }

    pub fn binding(&self) -> &ProjectBindingService {
        &self.inner.binding
    }

    pub fn gateway(&self) -> &PersistenceGateway {
        &self.inner.gateway
    }

    pub async fn dispatch(&self, command: Command) -> Result<CommandOutcome, CoordinatorError> {
        debug!(?command, "dispatch");
        match command {
            Command::CreateConversation => {
                let id = ConversationId::generate();
                self.switch(id.clone()).await;
                Ok(CommandOutcome::Created { conversation_id: id })
            }
            Command::SwitchConversation(id) => {
                let project = self.switch(id.clone()).await;
                Ok(CommandOutcome::Switched { conversation_id: id, project })
            }
            Command::ActivateView(view) => self.activate_view(view).await,
            Command::UserMessage(text) => {
                let id = self.active()?;
                let message = ChatMessage::new(ChatRole::User, text);
                let message_id = message.id;
                let transcript = self.inner.binding.push_message(&id, message);
                self.inner.gateway.schedule_save(id.as_str(), SavePayload::Chat(transcript));
                self.inner.gateway.schedule_save(id.as_str(), SavePayload::Activity(Utc::now()));
                Ok(CommandOutcome::MessageRecorded { message_id })
            }
            Command::AssistantChunk(chunk) => self.assistant_chunk(&chunk),
            Command::AssistantDone => self.assistant_done(),
            Command::ClearConversation(id) => {
                self.drop_stream_for(&id);
                let existed = self.inner.store.clear_conversation(&id);
                self.inner.binding.forget(&id);
                Ok(CommandOutcome::Cleared { existed })
            }
            Command::DeleteProject(id) => {
                self.drop_stream_for(&id);
                self.inner.binding.delete_project(&id).await?;
                Ok(CommandOutcome::Deleted { conversation_id: id })
            }
        }
    }

    fn active(&self) -> Result<ConversationId, CoordinatorError> {
        self.inner.store.active_id().ok_or(CoordinatorError::NoActiveConversation)
    }

    /// Binding failures are logged, not returned: the local workspace keeps
    /// working while the backend is unavailable.
    async fn switch(&self, id: ConversationId) -> Option<ProjectRecord> {
        if let Some(previous) = self.inner.store.active_id() {
            if previous != id {
                self.finish_stream_for(&previous);
            }
        }
        self.inner.store.switch_conversation(id.clone());

        let project = match self.inner.binding.switch_to(&id).await {
            Ok(project) => Some(project),
            Err(err) => {
                warn!(conversation_id = %id, error = %err, "project binding unavailable; continuing locally");
                None
            }
        };
        self.inner.gateway.schedule_save(id.as_str(), SavePayload::Activity(Utc::now()));
        info!(conversation_id = %id, "conversation active");
        project
    }

    async fn activate_view(&self, view: View) -> Result<CommandOutcome, CoordinatorError> {
        match view {
            View::Chat => Ok(CommandOutcome::ChatReady),
            View::Builder => {
                let id = self.active()?;
                let mount = self.inner.bridge.mount_live(&id, MountMode::FullReplace).await?;
                Ok(CommandOutcome::BuilderReady { mount })
            }
            View::Terminal => {
                let process_id =
                    self.inner.terminals.create_bootstrap().or_else(|| self.inner.terminals.active());
                Ok(CommandOutcome::TerminalReady { process_id })
            }
        }
    }

    fn assistant_chunk(&self, chunk: &str) -> Result<CommandOutcome, CoordinatorError> {
        let id = self.active()?;
        let mut slot = self.inner.stream.lock().expect("assistant stream lock poisoned");
        if slot.as_ref().is_some_and(|stream| stream.conversation_id != id) {
            *slot = None;
        }
        let stream = slot.get_or_insert_with(|| {
            // The first payload of a turn into an empty workspace is its
            // initial sync; later turns are edits.
            let origin =
                if self.inner.store.is_empty() { SyncOrigin::Initial } else { SyncOrigin::Incremental };
            self.inner.store.snapshot_prior_from_live();
            AssistantStream {
                conversation_id: id.clone(),
                parser: ArtifactStream::new(),
                origin,
                message: ChatMessage::new(ChatRole::Assistant, String::new()),
                mutations: 0,
            }
        });

        let batch = stream.parser.push(chunk);
        stream.message.content.push_str(chunk);
        let applied = if batch.is_empty() {
            0
        } else {
            self.inner.store.apply_mutation_batch(&batch, stream.origin)
        };
        stream.mutations += applied;
        let pending_bytes = stream.parser.pending().len();
        let message = stream.message.clone();
        drop(slot);

        let transcript = self.inner.binding.upsert_assistant_message(&id, message);
        self.inner.gateway.schedule_save(id.as_str(), SavePayload::Chat(transcript));
        Ok(CommandOutcome::ChunkApplied { mutations: applied, pending_bytes })
    }

    fn assistant_done(&self) -> Result<CommandOutcome, CoordinatorError> {
        let stream = self
            .inner
            .stream
            .lock()
            .expect("assistant stream lock poisoned")
            .take()
            .ok_or(CoordinatorError::NoActiveStream)?;
        let AssistantStream { conversation_id, parser, message, mutations, .. } = stream;
        let unparsed = parser.finish();
        if !unparsed.is_empty() {
            debug!(conversation_id = %conversation_id, bytes = unparsed.len(), "assistant message ended with unclosed markup");
        }

        let message_id = message.id;
        let transcript = self.inner.binding.upsert_assistant_message(&conversation_id, message);
        self.inner.gateway.schedule_save(conversation_id.as_str(), SavePayload::Chat(transcript));
        self.inner.gateway.schedule_save(conversation_id.as_str(), SavePayload::Activity(Utc::now()));
        Ok(CommandOutcome::StreamFinished { message_id, mutations, unparsed })
    }

    /// End a stream that belongs to `id`, keeping its text in the transcript.
    fn finish_stream_for(&self, id: &ConversationId) {
        let belongs = self
            .inner
            .stream
            .lock()
            .expect("assistant stream lock poisoned")
            .as_ref()
            .is_some_and(|stream| &stream.conversation_id == id);
        if belongs {
            let _ = self.assistant_done();
        }
    }

    fn drop_stream_for(&self, id: &ConversationId) {
        let mut slot = self.inner.stream.lock().expect("assistant stream lock poisoned");
        if slot.as_ref().is_some_and(|stream| &stream.conversation_id == id) {
            *slot = None;
        }
    }

    /// Schedule a workspace save whenever a conversation's files or builder
    /// state change. Bulk loads (`Replaced`) are not saved back.
    pub async fn run_autosave(self, mut shutdown: broadcast::Receiver<()>) {
        let mut events = self.inner.store.subscribe();
        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => break,

                event = events.recv() => match event {
                    Ok(
                        WorkspaceEvent::FilesChanged { conversation_id, .. }
                        | WorkspaceEvent::StateChanged { conversation_id },
                    ) => {
                        if let Some(builder) = self.inner.store.builder_state(&conversation_id) {
                            self.inner
                                .gateway
                                .schedule_save(conversation_id.as_str(), SavePayload::Workspace(builder));
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "autosave lagged; saving the active workspace");
                        if let Some(id) = self.inner.store.active_id() {
                            if let Some(builder) = self.inner.store.builder_state(&id) {
                                self.inner.gateway.schedule_save(id.as_str(), SavePayload::Workspace(builder));
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }
}
