// Workspace → sandbox sync bridge.
//
// Store change events are coalesced per conversation; when a window settles
// the bridge reads the *live* workspace and mounts it. Mount passes are
// serialized and skip files whose content hash matches what was last written.

pub mod hash;

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use forgepad_common::path::normalize::parent_dirs;
use forgepad_common::types::{ConversationId, ErrorSignal, Severity};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::debounce::Debouncer;
use crate::sandbox::{SandboxError, SandboxHost};
use crate::workspace::{ChatWorkspaceStore, WorkspaceEvent, WorkspaceState};

use self::hash::{sha256_hex, ContentHash};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MountMode {
    /// Write new and changed files; delete only paths removed in the workspace.
    Merge,
    /// Additionally delete anything a previous mount wrote that is gone now.
    FullReplace,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MountReport {
    pub conversation_id: Option<ConversationId>,
    pub written: usize,
    pub skipped: usize,
    pub removed: usize,
    /// Of `written`, how many were pending their initial sync.
    pub initial: usize,
    /// Of `written`, how many were incremental edits.
    pub incremental: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    Mounted(MountReport),
    Failed { conversation_id: ConversationId, error: SandboxError },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum BridgeState {
    Idle,
    /// A sandbox-fatal error latched; mounts fail fast until `unblock`.
    Blocked(String),
}

#[derive(Default)]
struct Mounted {
    conversation: Option<ConversationId>,
    hashes: HashMap<String, ContentHash>,
}

/// Channels consumed by `run`, taken at construction so no event is missed
/// between building the bridge and spawning its loop.
struct LoopInputs {
    requests: mpsc::UnboundedReceiver<(ConversationId, MountMode)>,
    events: broadcast::Receiver<WorkspaceEvent>,
}

struct Inner {
    store: ChatWorkspaceStore,
    host: Arc<SandboxHost>,
    window: Duration,
    mounted: tokio::sync::Mutex<Mounted>,
    blocked: StdMutex<Option<SandboxError>>,
    requests: mpsc::UnboundedSender<(ConversationId, MountMode)>,
    loop_inputs: StdMutex<Option<LoopInputs>>,
    events: broadcast::Sender<BridgeEvent>,
}

#[derive(Clone)]
pub struct WorkspaceSyncBridge {
    inner: Arc<Inner>,
}

impl WorkspaceSyncBridge {
    pub fn new(store: ChatWorkspaceStore, host: Arc<SandboxHost>, window: Duration) -> Self {
        let (requests, request_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        let store_events = store.subscribe();
        Self {
            inner: Arc::new(Inner {
                store,
                host,
                window,
                mounted: tokio::sync::Mutex::new(Mounted::default()),
                blocked: StdMutex::new(None),
                requests,
                loop_inputs: StdMutex::new(Some(LoopInputs {
                    requests: request_rx,
                    events: store_events,
                })),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.inner.events.subscribe()
    }

    pub fn host(&self) -> &Arc<SandboxHost> {
        &self.inner.host
    }

    pub fn state(&self) -> BridgeState {
        match self.inner.blocked.lock().expect("bridge state lock poisoned").as_ref() {
            Some(error) => BridgeState::Blocked(error.to_string()),
            None => BridgeState::Idle,
        }
    }

    /// Clear a latched fatal error so mounts are attempted again.
    pub fn unblock(&self) {
        self.inner.blocked.lock().expect("bridge state lock poisoned").take();
    }

    /// Schedule a debounced mount of `id`.
    pub fn request_mount(&self, id: ConversationId, mode: MountMode) {
        if self.inner.requests.send((id, mode)).is_err() {
            debug!("sync bridge loop not running; mount request dropped");
        }
    }

    /// Mount the live workspace of `id` now.
    pub async fn mount_live(
        &self,
        id: &ConversationId,
        mode: MountMode,
    ) -> Result<MountReport, SandboxError> {
        self.check_blocked()?;
        self.boot(id).await?;

        let mut mounted = self.inner.mounted.lock().await;
        // Read after taking the mount lock so the pass sees the newest state.
        let Some(state) = self.inner.store.state_of(id) else {
            return Ok(MountReport { conversation_id: Some(id.clone()), ..MountReport::default() });
        };
        let report = self.mount_locked(&mut mounted, id, &state, mode).await?;
        drop(mounted);

        self.inner.store.settle_mount(id, &state);
        Ok(report)
    }

    /// Mount a given workspace state (already read by the caller).
    pub async fn mount(
        &self,
        id: &ConversationId,
        workspace: &WorkspaceState,
        mode: MountMode,
    ) -> Result<MountReport, SandboxError> {
        self.check_blocked()?;
        self.boot(id).await?;
        let mut mounted = self.inner.mounted.lock().await;
        let report = self.mount_locked(&mut mounted, id, workspace, mode).await?;
        drop(mounted);
        self.inner.store.settle_mount(id, workspace);
        Ok(report)
    }

    fn check_blocked(&self) -> Result<(), SandboxError> {
        match self.inner.blocked.lock().expect("bridge state lock poisoned").as_ref() {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    async fn boot(&self, id: &ConversationId) -> Result<(), SandboxError> {
        match self.inner.host.ensure_booted().await {
            Ok(()) => Ok(()),
            Err(err) => {
                if err.is_fatal() {
                    self.latch(id, &err);
                }
                Err(err)
            }
        }
    }

    fn latch(&self, id: &ConversationId, err: &SandboxError) {
        let newly_blocked = {
            let mut blocked = self.inner.blocked.lock().expect("bridge state lock poisoned");
            let newly = blocked.is_none();
            *blocked = Some(err.clone());
            newly
        };
        if newly_blocked {
            error!(conversation_id = %id, error = %err, "sandbox unavailable; mounts blocked");
            let code = match err {
                SandboxError::InstanceLimit => "SANDBOX_INSTANCE_LIMIT",
                _ => "SANDBOX_BOOT_FAILED",
            };
            self.inner.store.push_error(
                ErrorSignal { message: err.to_string(), code: code.to_string(), severity: Severity::Error },
                None,
            );
        }
        let _ = self
            .inner
            .events
            .send(BridgeEvent::Failed { conversation_id: id.clone(), error: err.clone() });
    }

    async fn mount_locked(
        &self,
        mounted: &mut Mounted,
        id: &ConversationId,
        state: &WorkspaceState,
        mode: MountMode,
    ) -> Result<MountReport, SandboxError> {
        let sandbox = Arc::clone(self.inner.host.booted()?);
        let switching = mounted.conversation.as_ref() != Some(id);
        let full = mode == MountMode::FullReplace || switching;
        let mut report = MountReport { conversation_id: Some(id.clone()), ..MountReport::default() };

        let mut removals: BTreeSet<String> = state
            .pending_removals
            .iter()
            .filter(|path| !state.files.contains_key(*path))
            .cloned()
            .collect();
        if full {
            removals.extend(
                mounted.hashes.keys().filter(|path| !state.files.contains_key(*path)).cloned(),
            );
        }
        for path in removals {
            sandbox.remove(path.clone()).await?;
            mounted.hashes.remove(&path);
            report.removed += 1;
        }
        if switching {
            mounted.conversation = Some(id.clone());
        }

        let pending: Vec<(&String, &String, ContentHash)> = state
            .files
            .iter()
            .filter_map(|(path, content)| {
                let hash = sha256_hex(content.as_bytes());
                if mounted.hashes.get(path) == Some(&hash) {
                    None
                } else {
                    Some((path, content, hash))
                }
            })
            .collect();
        report.skipped = state.files.len() - pending.len();

        let dirs: BTreeSet<String> =
            pending.iter().flat_map(|(path, _, _)| parent_dirs(path)).collect();
        for dir in dirs {
            sandbox.mkdir(dir).await?;
        }

        for (path, content, hash) in pending {
            sandbox.write_file(path.clone(), content.clone()).await?;
            mounted.hashes.insert(path.clone(), hash);
            report.written += 1;
            if state.needs_initial_sync.get(path).copied().unwrap_or(false) {
                report.initial += 1;
            } else if state.needs_incremental_sync.get(path).copied().unwrap_or(false) {
                report.incremental += 1;
            }
        }

        info!(
            conversation_id = %id,
            written = report.written,
            skipped = report.skipped,
            removed = report.removed,
            full,
            "workspace mounted"
        );
        let _ = self.inner.events.send(BridgeEvent::Mounted(report.clone()));
        Ok(report)
    }

    /// Event loop: coalesce store changes and mount when each window settles.
    /// Returns immediately if another loop already owns the inputs.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let Some(LoopInputs { mut requests, mut events }) =
            self.inner.loop_inputs.lock().expect("bridge loop lock poisoned").take()
        else {
            warn!("sync bridge loop already running");
            return;
        };
        let mut debouncer: Debouncer<ConversationId, MountMode> = Debouncer::new(self.inner.window);

        info!(window_ms = self.inner.window.as_millis() as u64, "sync bridge started");

        loop {
            let deadline = debouncer.next_deadline();
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    info!("sync bridge shutting down");
                    break;
                }

                event = events.recv() => match event {
                    Ok(WorkspaceEvent::FilesChanged { conversation_id, .. }) => {
                        trace!(conversation_id = %conversation_id, "files changed");
                        debouncer.push_merge(conversation_id, MountMode::Merge, MountMode::max);
                    }
                    Ok(WorkspaceEvent::Switched { current, .. }) => {
                        debouncer.push_merge(current, MountMode::FullReplace, MountMode::max);
                    }
                    Ok(WorkspaceEvent::Replaced { conversation_id }) => {
                        debouncer.push_merge(conversation_id, MountMode::FullReplace, MountMode::max);
                    }
                    Ok(WorkspaceEvent::Cleared { conversation_id }) => {
                        debouncer.cancel_where(|pending| *pending != conversation_id);
                    }
                    Ok(WorkspaceEvent::StateChanged { .. } | WorkspaceEvent::ErrorsChanged) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "sync bridge lagged behind workspace events; scheduling full mount");
                        if let Some(active) = self.inner.store.active_id() {
                            debouncer.push_merge(active, MountMode::FullReplace, MountMode::max);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("workspace event channel closed, sync bridge exiting");
                        break;
                    }
                },

                request = requests.recv() => {
                    if let Some((id, mode)) = request {
                        debouncer.push_merge(id, mode, MountMode::max);
                    }
                }

                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {}
            }

            for (id, mode) in debouncer.drain_ready() {
                if !self.inner.store.is_active(&id) {
                    debug!(conversation_id = %id, "skipping mount for inactive conversation");
                    continue;
                }
                if let Err(err) = self.mount_live(&id, mode).await {
                    if !err.is_fatal() {
                        warn!(conversation_id = %id, error = %err, "mount pass failed");
                    }
                }
            }
        }
    }
}
