// Debounced, failure-tolerant persistence of project state.
//
// `schedule_save` updates the local copy immediately and queues the write.
// Saves coalesce per (project, kind); when a window settles the gateway
// checks the conversation is still active, checks backend health and writes.
// A failed write is not retried: the next save for the same key supersedes
// it. There is no durable outbox, so pending writes are lost if the backend
// stays down until the daemon exits.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use forgepad_common::types::{BuilderState, ChatMessage, ConversationId};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{BackendError, ProjectBackend};
use crate::binding::{BindingError, ProjectBindingService};
use crate::debounce::Debouncer;
use crate::workspace::ChatWorkspaceStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveKind {
    Chat,
    Workspace,
    Activity,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SavePayload {
    Chat(Vec<ChatMessage>),
    Workspace(BuilderState),
    Activity(DateTime<Utc>),
}

impl SavePayload {
    pub fn kind(&self) -> SaveKind {
        match self {
            Self::Chat(_) => SaveKind::Chat,
            Self::Workspace(_) => SaveKind::Workspace,
            Self::Activity(_) => SaveKind::Activity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayStatus {
    Healthy,
    /// The last health check or write could not reach the backend.
    Degraded,
    /// No credential; nothing is written remotely.
    LocalOnly,
}

/// What happened to one scheduled save when its window fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Written,
    /// A newer save for the same key exists.
    Superseded,
    /// The conversation is no longer active.
    Inactive,
    LocalOnly,
    /// The health check failed or timed out.
    Offline,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveReport {
    pub project_id: String,
    pub kind: SaveKind,
    pub revision: u64,
    pub outcome: SaveOutcome,
}

type SaveKey = (String, SaveKind);

struct Scheduled {
    revision: u64,
    payload: SavePayload,
}

enum Request {
    Save { key: SaveKey, scheduled: Scheduled },
    Flush(oneshot::Sender<Vec<SaveReport>>),
}

struct GatewayState {
    next_revision: u64,
    /// Newest scheduled revision per key.
    latest: HashMap<SaveKey, u64>,
    /// Newest revision the backend acknowledged per key.
    acked: HashMap<SaveKey, u64>,
    status: GatewayStatus,
    outage_reported: bool,
    local_only_reported: bool,
}

struct Inner {
    backend: Arc<dyn ProjectBackend>,
    binding: ProjectBindingService,
    store: ChatWorkspaceStore,
    window: Duration,
    liveness_timeout: Duration,
    state: StdMutex<GatewayState>,
    /// Serializes writes per key so at most one is in flight.
    key_locks: StdMutex<HashMap<SaveKey, Arc<tokio::sync::Mutex<()>>>>,
    requests: mpsc::UnboundedSender<Request>,
    request_rx: StdMutex<Option<mpsc::UnboundedReceiver<Request>>>,
    reports: broadcast::Sender<SaveReport>,
}

#[derive(Clone)]
pub struct PersistenceGateway {
    inner: Arc<Inner>,
}

impl PersistenceGateway {
    pub fn new(
        binding: ProjectBindingService,
        store: ChatWorkspaceStore,
        window: Duration,
        liveness_timeout: Duration,
    ) -> Self {
        let backend = Arc::clone(binding.backend());
        let status = if backend.has_credentials() {
            GatewayStatus::Healthy
        } else {
            GatewayStatus::LocalOnly
        };
        let (requests, request_rx) = mpsc::unbounded_channel();
        let (reports, _) = broadcast::channel(128);
        Self {
            inner: Arc::new(Inner {
                backend,
                binding,
                store,
                window,
                liveness_timeout,
                state: StdMutex::new(GatewayState {
                    next_revision: 0,
                    latest: HashMap::new(),
                    acked: HashMap::new(),
                    status,
                    outage_reported: false,
                    local_only_reported: false,
                }),
                key_locks: StdMutex::new(HashMap::new()),
                requests,
                request_rx: StdMutex::new(Some(request_rx)),
                reports,
            }),
        }
    }

    pub fn status(&self) -> GatewayStatus {
        self.inner.state().status
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SaveReport> {
        self.inner.reports.subscribe()
    }

    /// Newest revision acknowledged by the backend for `(project_id, kind)`.
    pub fn acked_revision(&self, project_id: &str, kind: SaveKind) -> Option<u64> {
        self.inner.state().acked.get(&(project_id.to_string(), kind)).copied()
    }

    /// Apply `payload` to the local copy now and queue the remote write.
    /// Returns the save's revision.
    pub fn schedule_save(&self, project_id: &str, payload: SavePayload) -> u64 {
        self.inner.binding.apply_local(project_id, &payload);

        let key = (project_id.to_string(), payload.kind());
        let revision = {
            let mut state = self.inner.state();
            state.next_revision += 1;
            let revision = state.next_revision;
            state.latest.insert(key.clone(), revision);
            revision
        };
        debug!(project_id, kind = ?key.1, revision, "save scheduled");
        if self.inner.requests.send(Request::Save { key, scheduled: Scheduled { revision, payload } }).is_err() {
            debug!("persistence loop not running; save kept local");
        }
        revision
    }

    /// Write every pending save now, skipping the debounce window. Resolves
    /// once those writes have finished.
    pub async fn flush(&self) -> Vec<SaveReport> {
        let (tx, rx) = oneshot::channel();
        if self.inner.requests.send(Request::Flush(tx)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let Some(mut requests) =
            self.inner.request_rx.lock().expect("gateway request lock poisoned").take()
        else {
            warn!("persistence loop already running");
            return;
        };
        let mut debouncer: Debouncer<SaveKey, Scheduled> = Debouncer::new(self.inner.window);
        info!(window_ms = self.inner.window.as_millis() as u64, "persistence gateway started");

        loop {
            let deadline = debouncer.next_deadline();
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    let mut waiters = Vec::new();
                    while let Ok(request) = requests.try_recv() {
                        match request {
                            Request::Save { key, scheduled } => debouncer.push(key, scheduled),
                            Request::Flush(reply) => waiters.push(reply),
                        }
                    }
                    let pending = debouncer.drain_all();
                    if !pending.is_empty() {
                        info!(pending = pending.len(), "flushing saves before shutdown");
                    }
                    let mut reports = Vec::new();
                    for (key, scheduled) in pending {
                        reports.push(Arc::clone(&self.inner).write(key, scheduled).await);
                    }
                    for waiter in waiters {
                        let _ = waiter.send(reports.clone());
                    }
                    info!("persistence gateway shutting down");
                    break;
                }

                request = requests.recv() => match request {
                    Some(Request::Save { key, scheduled }) => debouncer.push(key, scheduled),
                    Some(Request::Flush(reply)) => {
                        let mut reports = Vec::new();
                        for (key, scheduled) in debouncer.drain_all() {
                            reports.push(Arc::clone(&self.inner).write(key, scheduled).await);
                        }
                        let _ = reply.send(reports);
                    }
                    None => break,
                },

                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {}
            }

            for (key, scheduled) in debouncer.drain_ready() {
                tokio::spawn(Arc::clone(&self.inner).write(key, scheduled));
            }
        }
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, GatewayState> {
        self.state.lock().expect("gateway state lock poisoned")
    }

    fn key_lock(&self, key: &SaveKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.key_locks.lock().expect("gateway key lock poisoned");
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    fn is_superseded(&self, key: &SaveKey, revision: u64) -> bool {
        let state = self.state();
        let newer_scheduled = state.latest.get(key).is_some_and(|latest| *latest > revision);
        let newer_acked = state.acked.get(key).is_some_and(|acked| *acked >= revision);
        newer_scheduled || newer_acked
    }

    async fn write(self: Arc<Self>, key: SaveKey, scheduled: Scheduled) -> SaveReport {
        let revision = scheduled.revision;
        let outcome = self.write_outcome(&key, scheduled).await;
        match &outcome {
            SaveOutcome::Written => debug!(project_id = %key.0, kind = ?key.1, revision, "saved"),
            SaveOutcome::Failed(reason) => {
                warn!(project_id = %key.0, kind = ?key.1, revision, %reason, "save failed");
            }
            other => debug!(project_id = %key.0, kind = ?key.1, revision, outcome = ?other, "save skipped"),
        }
        let report = SaveReport { project_id: key.0, kind: key.1, revision, outcome };
        let _ = self.reports.send(report.clone());
        report
    }

    async fn write_outcome(&self, key: &SaveKey, scheduled: Scheduled) -> SaveOutcome {
        let conversation = ConversationId::new(key.0.clone());
        if !self.store.is_active(&conversation) {
            return SaveOutcome::Inactive;
        }
        if self.is_superseded(key, scheduled.revision) {
            return SaveOutcome::Superseded;
        }
        if !self.backend.has_credentials() {
            self.mark_local_only();
            return SaveOutcome::LocalOnly;
        }

        let lock = self.key_lock(key);
        let _guard = lock.lock().await;
        if self.is_superseded(key, scheduled.revision) {
            return SaveOutcome::Superseded;
        }

        match tokio::time::timeout(self.liveness_timeout, self.backend.health()).await {
            Ok(Ok(())) => self.mark_healthy(),
            Ok(Err(err)) => {
                self.mark_degraded(&err.to_string());
                return SaveOutcome::Offline;
            }
            Err(_) => {
                self.mark_degraded("health check timed out");
                return SaveOutcome::Offline;
            }
        }

        // Creates the project on the first save of a new conversation.
        let project_id = match self.binding.ensure_project_for(&conversation).await {
            Ok(record) => record.id,
            Err(BindingError::Backend(err)) => return self.failed(err),
        };

        let result = match scheduled.payload {
            SavePayload::Chat(messages) => self.backend.save_chat(project_id, messages).await,
            SavePayload::Workspace(builder) => self.backend.save_builder(project_id, builder).await,
            SavePayload::Activity(at) => self.backend.bump_activity(project_id, at).await,
        };
        match result {
            Ok(()) => {
                let mut state = self.state();
                let acked = state.acked.entry(key.clone()).or_insert(0);
                *acked = (*acked).max(scheduled.revision);
                SaveOutcome::Written
            }
            Err(err) => self.failed(err),
        }
    }

    fn failed(&self, err: BackendError) -> SaveOutcome {
        if err.is_transient() {
            self.mark_degraded(&err.to_string());
            SaveOutcome::Offline
        } else {
            SaveOutcome::Failed(err.to_string())
        }
    }

    fn mark_healthy(&self) {
        let mut state = self.state();
        if state.status == GatewayStatus::Degraded {
            info!("backend reachable again; remote saves resumed");
        }
        state.status = GatewayStatus::Healthy;
        state.outage_reported = false;
    }

    fn mark_degraded(&self, reason: &str) {
        let mut state = self.state();
        state.status = GatewayStatus::Degraded;
        if !state.outage_reported {
            state.outage_reported = true;
            warn!(%reason, "backend unavailable; changes are kept locally until it recovers");
        }
    }

    fn mark_local_only(&self) {
        let mut state = self.state();
        state.status = GatewayStatus::LocalOnly;
        if !state.local_only_reported {
            state.local_only_reported = true;
            info!("no backend credential; persistence is local-only");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryProjectBackend;
    use forgepad_common::types::ChatRole;

    struct Harness {
        backend: MemoryProjectBackend,
        store: ChatWorkspaceStore,
        gateway: PersistenceGateway,
        shutdown: broadcast::Sender<()>,
        handle: tokio::task::JoinHandle<()>,
    }

    fn start(backend: MemoryProjectBackend) -> Harness {
        let store = ChatWorkspaceStore::new(4);
        let binding = ProjectBindingService::new(Arc::new(backend.clone()), store.clone());
        let gateway = PersistenceGateway::new(
            binding,
            store.clone(),
            Duration::from_millis(1500),
            Duration::from_millis(200),
        );
        let (shutdown, rx) = broadcast::channel(1);
        let handle = tokio::spawn(gateway.clone().run(rx));
        Harness { backend, store, gateway, shutdown, handle }
    }

    fn files(content: &str) -> SavePayload {
        SavePayload::Workspace(BuilderState {
            files: [("app.ts".to_string(), content.to_string())].into(),
            ..BuilderState::default()
        })
    }

    async fn next_report(reports: &mut broadcast::Receiver<SaveReport>) -> SaveReport {
        reports.recv().await.expect("a save report should arrive")
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_saves_coalesce_into_one_write_with_final_content() {
        let h = start(MemoryProjectBackend::new());
        h.store.switch_conversation(ConversationId::new("c1"));
        let mut reports = h.gateway.subscribe();

        for n in 0..5 {
            h.gateway.schedule_save("c1", files(&format!("v{n}")));
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        let report = next_report(&mut reports).await;

        assert_eq!(report.outcome, SaveOutcome::Written);
        assert_eq!(h.backend.call_count("save_builder"), 1);
        let saved = h.backend.project("c1").expect("project should be created on first save");
        assert_eq!(saved.builder_state.files.get("app.ts").map(String::as_str), Some("v4"));
        assert_eq!(h.gateway.acked_revision("c1", SaveKind::Workspace), Some(report.revision));

        h.shutdown.send(()).expect("shutdown should send");
        h.handle.await.expect("gateway should stop");
    }

    #[tokio::test(start_paused = true)]
    async fn kinds_are_debounced_independently() {
        let h = start(MemoryProjectBackend::new());
        h.store.switch_conversation(ConversationId::new("c1"));
        let mut reports = h.gateway.subscribe();

        h.gateway.schedule_save("c1", files("a"));
        h.gateway.schedule_save("c1", SavePayload::Chat(vec![ChatMessage::new(ChatRole::User, "hi")]));
        let mut kinds = vec![next_report(&mut reports).await.kind, next_report(&mut reports).await.kind];
        kinds.sort();

        assert_eq!(kinds, vec![SaveKind::Chat, SaveKind::Workspace]);
    }

    #[tokio::test(start_paused = true)]
    async fn switching_away_cancels_pending_save() {
        let h = start(MemoryProjectBackend::new());
        h.store.switch_conversation(ConversationId::new("c1"));
        let mut reports = h.gateway.subscribe();

        h.gateway.schedule_save("c1", files("draft"));
        h.store.switch_conversation(ConversationId::new("c2"));
        let report = next_report(&mut reports).await;

        assert_eq!(report.outcome, SaveOutcome::Inactive);
        assert_eq!(h.backend.call_count("save_builder"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn outage_is_reported_once_and_local_copy_stays_current() {
        let backend = MemoryProjectBackend::new();
        backend.set_unreachable(true);
        let h = start(backend);
        h.store.switch_conversation(ConversationId::new("c1"));
        let mut reports = h.gateway.subscribe();

        for n in 0..3 {
            h.gateway.schedule_save("c1", files(&format!("v{n}")));
            assert_eq!(next_report(&mut reports).await.outcome, SaveOutcome::Offline);
        }
        assert_eq!(h.gateway.status(), GatewayStatus::Degraded);
        assert_eq!(h.backend.call_count("save_builder"), 0);

        h.backend.set_unreachable(false);
        h.gateway.schedule_save("c1", files("v3"));
        assert_eq!(next_report(&mut reports).await.outcome, SaveOutcome::Written);
        assert_eq!(h.gateway.status(), GatewayStatus::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_health_check_times_out() {
        let backend = MemoryProjectBackend::new();
        backend.set_latency(Some(Duration::from_secs(5)));
        let h = start(backend);
        h.store.switch_conversation(ConversationId::new("c1"));
        let mut reports = h.gateway.subscribe();

        h.gateway.schedule_save("c1", files("x"));
        assert_eq!(next_report(&mut reports).await.outcome, SaveOutcome::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_credential_is_local_only() {
        let backend = MemoryProjectBackend::new();
        backend.set_credentials(false);
        let h = start(backend);
        h.store.switch_conversation(ConversationId::new("c1"));
        assert_eq!(h.gateway.status(), GatewayStatus::LocalOnly);

        let messages = vec![ChatMessage::new(ChatRole::User, "hello")];
        let mut reports = h.gateway.subscribe();
        h.gateway.schedule_save("c1", SavePayload::Chat(messages.clone()));

        assert_eq!(next_report(&mut reports).await.outcome, SaveOutcome::LocalOnly);
        assert_eq!(h.backend.call_count("health"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_writes_pending_saves_immediately() {
        let h = start(MemoryProjectBackend::new());
        h.store.switch_conversation(ConversationId::new("c1"));

        h.gateway.schedule_save("c1", files("final"));
        let reports = h.gateway.flush().await;

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].outcome, SaveOutcome::Written);
        let saved = h.backend.project("c1").expect("project should exist");
        assert_eq!(saved.builder_state.files.get("app.ts").map(String::as_str), Some("final"));
    }

    #[tokio::test]
    async fn superseded_revision_is_not_written() {
        let backend = MemoryProjectBackend::new();
        let store = ChatWorkspaceStore::new(4);
        store.switch_conversation(ConversationId::new("c1"));
        let binding = ProjectBindingService::new(Arc::new(backend.clone()), store.clone());
        let gateway =
            PersistenceGateway::new(binding, store, Duration::from_millis(10), Duration::from_secs(1));

        let old = gateway.schedule_save("c1", files("old"));
        let new = gateway.schedule_save("c1", files("new"));
        assert!(new > old);

        let stale = Arc::clone(&gateway.inner)
            .write(("c1".into(), SaveKind::Workspace), Scheduled { revision: old, payload: files("old") })
            .await;
        assert_eq!(stale.outcome, SaveOutcome::Superseded);
        assert_eq!(backend.call_count("save_builder"), 0);
    }
}
