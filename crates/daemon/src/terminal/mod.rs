// Terminal session manager.
//
// Sessions are keyed by a random `ProcessId` and run a shell inside the
// sandbox. Output is kept in a bounded history, fanned out to subscribers and
// scanned line by line for error signals, which land in the shared workspace
// error queue tagged with the session's id.

pub mod detect;
mod session;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use forgepad_common::types::{ErrorSignal, ProcessId, Severity};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::sandbox::{ProcessIo, SandboxError, SandboxHost};
use crate::workspace::ChatWorkspaceStore;

pub use detect::{DetectError, ErrorDetector, RegexErrorDetector, MAX_SCAN_LINE_BYTES};
pub use session::{SessionInfo, SessionState};

use session::{Input, Session};

const EVENT_CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TerminalError {
    #[error("no terminal session {0}")]
    NotFound(ProcessId),
    #[error("terminal session {0} is closed")]
    Closed(ProcessId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalEvent {
    Created { process_id: ProcessId },
    StateChanged { process_id: ProcessId, state: SessionState },
    Closed { process_id: ProcessId },
    Selected { process_id: Option<ProcessId> },
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<ProcessId, Arc<Session>>,
    /// Creation order; the selection fallback picks the last entry.
    order: Vec<ProcessId>,
    active: Option<ProcessId>,
}

struct Inner {
    host: Arc<SandboxHost>,
    store: ChatWorkspaceStore,
    detector: Arc<dyn ErrorDetector>,
    registry: StdMutex<Registry>,
    events: broadcast::Sender<TerminalEvent>,
}

#[derive(Clone)]
pub struct TerminalSessionManager {
    inner: Arc<Inner>,
}

impl TerminalSessionManager {
    pub fn new(host: Arc<SandboxHost>, store: ChatWorkspaceStore) -> Self {
        Self::with_detector(host, store, Arc::new(RegexErrorDetector))
    }

    pub fn with_detector(
        host: Arc<SandboxHost>,
        store: ChatWorkspaceStore,
        detector: Arc<dyn ErrorDetector>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                host,
                store,
                detector,
                registry: StdMutex::new(Registry::default()),
                events,
            }),
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TerminalEvent> {
        self.inner.events.subscribe()
    }

    /// Allocate a session and start its shell in the background. The new
    /// session becomes the selected one. Must be called within a runtime.
    pub fn create(&self) -> ProcessId {
        let id = ProcessId::generate();
        let session = Arc::new(Session::new(id));
        {
            let mut registry = self.inner.registry();
            registry.sessions.insert(id, Arc::clone(&session));
            registry.order.push(id);
            registry.active = Some(id);
        }
        info!(process_id = %id, "terminal session created");
        self.inner.emit(TerminalEvent::Created { process_id: id });
        self.inner.emit(TerminalEvent::Selected { process_id: Some(id) });

        tokio::spawn(Arc::clone(&self.inner).run_session(session));
        id
    }

    /// Open the first terminal if none exist yet.
    pub fn create_bootstrap(&self) -> Option<ProcessId> {
        if self.inner.registry().sessions.is_empty() {
            Some(self.create())
        } else {
            None
        }
    }

    pub fn close(&self, id: ProcessId) -> Result<(), TerminalError> {
        if self.inner.close_session(id) {
            Ok(())
        } else {
            Err(TerminalError::NotFound(id))
        }
    }

    /// Send input to the session's shell. Input written before the shell is
    /// ready is delivered once it is.
    pub async fn write(&self, id: ProcessId, data: impl Into<String>) -> Result<(), TerminalError> {
        let data = data.into();
        let session = self.session(id)?;
        let sender = {
            let mut input = session.input.lock().expect("session input lock poisoned");
            match &mut *input {
                Input::Closed => return Err(TerminalError::Closed(id)),
                Input::Buffered(pending) => {
                    pending.push(data);
                    return Ok(());
                }
                Input::Live(sender) => sender.clone(),
            }
        };

        if data.contains(['\n', '\r']) {
            self.inner.transition_from(&session, SessionState::Ready, SessionState::Busy);
        }
        sender.send(data).await.map_err(|_| TerminalError::Closed(id))
    }

    pub fn subscribe(&self, id: ProcessId) -> Result<broadcast::Receiver<String>, TerminalError> {
        Ok(self.session(id)?.output.subscribe())
    }

    /// Forward every output chunk of `id` to `handler` until the session ends.
    pub fn on_output<F>(&self, id: ProcessId, mut handler: F) -> Result<JoinHandle<()>, TerminalError>
    where
        F: FnMut(String) + Send + 'static,
    {
        let mut output = self.subscribe(id)?;
        Ok(tokio::spawn(async move {
            loop {
                match output.recv().await {
                    Ok(chunk) => handler(chunk),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(process_id = %id, skipped, "output handler lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }))
    }

    /// Buffered output, oldest first, for late subscribers.
    pub fn output_history(&self, id: ProcessId) -> Result<Vec<String>, TerminalError> {
        Ok(self.session(id)?.history.lock().expect("session history lock poisoned").snapshot())
    }

    pub fn state(&self, id: ProcessId) -> Result<SessionState, TerminalError> {
        Ok(self.session(id)?.state())
    }

    pub fn select(&self, id: ProcessId) -> Result<(), TerminalError> {
        {
            let mut registry = self.inner.registry();
            if !registry.sessions.contains_key(&id) {
                return Err(TerminalError::NotFound(id));
            }
            registry.active = Some(id);
        }
        self.inner.emit(TerminalEvent::Selected { process_id: Some(id) });
        Ok(())
    }

    pub fn active(&self) -> Option<ProcessId> {
        self.inner.registry().active
    }

    /// Open sessions in creation order.
    pub fn list(&self) -> Vec<SessionInfo> {
        let registry = self.inner.registry();
        registry
            .order
            .iter()
            .filter_map(|id| registry.sessions.get(id))
            .map(|session| SessionInfo {
                process_id: session.id,
                state: session.state(),
                active: registry.active == Some(session.id),
                history_bytes: session.history_bytes(),
            })
            .collect()
    }

    /// Close every session (daemon shutdown).
    pub fn close_all(&self) {
        let ids: Vec<ProcessId> = self.inner.registry().order.clone();
        for id in ids {
            self.inner.close_session(id);
        }
    }

    fn session(&self, id: ProcessId) -> Result<Arc<Session>, TerminalError> {
        self.inner.registry().sessions.get(&id).cloned().ok_or(TerminalError::NotFound(id))
    }
}

async fn spawn_shell(host: &SandboxHost) -> Result<ProcessIo, SandboxError> {
    host.ensure_booted().await?;
    host.booted()?.spawn_shell().await
}

impl Inner {
    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().expect("terminal registry lock poisoned")
    }

    fn emit(&self, event: TerminalEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&self, session: &Session, next: SessionState) {
        if let Some(previous) = session.transition(next) {
            if previous != next {
                self.emit(TerminalEvent::StateChanged { process_id: session.id, state: next });
            }
        }
    }

    fn transition_from(&self, session: &Session, from: SessionState, to: SessionState) {
        let changed = {
            let mut state = session.state.lock().expect("session state lock poisoned");
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        };
        if changed {
            self.emit(TerminalEvent::StateChanged { process_id: session.id, state: to });
        }
    }

    /// Remove the session and release its process. Selection falls back to
    /// the most recently created remaining session.
    fn close_session(&self, id: ProcessId) -> bool {
        let (session, selection) = {
            let mut registry = self.registry();
            let Some(session) = registry.sessions.remove(&id) else {
                return false;
            };
            registry.order.retain(|existing| *existing != id);
            let selection = if registry.active == Some(id) {
                registry.active = registry.order.last().copied();
                Some(registry.active)
            } else {
                None
            };
            (session, selection)
        };

        session.close();
        info!(process_id = %id, "terminal session closed");
        self.emit(TerminalEvent::StateChanged { process_id: id, state: SessionState::Closed });
        self.emit(TerminalEvent::Closed { process_id: id });
        if let Some(process_id) = selection {
            self.emit(TerminalEvent::Selected { process_id });
        }
        true
    }

    async fn run_session(self: Arc<Self>, session: Arc<Session>) {
        let id = session.id;
        self.set_state(&session, SessionState::Initializing);

        let io = match spawn_shell(&self.host).await {
            Ok(io) => io,
            Err(err) => {
                warn!(process_id = %id, error = %err, "terminal failed to start");
                self.store.push_error(
                    ErrorSignal {
                        message: format!("terminal failed to start: {err}"),
                        code: "TERMINAL_SPAWN_FAILED".to_string(),
                        severity: Severity::Error,
                    },
                    Some(id),
                );
                self.close_session(id);
                return;
            }
        };
        let ProcessIo { input, mut output, ready, kill } = io;

        {
            let mut slot = session.kill.lock().expect("session kill lock poisoned");
            if session.state() == SessionState::Closed {
                let _ = kill.send(());
                return;
            }
            *slot = Some(kill);
        }

        if ready.await.is_err() {
            debug!(process_id = %id, "shell exited before reporting readiness");
            self.close_session(id);
            return;
        }

        // Flush buffered input in order before switching to live writes.
        loop {
            let pending = {
                let mut slot = session.input.lock().expect("session input lock poisoned");
                let pending = match &mut *slot {
                    Input::Buffered(pending) => std::mem::take(pending),
                    Input::Live(_) | Input::Closed => break,
                };
                if pending.is_empty() {
                    *slot = Input::Live(input.clone());
                    break;
                }
                pending
            };
            for data in pending {
                if input.send(data).await.is_err() {
                    break;
                }
            }
        }
        drop(input);
        self.set_state(&session, SessionState::Ready);

        let mut partial = String::new();
        while let Some(chunk) = output.recv().await {
            session.history.lock().expect("session history lock poisoned").push(chunk.clone());
            let _ = session.output.send(chunk.clone());
            self.transition_from(&session, SessionState::Busy, SessionState::Ready);
            self.scan_output(id, &mut partial, &chunk);
        }
        if !partial.is_empty() {
            self.detect_line(id, &partial);
        }

        debug!(process_id = %id, "terminal output ended");
        self.close_session(id);
    }

    fn scan_output(&self, id: ProcessId, partial: &mut String, chunk: &str) {
        partial.push_str(chunk);
        while let Some(end) = partial.find('\n') {
            let line: String = partial.drain(..=end).collect();
            self.detect_line(id, line.trim_end_matches(['\n', '\r']));
        }
        if partial.len() > MAX_SCAN_LINE_BYTES {
            trace!(process_id = %id, bytes = partial.len(), "discarding unterminated output line");
            partial.clear();
        }
    }

    fn detect_line(&self, id: ProcessId, line: &str) {
        match self.detector.detect(line) {
            Ok(signals) => {
                for signal in signals {
                    debug!(process_id = %id, code = %signal.code, "error detected in terminal output");
                    self.store.push_error(signal, Some(id));
                }
            }
            Err(err) => trace!(process_id = %id, error = %err, "output scan skipped"),
        }
    }
}
