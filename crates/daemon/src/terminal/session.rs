use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;

use forgepad_common::types::ProcessId;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};

pub(crate) const MAX_OUTPUT_HISTORY_BYTES: usize = 512 * 1024;
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Initializing,
    Ready,
    Busy,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub process_id: ProcessId,
    pub state: SessionState,
    pub active: bool,
    pub history_bytes: usize,
}

#[derive(Default)]
pub(crate) struct OutputHistory {
    chunks: VecDeque<String>,
    total_bytes: usize,
}

impl OutputHistory {
    pub(crate) fn push(&mut self, chunk: String) {
        self.total_bytes = self.total_bytes.saturating_add(chunk.len());
        self.chunks.push_back(chunk);
        while self.total_bytes > MAX_OUTPUT_HISTORY_BYTES {
            let Some(front) = self.chunks.pop_front() else {
                self.total_bytes = 0;
                break;
            };
            self.total_bytes = self.total_bytes.saturating_sub(front.len());
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<String> {
        self.chunks.iter().cloned().collect()
    }

    pub(crate) fn total_bytes(&self) -> usize {
        self.total_bytes
    }
}

/// Input side of a session. Writes made before the process is ready are
/// buffered and flushed in order once it is.
pub(crate) enum Input {
    Buffered(Vec<String>),
    Live(mpsc::Sender<String>),
    Closed,
}

pub(crate) struct Session {
    pub(crate) id: ProcessId,
    pub(crate) state: StdMutex<SessionState>,
    pub(crate) input: StdMutex<Input>,
    pub(crate) output: broadcast::Sender<String>,
    pub(crate) history: StdMutex<OutputHistory>,
    pub(crate) kill: StdMutex<Option<oneshot::Sender<()>>>,
}

impl Session {
    pub(crate) fn new(id: ProcessId) -> Self {
        let (output, _) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
        Self {
            id,
            state: StdMutex::new(SessionState::Created),
            input: StdMutex::new(Input::Buffered(Vec::new())),
            output,
            history: StdMutex::new(OutputHistory::default()),
            kill: StdMutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.lock().expect("session state lock poisoned")
    }

    /// Move to `next` unless the session already closed. Returns the
    /// state that was replaced.
    pub(crate) fn transition(&self, next: SessionState) -> Option<SessionState> {
        let mut state = self.state.lock().expect("session state lock poisoned");
        if *state == SessionState::Closed {
            return None;
        }
        Some(std::mem::replace(&mut *state, next))
    }

    pub(crate) fn history_bytes(&self) -> usize {
        self.history.lock().expect("session history lock poisoned").total_bytes()
    }

    /// Mark closed and release the process. Idempotent.
    pub(crate) fn close(&self) {
        *self.state.lock().expect("session state lock poisoned") = SessionState::Closed;
        *self.input.lock().expect("session input lock poisoned") = Input::Closed;
        if let Some(kill) = self.kill.lock().expect("session kill lock poisoned").take() {
            let _ = kill.send(());
        }
    }
}
