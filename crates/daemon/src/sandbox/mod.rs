// Execution sandbox: the mount target for workspaces and the host for
// terminal processes. One instance per process, booted at most once.

pub mod local;
pub mod memory;

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, OnceCell};
use tracing::{error, info};

pub use local::LocalSandbox;
pub use memory::MemorySandbox;

pub type SandboxFuture<T> = Pin<Box<dyn Future<Output = Result<T, SandboxError>> + Send>>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SandboxError {
    #[error("sandbox failed to boot: {0}")]
    BootFailed(String),
    #[error("sandbox instance limit reached: only one instance may exist and it failed to boot")]
    InstanceLimit,
    #[error("sandbox is not booted")]
    NotBooted,
    #[error("path is outside the sandbox: {0}")]
    InvalidPath(String),
    #[error("sandbox I/O failed at `{path}`: {message}")]
    Io { path: String, message: String },
    #[error("failed to spawn process: {0}")]
    Spawn(String),
}

impl SandboxError {
    /// Errors that block further mounts until the user intervenes.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::BootFailed(_) | Self::InstanceLimit | Self::NotBooted)
    }

    pub(crate) fn io(path: impl Into<String>, error: std::io::Error) -> Self {
        Self::Io { path: path.into(), message: error.to_string() }
    }
}

/// Byte streams of one spawned process.
pub struct ProcessIo {
    pub input: mpsc::Sender<String>,
    pub output: mpsc::Receiver<String>,
    /// Fires once the process reports readiness.
    pub ready: oneshot::Receiver<()>,
    /// Send (or drop) to terminate the process.
    pub kill: oneshot::Sender<()>,
}

/// Filesystem and process surface of the sandbox. Paths are normalized,
/// workspace-relative.
pub trait Sandbox: Send + Sync {
    fn boot(&self) -> SandboxFuture<()>;
    fn mkdir(&self, path: String) -> SandboxFuture<()>;
    fn write_file(&self, path: String, content: String) -> SandboxFuture<()>;
    fn remove(&self, path: String) -> SandboxFuture<()>;
    fn spawn_shell(&self) -> SandboxFuture<ProcessIo>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", content = "reason", rename_all = "snake_case")]
pub enum SandboxPhase {
    NotBooted,
    Booting,
    Ready,
    Failed(String),
}

/// Process-wide owner of the single sandbox instance.
///
/// Concurrent `ensure_booted` calls share one in-flight boot. Once a boot
/// has failed, later calls get `InstanceLimit` instead of a new attempt.
pub struct SandboxHost {
    sandbox: Arc<dyn Sandbox>,
    boot: OnceCell<Result<(), SandboxError>>,
    phase: StdMutex<SandboxPhase>,
}

impl SandboxHost {
    pub fn new(sandbox: Arc<dyn Sandbox>) -> Self {
        Self { sandbox, boot: OnceCell::new(), phase: StdMutex::new(SandboxPhase::NotBooted) }
    }

    pub fn phase(&self) -> SandboxPhase {
        self.phase.lock().expect("sandbox phase lock poisoned").clone()
    }

    fn set_phase(&self, phase: SandboxPhase) {
        *self.phase.lock().expect("sandbox phase lock poisoned") = phase;
    }

    pub async fn ensure_booted(&self) -> Result<(), SandboxError> {
        if let Some(Err(_)) = self.boot.get() {
            return Err(SandboxError::InstanceLimit);
        }

        self.boot
            .get_or_init(|| async {
                self.set_phase(SandboxPhase::Booting);
                info!("booting sandbox");
                let result = self.sandbox.boot().await;
                match &result {
                    Ok(()) => {
                        self.set_phase(SandboxPhase::Ready);
                        info!("sandbox ready");
                    }
                    Err(err) => {
                        self.set_phase(SandboxPhase::Failed(err.to_string()));
                        error!(error = %err, "sandbox boot failed");
                    }
                }
                result
            })
            .await
            .clone()
    }

    /// The sandbox, only once booted.
    pub fn booted(&self) -> Result<&Arc<dyn Sandbox>, SandboxError> {
        match self.boot.get() {
            Some(Ok(())) => Ok(&self.sandbox),
            Some(Err(_)) => Err(SandboxError::InstanceLimit),
            None => Err(SandboxError::NotBooted),
        }
    }
}
