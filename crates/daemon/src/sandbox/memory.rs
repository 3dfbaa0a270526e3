// In-process sandbox for tests and `--dry-run`: a path → content map and
// shells that echo their input back line by line.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use forgepad_common::path::normalize::is_within;
use forgepad_common::path::normalize_path;
use tokio::sync::{mpsc, oneshot};

use super::{ProcessIo, Sandbox, SandboxError, SandboxFuture};

#[derive(Default)]
struct Inner {
    files: StdMutex<BTreeMap<String, String>>,
    dirs: StdMutex<BTreeSet<String>>,
    writes: AtomicUsize,
    removes: AtomicUsize,
    boots: AtomicUsize,
    boot_failure: StdMutex<Option<String>>,
}

#[derive(Clone, Default)]
pub struct MemorySandbox {
    inner: Arc<Inner>,
}

impl MemorySandbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sandbox whose boot always fails with `reason`.
    pub fn failing_boot(reason: impl Into<String>) -> Self {
        let sandbox = Self::default();
        *sandbox.inner.boot_failure.lock().expect("boot failure lock poisoned") = Some(reason.into());
        sandbox
    }

    pub fn files(&self) -> BTreeMap<String, String> {
        self.inner.files.lock().expect("memory sandbox lock poisoned").clone()
    }

    pub fn dirs(&self) -> BTreeSet<String> {
        self.inner.dirs.lock().expect("memory sandbox lock poisoned").clone()
    }

    pub fn write_count(&self) -> usize {
        self.inner.writes.load(Ordering::SeqCst)
    }

    pub fn remove_count(&self) -> usize {
        self.inner.removes.load(Ordering::SeqCst)
    }

    pub fn boot_count(&self) -> usize {
        self.inner.boots.load(Ordering::SeqCst)
    }
}

fn checked(path: &str) -> Result<String, SandboxError> {
    normalize_path(path).map_err(|error| SandboxError::InvalidPath(error.to_string()))
}

impl Sandbox for MemorySandbox {
    fn boot(&self) -> SandboxFuture<()> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            inner.boots.fetch_add(1, Ordering::SeqCst);
            match inner.boot_failure.lock().expect("boot failure lock poisoned").clone() {
                Some(reason) => Err(SandboxError::BootFailed(reason)),
                None => Ok(()),
            }
        })
    }

    fn mkdir(&self, path: String) -> SandboxFuture<()> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            let path = checked(&path)?;
            inner.dirs.lock().expect("memory sandbox lock poisoned").insert(path);
            Ok(())
        })
    }

    fn write_file(&self, path: String, content: String) -> SandboxFuture<()> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            let path = checked(&path)?;
            inner.writes.fetch_add(1, Ordering::SeqCst);
            inner.files.lock().expect("memory sandbox lock poisoned").insert(path, content);
            Ok(())
        })
    }

    fn remove(&self, path: String) -> SandboxFuture<()> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            let path = checked(&path)?;
            inner.removes.fetch_add(1, Ordering::SeqCst);
            inner
                .files
                .lock()
                .expect("memory sandbox lock poisoned")
                .retain(|existing, _| !is_within(existing, &path));
            inner
                .dirs
                .lock()
                .expect("memory sandbox lock poisoned")
                .retain(|existing| !is_within(existing, &path));
            Ok(())
        })
    }

    fn spawn_shell(&self) -> SandboxFuture<ProcessIo> {
        Box::pin(async move {
            let (input_tx, mut input_rx) = mpsc::channel::<String>(64);
            let (output_tx, output_rx) = mpsc::channel::<String>(64);
            let (ready_tx, ready_rx) = oneshot::channel();
            let (kill_tx, mut kill_rx) = oneshot::channel::<()>();

            tokio::spawn(async move {
                let _ = ready_tx.send(());
                let mut line = String::new();
                loop {
                    tokio::select! {
                        _ = &mut kill_rx => break,
                        data = input_rx.recv() => {
                            let Some(data) = data else { break };
                            line.push_str(&data);
                            while let Some(end) = line.find('\n') {
                                let complete: String = line.drain(..=end).collect();
                                if output_tx.send(complete).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                }
            });

            Ok(ProcessIo { input: input_tx, output: output_rx, ready: ready_rx, kill: kill_tx })
        })
    }
}
