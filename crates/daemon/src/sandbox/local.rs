// Directory-backed sandbox: files under a root on disk, shells via tokio::process.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use forgepad_common::path::normalize_path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::{ProcessIo, Sandbox, SandboxError, SandboxFuture};

const READ_CHUNK_BYTES: usize = 4096;
const CHANNEL_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct LocalSandbox {
    root: Arc<PathBuf>,
    shell: Arc<String>,
}

impl LocalSandbox {
    pub fn new(root: impl Into<PathBuf>, shell: impl Into<String>) -> Self {
        Self { root: Arc::new(root.into()), shell: Arc::new(shell.into()) }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, SandboxError> {
        let normalized =
            normalize_path(path).map_err(|error| SandboxError::InvalidPath(error.to_string()))?;
        Ok(self.root.join(normalized))
    }
}

impl Sandbox for LocalSandbox {
    fn boot(&self) -> SandboxFuture<()> {
        let root = Arc::clone(&self.root);
        Box::pin(async move {
            tokio::fs::create_dir_all(root.as_path())
                .await
                .map_err(|error| SandboxError::BootFailed(format!("{}: {error}", root.display())))?;
            crate::security::ensure_owner_only_dir(&root)
                .map_err(|error| SandboxError::BootFailed(error.to_string()))?;
            Ok(())
        })
    }

    fn mkdir(&self, path: String) -> SandboxFuture<()> {
        let root = Arc::clone(&self.root);
        let resolved = self.resolve(&path);
        Box::pin(async move {
            let target = resolved?;
            ensure_confined(&root, &target, &path).await?;
            tokio::fs::create_dir_all(&target).await.map_err(|error| SandboxError::io(path, error))
        })
    }

    fn write_file(&self, path: String, content: String) -> SandboxFuture<()> {
        let root = Arc::clone(&self.root);
        let resolved = self.resolve(&path);
        Box::pin(async move {
            let target = resolved?;
            if is_symlink(&target).await {
                return Err(SandboxError::InvalidPath(format!("`{path}` is a symlink")));
            }
            ensure_confined(&root, &target, &path).await?;
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|error| SandboxError::io(path.clone(), error))?;
            }
            tokio::fs::write(&target, content).await.map_err(|error| SandboxError::io(path, error))
        })
    }

    fn remove(&self, path: String) -> SandboxFuture<()> {
        let root = Arc::clone(&self.root);
        let resolved = self.resolve(&path);
        Box::pin(async move {
            let target = resolved?;
            if let Some(parent) = target.parent() {
                ensure_confined(&root, parent, &path).await?;
            }
            // A symlink is removed itself, never what it points at.
            let result = match tokio::fs::symlink_metadata(&target).await {
                Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&target).await,
                Ok(_) => tokio::fs::remove_file(&target).await,
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(error) => Err(error),
            };
            result.map_err(|error| SandboxError::io(path, error))
        })
    }

    fn spawn_shell(&self) -> SandboxFuture<ProcessIo> {
        let root = Arc::clone(&self.root);
        let shell = Arc::clone(&self.shell);
        Box::pin(async move {
            let mut child = Command::new(shell.as_str())
                .current_dir(root.as_path())
                .env("TERM", "dumb")
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|error| SandboxError::Spawn(format!("{shell}: {error}")))?;

            let (input_tx, mut input_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
            let (output_tx, output_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
            let (ready_tx, ready_rx) = oneshot::channel();
            let (kill_tx, kill_rx) = oneshot::channel::<()>();

            if let Some(mut stdin) = child.stdin.take() {
                tokio::spawn(async move {
                    while let Some(data) = input_rx.recv().await {
                        if stdin.write_all(data.as_bytes()).await.is_err()
                            || stdin.flush().await.is_err()
                        {
                            break;
                        }
                    }
                });
            }
            if let Some(stdout) = child.stdout.take() {
                tokio::spawn(pump_output(stdout, output_tx.clone()));
            }
            if let Some(stderr) = child.stderr.take() {
                tokio::spawn(pump_output(stderr, output_tx));
            }

            tokio::spawn(async move {
                tokio::select! {
                    status = child.wait() => {
                        debug!(?status, "shell exited");
                    }
                    _ = kill_rx => {
                        if let Err(error) = child.kill().await {
                            warn!(error = %error, "failed to kill shell");
                        }
                    }
                }
            });

            // A spawned shell accepts input immediately.
            let _ = ready_tx.send(());
            Ok(ProcessIo { input: input_tx, output: output_rx, ready: ready_rx, kill: kill_tx })
        })
    }
}

async fn is_symlink(path: &Path) -> bool {
    tokio::fs::symlink_metadata(path).await.is_ok_and(|meta| meta.file_type().is_symlink())
}

/// Fail when the nearest existing ancestor of `target` resolves outside
/// `root`. Shells run inside the root and may leave symlinks behind.
async fn ensure_confined(root: &Path, target: &Path, display: &str) -> Result<(), SandboxError> {
    let root = tokio::fs::canonicalize(root).await.map_err(|error| SandboxError::io(display, error))?;
    let mut existing = target.to_path_buf();
    loop {
        match tokio::fs::canonicalize(&existing).await {
            Ok(resolved) if resolved.starts_with(&root) => return Ok(()),
            Ok(_) => {
                return Err(SandboxError::InvalidPath(format!(
                    "`{display}` resolves outside the sandbox"
                )));
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                if !existing.pop() {
                    return Ok(());
                }
            }
            Err(error) => return Err(SandboxError::io(display, error)),
        }
    }
}

async fn pump_output<R>(mut reader: R, output: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; READ_CHUNK_BYTES];
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let chunk = String::from_utf8_lossy(&buffer[..n]).into_owned();
                if output.send(chunk).await.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn sandbox(tmp: &TempDir) -> LocalSandbox {
        LocalSandbox::new(tmp.path().join("sandbox"), "/bin/sh")
    }

    #[tokio::test]
    async fn write_creates_parents_and_remove_is_idempotent() {
        let tmp = TempDir::new().expect("tempdir should be created");
        let sandbox = sandbox(&tmp);
        sandbox.boot().await.expect("boot should succeed");

        sandbox
            .write_file("src/lib/a.ts".into(), "export const a = 1;".into())
            .await
            .expect("write should succeed");
        let on_disk = std::fs::read_to_string(sandbox.root().join("src/lib/a.ts"))
            .expect("file should exist");
        assert_eq!(on_disk, "export const a = 1;");

        sandbox.remove("src".into()).await.expect("remove dir should succeed");
        assert!(!sandbox.root().join("src").exists());
        sandbox.remove("src".into()).await.expect("second remove should be a no-op");
    }

    #[tokio::test]
    async fn traversal_is_rejected() {
        let tmp = TempDir::new().expect("tempdir should be created");
        let sandbox = sandbox(&tmp);
        sandbox.boot().await.expect("boot should succeed");

        let error = sandbox
            .write_file("../escape.txt".into(), "x".into())
            .await
            .expect_err("traversal should fail");
        assert!(matches!(error, SandboxError::InvalidPath(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinks_cannot_redirect_writes_outside_the_root() {
        let tmp = TempDir::new().expect("tempdir should be created");
        let sandbox = sandbox(&tmp);
        sandbox.boot().await.expect("boot should succeed");
        let outside = tmp.path().join("outside");
        std::fs::create_dir_all(&outside).expect("outside dir should be created");
        std::fs::write(outside.join("target.txt"), "untouched").expect("target should be written");
        std::os::unix::fs::symlink(&outside, sandbox.root().join("src")).expect("dir link");
        std::os::unix::fs::symlink(outside.join("target.txt"), sandbox.root().join("link.ts"))
            .expect("file link");

        for path in ["src/evil.ts", "src/deep/evil.ts", "link.ts"] {
            let error = sandbox
                .write_file(path.into(), "x".into())
                .await
                .expect_err("write through a symlink should fail");
            assert!(matches!(error, SandboxError::InvalidPath(_)), "{path}: {error}");
        }
        assert!(matches!(
            sandbox.mkdir("src/lib".into()).await,
            Err(SandboxError::InvalidPath(_))
        ));
        assert!(!outside.join("evil.ts").exists());
        assert!(!outside.join("deep").exists());

        sandbox.remove("src".into()).await.expect("removing the link should succeed");
        sandbox.remove("link.ts".into()).await.expect("removing the link should succeed");
        assert!(!sandbox.root().join("src").exists());
        assert_eq!(
            std::fs::read_to_string(outside.join("target.txt")).expect("target should survive"),
            "untouched"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shell_echoes_through_pipes() {
        let tmp = TempDir::new().expect("tempdir should be created");
        let sandbox = sandbox(&tmp);
        sandbox.boot().await.expect("boot should succeed");

        let mut io = sandbox.spawn_shell().await.expect("shell should spawn");
        (&mut io.ready).await.expect("shell should report ready");
        io.input.send("echo forgepad-ok\n".into()).await.expect("input should be accepted");

        let chunk = tokio::time::timeout(Duration::from_secs(5), io.output.recv())
            .await
            .expect("output should arrive")
            .expect("output channel should be open");
        assert!(chunk.contains("forgepad-ok"));
        let _ = io.kill.send(());
    }
}
