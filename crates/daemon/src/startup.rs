// Runtime files under ~/.forgepad: the control socket and the PID file.
// Readiness is signaled by the socket accepting connections.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tokio::net::{UnixListener, UnixStream};
use tracing::{info, warn};

use crate::config::global_dir;
use crate::security::{ensure_owner_only_dir, ensure_owner_only_file};

const SOCKET_NAME: &str = "daemon.sock";
const PID_FILE_NAME: &str = "daemon.pid";

#[derive(Debug, Clone)]
pub struct DaemonPaths {
    pub base_dir: PathBuf,
    pub socket_path: PathBuf,
    /// Diagnostics, plus ownership checks on shutdown.
    pub pid_path: PathBuf,
}

impl DaemonPaths {
    pub fn resolve() -> Result<Self> {
        let base = global_dir().context("could not determine home directory")?;
        Self::resolve_in(base)
    }

    /// Paths under `base`, which is created owner-only.
    pub fn resolve_in(base: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base.into();
        fs::create_dir_all(&base_dir)
            .with_context(|| format!("failed to create `{}`", base_dir.display()))?;
        ensure_owner_only_dir(&base_dir)?;
        Ok(Self {
            socket_path: base_dir.join(SOCKET_NAME),
            pid_path: base_dir.join(PID_FILE_NAME),
            base_dir,
        })
    }

    pub fn write_pid(&self) -> Result<()> {
        let pid = std::process::id();
        fs::write(&self.pid_path, pid.to_string())
            .with_context(|| format!("failed to write `{}`", self.pid_path.display()))?;
        ensure_owner_only_file(&self.pid_path)?;
        info!(pid, path = %self.pid_path.display(), "wrote PID file");
        Ok(())
    }

    pub fn recorded_pid(&self) -> Option<u32> {
        fs::read_to_string(&self.pid_path).ok()?.trim().parse().ok()
    }

    /// Remove runtime files on shutdown, leaving them alone when a
    /// replacement daemon has already taken them over.
    pub async fn release(&self) {
        if self.recorded_pid() == Some(std::process::id()) {
            remove_if_present(&self.pid_path);
        }
        if !is_daemon_running(&self.socket_path).await {
            remove_if_present(&self.socket_path);
        }
    }
}

fn remove_if_present(path: &Path) {
    if let Err(error) = fs::remove_file(path) {
        if error.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %error, "failed to remove runtime file");
        }
    }
}

/// Bind the control socket, replacing a stale socket left by a dead daemon.
/// Anything at `path` that is not a socket is left untouched.
pub async fn bind_socket(path: &Path) -> Result<UnixListener> {
    if let Ok(meta) = fs::symlink_metadata(path) {
        if !is_socket(&meta) {
            bail!("`{}` exists and is not a socket", path.display());
        }
        fs::remove_file(path).context("failed to remove stale socket")?;
    }

    let listener = UnixListener::bind(path)
        .with_context(|| format!("failed to bind `{}`", path.display()))?;
    info!(path = %path.display(), "daemon socket ready");
    Ok(listener)
}

#[cfg(unix)]
fn is_socket(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::FileTypeExt;
    meta.file_type().is_socket()
}

#[cfg(not(unix))]
fn is_socket(_meta: &fs::Metadata) -> bool {
    true
}

pub async fn is_daemon_running(socket_path: &Path) -> bool {
    UnixStream::connect(socket_path).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn paths(tmp: &TempDir) -> DaemonPaths {
        DaemonPaths::resolve_in(tmp.path().join("state")).expect("paths should resolve")
    }

    #[test]
    fn runtime_files_live_under_the_base_dir() {
        let tmp = TempDir::new().expect("temp dir should be created");
        let paths = paths(&tmp);
        assert!(paths.base_dir.is_dir());
        assert_eq!(paths.socket_path, paths.base_dir.join("daemon.sock"));
        assert_eq!(paths.pid_path, paths.base_dir.join("daemon.pid"));
    }

    #[tokio::test]
    async fn release_removes_only_our_own_pid_file() {
        let tmp = TempDir::new().expect("temp dir should be created");
        let paths = paths(&tmp);

        paths.write_pid().expect("pid file should be written");
        assert_eq!(paths.recorded_pid(), Some(std::process::id()));
        paths.release().await;
        assert!(!paths.pid_path.exists());

        fs::write(&paths.pid_path, "1").expect("foreign pid should be written");
        paths.release().await;
        assert_eq!(paths.recorded_pid(), Some(1));
    }

    #[tokio::test]
    async fn stale_socket_is_replaced_and_live_one_kept_on_release() {
        let tmp = TempDir::new().expect("temp dir should be created");
        let paths = paths(&tmp);

        drop(bind_socket(&paths.socket_path).await.expect("first bind should succeed"));
        let _listener = bind_socket(&paths.socket_path).await.expect("rebind should succeed");
        assert!(is_daemon_running(&paths.socket_path).await);

        paths.release().await;
        assert!(paths.socket_path.exists(), "a listening socket belongs to a live daemon");
    }

    #[tokio::test]
    async fn regular_file_at_socket_path_is_not_deleted() {
        let tmp = TempDir::new().expect("temp dir should be created");
        let paths = paths(&tmp);
        fs::write(&paths.socket_path, "notes").expect("file should be written");

        let error = bind_socket(&paths.socket_path).await.expect_err("bind should refuse");
        assert!(error.to_string().contains("not a socket"));
        assert_eq!(fs::read_to_string(&paths.socket_path).expect("file should remain"), "notes");
    }

    #[tokio::test]
    async fn missing_socket_means_not_running() {
        let tmp = TempDir::new().expect("temp dir should be created");
        assert!(!is_daemon_running(&tmp.path().join("nonexistent.sock")).await);
    }
}
