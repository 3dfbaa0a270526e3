use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use forgepad_common::protocol::jsonrpc::{Request, RequestId, Response};
use forgepad_common::protocol::rpc_methods::DAEMON_SHUTDOWN;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::backend::{HttpProjectBackend, MemoryProjectBackend, ProjectBackend};
use crate::config::GlobalConfig;
use crate::coordinator::Coordinator;
use crate::rpc::methods::RpcServerState;
use crate::rpc::unix::serve_unix_until_shutdown;
use crate::sandbox::{LocalSandbox, MemorySandbox, Sandbox};
use crate::security::resolve_backend_token;
use crate::startup::{bind_socket, is_daemon_running, DaemonPaths};

const TAKEOVER_WAIT_RETRIES: usize = 40;
const TAKEOVER_WAIT_DELAY: Duration = Duration::from_millis(50);
const LOOP_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default)]
pub struct DaemonOptions {
    /// Serve over the in-memory sandbox and backend; nothing touches disk
    /// or the network besides the socket.
    pub dry_run: bool,
}

pub async fn run_standalone(config: GlobalConfig, options: DaemonOptions) -> Result<()> {
    let coordinator = build_coordinator(&config, &options)?;
    run_standalone_with_paths(DaemonPaths::resolve()?, coordinator).await
}

/// Pick the sandbox and backend drivers for this run.
pub fn build_coordinator(config: &GlobalConfig, options: &DaemonOptions) -> Result<Coordinator> {
    let sandbox: Arc<dyn Sandbox> = if options.dry_run {
        Arc::new(MemorySandbox::new())
    } else {
        let root = config
            .sandbox
            .resolved_root()
            .context("could not determine sandbox root; set [sandbox] root")?;
        info!(root = %root.display(), shell = %config.sandbox.shell, "using local sandbox");
        Arc::new(LocalSandbox::new(root, config.sandbox.shell.clone()))
    };

    let backend: Arc<dyn ProjectBackend> = match (&config.backend_url, options.dry_run) {
        (Some(url), false) => {
            let backend = HttpProjectBackend::new(url, resolve_backend_token())
                .with_context(|| format!("invalid backend url `{url}`"))?;
            info!(base_url = %backend.base_url(), "using http project backend");
            Arc::new(backend)
        }
        _ => {
            info!("no backend configured; projects are kept in memory");
            Arc::new(MemoryProjectBackend::new())
        }
    };

    Ok(Coordinator::assemble(sandbox, backend, config))
}

/// Long-running loops owned by the daemon besides the socket server.
struct BackgroundLoops {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundLoops {
    fn spawn(coordinator: &Coordinator, shutdown: &broadcast::Sender<()>) -> Self {
        let handles = vec![
            tokio::spawn(coordinator.bridge().clone().run(shutdown.subscribe())),
            tokio::spawn(coordinator.gateway().clone().run(shutdown.subscribe())),
            tokio::spawn(coordinator.clone().run_autosave(shutdown.subscribe())),
        ];
        Self { handles }
    }

    /// Wait for every loop to observe shutdown. The gateway drains pending
    /// saves before its loop returns.
    async fn join(self) {
        for handle in self.handles {
            match tokio::time::timeout(LOOP_SHUTDOWN_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => warn!(?error, "background loop panicked"),
                Err(_) => warn!("background loop did not stop in time"),
            }
        }
    }
}

async fn run_standalone_with_paths(paths: DaemonPaths, coordinator: Coordinator) -> Result<()> {
    take_over_running_daemon(&paths.socket_path).await?;

    let listener = bind_socket(&paths.socket_path).await?;
    paths.write_pid()?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(4);
    let loops = BackgroundLoops::spawn(&coordinator, &shutdown_tx);
    let state = RpcServerState::new(coordinator.clone()).with_shutdown_notifier(shutdown_tx.clone());
    let ctrl_c_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = ctrl_c_tx.send(());
    });

    info!(socket_path = %paths.socket_path.display(), "daemon started");
    let result = serve_unix_until_shutdown(listener, state, shutdown_rx).await;

    // A listener failure ends the server without a shutdown signal.
    let _ = shutdown_tx.send(());
    loops.join().await;
    coordinator.terminals().close_all();
    paths.release().await;
    info!("daemon stopped");
    result.context("daemon exited with error")
}

async fn take_over_running_daemon(socket_path: &Path) -> Result<()> {
    if !is_daemon_running(socket_path).await {
        return Ok(());
    }

    info!(socket_path = %socket_path.display(), "running daemon detected, requesting shutdown");
    request_daemon_shutdown(socket_path).await?;
    wait_for_daemon_shutdown(socket_path).await
}

async fn request_daemon_shutdown(socket_path: &Path) -> Result<()> {
    let request = Request::new(DAEMON_SHUTDOWN, None, RequestId::Number(1));
    let encoded =
        serde_json::to_vec(&request).context("failed to serialize daemon shutdown request")?;
    let mut stream =
        UnixStream::connect(socket_path).await.context("failed to connect to running daemon")?;
    stream.write_all(&encoded).await.context("failed to send daemon shutdown request")?;
    stream.write_all(b"\n").await.context("failed to send daemon shutdown request terminator")?;
    stream.flush().await.context("failed to flush daemon shutdown request")?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let bytes_read =
        reader.read_line(&mut line).await.context("failed to read daemon shutdown response")?;
    if bytes_read == 0 {
        return Ok(());
    }

    let response: Response =
        serde_json::from_str(line.trim()).context("failed to decode daemon shutdown response")?;
    if let Some(error) = response.error {
        return Err(anyhow!("daemon refused shutdown request: {}", error.message));
    }

    Ok(())
}

async fn wait_for_daemon_shutdown(socket_path: &Path) -> Result<()> {
    for _ in 0..TAKEOVER_WAIT_RETRIES {
        if !is_daemon_running(socket_path).await {
            return Ok(());
        }
        tokio::time::sleep(TAKEOVER_WAIT_DELAY).await;
    }

    Err(anyhow!("running daemon did not exit after takeover request at `{}`", socket_path.display()))
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use super::{build_coordinator, run_standalone_with_paths, DaemonOptions, DaemonPaths};
    use crate::config::GlobalConfig;
    use crate::startup::is_daemon_running;

    fn dry_run() -> DaemonOptions {
        DaemonOptions { dry_run: true }
    }

    async fn wait_until_running(paths: &DaemonPaths) {
        for _ in 0..80 {
            if is_daemon_running(&paths.socket_path).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("daemon should be accepting connections");
    }

    #[test]
    fn dry_run_ignores_configured_backend() {
        let config = GlobalConfig {
            backend_url: Some("http://example.com".to_string()),
            ..GlobalConfig::default()
        };
        // A non-loopback http url is rejected outside dry-run.
        assert!(build_coordinator(&config, &DaemonOptions::default()).is_err());
        assert!(build_coordinator(&config, &dry_run()).is_ok());
    }

    #[tokio::test]
    async fn second_daemon_takes_over_the_socket() {
        let tmp = TempDir::new().expect("temp dir should be created");
        let paths = DaemonPaths::resolve_in(tmp.path()).expect("paths should resolve");

        let config = GlobalConfig::default();
        let first_coordinator =
            build_coordinator(&config, &dry_run()).expect("dry-run coordinator should build");
        let first = tokio::spawn(run_standalone_with_paths(paths.clone(), first_coordinator));
        wait_until_running(&paths).await;

        let second_coordinator =
            build_coordinator(&config, &dry_run()).expect("dry-run coordinator should build");
        let second = tokio::spawn(run_standalone_with_paths(paths.clone(), second_coordinator));

        tokio::time::timeout(Duration::from_secs(10), first)
            .await
            .expect("first daemon should exit after takeover request")
            .expect("first daemon task should resolve")
            .expect("first daemon should shut down cleanly");

        wait_until_running(&paths).await;
        second.abort();
        let _ = second.await;
    }
}
