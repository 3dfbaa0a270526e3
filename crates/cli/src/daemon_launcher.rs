// Auto-start of `forgepadd` for commands that need the daemon.

use std::ffi::OsString;
use std::io;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::UnixStream;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::client::is_daemon_unavailable_kind;

pub const DAEMON_BIN_ENV: &str = "FORGEPAD_DAEMON_BIN";
const DEFAULT_DAEMON_BIN: &str = "forgepadd";

const STARTUP_DEADLINE: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Return once something accepts connections on `socket_path`, launching
/// the daemon first when nothing is listening.
pub async fn ensure_daemon_running(socket_path: &Path) -> Result<()> {
    match UnixStream::connect(socket_path).await {
        Ok(_) => Ok(()),
        Err(err) if is_daemon_unavailable_kind(err.kind()) => {
            let binary = daemon_binary(std::env::var_os(DAEMON_BIN_ENV));
            let child = launch(&binary)?;
            await_socket(child, socket_path, STARTUP_DEADLINE).await
        }
        Err(err) => Err(err).with_context(|| {
            format!("failed to connect to daemon socket at `{}`", socket_path.display())
        }),
    }
}

fn daemon_binary(explicit: Option<OsString>) -> OsString {
    explicit
        .filter(|binary| !binary.is_empty())
        .unwrap_or_else(|| OsString::from(DEFAULT_DAEMON_BIN))
}

fn launch(binary: &OsString) -> Result<Child> {
    let child = Command::new(binary)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|err| {
            let hint = if err.kind() == io::ErrorKind::NotFound {
                format!(" (install it on PATH or set {DAEMON_BIN_ENV})")
            } else {
                String::new()
            };
            anyhow::Error::new(err)
                .context(format!("failed to launch daemon `{}`{hint}", binary.to_string_lossy()))
        })?;
    info!(pid = child.id(), binary = %binary.to_string_lossy(), "launched daemon");
    Ok(child)
}

/// Poll until the socket accepts a connection. A daemon that exits before
/// binding is reported immediately rather than after the deadline.
async fn await_socket(mut child: Child, socket_path: &Path, deadline: Duration) -> Result<()> {
    let give_up = Instant::now() + deadline;
    loop {
        match UnixStream::connect(socket_path).await {
            Ok(_) => return Ok(()),
            Err(err) if is_daemon_unavailable_kind(err.kind()) => {
                debug!(error = %err, "daemon socket not ready yet");
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("daemon socket at `{}` is not usable", socket_path.display())
                });
            }
        }

        if let Some(status) = child.try_wait().context("failed to poll daemon process")? {
            bail!("daemon exited during startup ({status}); run `forgepadd` directly to see why");
        }
        if Instant::now() >= give_up {
            bail!(
                "daemon did not open `{}` within {}ms",
                socket_path.display(),
                deadline.as_millis()
            );
        }
        sleep(POLL_INTERVAL).await;
    }
}
