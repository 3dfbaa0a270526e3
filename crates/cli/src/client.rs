use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use forgepad_common::protocol::jsonrpc::{Request, RequestId, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::debug;

use crate::exit_code::RpcError;

pub const DAEMON_NOT_RUNNING_EXIT_CODE: i32 = 10;

const SOCKET_RELATIVE_PATH: &str = ".forgepad/daemon.sock";
const DEFAULT_TIMEOUT_SECS: u64 = 5;

#[derive(Debug)]
pub struct DaemonUnavailable {
    socket_path: PathBuf,
    source: io::Error,
}

impl DaemonUnavailable {
    fn new(socket_path: PathBuf, source: io::Error) -> Self {
        Self { socket_path, source }
    }

    pub fn exit_code(&self) -> i32 {
        DAEMON_NOT_RUNNING_EXIT_CODE
    }
}

impl fmt::Display for DaemonUnavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "daemon is not running (socket `{}`)", self.socket_path.display())
    }
}

impl std::error::Error for DaemonUnavailable {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

#[derive(Debug)]
pub struct DaemonClient {
    socket_path: PathBuf,
    timeout: Duration,
    next_request_id: AtomicI64,
}

impl Default for DaemonClient {
    fn default() -> Self {
        Self::new(default_socket_path())
    }
}

impl DaemonClient {
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            next_request_id: AtomicI64::new(1),
        }
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    /// Call `method` and decode its result.
    ///
    /// Transport failures are retried once. Errors the daemon answered with
    /// are returned as-is, since the request may already have taken effect.
    pub async fn call<R>(&self, method: &str, params: Option<Value>) -> Result<R>
    where
        R: DeserializeOwned,
    {
        let id = self.next_request_id.fetch_add(1, Ordering::SeqCst);

        match self.call_once(id, method, params.clone()).await {
            Ok(result) => Ok(result),
            Err(first_error) if is_daemon_answer(&first_error) => Err(first_error),
            Err(first_error) => {
                debug!(method, error = %first_error, "retrying json-rpc call");
                self.call_once(id, method, params).await.map_err(|second_error| {
                    second_error.context(format!(
                        "json-rpc call failed after retry; first error: {first_error:#}"
                    ))
                })
            }
        }
    }

    async fn call_once<R>(&self, id: i64, method: &str, params: Option<Value>) -> Result<R>
    where
        R: DeserializeOwned,
    {
        let request = Request::new(method, params, RequestId::Number(id));
        let mut payload =
            serde_json::to_vec(&request).context("failed to serialize json-rpc request")?;
        payload.push(b'\n');

        let stream = timeout(self.timeout, UnixStream::connect(&self.socket_path))
            .await
            .context("timed out connecting to daemon socket")?
            .map_err(|err| {
                if is_daemon_unavailable_kind(err.kind()) {
                    anyhow!(DaemonUnavailable::new(self.socket_path.clone(), err))
                } else {
                    anyhow!(err)
                }
            })
            .with_context(|| {
                format!("failed to connect to daemon socket `{}`", self.socket_path.display())
            })?;

        let (read_half, mut write_half) = stream.into_split();
        timeout(self.timeout, write_half.write_all(&payload))
            .await
            .context("timed out writing json-rpc request")?
            .context("failed writing json-rpc request to daemon socket")?;
        timeout(self.timeout, write_half.flush())
            .await
            .context("timed out flushing json-rpc request")?
            .context("failed flushing json-rpc request to daemon socket")?;

        let mut reader = BufReader::new(read_half);
        let mut response_line = Vec::new();
        timeout(self.timeout, reader.read_until(b'\n', &mut response_line))
            .await
            .context("timed out waiting for json-rpc response")?
            .context("failed reading json-rpc response from daemon socket")?;

        if response_line.is_empty() {
            anyhow::bail!("daemon returned an empty json-rpc response");
        }

        let response: Response = serde_json::from_slice(&response_line)
            .context("failed to decode daemon json-rpc response")?;

        if let Some(error) = response.error {
            return Err(anyhow::Error::new(RpcError::from_wire(method, error)));
        }

        let result = response.result.context("daemon json-rpc response missing `result` field")?;
        serde_json::from_value(result)
            .with_context(|| format!("failed to decode `{method}` result"))
    }
}

pub fn daemon_unavailable_exit_code(error: &anyhow::Error) -> Option<i32> {
    error.downcast_ref::<DaemonUnavailable>().map(DaemonUnavailable::exit_code)
}

/// `~/.forgepad/daemon.sock`, where the daemon binds.
pub fn default_socket_path() -> PathBuf {
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));
    home.join(SOCKET_RELATIVE_PATH)
}

fn is_daemon_answer(error: &anyhow::Error) -> bool {
    error.downcast_ref::<RpcError>().is_some()
}

pub(crate) fn is_daemon_unavailable_kind(kind: io::ErrorKind) -> bool {
    matches!(kind, io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused)
}
