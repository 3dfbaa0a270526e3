use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{self, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::rpc::methods::{handle_raw_request, RpcServerState};
use crate::rpc::trace::{with_request_trace, RequestTrace};

const CONNECTION_DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Serve JSON-RPC 2.0 over a Unix domain socket until the listener fails.
///
/// Framing is newline-delimited JSON, matching the CLI transport.
pub async fn serve_unix(listener: UnixListener, state: RpcServerState) -> Result<()> {
    loop {
        let (stream, _) =
            listener.accept().await.context("failed to accept unix rpc connection")?;
        let connection_state = state.clone();
        tokio::spawn(async move {
            if let Err(error) = serve_connection(stream, connection_state).await {
                warn!(?error, "unix rpc connection failed");
            }
        });
    }
}

/// Like `serve_unix`, but stops accepting once `shutdown` fires. Connections
/// still open after a short grace period are aborted.
pub async fn serve_unix_until_shutdown(
    listener: UnixListener,
    state: RpcServerState,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let mut connections = JoinSet::new();
    let result = loop {
        tokio::select! {
            biased;

            _ = shutdown.recv() => break Ok(()),

            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        break Err(anyhow::Error::new(error)
                            .context("failed to accept unix rpc connection"));
                    }
                };
                let connection_state = state.clone();
                connections.spawn(async move {
                    if let Err(error) = serve_connection(stream, connection_state).await {
                        warn!(?error, "unix rpc connection failed");
                    }
                });
            }

            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    };

    // In-flight responses (including the one acknowledging a shutdown
    // request) get a short window to be written.
    debug!(open = connections.len(), "closing rpc connections");
    let _ = tokio::time::timeout(CONNECTION_DRAIN_GRACE, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    connections.shutdown().await;
    result
}

/// Handle a single RPC stream. Each request line yields one response line.
pub async fn serve_connection<IO>(stream: IO, state: RpcServerState) -> Result<()>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, mut write_half) = io::split(stream);
    let mut reader = BufReader::new(read_half);

    loop {
        let mut request_line = Vec::new();
        let bytes_read = reader
            .read_until(b'\n', &mut request_line)
            .await
            .context("failed to read json-rpc request")?;

        if bytes_read == 0 {
            return Ok(());
        }

        trim_line_endings(&mut request_line);
        if request_line.iter().all(|byte| byte.is_ascii_whitespace()) {
            continue;
        }

        let trace = RequestTrace::from_raw(&request_line);
        let response = with_request_trace(trace, handle_raw_request(&request_line, &state)).await;
        let mut encoded =
            serde_json::to_vec(&response).context("failed to serialize json-rpc response")?;
        encoded.push(b'\n');

        write_half.write_all(&encoded).await.context("failed to write json-rpc response")?;
        write_half.flush().await.context("failed to flush json-rpc response")?;
    }
}

fn trim_line_endings(line: &mut Vec<u8>) {
    while matches!(line.last(), Some(b'\n' | b'\r')) {
        line.pop();
    }
}

#[cfg(test)]
mod tests {
    use std::{io, path::Path, time::Duration};

    use forgepad_common::protocol::jsonrpc::{Request, RequestId, Response};
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        net::{UnixListener, UnixStream},
        sync::broadcast,
    };

    use super::{serve_unix, serve_unix_until_shutdown, RpcServerState};

    fn bind(path: &Path) -> Option<UnixListener> {
        match UnixListener::bind(path) {
            Ok(listener) => Some(listener),
            Err(error) if error.kind() == io::ErrorKind::PermissionDenied => {
                eprintln!("skipping unix socket test: bind is not permitted in this environment");
                None
            }
            Err(error) => panic!("failed to bind unix socket: {error}"),
        }
    }

    #[tokio::test]
    async fn accepts_concurrent_unix_connections() {
        let tmp = TempDir::new().expect("temp dir should be created");
        let socket_path = tmp.path().join("rpc.sock");
        let Some(listener) = bind(&socket_path) else {
            return;
        };

        let server =
            tokio::spawn(async move { serve_unix(listener, RpcServerState::in_memory()).await });

        let mut clients = Vec::new();
        for client_id in 0_i64..8_i64 {
            let socket_path = socket_path.clone();
            clients.push(tokio::spawn(async move {
                let request = Request::new(
                    "rpc.ping",
                    Some(json!({ "client_id": client_id })),
                    RequestId::Number(client_id),
                );
                rpc_call(&socket_path, request).await
            }));
        }

        for (expected_id, task) in (0_i64..8_i64).zip(clients) {
            let response = task.await.expect("client call should complete");
            assert_eq!(response.id, RequestId::Number(expected_id));
            assert!(response.error.is_none(), "expected success response: {response:?}");
            assert_eq!(response.result, Some(json!({ "ok": true })));
        }

        server.abort();
        let _ = server.await;
    }

    #[tokio::test]
    async fn keeps_connection_open_for_multiple_requests() {
        let tmp = TempDir::new().expect("temp dir should be created");
        let socket_path = tmp.path().join("rpc.sock");
        let Some(listener) = bind(&socket_path) else {
            return;
        };

        let server =
            tokio::spawn(async move { serve_unix(listener, RpcServerState::in_memory()).await });
        let stream = UnixStream::connect(&socket_path).await.expect("client should connect");
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let ping = Request::new("rpc.ping", Some(json!({})), RequestId::Number(1));
        write_request(&mut write_half, &ping).await;
        let ping_response = read_response(&mut reader).await;
        assert_eq!(ping_response.result, Some(json!({ "ok": true })));

        let create = Request::new("conversation.create", None, RequestId::Number(2));
        write_request(&mut write_half, &create).await;
        let created = read_response(&mut reader).await;
        assert_eq!(created.result.expect("create should succeed")["type"], "created");

        let unknown = Request::new("rpc.unknown", Some(json!({})), RequestId::Number(3));
        write_request(&mut write_half, &unknown).await;
        let unknown_response = read_response(&mut reader).await;
        assert!(unknown_response.result.is_none());
        assert_eq!(unknown_response.error.expect("error should be present").code, -32601);

        server.abort();
        let _ = server.await;
    }

    #[tokio::test]
    async fn shutdown_request_stops_the_server() {
        let tmp = TempDir::new().expect("temp dir should be created");
        let socket_path = tmp.path().join("rpc.sock");
        let Some(listener) = bind(&socket_path) else {
            return;
        };

        let (shutdown_tx, shutdown_rx) = broadcast::channel(4);
        let state = RpcServerState::in_memory().with_shutdown_notifier(shutdown_tx);
        let server = tokio::spawn(serve_unix_until_shutdown(listener, state, shutdown_rx));

        let response =
            rpc_call(&socket_path, Request::new("daemon.shutdown", None, RequestId::Number(1)))
                .await;
        assert_eq!(response.result, Some(json!({ "ok": true })));

        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("server should stop after shutdown")
            .expect("server task should resolve")
            .expect("server should exit cleanly");
    }

    async fn rpc_call(socket_path: &Path, request: Request) -> Response {
        let stream = UnixStream::connect(socket_path).await.expect("client should connect");
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        write_request(&mut write_half, &request).await;
        read_response(&mut reader).await
    }

    async fn write_request(write_half: &mut tokio::net::unix::OwnedWriteHalf, request: &Request) {
        let mut encoded =
            serde_json::to_vec(request).expect("request should serialize for test transport");
        encoded.push(b'\n');
        write_half.write_all(&encoded).await.expect("request write should succeed");
        write_half.flush().await.expect("request flush should succeed");
    }

    async fn read_response(reader: &mut BufReader<tokio::net::unix::OwnedReadHalf>) -> Response {
        let mut response_line = Vec::new();
        reader.read_until(b'\n', &mut response_line).await.expect("response should be readable");
        serde_json::from_slice::<Response>(&response_line).expect("response should decode")
    }
}
