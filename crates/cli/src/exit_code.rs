// Consistent exit codes for the forgepad CLI.
//
//   0  = success
//   1  = general error
//   2  = usage/argument error (including params the daemon rejected)
//   10 = daemon not reachable
//   13 = network error

use std::process;

use forgepad_common::protocol::jsonrpc::{self, INVALID_PARAMS, INVALID_REQUEST};

/// Named exit codes for the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    Error = 1,
    Usage = 2,
    DaemonDown = 10,
    Network = 13,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Map an anyhow error to an exit code by inspecting the error chain.
    pub fn from_error(err: &anyhow::Error) -> Self {
        for cause in err.chain() {
            if let Some(rpc_err) = cause.downcast_ref::<RpcError>() {
                return Self::from_rpc_code(rpc_err.code);
            }
            if let Some(io_err) = cause.downcast_ref::<std::io::Error>() {
                return match io_err.kind() {
                    std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::NotFound => {
                        Self::DaemonDown
                    }
                    std::io::ErrorKind::TimedOut => Self::Network,
                    _ => Self::Error,
                };
            }
        }

        let msg = format!("{err:#}");
        if msg.contains("daemon") && (msg.contains("connect") || msg.contains("socket")) {
            return Self::DaemonDown;
        }
        if msg.contains("timed out") {
            return Self::Network;
        }

        Self::Error
    }

    /// Map a JSON-RPC error code to an exit code.
    pub fn from_rpc_code(code: i32) -> Self {
        match code {
            INVALID_PARAMS | INVALID_REQUEST => Self::Usage,
            _ => Self::Error,
        }
    }
}

impl From<ExitCode> for process::ExitCode {
    fn from(code: ExitCode) -> Self {
        process::ExitCode::from(code.code() as u8)
    }
}

/// A daemon-reported error that can be embedded in an `anyhow::Error` chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcError {
    pub method: String,
    pub code: i32,
    pub message: String,
    /// `data.reason`, when the daemon attached one.
    pub reason: Option<String>,
}

impl RpcError {
    pub fn from_wire(method: &str, error: jsonrpc::RpcError) -> Self {
        let reason = error
            .data
            .as_ref()
            .and_then(|data| data.get("reason"))
            .and_then(|reason| reason.as_str())
            .map(str::to_string);
        Self { method: method.to_string(), code: error.code, message: error.message, reason }
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "{} failed ({}): {reason}", self.method, self.code),
            None => write!(f, "{} failed ({}): {}", self.method, self.code, self.message),
        }
    }
}

impl std::error::Error for RpcError {}
