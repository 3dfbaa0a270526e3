// Output format auto-detection for the CLI.
//
// TTY → human-readable text. Piped/redirected → structured JSON.
// `--json` flag forces JSON output regardless of terminal.

use crate::client::daemon_unavailable_exit_code;
use crate::exit_code::RpcError;

use forgepad_common::protocol::jsonrpc::INVALID_PARAMS;
use serde::Serialize;
use std::io::{self, IsTerminal, Write};

const ANSI_RED: &str = "\x1b[31m";
const ANSI_YELLOW: &str = "\x1b[33m";
const ANSI_RESET: &str = "\x1b[0m";

/// Output format for CLI commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable text.
    Human,
    /// Machine-readable JSON (one object per response).
    Json,
}

impl OutputFormat {
    /// Auto-detect format: JSON if `--json` was passed or stdout is not a TTY.
    pub fn detect(json_flag: bool) -> Self {
        if json_flag {
            return Self::Json;
        }
        Self::detect_from_terminal(io::stdout().is_terminal())
    }

    /// Testable variant that takes an explicit `is_tty` flag.
    pub fn detect_from_terminal(is_tty: bool) -> Self {
        if is_tty {
            Self::Human
        } else {
            Self::Json
        }
    }
}

/// Write a value to stdout in the selected format.
pub fn print_output<T, F>(format: OutputFormat, value: &T, human_fn: F) -> io::Result<()>
where
    T: Serialize,
    F: FnOnce(&T) -> String,
{
    let mut out = io::stdout().lock();
    write_output(&mut out, format, value, human_fn)
}

/// Write a value to a provided writer (useful for testing).
pub fn write_output<W, T, F>(
    writer: &mut W,
    format: OutputFormat,
    value: &T,
    human_fn: F,
) -> io::Result<()>
where
    W: Write,
    T: Serialize,
    F: FnOnce(&T) -> String,
{
    match format {
        OutputFormat::Human => {
            writeln!(writer, "{}", human_fn(value))
        }
        OutputFormat::Json => {
            serde_json::to_writer(&mut *writer, value).map_err(io::Error::other)?;
            writeln!(writer)
        }
    }
}

/// Severity of a stderr diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Error,
    Warning,
}

impl Level {
    fn label(self) -> &'static str {
        match self {
            Level::Error => "error",
            Level::Warning => "warning",
        }
    }

    fn color(self) -> &'static str {
        match self {
            Level::Error => ANSI_RED,
            Level::Warning => ANSI_YELLOW,
        }
    }
}

pub fn print_error(format: OutputFormat, code: &str, message: &str) {
    emit_diagnostic(format, Level::Error, code, message);
}

pub fn print_warning(format: OutputFormat, code: &str, message: &str) {
    emit_diagnostic(format, Level::Warning, code, message);
}

fn emit_diagnostic(format: OutputFormat, level: Level, code: &str, message: &str) {
    let colored = io::stderr().is_terminal();
    let line = diagnostic_line(format, level, code, message, colored);
    let _ = writeln!(io::stderr().lock(), "{line}");
}

/// One stderr line: `{"error": {...}}` in JSON mode, `label: message` otherwise.
fn diagnostic_line(
    format: OutputFormat,
    level: Level,
    code: &str,
    message: &str,
    colored: bool,
) -> String {
    match format {
        OutputFormat::Json => {
            serde_json::json!({ (level.label()): { "code": code, "message": message } }).to_string()
        }
        OutputFormat::Human if colored => {
            format!("{}{}:{ANSI_RESET} {message}", level.color(), level.label())
        }
        OutputFormat::Human => format!("{}: {message}", level.label()),
    }
}

/// Print a mapped, actionable error for a command failure.
pub fn print_anyhow_error(format: OutputFormat, error: &anyhow::Error) {
    let (code, message) = actionable_error(error);
    print_error(format, code, &message);
}

fn actionable_error(error: &anyhow::Error) -> (&'static str, String) {
    let message = format!("{error:#}");
    let lower = message.to_ascii_lowercase();

    if daemon_unavailable_exit_code(error).is_some()
        || (lower.contains("daemon")
            && lower.contains("socket")
            && (lower.contains("connection refused")
                || lower.contains("not found")
                || lower.contains("failed to connect")))
    {
        return (
            "DAEMON_NOT_RUNNING",
            "Daemon is not running. Start it with: forgepadd (or it auto-starts with most commands)"
                .to_string(),
        );
    }

    if lower.contains("timed out") {
        return (
            "NETWORK_TIMEOUT",
            "Could not reach daemon. Check if forgepadd is running: ps aux | grep forgepadd"
                .to_string(),
        );
    }

    let rpc = error.chain().find_map(|cause| cause.downcast_ref::<RpcError>());
    if let Some(rpc) = rpc {
        let reason = rpc.reason.as_deref().unwrap_or(&rpc.message);
        if reason.contains("no active conversation") {
            return (
                "NO_ACTIVE_CONVERSATION",
                "No active conversation. Run: forgepad new (or forgepad switch <id>)".to_string(),
            );
        }
        if rpc.code == INVALID_PARAMS {
            return ("INVALID_PARAMS", format!("{}: {reason}", rpc.method));
        }
        return ("OPERATION_FAILED", format!("{}: {reason}", rpc.method));
    }

    ("RPC_ERROR", message)
}
