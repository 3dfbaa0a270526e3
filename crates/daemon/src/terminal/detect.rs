// Error detection over terminal output.
//
// Detection is heuristic and pluggable: the manager feeds complete lines to an
// `ErrorDetector` and forwards whatever it yields to the workspace error
// queue. A detector failure only loses that line's signals.

use std::sync::OnceLock;

use forgepad_common::types::{ErrorSignal, Severity};
use regex::Regex;
use thiserror::Error;

/// Lines longer than this are not scanned.
pub const MAX_SCAN_LINE_BYTES: usize = 16 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DetectError {
    #[error("line of {0} bytes exceeds the scan limit")]
    LineTooLong(usize),
    #[error("{0}")]
    Other(String),
}

pub trait ErrorDetector: Send + Sync {
    /// Scan one complete output line (terminator stripped).
    fn detect(&self, line: &str) -> Result<Vec<ErrorSignal>, DetectError>;
}

/// Default detector: ANSI-stripped regex matching for the toolchains a web
/// project sandbox usually runs (tsc, npm, node, vite, esbuild).
#[derive(Debug, Default, Clone, Copy)]
pub struct RegexErrorDetector;

struct Rule {
    pattern: Regex,
    severity: Severity,
    /// Fixed code, or `None` to take it from the `code` capture group.
    code: Option<&'static str>,
}

fn ansi_escape() -> &'static Regex {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    ANSI.get_or_init(|| {
        Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]")
            .expect("ansi escape pattern should compile")
    })
}

fn rules() -> &'static [Rule] {
    static RULES: OnceLock<Vec<Rule>> = OnceLock::new();
    RULES
        .get_or_init(|| {
            vec![
                // tsc: `src/a.ts(3,7): error TS2304: Cannot find name 'x'.`
                Rule {
                    pattern: Regex::new(r"\berror (?P<code>TS\d{3,5}):\s*(?P<message>.+)$")
                        .expect("typescript pattern should compile"),
                    severity: Severity::Error,
                    code: None,
                },
                // npm: `npm ERR! code ENOENT`
                Rule {
                    pattern: Regex::new(r"^npm (?:ERR!|error) code (?P<code>E[A-Z0-9_]+)\s*$")
                        .expect("npm pattern should compile"),
                    severity: Severity::Error,
                    code: None,
                },
                // esbuild: `✘ [ERROR] Could not resolve "react"`
                Rule {
                    pattern: Regex::new(r"^(?:✘|X)?\s*\[ERROR\]\s+(?P<message>.+)$")
                        .expect("esbuild pattern should compile"),
                    severity: Severity::Error,
                    code: Some("ESBUILD_ERROR"),
                },
                // vite: `[vite] Internal server error: Failed to resolve import`
                Rule {
                    pattern: Regex::new(
                        r"\[vite\]\s+(?:Internal server error|Pre-transform error|error)[:\s]+(?P<message>.+)$",
                    )
                    .expect("vite pattern should compile"),
                    severity: Severity::Error,
                    code: Some("VITE_ERROR"),
                },
                // JS runtime: `TypeError: x is not a function`
                Rule {
                    pattern: Regex::new(
                        r"^(?:Uncaught\s+)?(?P<code>(?:[A-Z][A-Za-z]*)?Error)(?:\s*\[(?P<node>ERR_[A-Z0-9_]+)\])?:\s*(?P<message>.+)$",
                    )
                    .expect("runtime error pattern should compile"),
                    severity: Severity::Error,
                    code: None,
                },
                // Node error codes anywhere in a line: `code: 'ERR_MODULE_NOT_FOUND'`
                Rule {
                    pattern: Regex::new(r"\b(?P<code>ERR_[A-Z0-9_]{3,})\b")
                        .expect("node code pattern should compile"),
                    severity: Severity::Error,
                    code: None,
                },
                Rule {
                    pattern: Regex::new(r"(?i)^(?:npm\s+)?warn(?:ing)?[:!]?\s+(?P<message>.+)$")
                        .expect("warning pattern should compile"),
                    severity: Severity::Warning,
                    code: Some("WARNING"),
                },
            ]
        })
        .as_slice()
}

/// Remove terminal escape sequences and carriage returns.
pub fn strip_ansi(text: &str) -> String {
    ansi_escape().replace_all(text, "").replace('\r', "")
}

impl ErrorDetector for RegexErrorDetector {
    fn detect(&self, line: &str) -> Result<Vec<ErrorSignal>, DetectError> {
        if line.len() > MAX_SCAN_LINE_BYTES {
            return Err(DetectError::LineTooLong(line.len()));
        }
        let clean = strip_ansi(line);
        let clean = clean.trim();
        if clean.is_empty() {
            return Ok(Vec::new());
        }

        // First matching rule wins so one line yields at most one signal.
        for rule in rules() {
            let Some(captures) = rule.pattern.captures(clean) else {
                continue;
            };
            let code = match rule.code {
                Some(fixed) => fixed.to_string(),
                None => captures
                    .name("node")
                    .or_else(|| captures.name("code"))
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default(),
            };
            let message = captures
                .name("message")
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_else(|| clean.to_string());
            return Ok(vec![ErrorSignal { message, code, severity: rule.severity }]);
        }
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detect_one(line: &str) -> Option<ErrorSignal> {
        RegexErrorDetector.detect(line).expect("detection should succeed").into_iter().next()
    }

    #[test]
    fn typescript_diagnostic_uses_ts_code() {
        let signal = detect_one("src/main.ts(4,9): error TS2304: Cannot find name 'foo'.")
            .expect("ts error should be detected");
        assert_eq!(signal.code, "TS2304");
        assert_eq!(signal.message, "Cannot find name 'foo'.");
        assert_eq!(signal.severity, Severity::Error);
    }

    #[test]
    fn ansi_colouring_is_ignored() {
        let signal = detect_one("\x1b[31mTypeError\x1b[39m: x is not a function\r")
            .expect("coloured runtime error should be detected");
        assert_eq!(signal.code, "TypeError");
        assert_eq!(signal.message, "x is not a function");
    }

    #[test]
    fn npm_and_node_codes() {
        assert_eq!(detect_one("npm ERR! code ENOENT").map(|s| s.code), Some("ENOENT".to_string()));
        assert_eq!(
            detect_one("Error [ERR_MODULE_NOT_FOUND]: Cannot find package 'vite'").map(|s| s.code),
            Some("ERR_MODULE_NOT_FOUND".to_string())
        );
        assert_eq!(
            detect_one("  code: 'ERR_INVALID_ARG_TYPE'").map(|s| s.code),
            Some("ERR_INVALID_ARG_TYPE".to_string())
        );
    }

    #[test]
    fn bundler_errors() {
        let esbuild = detect_one("✘ [ERROR] Could not resolve \"react\"").expect("esbuild error");
        assert_eq!(esbuild.code, "ESBUILD_ERROR");
        assert_eq!(esbuild.message, "Could not resolve \"react\"");

        let vite = detect_one("10:02:11 AM [vite] Internal server error: Failed to resolve import")
            .expect("vite error");
        assert_eq!(vite.code, "VITE_ERROR");
    }

    #[test]
    fn warnings_have_warning_severity() {
        let signal = detect_one("warning: unused variable `x`").expect("warning should be detected");
        assert_eq!(signal.severity, Severity::Warning);
        assert_eq!(signal.message, "unused variable `x`");
    }

    #[test]
    fn ordinary_output_yields_nothing() {
        assert!(detect_one("  VITE v5.0.0  ready in 312 ms").is_none());
        assert!(detect_one("added 120 packages in 3s").is_none());
        assert!(detect_one("").is_none());
    }

    #[test]
    fn oversized_line_is_a_detection_error() {
        let line = "x".repeat(MAX_SCAN_LINE_BYTES + 1);
        assert_eq!(
            RegexErrorDetector.detect(&line),
            Err(DetectError::LineTooLong(MAX_SCAN_LINE_BYTES + 1))
        );
    }
}
