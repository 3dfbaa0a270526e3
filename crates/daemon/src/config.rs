// Local configuration for the daemon.
//
// Global config: `~/.forgepad/config.toml`

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::security::{ensure_owner_only_dir, ensure_owner_only_file};

/// Environment override for the backend base URL.
pub const BACKEND_URL_ENV: &str = "FORGEPAD_BACKEND_URL";

/// Root directory for forgepad global state: `~/.forgepad/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".forgepad"))
}

/// Path to the global config file: `~/.forgepad/config.toml`.
pub fn global_config_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("config.toml"))
}

// ── Global config ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct GlobalConfig {
    /// Project backend base URL (e.g. `https://api.forgepad.dev`).
    /// Unset means the in-process backend is used.
    pub backend_url: Option<String>,
    pub sandbox: SandboxConfig,
    pub sync: SyncTuning,
    pub errors: ErrorQueueConfig,
}

impl GlobalConfig {
    /// Load from `~/.forgepad/config.toml`, then apply environment
    /// overrides. Returns defaults if the file doesn't exist or can't be parsed.
    pub fn load() -> Self {
        let mut config =
            global_config_path().and_then(|p| Self::load_from(&p).ok()).unwrap_or_default();
        if let Ok(url) = std::env::var(BACKEND_URL_ENV) {
            if !url.trim().is_empty() {
                config.backend_url = Some(url);
            }
        }
        config
    }

    /// Load from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&contents).map_err(ConfigError::Parse)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigError::Io)?;
            ensure_owner_only_dir(parent)
                .map_err(|error| ConfigError::Io(std::io::Error::other(error.to_string())))?;
        }
        let contents = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, contents).map_err(ConfigError::Io).and_then(|_| {
            ensure_owner_only_file(path)
                .map_err(|error| ConfigError::Io(std::io::Error::other(error.to_string())))
        })
    }
}

/// Where the local sandbox lives and what shell terminals run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Sandbox root directory. Defaults to `~/.forgepad/sandbox`.
    pub root: Option<PathBuf>,
    /// Shell spawned for each terminal session.
    pub shell: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self { root: None, shell: default_shell() }
    }
}

impl SandboxConfig {
    pub fn resolved_root(&self) -> Option<PathBuf> {
        self.root.clone().or_else(|| global_dir().map(|d| d.join("sandbox")))
    }
}

fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

/// Debounce and health-check timings. Values are clamped on read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncTuning {
    pub mount_debounce_ms: u64,
    pub save_debounce_ms: u64,
    pub liveness_timeout_ms: u64,
}

const MOUNT_DEBOUNCE_RANGE: (u64, u64) = (50, 2_000);
const SAVE_DEBOUNCE_RANGE: (u64, u64) = (250, 5_000);
const LIVENESS_TIMEOUT_RANGE: (u64, u64) = (100, 10_000);

impl Default for SyncTuning {
    fn default() -> Self {
        Self { mount_debounce_ms: 150, save_debounce_ms: 1_500, liveness_timeout_ms: 2_000 }
    }
}

impl SyncTuning {
    pub fn mount_debounce(&self) -> Duration {
        clamped(self.mount_debounce_ms, MOUNT_DEBOUNCE_RANGE)
    }

    pub fn save_debounce(&self) -> Duration {
        clamped(self.save_debounce_ms, SAVE_DEBOUNCE_RANGE)
    }

    pub fn liveness_timeout(&self) -> Duration {
        clamped(self.liveness_timeout_ms, LIVENESS_TIMEOUT_RANGE)
    }
}

fn clamped(ms: u64, (min, max): (u64, u64)) -> Duration {
    Duration::from_millis(ms.clamp(min, max))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ErrorQueueConfig {
    /// Maximum queued errors; the oldest is evicted beyond this.
    pub capacity: usize,
}

impl Default for ErrorQueueConfig {
    fn default() -> Self {
        Self { capacity: 4 }
    }
}

impl ErrorQueueConfig {
    pub fn effective_capacity(&self) -> usize {
        self.capacity.max(1)
    }
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Serialize(toml::ser::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config I/O error: {e}"),
            Self::Parse(e) => write!(f, "config parse error: {e}"),
            Self::Serialize(e) => write!(f, "config serialize error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn global_config_defaults() {
        let cfg = GlobalConfig::default();
        assert!(cfg.backend_url.is_none());
        assert!(cfg.sandbox.root.is_none());
        assert!(!cfg.sandbox.shell.is_empty());
        assert_eq!(cfg.sync.save_debounce(), Duration::from_millis(1_500));
        assert_eq!(cfg.sync.liveness_timeout(), Duration::from_secs(2));
        assert_eq!(cfg.errors.capacity, 4);
    }

    #[test]
    fn global_config_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let cfg = GlobalConfig {
            backend_url: Some("https://api.example.com".into()),
            sandbox: SandboxConfig { root: Some(dir.path().join("sb")), shell: "/bin/bash".into() },
            sync: SyncTuning { mount_debounce_ms: 200, save_debounce_ms: 1_000, liveness_timeout_ms: 500 },
            errors: ErrorQueueConfig { capacity: 8 },
        };
        cfg.save_to(&path).unwrap();
        let loaded = GlobalConfig::load_from(&path).unwrap();
        assert_eq!(cfg, loaded);
    }

    #[test]
    fn global_config_parse_from_toml() {
        let toml_str = r#"
backend_url = "https://api.forgepad.dev"

[sandbox]
shell = "/bin/zsh"

[sync]
save_debounce_ms = 2000

[errors]
capacity = 6
"#;
        let cfg: GlobalConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.backend_url.as_deref(), Some("https://api.forgepad.dev"));
        assert_eq!(cfg.sandbox.shell, "/bin/zsh");
        assert_eq!(cfg.sync.save_debounce(), Duration::from_secs(2));
        assert_eq!(cfg.sync.mount_debounce(), Duration::from_millis(150));
        assert_eq!(cfg.errors.capacity, 6);
    }

    #[test]
    fn global_config_missing_fields_use_defaults() {
        let cfg: GlobalConfig = toml::from_str("").unwrap();
        assert_eq!(cfg, GlobalConfig::default());
    }

    #[test]
    fn global_config_load_missing_file_is_error() {
        let dir = TempDir::new().unwrap();
        assert!(GlobalConfig::load_from(&dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn error_queue_rejects_unknown_fields() {
        let error = toml::from_str::<GlobalConfig>("[errors]\nlimit = 3\n")
            .expect_err("parse should fail");
        assert!(error.to_string().contains("unknown field `limit`"));
    }

    // ── Clamping ───────────────────────────────────────────────────

    #[test]
    fn timings_clamp_to_supported_ranges() {
        let tuning = SyncTuning { mount_debounce_ms: 1, save_debounce_ms: 60_000, liveness_timeout_ms: 0 };
        assert_eq!(tuning.mount_debounce(), Duration::from_millis(50));
        assert_eq!(tuning.save_debounce(), Duration::from_millis(5_000));
        assert_eq!(tuning.liveness_timeout(), Duration::from_millis(100));
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        assert_eq!(ErrorQueueConfig { capacity: 0 }.effective_capacity(), 1);
    }

    #[test]
    fn global_dir_is_under_home() {
        let dir = global_dir().expect("home dir should resolve");
        assert!(dir.ends_with(".forgepad"));
    }

    #[test]
    fn global_config_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("deep").join("nested").join("config.toml");
        GlobalConfig::default().save_to(&path).unwrap();
        assert!(path.exists());
    }
}
