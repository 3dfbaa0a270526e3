// Remote project store.
//
// `ProjectBackend` mirrors the REST contract the binding service and
// persistence gateway rely on. Futures are boxed and 'static so callers can
// hold the backend as `Arc<dyn ProjectBackend>` and spawn the calls.

pub mod http;
pub mod memory;

use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use forgepad_common::types::{BuilderState, ChatMessage, NewProject, ProjectPatch, ProjectRecord};
use thiserror::Error;
use url::Url;

pub use http::HttpProjectBackend;
pub use memory::MemoryProjectBackend;

pub type BackendFuture<T> = Pin<Box<dyn Future<Output = Result<T, BackendError>> + Send>>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("backend rejected the credential")]
    Unauthorized,
    #[error("no credential configured for backend writes")]
    MissingCredential,
    #[error("not found: {0}")]
    NotFound(String),
    /// Duplicate key on create.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("backend unreachable: {0}")]
    Unreachable(String),
    #[error("backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed backend response: {0}")]
    Decode(String),
    #[error("invalid backend URL: {0}")]
    InvalidUrl(String),
}

impl BackendError {
    /// Errors that say nothing about the payload, only that the backend
    /// could not be reached right now.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Status { status: 500..=599, .. })
    }
}

pub trait ProjectBackend: Send + Sync {
    /// Whether writes can be authenticated at all.
    fn has_credentials(&self) -> bool;

    /// Lightweight liveness check.
    fn health(&self) -> BackendFuture<()>;

    fn list_projects(&self) -> BackendFuture<Vec<ProjectRecord>>;

    /// Fails with `Conflict` when a project already exists for `chat_uuid`.
    fn create_project(&self, project: NewProject) -> BackendFuture<ProjectRecord>;

    fn update_project(&self, project_id: String, patch: ProjectPatch) -> BackendFuture<ProjectRecord>;

    fn delete_project(&self, project_id: String) -> BackendFuture<()>;

    fn save_chat(&self, project_id: String, messages: Vec<ChatMessage>) -> BackendFuture<()>;

    fn load_chat(&self, project_id: String) -> BackendFuture<Vec<ChatMessage>>;

    fn save_builder(&self, project_id: String, state: BuilderState) -> BackendFuture<()>;

    /// `None` when the project has never saved a workspace.
    fn load_builder(&self, project_id: String) -> BackendFuture<Option<BuilderState>>;

    fn bump_activity(&self, project_id: String, at: DateTime<Utc>) -> BackendFuture<()>;
}

/// Accept https anywhere, plain http only for loopback hosts.
pub fn validate_backend_url(raw: &str) -> Result<Url, BackendError> {
    let url = Url::parse(raw.trim()).map_err(|err| BackendError::InvalidUrl(format!("{raw}: {err}")))?;
    match url.scheme() {
        "https" => {}
        "http" => {
            let loopback = match url.host() {
                Some(url::Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
                Some(url::Host::Ipv4(addr)) => addr.is_loopback(),
                Some(url::Host::Ipv6(addr)) => addr.is_loopback(),
                None => false,
            };
            if !loopback {
                return Err(BackendError::InvalidUrl(format!(
                    "{raw}: plain http is only allowed for localhost"
                )));
            }
        }
        other => {
            return Err(BackendError::InvalidUrl(format!("{raw}: unsupported scheme `{other}`")));
        }
    }
    if url.cannot_be_a_base() {
        return Err(BackendError::InvalidUrl(format!("{raw}: not a base URL")));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn https_and_loopback_http_are_accepted() {
        assert!(validate_backend_url("https://api.example.com/v1").is_ok());
        assert!(validate_backend_url("http://localhost:8787").is_ok());
        assert!(validate_backend_url("http://127.0.0.1:9000/api").is_ok());
        assert!(validate_backend_url("http://[::1]:9000").is_ok());
    }

    #[test]
    fn remote_http_and_other_schemes_are_rejected() {
        assert!(matches!(
            validate_backend_url("http://api.example.com"),
            Err(BackendError::InvalidUrl(_))
        ));
        assert!(matches!(validate_backend_url("ftp://localhost"), Err(BackendError::InvalidUrl(_))));
        assert!(matches!(validate_backend_url("not a url"), Err(BackendError::InvalidUrl(_))));
    }

    #[test]
    fn transient_errors() {
        assert!(BackendError::Unreachable("refused".into()).is_transient());
        assert!(BackendError::Status { status: 503, body: String::new() }.is_transient());
        assert!(!BackendError::Status { status: 400, body: String::new() }.is_transient());
        assert!(!BackendError::Conflict("c1".into()).is_transient());
    }
}
