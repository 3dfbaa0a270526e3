use std::time::Duration;

use chrono::{DateTime, Utc};
use forgepad_common::types::{BuilderState, ChatMessage, NewProject, ProjectPatch, ProjectRecord};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::trace;
use url::Url;

use super::{validate_backend_url, BackendError, BackendFuture, ProjectBackend};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Deserialize)]
struct ProjectEnvelope {
    #[serde(default = "default_success")]
    success: bool,
    project: Option<ProjectRecord>,
    #[serde(default)]
    error: Option<String>,
}

fn default_success() -> bool {
    true
}

#[derive(Deserialize)]
struct ProjectList {
    #[serde(default)]
    projects: Vec<ProjectRecord>,
}

#[derive(Serialize, Deserialize)]
struct ChatBody {
    #[serde(default)]
    messages: Vec<ChatMessage>,
}

#[derive(Serialize, Deserialize)]
struct BuilderBody {
    #[serde(default)]
    builder_state: Option<BuilderState>,
}

#[derive(Serialize)]
struct ActivityBody {
    last_activity: DateTime<Utc>,
}

/// REST client for the project backend. Reads send the bearer token when
/// one is configured; writes require it.
#[derive(Clone)]
pub struct HttpProjectBackend {
    base: Url,
    client: Client,
    token: Option<String>,
}

impl HttpProjectBackend {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, BackendError> {
        Self::with_timeout(base_url, token, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(
        base_url: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let base = validate_backend_url(base_url)?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| BackendError::InvalidUrl(format!("failed to build HTTP client: {err}")))?;
        let token = token.map(|value| value.trim().to_string()).filter(|value| !value.is_empty());
        Ok(Self { base, client, token })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Base URL with `segments` appended, each percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> String {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url.into()
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn read(&self, segments: &[&str]) -> RequestBuilder {
        self.authorized(self.client.get(self.endpoint(segments)))
    }

    fn write(
        &self,
        method: reqwest::Method,
        segments: &[&str],
    ) -> Result<RequestBuilder, BackendError> {
        if self.token.is_none() {
            return Err(BackendError::MissingCredential);
        }
        Ok(self.authorized(self.client.request(method, self.endpoint(segments))))
    }
}

async fn send(request: RequestBuilder, subject: String) -> Result<Response, BackendError> {
    let response = request.send().await.map_err(|err| BackendError::Unreachable(err.to_string()))?;
    let status = response.status();
    trace!(%status, %subject, "backend response");
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BackendError::Unauthorized,
        StatusCode::NOT_FOUND => BackendError::NotFound(subject),
        StatusCode::CONFLICT => BackendError::Conflict(subject),
        _ if body.to_ascii_lowercase().contains("duplicate key") => BackendError::Conflict(subject),
        other => BackendError::Status { status: other.as_u16(), body },
    })
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, BackendError> {
    let body = response.text().await.map_err(|err| BackendError::Unreachable(err.to_string()))?;
    serde_json::from_str(&body).map_err(|err| BackendError::Decode(err.to_string()))
}

fn unwrap_project(envelope: ProjectEnvelope, subject: &str) -> Result<ProjectRecord, BackendError> {
    match envelope {
        ProjectEnvelope { success: true, project: Some(project), .. } => Ok(project),
        ProjectEnvelope { error, .. } => Err(BackendError::Decode(format!(
            "{subject}: {}",
            error.unwrap_or_else(|| "response carried no project".to_string())
        ))),
    }
}

impl ProjectBackend for HttpProjectBackend {
    fn has_credentials(&self) -> bool {
        self.token.is_some()
    }

    fn health(&self) -> BackendFuture<()> {
        let request = self.client.get(self.endpoint(&["health"]));
        Box::pin(async move {
            send(request, "health".to_string()).await?;
            Ok(())
        })
    }

    fn list_projects(&self) -> BackendFuture<Vec<ProjectRecord>> {
        let request = self.read(&["projects"]);
        Box::pin(async move {
            let response = send(request, "projects".to_string()).await?;
            Ok(decode::<ProjectList>(response).await?.projects)
        })
    }

    fn create_project(&self, project: NewProject) -> BackendFuture<ProjectRecord> {
        let request = self.write(reqwest::Method::POST, &["projects"]);
        Box::pin(async move {
            let subject = format!("project for conversation {}", project.chat_uuid);
            let response = send(request?.json(&project), subject.clone()).await?;
            unwrap_project(decode(response).await?, &subject)
        })
    }

    fn update_project(&self, project_id: String, patch: ProjectPatch) -> BackendFuture<ProjectRecord> {
        let request = self.write(reqwest::Method::PUT, &["projects", project_id.as_str()]);
        Box::pin(async move {
            let subject = format!("project {project_id}");
            let response = send(request?.json(&patch), subject.clone()).await?;
            unwrap_project(decode(response).await?, &subject)
        })
    }

    fn delete_project(&self, project_id: String) -> BackendFuture<()> {
        let request = self.write(reqwest::Method::DELETE, &["projects", project_id.as_str()]);
        Box::pin(async move {
            send(request?, format!("project {project_id}")).await?;
            Ok(())
        })
    }

    fn save_chat(&self, project_id: String, messages: Vec<ChatMessage>) -> BackendFuture<()> {
        let request = self.write(reqwest::Method::POST, &["projects", project_id.as_str(), "chat"]);
        Box::pin(async move {
            send(request?.json(&ChatBody { messages }), format!("chat of {project_id}")).await?;
            Ok(())
        })
    }

    fn load_chat(&self, project_id: String) -> BackendFuture<Vec<ChatMessage>> {
        let request = self.read(&["projects", project_id.as_str(), "chat"]);
        Box::pin(async move {
            let response = send(request, format!("chat of {project_id}")).await?;
            Ok(decode::<ChatBody>(response).await?.messages)
        })
    }

    fn save_builder(&self, project_id: String, state: BuilderState) -> BackendFuture<()> {
        let request = self.write(reqwest::Method::POST, &["projects", project_id.as_str(), "builder"]);
        Box::pin(async move {
            let body = BuilderBody { builder_state: Some(state) };
            send(request?.json(&body), format!("workspace of {project_id}")).await?;
            Ok(())
        })
    }

    fn load_builder(&self, project_id: String) -> BackendFuture<Option<BuilderState>> {
        let request = self.read(&["projects", project_id.as_str(), "builder"]);
        Box::pin(async move {
            let response = send(request, format!("workspace of {project_id}")).await?;
            Ok(decode::<BuilderBody>(response).await?.builder_state)
        })
    }

    fn bump_activity(&self, project_id: String, at: DateTime<Utc>) -> BackendFuture<()> {
        let request = self.write(reqwest::Method::POST, &["projects", project_id.as_str(), "activity"]);
        Box::pin(async move {
            let body = ActivityBody { last_activity: at };
            send(request?.json(&body), format!("activity of {project_id}")).await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_keep_base_path_and_encode_ids() {
        let backend = HttpProjectBackend::new("https://api.example.com/v1/", Some("t".into()))
            .expect("backend should build");
        assert_eq!(backend.endpoint(&["projects"]), "https://api.example.com/v1/projects");
        assert_eq!(
            backend.endpoint(&["projects", "a b/c", "chat"]),
            "https://api.example.com/v1/projects/a%20b%2Fc/chat"
        );
    }

    #[test]
    fn blank_token_counts_as_missing() {
        let backend = HttpProjectBackend::new("http://localhost:1", Some("  ".into()))
            .expect("backend should build");
        assert!(!backend.has_credentials());
    }

    #[tokio::test]
    async fn writes_without_token_fail_before_sending() {
        let backend =
            HttpProjectBackend::new("http://localhost:1", None).expect("backend should build");
        let result = backend.save_chat("c1".into(), Vec::new()).await;
        assert_eq!(result, Err(BackendError::MissingCredential));
    }

    #[test]
    fn envelope_without_project_is_a_decode_error() {
        let envelope: ProjectEnvelope =
            serde_json::from_value(serde_json::json!({"success": false, "error": "boom"}))
                .expect("envelope should parse");
        assert!(matches!(unwrap_project(envelope, "p"), Err(BackendError::Decode(msg)) if msg.contains("boom")));
    }
}
