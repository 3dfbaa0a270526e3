use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use forgepad_common::types::{BuilderState, ChatMessage, NewProject, ProjectPatch, ProjectRecord};

use super::{BackendError, BackendFuture, ProjectBackend};

#[derive(Default)]
struct Inner {
    projects: StdMutex<BTreeMap<String, ProjectRecord>>,
    /// Projects whose workspace was saved at least once.
    builder_saved: StdMutex<BTreeSet<String>>,
    unreachable: AtomicBool,
    no_credentials: AtomicBool,
    latency: StdMutex<Option<Duration>>,
    calls: StdMutex<HashMap<&'static str, usize>>,
}

/// In-process backend with the same contract as the REST one. Used offline
/// and in tests, where outages and latency can be switched on.
#[derive(Clone, Default)]
pub struct MemoryProjectBackend {
    inner: Arc<Inner>,
}

impl MemoryProjectBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call (including `health`) fails with `Unreachable` while set.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn set_credentials(&self, present: bool) {
        self.inner.no_credentials.store(!present, Ordering::SeqCst);
    }

    /// Delay applied before every call completes.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.inner.latency.lock().expect("backend latency lock poisoned") = latency;
    }

    pub fn project(&self, id: &str) -> Option<ProjectRecord> {
        self.inner.projects.lock().expect("backend projects lock poisoned").get(id).cloned()
    }

    pub fn project_count(&self) -> usize {
        self.inner.projects.lock().expect("backend projects lock poisoned").len()
    }

    /// Insert or replace a record directly.
    pub fn seed(&self, record: ProjectRecord) {
        let id = record.id.clone();
        if !record.builder_state.files.is_empty() {
            self.inner.builder_saved.lock().expect("backend builder lock poisoned").insert(id.clone());
        }
        self.inner.projects.lock().expect("backend projects lock poisoned").insert(id, record);
    }

    /// How many times `op` (the trait method name) was called.
    pub fn call_count(&self, op: &str) -> usize {
        self.inner.calls.lock().expect("backend calls lock poisoned").get(op).copied().unwrap_or(0)
    }

    fn call<T, F>(&self, op: &'static str, body: F) -> BackendFuture<T>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T, BackendError> + Send + 'static,
    {
        *self.inner.calls.lock().expect("backend calls lock poisoned").entry(op).or_insert(0) += 1;
        let inner = Arc::clone(&self.inner);
        let latency = *inner.latency.lock().expect("backend latency lock poisoned");
        Box::pin(async move {
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            if inner.unreachable.load(Ordering::SeqCst) {
                return Err(BackendError::Unreachable("memory backend offline".to_string()));
            }
            body(&inner)
        })
    }

    fn write<T, F>(&self, op: &'static str, body: F) -> BackendFuture<T>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T, BackendError> + Send + 'static,
    {
        let authorized = self.has_credentials();
        self.call(op, move |inner| {
            if !authorized {
                return Err(BackendError::MissingCredential);
            }
            body(inner)
        })
    }
}

fn with_project<T>(
    inner: &Inner,
    id: &str,
    f: impl FnOnce(&mut ProjectRecord) -> T,
) -> Result<T, BackendError> {
    let mut projects = inner.projects.lock().expect("backend projects lock poisoned");
    projects.get_mut(id).map(f).ok_or_else(|| BackendError::NotFound(format!("project {id}")))
}

impl ProjectBackend for MemoryProjectBackend {
    fn has_credentials(&self) -> bool {
        !self.inner.no_credentials.load(Ordering::SeqCst)
    }

    fn health(&self) -> BackendFuture<()> {
        self.call("health", |_| Ok(()))
    }

    fn list_projects(&self) -> BackendFuture<Vec<ProjectRecord>> {
        self.call("list_projects", |inner| {
            Ok(inner.projects.lock().expect("backend projects lock poisoned").values().cloned().collect())
        })
    }

    fn create_project(&self, project: NewProject) -> BackendFuture<ProjectRecord> {
        self.write("create_project", move |inner| {
            let mut projects = inner.projects.lock().expect("backend projects lock poisoned");
            if projects.contains_key(&project.chat_uuid) {
                return Err(BackendError::Conflict(format!(
                    "duplicate key: project for conversation {}",
                    project.chat_uuid
                )));
            }
            let record = ProjectRecord::from_new(project, Utc::now());
            projects.insert(record.id.clone(), record.clone());
            Ok(record)
        })
    }

    fn update_project(&self, project_id: String, patch: ProjectPatch) -> BackendFuture<ProjectRecord> {
        self.write("update_project", move |inner| {
            with_project(inner, &project_id, |record| {
                record.apply_patch(&patch);
                record.clone()
            })
        })
    }

    fn delete_project(&self, project_id: String) -> BackendFuture<()> {
        self.write("delete_project", move |inner| {
            inner.builder_saved.lock().expect("backend builder lock poisoned").remove(&project_id);
            inner
                .projects
                .lock()
                .expect("backend projects lock poisoned")
                .remove(&project_id)
                .map(|_| ())
                .ok_or_else(|| BackendError::NotFound(format!("project {project_id}")))
        })
    }

    fn save_chat(&self, project_id: String, messages: Vec<ChatMessage>) -> BackendFuture<()> {
        self.write("save_chat", move |inner| {
            with_project(inner, &project_id, |record| record.chat_messages = messages)
        })
    }

    fn load_chat(&self, project_id: String) -> BackendFuture<Vec<ChatMessage>> {
        self.call("load_chat", move |inner| {
            with_project(inner, &project_id, |record| record.chat_messages.clone())
        })
    }

    fn save_builder(&self, project_id: String, state: BuilderState) -> BackendFuture<()> {
        self.write("save_builder", move |inner| {
            with_project(inner, &project_id, |record| record.builder_state = state)?;
            inner.builder_saved.lock().expect("backend builder lock poisoned").insert(project_id);
            Ok(())
        })
    }

    fn load_builder(&self, project_id: String) -> BackendFuture<Option<BuilderState>> {
        self.call("load_builder", move |inner| {
            let state = with_project(inner, &project_id, |record| record.builder_state.clone())?;
            let saved = inner.builder_saved.lock().expect("backend builder lock poisoned").contains(&project_id);
            Ok(saved.then_some(state))
        })
    }

    fn bump_activity(&self, project_id: String, at: DateTime<Utc>) -> BackendFuture<()> {
        self.write("bump_activity", move |inner| {
            with_project(inner, &project_id, |record| record.last_activity = record.last_activity.max(at))
        })
    }
}
