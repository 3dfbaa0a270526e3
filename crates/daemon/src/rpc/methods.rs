use std::sync::Arc;

use forgepad_common::protocol::jsonrpc::{
    Request, RequestId, Response, RpcError, INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST,
    METHOD_NOT_FOUND, PARSE_ERROR,
};
use forgepad_common::path::normalize_path;
use forgepad_common::protocol::rpc_methods as methods;
use forgepad_common::types::{ConversationId, ProcessId, View};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast;
use tracing::debug;

use crate::backend::MemoryProjectBackend;
use crate::config::GlobalConfig;
use crate::coordinator::{Command, Coordinator};
use crate::rpc::trace::current_trace_id;
use crate::sandbox::MemorySandbox;

#[derive(Clone)]
pub struct RpcServerState {
    coordinator: Coordinator,
    shutdown_notifier: Option<broadcast::Sender<()>>,
}

impl RpcServerState {
    pub fn new(coordinator: Coordinator) -> Self {
        Self { coordinator, shutdown_notifier: None }
    }

    /// A daemon backed by the in-process sandbox and project backend.
    pub fn in_memory() -> Self {
        Self::new(Coordinator::assemble(
            Arc::new(MemorySandbox::new()),
            Arc::new(MemoryProjectBackend::new()),
            &GlobalConfig::default(),
        ))
    }

    pub fn with_shutdown_notifier(mut self, notifier: broadcast::Sender<()>) -> Self {
        self.shutdown_notifier = Some(notifier);
        self
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }
}

// ── Params ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ConversationParams {
    conversation_id: ConversationId,
}

#[derive(Debug, Deserialize)]
struct OptionalConversationParams {
    #[serde(default)]
    conversation_id: Option<ConversationId>,
}

#[derive(Debug, Deserialize)]
struct UserMessageParams {
    text: String,
}

#[derive(Debug, Deserialize)]
struct AssistantChunkParams {
    chunk: String,
}

#[derive(Debug, Deserialize)]
struct ViewParams {
    view: View,
}

#[derive(Debug, Deserialize)]
struct PathParams {
    path: String,
}

#[derive(Debug, Deserialize)]
struct UpdateParams {
    path: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct RenameParams {
    old_path: String,
    new_path: String,
}

#[derive(Debug, Deserialize)]
struct SelectPathParams {
    #[serde(default)]
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorIndexParams {
    index: usize,
}

#[derive(Debug, Deserialize)]
struct ProcessParams {
    process_id: ProcessId,
}

#[derive(Debug, Deserialize)]
struct TerminalWriteParams {
    process_id: ProcessId,
    data: String,
}

// ── Results ────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct FileEntry {
    path: String,
    bytes: usize,
}

#[derive(Debug, Serialize)]
struct WorkspaceFiles {
    conversation_id: ConversationId,
    files: Vec<FileEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    selected_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    project_root: Option<String>,
}

pub async fn handle_raw_request(raw: &[u8], state: &RpcServerState) -> Response {
    let request = match serde_json::from_slice::<Request>(raw) {
        Ok(request) => request,
        Err(error) => {
            return Response::error(
                RequestId::Null,
                RpcError {
                    code: PARSE_ERROR,
                    message: "Parse error".to_string(),
                    data: Some(json!({ "reason": error.to_string() })),
                },
            );
        }
    };

    if request.jsonrpc != "2.0" {
        return Response::error(
            request.id,
            RpcError { code: INVALID_REQUEST, message: "Invalid Request".to_string(), data: None },
        );
    }

    debug!(method = %request.method, trace_id = ?current_trace_id(), "rpc request");
    dispatch_request(request, state).await
}

pub async fn dispatch_request(request: Request, state: &RpcServerState) -> Response {
    match request.method.as_str() {
        methods::RPC_PING => Response::success(
            request.id,
            json!({
                "ok": true,
            }),
        ),
        methods::DAEMON_SHUTDOWN => {
            if let Some(notifier) = &state.shutdown_notifier {
                let _ = notifier.send(());
            }
            Response::success(
                request.id,
                json!({
                    "ok": true,
                }),
            )
        }
        methods::CONVERSATION_CREATE => {
            run_command(request.id, state, Command::CreateConversation).await
        }
        methods::CONVERSATION_SWITCH => {
            match decode_params::<ConversationParams>(request.params, &request.id, &request.method) {
                Ok(params) => {
                    run_command(request.id, state, Command::SwitchConversation(params.conversation_id))
                        .await
                }
                Err(response) => response,
            }
        }
        methods::CONVERSATION_CLEAR => {
            match decode_params::<ConversationParams>(request.params, &request.id, &request.method) {
                Ok(params) => {
                    run_command(request.id, state, Command::ClearConversation(params.conversation_id))
                        .await
                }
                Err(response) => response,
            }
        }
        methods::CONVERSATION_ACTIVE => handle_conversation_active(request, state),
        methods::CHAT_USER_MESSAGE => {
            match decode_params::<UserMessageParams>(request.params, &request.id, &request.method) {
                Ok(params) => run_command(request.id, state, Command::UserMessage(params.text)).await,
                Err(response) => response,
            }
        }
        methods::CHAT_ASSISTANT_CHUNK => {
            match decode_params::<AssistantChunkParams>(request.params, &request.id, &request.method)
            {
                Ok(params) => {
                    run_command(request.id, state, Command::AssistantChunk(params.chunk)).await
                }
                Err(response) => response,
            }
        }
        methods::CHAT_ASSISTANT_DONE => run_command(request.id, state, Command::AssistantDone).await,
        methods::CHAT_TRANSCRIPT => handle_chat_transcript(request, state),
        methods::VIEW_ACTIVATE => {
            match decode_params::<ViewParams>(request.params, &request.id, &request.method) {
                Ok(params) => run_command(request.id, state, Command::ActivateView(params.view)).await,
                Err(response) => response,
            }
        }
        methods::WORKSPACE_FILES => handle_workspace_files(request, state),
        methods::WORKSPACE_READ => handle_workspace_read(request, state),
        methods::WORKSPACE_UPDATE => handle_workspace_update(request, state),
        methods::WORKSPACE_RENAME => handle_workspace_rename(request, state),
        methods::WORKSPACE_DELETE => handle_workspace_delete(request, state),
        methods::WORKSPACE_MKDIR => handle_workspace_mkdir(request, state),
        methods::WORKSPACE_DIFF => handle_workspace_diff(request, state),
        methods::WORKSPACE_SELECT => handle_workspace_select(request, state),
        methods::ERRORS_LIST => {
            Response::success(request.id, json!({ "errors": state.coordinator.store().errors() }))
        }
        methods::ERRORS_REMOVE => handle_errors_remove(request, state),
        methods::ERRORS_CLEAR => {
            state.coordinator.store().clear_errors();
            Response::success(request.id, json!({ "ok": true }))
        }
        methods::TERMINAL_CREATE => {
            let process_id = state.coordinator.terminals().create();
            Response::success(request.id, json!({ "process_id": process_id }))
        }
        methods::TERMINAL_CLOSE => handle_terminal_close(request, state),
        methods::TERMINAL_WRITE => handle_terminal_write(request, state).await,
        methods::TERMINAL_READ => handle_terminal_read(request, state),
        methods::TERMINAL_LIST => {
            let terminals = state.coordinator.terminals();
            Response::success(
                request.id,
                json!({ "sessions": terminals.list(), "active": terminals.active() }),
            )
        }
        methods::TERMINAL_SELECT => handle_terminal_select(request, state),
        methods::PROJECT_DELETE => {
            match decode_params::<ConversationParams>(request.params, &request.id, &request.method) {
                Ok(params) => {
                    run_command(request.id, state, Command::DeleteProject(params.conversation_id)).await
                }
                Err(response) => response,
            }
        }
        methods::PROJECT_STATUS => handle_project_status(request, state),
        methods::SANDBOX_UNBLOCK => {
            state.coordinator.bridge().unblock();
            Response::success(request.id, json!({ "bridge": state.coordinator.bridge().state() }))
        }
        _ => Response::error(
            request.id,
            RpcError {
                code: METHOD_NOT_FOUND,
                message: "Method not found".to_string(),
                data: None,
            },
        ),
    }
}

async fn run_command(request_id: RequestId, state: &RpcServerState, command: Command) -> Response {
    match state.coordinator.dispatch(command).await {
        Ok(outcome) => Response::success(request_id, json!(outcome)),
        Err(error) => operation_error_response(request_id, error.to_string()),
    }
}

fn handle_conversation_active(request: Request, state: &RpcServerState) -> Response {
    let conversation_id = state.coordinator.store().active_id();
    let project = conversation_id.as_ref().and_then(|id| state.coordinator.binding().record(id));
    Response::success(
        request.id,
        json!({
            "conversation_id": conversation_id,
            "project": project,
            "conversations": state.coordinator.store().conversation_ids(),
        }),
    )
}

fn handle_chat_transcript(request: Request, state: &RpcServerState) -> Response {
    let params = match request.params {
        Some(_) => {
            match decode_params::<OptionalConversationParams>(
                request.params,
                &request.id,
                &request.method,
            ) {
                Ok(params) => params,
                Err(response) => return response,
            }
        }
        None => OptionalConversationParams { conversation_id: None },
    };
    let Some(id) = params.conversation_id.or_else(|| state.coordinator.store().active_id()) else {
        return no_active_conversation(request.id);
    };
    let messages = state.coordinator.binding().transcript(&id);
    Response::success(request.id, json!({ "conversation_id": id, "messages": messages }))
}

// ── Workspace RPC handlers ─────────────────────────────────────────

fn handle_workspace_files(request: Request, state: &RpcServerState) -> Response {
    let store = state.coordinator.store();
    let Some(conversation_id) = store.active_id() else {
        return no_active_conversation(request.id);
    };
    let Some(workspace) = store.state_of(&conversation_id) else {
        return no_active_conversation(request.id);
    };
    let files = workspace
        .files
        .iter()
        .map(|(path, content)| FileEntry { path: path.clone(), bytes: content.len() })
        .collect();
    Response::success(
        request.id,
        json!(WorkspaceFiles {
            conversation_id,
            files,
            selected_path: workspace.selected_path,
            project_root: workspace.project_root,
        }),
    )
}

fn handle_workspace_read(request: Request, state: &RpcServerState) -> Response {
    let params = match decode_params::<PathParams>(request.params, &request.id, &request.method) {
        Ok(params) => params,
        Err(response) => return response,
    };
    let store = state.coordinator.store();
    if store.active_id().is_none() {
        return no_active_conversation(request.id);
    }
    let exists =
        normalize_path(&params.path).is_ok_and(|path| store.files().contains_key(&path));
    let content = store.get_content(&params.path);
    Response::success(
        request.id,
        json!({ "path": params.path, "content": content, "exists": exists }),
    )
}

fn handle_workspace_update(request: Request, state: &RpcServerState) -> Response {
    let params = match decode_params::<UpdateParams>(request.params, &request.id, &request.method) {
        Ok(params) => params,
        Err(response) => return response,
    };
    if state.coordinator.store().active_id().is_none() {
        return no_active_conversation(request.id);
    }
    match state.coordinator.store().update_file(&params.path, params.content) {
        Ok(changed) => Response::success(request.id, json!({ "changed": changed })),
        Err(error) => invalid_params_response(request.id, error.to_string()),
    }
}

fn handle_workspace_rename(request: Request, state: &RpcServerState) -> Response {
    let params = match decode_params::<RenameParams>(request.params, &request.id, &request.method) {
        Ok(params) => params,
        Err(response) => return response,
    };
    if state.coordinator.store().active_id().is_none() {
        return no_active_conversation(request.id);
    }
    match state.coordinator.store().rename(&params.old_path, &params.new_path) {
        Ok(renamed) => Response::success(request.id, json!({ "renamed": renamed })),
        Err(error) => operation_error_response(request.id, error.to_string()),
    }
}

fn handle_workspace_delete(request: Request, state: &RpcServerState) -> Response {
    let params = match decode_params::<PathParams>(request.params, &request.id, &request.method) {
        Ok(params) => params,
        Err(response) => return response,
    };
    if state.coordinator.store().active_id().is_none() {
        return no_active_conversation(request.id);
    }
    match state.coordinator.store().delete(&params.path) {
        Ok(removed) => Response::success(request.id, json!({ "removed": removed })),
        Err(error) => operation_error_response(request.id, error.to_string()),
    }
}

fn handle_workspace_mkdir(request: Request, state: &RpcServerState) -> Response {
    let params = match decode_params::<PathParams>(request.params, &request.id, &request.method) {
        Ok(params) => params,
        Err(response) => return response,
    };
    if state.coordinator.store().active_id().is_none() {
        return no_active_conversation(request.id);
    }
    match state.coordinator.store().create_folder(&params.path) {
        Ok(created) => Response::success(request.id, json!({ "created": created })),
        Err(error) => invalid_params_response(request.id, error.to_string()),
    }
}

fn handle_workspace_diff(request: Request, state: &RpcServerState) -> Response {
    if state.coordinator.store().active_id().is_none() {
        return no_active_conversation(request.id);
    }
    Response::success(
        request.id,
        json!({ "changes": state.coordinator.store().diff_against_prior() }),
    )
}

fn handle_workspace_select(request: Request, state: &RpcServerState) -> Response {
    let params =
        match decode_params::<SelectPathParams>(request.params, &request.id, &request.method) {
            Ok(params) => params,
            Err(response) => return response,
        };
    match state.coordinator.store().select_path(params.path.as_deref()) {
        Ok(()) => Response::success(request.id, json!({ "ok": true })),
        Err(error) => invalid_params_response(request.id, error.to_string()),
    }
}

fn handle_errors_remove(request: Request, state: &RpcServerState) -> Response {
    let params = match decode_params::<ErrorIndexParams>(request.params, &request.id, &request.method)
    {
        Ok(params) => params,
        Err(response) => return response,
    };
    let removed = state.coordinator.store().remove_error(params.index);
    Response::success(request.id, json!({ "removed": removed }))
}

// ── Terminal RPC handlers ──────────────────────────────────────────

fn handle_terminal_close(request: Request, state: &RpcServerState) -> Response {
    let params = match decode_params::<ProcessParams>(request.params, &request.id, &request.method) {
        Ok(params) => params,
        Err(response) => return response,
    };
    match state.coordinator.terminals().close(params.process_id) {
        Ok(()) => Response::success(
            request.id,
            json!({ "ok": true, "active": state.coordinator.terminals().active() }),
        ),
        Err(error) => operation_error_response(request.id, error.to_string()),
    }
}

async fn handle_terminal_write(request: Request, state: &RpcServerState) -> Response {
    let params =
        match decode_params::<TerminalWriteParams>(request.params, &request.id, &request.method) {
            Ok(params) => params,
            Err(response) => return response,
        };
    match state.coordinator.terminals().write(params.process_id, params.data).await {
        Ok(()) => Response::success(request.id, json!({ "ok": true })),
        Err(error) => operation_error_response(request.id, error.to_string()),
    }
}

fn handle_terminal_read(request: Request, state: &RpcServerState) -> Response {
    let params = match decode_params::<ProcessParams>(request.params, &request.id, &request.method) {
        Ok(params) => params,
        Err(response) => return response,
    };
    let terminals = state.coordinator.terminals();
    let result = terminals.state(params.process_id).and_then(|session_state| {
        terminals.output_history(params.process_id).map(|history| (session_state, history))
    });
    match result {
        Ok((session_state, history)) => Response::success(
            request.id,
            json!({
                "process_id": params.process_id,
                "state": session_state,
                "output": history.concat(),
            }),
        ),
        Err(error) => operation_error_response(request.id, error.to_string()),
    }
}

fn handle_terminal_select(request: Request, state: &RpcServerState) -> Response {
    let params = match decode_params::<ProcessParams>(request.params, &request.id, &request.method) {
        Ok(params) => params,
        Err(response) => return response,
    };
    match state.coordinator.terminals().select(params.process_id) {
        Ok(()) => Response::success(request.id, json!({ "active": params.process_id })),
        Err(error) => operation_error_response(request.id, error.to_string()),
    }
}

// ── Project RPC handlers ───────────────────────────────────────────

fn handle_project_status(request: Request, state: &RpcServerState) -> Response {
    let coordinator = &state.coordinator;
    let conversation_id = coordinator.store().active_id();
    let project = conversation_id.as_ref().and_then(|id| coordinator.binding().record(id));
    Response::success(
        request.id,
        json!({
            "gateway": coordinator.gateway().status(),
            "bridge": coordinator.bridge().state(),
            "sandbox": coordinator.bridge().host().phase(),
            "conversation_id": conversation_id,
            "project": project,
            "errors_queued": coordinator.store().errors().len(),
        }),
    )
}

// ── Helpers ────────────────────────────────────────────────────────

fn decode_params<T: DeserializeOwned>(
    params: Option<serde_json::Value>,
    request_id: &RequestId,
    method: &str,
) -> Result<T, Response> {
    let Some(params) = params else {
        return Err(invalid_params_response(request_id.clone(), format!("{method} requires params")));
    };

    serde_json::from_value::<T>(params).map_err(|error| {
        invalid_params_response(
            request_id.clone(),
            format!("failed to decode {method} params: {error}"),
        )
    })
}

fn invalid_params_response(request_id: RequestId, reason: String) -> Response {
    Response::error(
        request_id,
        RpcError {
            code: INVALID_PARAMS,
            message: "Invalid params".to_string(),
            data: Some(json!({ "reason": reason })),
        },
    )
}

fn operation_error_response(request_id: RequestId, reason: String) -> Response {
    Response::error(request_id, RpcError::with_reason(INTERNAL_ERROR, "Operation failed", reason))
}

fn no_active_conversation(request_id: RequestId) -> Response {
    operation_error_response(request_id, "no active conversation".to_string())
}
