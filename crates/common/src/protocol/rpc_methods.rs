// RPC method names served by the daemon socket.

// ── Daemon-internal ────────────────────────────────────────────────
pub const RPC_PING: &str = "rpc.ping";
pub const DAEMON_SHUTDOWN: &str = "daemon.shutdown";

// ── Conversation ───────────────────────────────────────────────────
pub const CONVERSATION_CREATE: &str = "conversation.create";
pub const CONVERSATION_SWITCH: &str = "conversation.switch";
pub const CONVERSATION_CLEAR: &str = "conversation.clear";
pub const CONVERSATION_ACTIVE: &str = "conversation.active";

// ── Chat stream ────────────────────────────────────────────────────
pub const CHAT_USER_MESSAGE: &str = "chat.user_message";
pub const CHAT_ASSISTANT_CHUNK: &str = "chat.assistant_chunk";
pub const CHAT_ASSISTANT_DONE: &str = "chat.assistant_done";
pub const CHAT_TRANSCRIPT: &str = "chat.transcript";

// ── View ───────────────────────────────────────────────────────────
pub const VIEW_ACTIVATE: &str = "view.activate";

// ── Workspace ──────────────────────────────────────────────────────
pub const WORKSPACE_FILES: &str = "workspace.files";
pub const WORKSPACE_READ: &str = "workspace.read";
pub const WORKSPACE_UPDATE: &str = "workspace.update";
pub const WORKSPACE_RENAME: &str = "workspace.rename";
pub const WORKSPACE_DELETE: &str = "workspace.delete";
pub const WORKSPACE_MKDIR: &str = "workspace.mkdir";
pub const WORKSPACE_DIFF: &str = "workspace.diff";
pub const WORKSPACE_SELECT: &str = "workspace.select";

// ── Error queue ────────────────────────────────────────────────────
pub const ERRORS_LIST: &str = "errors.list";
pub const ERRORS_REMOVE: &str = "errors.remove";
pub const ERRORS_CLEAR: &str = "errors.clear";

// ── Terminal ───────────────────────────────────────────────────────
pub const TERMINAL_CREATE: &str = "terminal.create";
pub const TERMINAL_CLOSE: &str = "terminal.close";
pub const TERMINAL_WRITE: &str = "terminal.write";
pub const TERMINAL_READ: &str = "terminal.read";
pub const TERMINAL_LIST: &str = "terminal.list";
pub const TERMINAL_SELECT: &str = "terminal.select";

// ── Project ────────────────────────────────────────────────────────
pub const PROJECT_DELETE: &str = "project.delete";
pub const PROJECT_STATUS: &str = "project.status";

// ── Sandbox ────────────────────────────────────────────────────────
pub const SANDBOX_UNBLOCK: &str = "sandbox.unblock";

/// All methods the daemon currently dispatches.
pub const IMPLEMENTED_METHODS: &[&str] = &[
    RPC_PING,
    DAEMON_SHUTDOWN,
    CONVERSATION_CREATE,
    CONVERSATION_SWITCH,
    CONVERSATION_CLEAR,
    CONVERSATION_ACTIVE,
    CHAT_USER_MESSAGE,
    CHAT_ASSISTANT_CHUNK,
    CHAT_ASSISTANT_DONE,
    CHAT_TRANSCRIPT,
    VIEW_ACTIVATE,
    WORKSPACE_FILES,
    WORKSPACE_READ,
    WORKSPACE_UPDATE,
    WORKSPACE_RENAME,
    WORKSPACE_DELETE,
    WORKSPACE_MKDIR,
    WORKSPACE_DIFF,
    WORKSPACE_SELECT,
    ERRORS_LIST,
    ERRORS_REMOVE,
    ERRORS_CLEAR,
    TERMINAL_CREATE,
    TERMINAL_CLOSE,
    TERMINAL_WRITE,
    TERMINAL_READ,
    TERMINAL_LIST,
    TERMINAL_SELECT,
    PROJECT_DELETE,
    PROJECT_STATUS,
    SANDBOX_UNBLOCK,
];
