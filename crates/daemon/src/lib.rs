// forgepad-daemon library: per-conversation workspaces, sandbox sync,
// terminals, project persistence, and the JSON-RPC surface over them.

pub mod backend;
pub mod binding;
pub mod config;
pub mod coordinator;
pub mod debounce;
pub mod persistence;
pub mod rpc;
pub mod runtime;
pub mod sandbox;
pub mod security;
pub mod startup;
pub mod sync;
pub mod terminal;
pub mod workspace;
