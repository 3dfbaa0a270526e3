// JSON-RPC server: method dispatch over a Unix socket.

pub mod methods;
pub mod trace;
pub mod unix;
