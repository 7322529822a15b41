//! Shared utilities and common functionality
//!
//! Server configuration, listeners and shutdown handling used by the connector server.

mod server;

pub use server::{DEFAULT_PORT, Listen, ServerConfig};
pub(crate) use server::{
    SocketCleanup, create_tcp_listener_stream, create_unix_listener_stream, shutdown_signal,
};
