//! Server configuration and management utilities
//!
//! This module provides server configuration, listener creation, socket cleanup and shutdown
//! handling for the plugin server.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use tokio::net::{TcpListener, UnixListener};
use tokio::signal;
use tokio::sync::oneshot;
use tokio_stream::wrappers::{TcpListenerStream, UnixListenerStream};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Default TCP port the plugin listens on, on all interfaces.
pub const DEFAULT_PORT: u16 = 50053;

/// Default maximum message size (64MB)
const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Default plugin identifier reported by `GetCapabilities`.
const DEFAULT_PLUGIN_IDENTIFIER: &str = "Rust SSE plugin";

/// Default plugin version reported by `GetCapabilities`.
const DEFAULT_PLUGIN_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Where the gRPC server accepts connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Listen {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    listen: Listen,
    max_message_size: usize,
    plugin_identifier: String,
    plugin_version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: Listen::Tcp(SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT))),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            plugin_identifier: DEFAULT_PLUGIN_IDENTIFIER.to_string(),
            plugin_version: DEFAULT_PLUGIN_VERSION.to_string(),
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the TCP address the gRPC server listens on. Default value is `0.0.0.0:50053`.
    pub fn with_address(mut self, address: SocketAddr) -> Self {
        self.listen = Listen::Tcp(address);
        self
    }

    /// Set the unix domain socket file path used by the gRPC server to listen for incoming
    /// connections, instead of a TCP address.
    pub fn with_socket_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.listen = Listen::Unix(file.into());
        self
    }

    /// Get where the gRPC server listens for incoming connections.
    pub fn listen(&self) -> &Listen {
        &self.listen
    }

    /// Set the maximum size of an encoded and decoded gRPC message. The value of `message_size` is in bytes. Default value is 64MB.
    pub fn with_max_message_size(mut self, message_size: usize) -> Self {
        self.max_message_size = message_size;
        self
    }

    /// Get the maximum size of an encoded and decoded gRPC message in bytes. Default value is 64MB.
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Set the plugin identifier reported to the engine.
    pub fn with_plugin_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.plugin_identifier = identifier.into();
        self
    }

    /// Get the plugin identifier reported to the engine.
    pub fn plugin_identifier(&self) -> &str {
        &self.plugin_identifier
    }

    /// Set the plugin version reported to the engine. Defaults to the crate version.
    pub fn with_plugin_version(mut self, version: impl Into<String>) -> Self {
        self.plugin_version = version.into();
        self
    }

    /// Get the plugin version reported to the engine.
    pub fn plugin_version(&self) -> &str {
        &self.plugin_version
    }
}

/// It is used to clean up the socket file when the server is dropped.
#[derive(Debug)]
pub struct SocketCleanup {
    sock_addr: PathBuf,
}

impl SocketCleanup {
    pub fn new(sock_addr: PathBuf) -> Self {
        Self { sock_addr }
    }
}

impl Drop for SocketCleanup {
    /// Cleanup the socket file when the server is dropped so that when the server is restarted, it can bind to the same address.
    /// UnixListener doesn't implement Drop trait, so we have to manually remove the socket file.
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.sock_addr);
    }
}

/// Create a TCP listener stream for the gRPC server
pub async fn create_tcp_listener_stream(
    address: SocketAddr,
) -> Result<TcpListenerStream, Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(address).await?;
    info!(address = %listener.local_addr()?, "Listening on TCP");
    Ok(TcpListenerStream::new(listener))
}

/// Create a Unix listener stream for the gRPC server
pub fn create_unix_listener_stream(
    socket_file: impl AsRef<Path>,
) -> Result<UnixListenerStream, Box<dyn std::error::Error + Send + Sync>> {
    let listener = UnixListener::bind(socket_file.as_ref())?;
    info!(path = ?socket_file.as_ref(), "Listening on unix socket");
    Ok(UnixListenerStream::new(listener))
}

async fn ctrl_c() {
    if let Err(e) = signal::ctrl_c().await {
        error!(error = ?e, "Failed to install SIGINT handler");
        std::future::pending::<()>().await;
    }
}

async fn terminate() {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            error!(error = ?e, "Failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

/// Shuts down the gRPC server on SIGINT, SIGTERM or when the user asks for it through
/// `shutdown_from_user`.
/// Once the request for shutdown has been invoked, server will broadcast shutdown to all calls
/// through the cancellation-token. A call error never shuts the server down.
pub async fn shutdown_signal(
    shutdown_from_user: Option<oneshot::Receiver<()>>,
    cln_token: CancellationToken,
) {
    // will call cancel_token.cancel() on drop of guard
    let _drop_guard = cln_token.drop_guard();

    let shutdown_from_user_future = async {
        match shutdown_from_user {
            Some(rx) => {
                rx.await.ok();
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = ctrl_c() => {},
        _ = terminate() => {},
        _ = shutdown_from_user_future => {},
    }
    info!("Shutting down the plugin server");
}
