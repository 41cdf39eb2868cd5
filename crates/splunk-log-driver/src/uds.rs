// Copyright 2024-Present Splunk Inc. https://www.splunk.com/
// SPDX-License-Identifier: Apache-2.0

//! Listener setup for the plugin control endpoint.
//!
//! Docker discovers managed plugins through a Unix socket under
//! `/run/docker/plugins`. A loopback TCP listener is also supported so the
//! control plane can be exercised without a privileged socket directory.

use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tokio::net::{TcpListener, UnixListener};
use tracing::warn;

use crate::config::Config;

/// Permission bits applied to the control socket file.
const SOCKET_MODE: u32 = 0o660;

/// Validates a Unix socket path before binding.
///
/// Returns an error if the path is empty, contains null bytes, is not
/// absolute, or exceeds 100 bytes. The byte limit keeps a safe margin under
/// the 108 byte `sun_path` limit on Linux.
pub fn validate_socket_path(path: &str) -> io::Result<()> {
    if path.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "Unix socket path cannot be empty",
        ));
    }

    if path.contains('\0') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "Unix socket path cannot contain null bytes",
        ));
    }

    // Byte length, not character length. The kernel limit is in bytes.
    let byte_len = path.as_bytes().len();
    if byte_len > 100 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Unix socket path too long: {byte_len} bytes (maximum 100 bytes). Path: {path}"),
        ));
    }

    if !path.starts_with('/') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Unix socket path should be absolute (start with '/'). Got: {path}"),
        ));
    }

    Ok(())
}

/// Guard that removes the socket file when dropped.
///
/// Tokio's UnixListener does not remove the socket file on drop, so an exit
/// without cleanup would leave a stale file for the next start to deal with.
#[derive(Debug)]
pub struct SocketCleanupGuard {
    path: String,
}

impl SocketCleanupGuard {
    pub fn new(path: String) -> Self {
        Self { path }
    }
}

impl Drop for SocketCleanupGuard {
    fn drop(&mut self) {
        // Best effort. The file may already be gone.
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove Unix socket file '{}': {}", self.path, e);
            }
        }
    }
}

/// Accepts control connections over TCP or a Unix socket.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// Where the control endpoint ended up bound.
///
/// For Unix sockets this also holds the cleanup guard. The socket file is
/// removed when the last clone is dropped.
#[derive(Debug, Clone)]
pub struct ListenerInfo {
    /// Loopback port when listening on TCP.
    pub tcp_port: Option<u16>,
    /// Socket file path when listening on a Unix socket.
    pub socket_path: Option<String>,
    _cleanup_guard: Option<Arc<SocketCleanupGuard>>,
}

/// Binds the control listener described by the configuration.
///
/// A configured TCP port takes precedence and binds the loopback interface,
/// with port 0 asking the OS for an ephemeral port. Otherwise the configured
/// socket path is validated, any stale socket file left by an unclean exit
/// is removed, and the socket is bound with [`SOCKET_MODE`] permissions.
pub async fn create_listener(config: &Config) -> io::Result<(Listener, ListenerInfo)> {
    if let Some(port) = config.tcp_port {
        let socket = SocketAddr::from(([127, 0, 0, 1], port));
        let listener = TcpListener::bind(&socket).await.map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("Failed to bind control listener to TCP port {port}. Error: {e}"),
            )
        })?;
        let actual_port = listener.local_addr()?.port();

        return Ok((
            Listener::Tcp(listener),
            ListenerInfo {
                tcp_port: Some(actual_port),
                socket_path: None,
                _cleanup_guard: None,
            },
        ));
    }

    let socket_path = &config.socket_path;
    validate_socket_path(socket_path)?;

    if let Some(parent) = Path::new(socket_path).parent() {
        if !parent.exists() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("Parent directory does not exist for Unix socket path: {socket_path}"),
            ));
        }
    }

    // A socket file left behind by an unclean exit is removed before binding.
    // Symlink targets are never removed.
    match std::fs::symlink_metadata(socket_path) {
        Ok(metadata) => {
            if metadata.file_type().is_symlink() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("Unix socket path is a symlink, refusing to remove: {socket_path}"),
                ));
            }
            std::fs::remove_file(socket_path).map_err(|e| {
                io::Error::new(
                    e.kind(),
                    format!(
                        "Failed to remove existing Unix socket at {socket_path}: {e}. \
                         Socket may be in use by another process."
                    ),
                )
            })?;
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(io::Error::new(
                e.kind(),
                format!("Failed to check existing file at {socket_path}: {e}"),
            ));
        }
    }

    let listener = UnixListener::bind(socket_path).map_err(|e| {
        let msg = match e.kind() {
            io::ErrorKind::AddrInUse | io::ErrorKind::AlreadyExists => format!(
                "Failed to bind control listener to Unix socket {socket_path}. \
                 Socket path already in use by another process. Error: {e}"
            ),
            io::ErrorKind::PermissionDenied => format!(
                "Failed to bind control listener to Unix socket {socket_path}. \
                 Permission denied, check directory permissions. Error: {e}"
            ),
            _ => {
                format!("Failed to bind control listener to Unix socket {socket_path}. Error: {e}")
            }
        };
        io::Error::new(e.kind(), msg)
    })?;

    {
        use std::os::unix::fs::PermissionsExt;

        let permissions = std::fs::Permissions::from_mode(SOCKET_MODE);
        std::fs::set_permissions(socket_path, permissions).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!(
                    "Failed to set permissions {SOCKET_MODE:o} on Unix socket {socket_path}: {e}"
                ),
            )
        })?;
    }

    let cleanup_guard = Arc::new(SocketCleanupGuard::new(socket_path.clone()));

    Ok((
        Listener::Unix(listener),
        ListenerInfo {
            tcp_port: None,
            socket_path: Some(socket_path.clone()),
            _cleanup_guard: Some(cleanup_guard),
        },
    ))
}
