// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Unix-socket control server.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;
use tokio::time::timeout;

use super::protocol::{read_frame, write_message, Request, Response};
use super::{dispatch, ControlError};
use crate::error::GatewayError;
use crate::gateway::Gateway;

/// How long a connection may sit idle between requests.
const CONNECTION_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
    gateway: Arc<Gateway>,
}

impl ControlServer {
    /// Bind the control socket.
    ///
    /// A leftover socket file from a crashed instance is removed. If a live
    /// server answers on it, fails with [`ControlError::AlreadyRunning`].
    pub async fn bind(path: impl Into<PathBuf>, gateway: Arc<Gateway>) -> Result<Self, ControlError> {
        let path = path.into();

        if path.exists() {
            if UnixStream::connect(&path).await.is_ok() {
                return Err(ControlError::AlreadyRunning(path));
            }
            tracing::info!(target: "control", path = %path.display(), "Removing stale control socket");
            std::fs::remove_file(&path)?;
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let listener = match UnixListener::bind(&path) {
            Ok(listener) => listener,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                return Err(ControlError::AlreadyRunning(path));
            }
            Err(e) => return Err(e.into()),
        };
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;

        tracing::info!(target: "control", path = %path.display(), "Control socket listening");
        Ok(Self {
            listener,
            path,
            gateway,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until the gateway requests shutdown, then wait
    /// for in-flight requests and remove the socket file.
    pub async fn run(self) -> Result<(), ControlError> {
        let mut shutdown = self.gateway.subscribe_shutdown();
        let mut connections = JoinSet::new();

        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let gateway = Arc::clone(&self.gateway);
                        connections.spawn(handle_connection(stream, gateway));
                    }
                    Err(e) => {
                        tracing::warn!(target: "control", error = %e, "Failed to accept control connection");
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        tracing::info!(
            target: "control",
            in_flight = connections.len(),
            "Control server stopping"
        );
        while connections.join_next().await.is_some() {}

        drop(self.listener);
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(target: "control", error = %e, "Failed to remove control socket");
            }
        }
        Ok(())
    }
}

async fn handle_connection(mut stream: UnixStream, gateway: Arc<Gateway>) {
    loop {
        let frame = match timeout(CONNECTION_IDLE_TIMEOUT, read_frame(&mut stream)).await {
            Err(_) => {
                tracing::debug!(target: "control", "Closing idle control connection");
                return;
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return,
            Ok(Err(e)) => {
                // Framing is lost after a bad length prefix; drop the connection.
                tracing::warn!(target: "control", error = %e, "Error reading control request");
                return;
            }
            Ok(Ok(frame)) => frame,
        };

        let response = match serde_json::from_slice::<Request>(&frame) {
            Err(e) => Response::from_result(Err(GatewayError::Validation(format!("malformed request: {}", e)))),
            Ok(_) if gateway.is_shutting_down() => Response::from_result(Err(GatewayError::ShutdownRequested)),
            Ok(request) => dispatch(&gateway, request).await,
        };

        if let Err(e) = write_message(&mut stream, &response).await {
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                tracing::warn!(target: "control", error = %e, "Error writing control response");
            }
            return;
        }
    }
}
