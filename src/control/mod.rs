// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Control plane.
//!
//! A local Unix socket through which the CLI issues administrative
//! commands and the authentication front-end reports MFA outcomes. Each
//! request is validated into a [`Command`] and executed against the
//! [`Gateway`], which serializes it with everything else touching the same
//! device.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::ControlClient;
pub use protocol::{Request, Response};
pub use server::ControlServer;

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::error::{GatewayError, GatewayResult};
use crate::gateway::Gateway;
use crate::store::render_device_table;
use crate::types::DeviceAddress;

/// Body returned by successful mutating commands.
pub const OK_BODY: &str = "OK";

/// Transport-level control-plane failures.
#[derive(Debug)]
pub enum ControlError {
    /// A live server already owns the socket.
    AlreadyRunning(PathBuf),
    /// Nothing is listening on the socket.
    NotRunning(PathBuf),
    /// No response within the client timeout.
    Timeout,
    Io(std::io::Error),
    /// The gateway executed the command and returned an error.
    Remote(GatewayError),
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyRunning(path) => {
                write!(f, "another wag instance is already serving {}", path.display())
            }
            Self::NotRunning(path) => {
                write!(f, "wag is not running (no server on {})", path.display())
            }
            Self::Timeout => write!(f, "timed out waiting for the control socket"),
            Self::Io(e) => write!(f, "control socket error: {}", e),
            Self::Remote(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ControlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Remote(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ControlError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<GatewayError> for ControlError {
    fn from(e: GatewayError) -> Self {
        Self::Remote(e)
    }
}

/// A validated control-plane command. One variant per operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Delete the device and revoke everything it had.
    Block(DeviceAddress),
    Lock(DeviceAddress),
    Reset(DeviceAddress),
    ListDevices,
    Sessions,
    AuthSuccess(DeviceAddress, Option<SocketAddr>),
    AuthFailure(DeviceAddress),
    Touch(DeviceAddress, SocketAddr),
    Reconcile,
}

fn parse_endpoint(endpoint: &str) -> GatewayResult<SocketAddr> {
    endpoint
        .trim()
        .parse()
        .map_err(|_| GatewayError::Validation(format!("invalid endpoint: {}", endpoint)))
}

impl TryFrom<Request> for Command {
    type Error = GatewayError;

    fn try_from(request: Request) -> Result<Self, Self::Error> {
        Ok(match request {
            Request::Block { address } => Command::Block(address.parse()?),
            Request::Lock { address } => Command::Lock(address.parse()?),
            Request::Reset { address } => Command::Reset(address.parse()?),
            Request::ListDevices => Command::ListDevices,
            Request::Sessions => Command::Sessions,
            Request::AuthSuccess { address, endpoint } => {
                let endpoint = endpoint.as_deref().map(parse_endpoint).transpose()?;
                Command::AuthSuccess(address.parse()?, endpoint)
            }
            Request::AuthFailure { address } => Command::AuthFailure(address.parse()?),
            Request::Touch { address, endpoint } => {
                Command::Touch(address.parse()?, parse_endpoint(&endpoint)?)
            }
            Request::Reconcile => Command::Reconcile,
        })
    }
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Block(_) => "block",
            Self::Lock(_) => "lock",
            Self::Reset(_) => "reset",
            Self::ListDevices => "list_devices",
            Self::Sessions => "sessions",
            Self::AuthSuccess(..) => "auth_success",
            Self::AuthFailure(_) => "auth_failure",
            Self::Touch(..) => "touch",
            Self::Reconcile => "reconcile",
        }
    }

    pub fn address(&self) -> Option<DeviceAddress> {
        match self {
            Self::Block(a)
            | Self::Lock(a)
            | Self::Reset(a)
            | Self::AuthSuccess(a, _)
            | Self::AuthFailure(a)
            | Self::Touch(a, _) => Some(*a),
            Self::ListDevices | Self::Sessions | Self::Reconcile => None,
        }
    }

    /// Run the command against the gateway and produce the response body.
    pub async fn execute(self, gateway: &Gateway) -> GatewayResult<String> {
        match self {
            Command::Block(address) => {
                gateway.admin_delete(address).await?;
                Ok(OK_BODY.to_string())
            }
            Command::Lock(address) => {
                gateway.admin_lock(address).await?;
                Ok(OK_BODY.to_string())
            }
            Command::Reset(address) => {
                gateway.admin_reset(address).await?;
                Ok(OK_BODY.to_string())
            }
            Command::ListDevices => Ok(render_device_table(&gateway.devices().await?)),
            Command::Sessions => Ok(gateway.sessions().render()),
            Command::AuthSuccess(address, endpoint) => {
                Ok(gateway.record_success(address, endpoint).await?.to_string())
            }
            Command::AuthFailure(address) => Ok(gateway.record_failure(address).await?.to_string()),
            Command::Touch(address, endpoint) => {
                let active = gateway.touch(address, endpoint).await?;
                Ok(if active { "ACTIVE" } else { "IGNORED" }.to_string())
            }
            Command::Reconcile => Ok(gateway.reconcile().await?.to_string()),
        }
    }
}

/// Validate and execute one wire request.
pub async fn dispatch(gateway: &Gateway, request: Request) -> Response {
    let command = match Command::try_from(request) {
        Ok(command) => command,
        Err(e) => {
            tracing::warn!(target: "control", error = %e, "Rejected malformed request");
            return Response::from_result(Err(e));
        }
    };

    tracing::debug!(
        target: "control",
        command = command.name(),
        address = ?command.address(),
        "Executing command"
    );
    let result = command.execute(gateway).await;
    if let Err(e) = &result {
        tracing::warn!(target: "control", command = command.name(), error = %e, "Command failed");
    }
    Response::from_result(result)
}
