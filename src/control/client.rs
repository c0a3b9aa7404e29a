// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Control-plane client used by the `devices` subcommand.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::UnixStream;
use tokio::time::timeout;

use super::protocol::{read_message, write_message, Request, Response};
use super::ControlError;

/// Default time to wait for a response. Generous: a command may wait on
/// the device lock behind a slow network update.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ControlClient {
    path: PathBuf,
    timeout: Duration,
}

impl ControlClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn connect(&self) -> Result<UnixStream, ControlError> {
        match UnixStream::connect(&self.path).await {
            Ok(stream) => Ok(stream),
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
                ) =>
            {
                Err(ControlError::NotRunning(self.path.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Send one request and wait for its response.
    pub async fn send(&self, request: &Request) -> Result<Response, ControlError> {
        let exchange = async {
            let mut stream = self.connect().await?;
            write_message(&mut stream, request).await?;
            let response: Response = read_message(&mut stream).await?;
            Ok::<_, ControlError>(response)
        };
        timeout(self.timeout, exchange)
            .await
            .map_err(|_| ControlError::Timeout)?
    }

    /// Send a request and turn an error response into [`ControlError::Remote`].
    pub async fn call(&self, request: Request) -> Result<String, ControlError> {
        Ok(self.send(&request).await?.into_result()?)
    }

    pub async fn block(&self, address: &str) -> Result<String, ControlError> {
        self.call(Request::Block {
            address: address.to_string(),
        })
        .await
    }

    pub async fn lock(&self, address: &str) -> Result<String, ControlError> {
        self.call(Request::Lock {
            address: address.to_string(),
        })
        .await
    }

    pub async fn reset(&self, address: &str) -> Result<String, ControlError> {
        self.call(Request::Reset {
            address: address.to_string(),
        })
        .await
    }

    pub async fn list_devices(&self) -> Result<String, ControlError> {
        self.call(Request::ListDevices).await
    }

    pub async fn sessions(&self) -> Result<String, ControlError> {
        self.call(Request::Sessions).await
    }

    pub async fn reconcile(&self) -> Result<String, ControlError> {
        self.call(Request::Reconcile).await
    }
}
