// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Control-plane wire protocol.
//!
//! One JSON document per frame, each frame prefixed by its length as a
//! 4-byte big-endian integer. A connection carries any number of
//! request/response pairs, strictly alternating.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ErrorKind, GatewayError, GatewayResult};

/// Maximum frame size (1 MB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Requests as they travel on the wire. Addresses are unvalidated text;
/// [`crate::control::Command::try_from`] turns a request into a checked command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Request {
    Block { address: String },
    Lock { address: String },
    Reset { address: String },
    ListDevices,
    Sessions,
    AuthSuccess {
        address: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
    },
    AuthFailure { address: String },
    Touch { address: String, endpoint: String },
    Reconcile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok { body: String },
    Error { kind: ErrorKind, message: String },
}

impl Response {
    pub fn ok(body: impl Into<String>) -> Self {
        Self::Ok { body: body.into() }
    }

    pub fn from_result(result: GatewayResult<String>) -> Self {
        match result {
            Ok(body) => Self::Ok { body },
            Err(e) => Self::Error {
                kind: e.kind(),
                message: e.detail(),
            },
        }
    }

    pub fn into_result(self) -> GatewayResult<String> {
        match self {
            Self::Ok { body } => Ok(body),
            Self::Error { kind, message } => Err(GatewayError::from_wire(kind, message)),
        }
    }
}

/// Read a length-delimited frame from an async reader.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_FRAME_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes", len),
        ));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Write a length-delimited frame to an async writer.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> std::io::Result<()> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("frame too large: {} bytes", data.len()),
        ));
    }

    let len = data.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let encoded = serde_json::to_vec(message)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    write_frame(writer, &encoded).await
}

pub async fn read_message<R, T>(reader: &mut R) -> std::io::Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let frame = read_frame(reader).await?;
    serde_json::from_slice(&frame).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}
