// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error taxonomy for the gateway core.
//!
//! Every failure a caller can observe maps to exactly one [`ErrorKind`].
//! The kind travels over the control socket next to the message, so the
//! CLI never has to inspect error text to decide what happened.

use std::fmt;

/// Persistence layer failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backing store could not be reached or read.
    Unavailable(String),
    /// A compare-and-set lost to a concurrent writer too many times.
    Conflict(String),
    /// The stored data could not be decoded.
    Corrupt(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable(msg) => write!(f, "device store unavailable: {}", msg),
            Self::Conflict(msg) => write!(f, "concurrent update conflict: {}", msg),
            Self::Corrupt(msg) => write!(f, "device store corrupt: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

/// Failure to apply a change to the live network configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkError {
    /// Operation that failed (e.g. `set_reachable`, `iptables -I`)
    pub operation: String,
    /// Underlying failure detail
    pub detail: String,
}

impl NetworkError {
    pub fn new(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            detail: detail.into(),
        }
    }
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.operation, self.detail)
    }
}

impl std::error::Error for NetworkError {}

/// Wire-level classification of a [`GatewayError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    InvalidTransition,
    Store,
    Network,
    Validation,
    ShutdownRequested,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::InvalidTransition => "invalid_transition",
            Self::Store => "store",
            Self::Network => "network",
            Self::Validation => "validation",
            Self::ShutdownRequested => "shutdown_requested",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by every gateway operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Unknown device or session.
    NotFound(String),
    /// Transition not allowed from the current state (e.g. success on a locked device).
    InvalidTransition(String),
    /// Persistence failed; the transition was aborted with no partial write.
    Store(StoreError),
    /// Enforcement failed; the authorization state is already committed and
    /// the next reconcile pass is expected to heal the drift.
    Network(NetworkError),
    /// Malformed command input.
    Validation(String),
    /// The operation was abandoned because the gateway is shutting down.
    ShutdownRequested,
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidTransition(_) => ErrorKind::InvalidTransition,
            Self::Store(_) => ErrorKind::Store,
            Self::Network(_) => ErrorKind::Network,
            Self::Validation(_) => ErrorKind::Validation,
            Self::ShutdownRequested => ErrorKind::ShutdownRequested,
        }
    }

    /// Message without the kind prefix, as sent over the control socket.
    pub fn detail(&self) -> String {
        match self {
            Self::NotFound(msg) | Self::InvalidTransition(msg) | Self::Validation(msg) => msg.clone(),
            Self::Store(e) => e.to_string(),
            Self::Network(e) => e.to_string(),
            Self::ShutdownRequested => "shutdown requested".to_string(),
        }
    }

    /// Rebuild an error received from the control socket.
    pub fn from_wire(kind: ErrorKind, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        match kind {
            ErrorKind::NotFound => Self::NotFound(detail),
            ErrorKind::InvalidTransition => Self::InvalidTransition(detail),
            ErrorKind::Store => Self::Store(StoreError::Unavailable(detail)),
            ErrorKind::Network => Self::Network(NetworkError::new("remote", detail)),
            ErrorKind::Validation => Self::Validation(detail),
            ErrorKind::ShutdownRequested => Self::ShutdownRequested,
        }
    }

    /// Single-line rendering for CLI output.
    pub fn one_line(&self) -> String {
        self.to_string()
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn device_not_found(address: impl fmt::Display) -> Self {
        Self::NotFound(format!("device {} not found", address))
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(msg) => write!(f, "not found: {}", msg),
            Self::InvalidTransition(msg) => write!(f, "invalid transition: {}", msg),
            Self::Store(e) => write!(f, "{}", e),
            Self::Network(e) => write!(f, "enforcement error: {}", e),
            Self::Validation(msg) => write!(f, "invalid request: {}", msg),
            Self::ShutdownRequested => write!(f, "gateway is shutting down"),
        }
    }
}

impl std::error::Error for GatewayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            Self::Network(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for GatewayError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<NetworkError> for GatewayError {
    fn from(e: NetworkError) -> Self {
        Self::Network(e)
    }
}

/// Convenience alias used throughout the core.
pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip_through_wire() {
        let errors = vec![
            GatewayError::device_not_found("10.0.0.2"),
            GatewayError::InvalidTransition("device is locked".into()),
            GatewayError::Validation("device must be supplied".into()),
            GatewayError::ShutdownRequested,
        ];
        for err in errors {
            let rebuilt = GatewayError::from_wire(err.kind(), err.detail());
            assert_eq!(rebuilt, err);
        }
    }

    #[test]
    fn test_network_error_rebuilt_keeps_kind() {
        let err = GatewayError::Network(NetworkError::new("iptables -I", "exit status 4"));
        let rebuilt = GatewayError::from_wire(err.kind(), err.detail());
        assert_eq!(rebuilt.kind(), ErrorKind::Network);
        assert!(rebuilt.to_string().contains("exit status 4"));
    }

    #[test]
    fn test_one_line_flattens() {
        let err = GatewayError::Store(StoreError::Unavailable("disk\nfull".into()));
        assert_eq!(err.one_line(), "device store unavailable: disk full");
    }

    #[test]
    fn test_error_kind_serde() {
        let json = serde_json::to_string(&ErrorKind::InvalidTransition).unwrap();
        assert_eq!(json, "\"invalid_transition\"");
        assert_eq!(ErrorKind::ShutdownRequested.as_str(), "shutdown_requested");
    }
}
