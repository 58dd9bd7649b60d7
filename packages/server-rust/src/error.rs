//! Error types shared across the server.

use std::time::Duration;

use cfgsync_core::frame::error_code;
use cfgsync_core::{ProtocolError, TenantName, ValueError};

/// Failure of an outbound RPC invocation.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("connection lost: {reason}")]
    ConnectionLost { reason: String },
    #[error("no reply within {timeout:?}")]
    Timeout { timeout: Duration },
    #[error("remote error {code}: {message}")]
    Remote { code: u32, message: String },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("unexpected return values: {0}")]
    WrongReturn(#[from] ValueError),
}

impl RpcError {
    /// Wire error code equivalent of this failure.
    #[must_use]
    pub fn code(&self) -> u32 {
        match self {
            Self::ConnectionLost { .. } => error_code::CONNECTION,
            Self::Timeout { .. } => error_code::TIMEOUT,
            Self::Remote { code, .. } => *code,
            Self::Protocol(_) => error_code::BAD_REPLY,
            Self::WrongReturn(_) => error_code::WRONG_RETURN,
        }
    }
}

/// Failure to map a client host onto an application.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    #[error("no application found for host '{hostname}'")]
    UnknownHost { hostname: String },
    #[error("host '{hostname}' is already in use by tenant '{owner}'")]
    HostInUse { hostname: String, owner: TenantName },
}
