//! Errors from the wire protocol layer.

use meshbus_types::{BusError, MemberKey};
use std::time::Duration;
use thiserror::Error;

/// Errors from the wire protocol layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Encode error: {0}")]
    Encode(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout {
        addr: std::net::SocketAddr,
        timeout: Duration,
    },
    #[error("No channel established to {0}")]
    NoChannel(MemberKey),
    #[error("No codec registered for message type '{0}'")]
    UnknownMessageType(String),
    #[error("Payload type mismatch: '{class_name}' is not {expected}")]
    TypeMismatch {
        class_name: String,
        expected: &'static str,
    },
}

impl From<WireError> for BusError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Decode(msg) => BusError::Decode(msg),
            WireError::Encode(msg) => BusError::Encode(msg),
            WireError::NoChannel(key) => BusError::SendDropped {
                member: key.to_string(),
            },
            WireError::UnknownMessageType(name) => BusError::UnknownMessageType(name),
            WireError::TypeMismatch { .. } => BusError::Decode(err.to_string()),
            WireError::ConnectTimeout { addr, .. } => BusError::Connect {
                member: addr.to_string(),
                reason: err.to_string(),
            },
            WireError::Io(_) | WireError::ConnectionClosed => BusError::Transport(err.to_string()),
        }
    }
}
