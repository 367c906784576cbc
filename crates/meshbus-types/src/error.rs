//! Shared error types for the meshbus system.

use thiserror::Error;

/// Top-level error type for the meshbus system.
#[derive(Error, Debug)]
pub enum BusError {
    /// A frame or envelope body could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// An envelope could not be encoded.
    #[error("Encode error: {0}")]
    Encode(String),

    /// A member identity string was not of the form `a.b.c.d:command:data`.
    #[error("Invalid member key '{key}': {reason}")]
    InvalidMemberKey {
        /// The offending key.
        key: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A connection to a peer could not be established.
    #[error("Connect error to {member}: {reason}")]
    Connect {
        /// The peer that could not be reached.
        member: String,
        /// The underlying failure.
        reason: String,
    },

    /// An established transport failed mid-session.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A send was attempted while no channel was established. Not fatal.
    #[error("Send dropped: no channel to {member}")]
    SendDropped {
        /// The member the send was addressed to.
        member: String,
    },

    /// No payload codec is registered for the type identifier.
    #[error("No codec registered for message type '{0}'")]
    UnknownMessageType(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The component is shutting down.
    #[error("Shutdown in progress")]
    ShuttingDown,
}

/// Alias for meshbus results.
pub type BusResult<T> = Result<T, BusError>;
