//! Cluster-level error types.

use meshbus_types::BusError;
use meshbus_wire::WireError;
use thiserror::Error;

/// Error type for the membership and routing layer.
#[derive(Error, Debug)]
pub enum ClusterError {
    /// A wrapped BusError.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// A wrapped WireError.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The service could not start.
    #[error("Startup failed: {0}")]
    Startup(String),
}

/// Alias for cluster results.
pub type ClusterResult<T> = Result<T, ClusterError>;
