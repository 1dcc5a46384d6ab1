//! Error types for service workers

use std::net::SocketAddr;
use thiserror::Error;

/// Error type for service operations
#[derive(Debug, Error)]
pub enum ServiceError {
    /// A service process could not be started
    #[error("failed to start {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// A listening socket could not be bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// A running server failed
    #[error("{name} failed: {reason}")]
    Serve { name: String, reason: String },

    /// Stopping a service failed
    #[error("failed to stop {name}: {reason}")]
    Terminate { name: String, reason: String },

    /// A configuration template failed to render
    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for service operations
pub type Result<T> = std::result::Result<T, ServiceError>;
