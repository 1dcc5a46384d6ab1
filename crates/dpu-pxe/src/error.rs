//! Error types for PXE provisioning

use dpu_common::CmdError;
use dpu_console::{ConsoleError, NavigationError};
use dpu_hw::HwError;
use dpu_services::ServiceError;
use thiserror::Error;

/// Error type for a PXE boot run
#[derive(Debug, Error)]
pub enum PxeError {
    /// Arguments or boot media failed validation
    #[error("invalid configuration: {0}")]
    Validation(String),

    /// Another instance holds the lock and could not be displaced
    #[error("instance lock: {0}")]
    Lock(String),

    /// Host preparation failed
    #[error("staging failed: {0}")]
    Staging(String),

    /// Firmware menu walk failed
    #[error(transparent)]
    Navigation(#[from] NavigationError),

    /// Nothing in the DHCP pool answered
    #[error("no response after {waited_secs}s")]
    PingTimeout { waited_secs: f64 },

    /// The booted device never accepted a login
    #[error("login to {address} failed after {attempts} attempts")]
    Login { address: String, attempts: u32 },

    /// Every attempt failed
    #[error("PXE boot failed after {attempts} attempts; last error: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<PxeError>,
    },

    /// Shutdown was requested
    #[error("interrupted")]
    Interrupted,

    #[error(transparent)]
    Hw(#[from] HwError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Console(#[from] ConsoleError),

    #[error(transparent)]
    Cmd(#[from] CmdError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PxeError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            PxeError::Validation(_) => 2,
            PxeError::Hw(e) if e.is_not_found() => 2,
            PxeError::RetriesExhausted { .. } => 4,
            PxeError::Navigation(_)
            | PxeError::PingTimeout { .. }
            | PxeError::Login { .. }
            | PxeError::Staging(_)
            | PxeError::Service(_)
            | PxeError::Hw(_) => 3,
            _ => 1,
        }
    }

    /// Whether retrying the attempt cannot help
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PxeError::Validation(_) | PxeError::Lock(_) | PxeError::Interrupted
        )
    }
}

/// Result type for PXE provisioning
pub type Result<T> = std::result::Result<T, PxeError>;
