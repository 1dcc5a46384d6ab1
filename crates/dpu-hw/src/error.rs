//! Error types for hardware operations

use dpu_common::CmdError;
use dpu_console::ConsoleError;
use thiserror::Error;

/// Error type for DPU hardware operations
#[derive(Debug, Error)]
pub enum HwError {
    /// No matching device on this host
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// Device index outside the detected range
    #[error("invalid device id {id}: {count} device(s) detected")]
    InvalidId { id: usize, count: usize },

    /// More than one kind of DPU is installed
    #[error("multiple DPU types detected ({0}); specify the platform manually")]
    MultipleKinds(String),

    /// Tool output did not look as expected
    #[error("unexpected output from {tool}: {reason}")]
    Parse { tool: String, reason: String },

    /// A firmware step failed
    #[error("step {step} failed: {reason}")]
    Step { step: String, reason: String },

    /// Command execution or download failed
    #[error(transparent)]
    Cmd(#[from] CmdError),

    /// Console interaction failed
    #[error("console: {0}")]
    Console(#[from] ConsoleError),

    /// Malformed JSON from a device tool
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HwError {
    pub fn step(step: impl ToString, reason: impl ToString) -> Self {
        HwError::Step {
            step: step.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether the error means the requested device is absent
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            HwError::DeviceNotFound(_) | HwError::InvalidId { .. } | HwError::MultipleKinds(_)
        )
    }
}

/// Result type for hardware operations
pub type Result<T> = std::result::Result<T, HwError>;
