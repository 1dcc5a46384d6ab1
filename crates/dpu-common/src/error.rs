//! Error types for command execution and file transfer

use thiserror::Error;

/// Error type for running commands and fetching files
#[derive(Debug, Error)]
pub enum CmdError {
    /// The shell could not be started
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The command ran but reported failure
    #[error("`{command}` exited with code {code}: {stderr}")]
    Failed {
        command: String,
        code: i32,
        stderr: String,
    },

    /// A stdout/stderr reader task died
    #[error("output reader failed: {0}")]
    Reader(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP transfer error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server answered with a non-success status
    #[error("download of {url} failed: HTTP {status}")]
    Download { url: String, status: u16 },

    /// Archive could not be unpacked
    #[error("archive error: {0}")]
    Archive(String),

    /// Nothing matching was found in an extracted tree
    #[error("{name} not found under {root}")]
    FileNotFound { name: String, root: String },
}

/// Result type for command execution
pub type Result<T> = std::result::Result<T, CmdError>;
