//! Error types for console sessions and menu navigation

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Error type for console operations
#[derive(Debug, Error)]
pub enum ConsoleError {
    /// Pattern did not show up in time
    #[error("timed out after {waited:?} waiting for /{pattern}/")]
    Timeout { pattern: String, waited: Duration },

    /// The console stream ended
    #[error("console reached end of stream ({context})")]
    Eof { context: String },

    /// The console could not be opened
    #[error("failed to open console {device}: {reason}")]
    Open { device: String, reason: String },

    /// Operation on a session that was already closed
    #[error("console session is closed")]
    Closed,

    /// Pattern failed to compile
    #[error("invalid pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    /// Menu profile could not be loaded
    #[error("invalid menu profile: {0}")]
    Profile(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for console operations
pub type Result<T> = std::result::Result<T, ConsoleError>;

/// Firmware UI state the navigator believes the device is in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuState {
    /// Firmware is printing its boot interrupt prompt
    BootPrompt,
    /// Boot was interrupted, front page of the setup menu
    SetupMenu,
    /// Inside the boot manager
    BootManager,
    /// Walking the boot device list
    DeviceList,
    /// PXE boot of the selected interface is underway
    NetworkBoot,
    /// Kernel is executing
    KernelBooting,
}

impl fmt::Display for MenuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MenuState::BootPrompt => "at boot interrupt prompt",
            MenuState::SetupMenu => "in setup menu",
            MenuState::BootManager => "in boot manager",
            MenuState::DeviceList => "in device list",
            MenuState::NetworkBoot => "network booting",
            MenuState::KernelBooting => "kernel booting",
        };
        f.write_str(s)
    }
}

/// What went wrong during navigation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NavigationFailure {
    #[error("console could not be opened")]
    ConsoleUnavailable,

    #[error("boot interrupt prompt not seen")]
    BootPromptNotSeen,

    #[error("firmware menu did not respond")]
    MenuUnresponsive,

    #[error("boot interface not found after {attempts} attempts")]
    BootInterfaceNotFound { attempts: u32 },

    #[error("kernel boot failed to begin")]
    KernelBootNotStarted,

    #[error("kernel never reported EFI stub")]
    KernelStubNotSeen,
}

/// Navigation aborted at some boot phase
#[derive(Debug, Error)]
#[error("menu navigation failed {state}: {kind}")]
pub struct NavigationError {
    pub state: MenuState,
    pub kind: NavigationFailure,
    #[source]
    pub source: ConsoleError,
}

impl NavigationError {
    pub fn new(state: MenuState, kind: NavigationFailure, source: ConsoleError) -> Self {
        Self {
            state,
            kind,
            source,
        }
    }
}
