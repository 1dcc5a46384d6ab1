//! DPU Console Automation
//!
//! This crate drives DPU serial consoles (rshim on BlueField, ttyUSB on IPU)
//! through `minicom` and walks the UEFI boot menu to start a network boot.
//!
//! # Pieces
//!
//! - [`ConsoleSession`]: one open console with expect-style pattern waits
//! - [`ConsoleConnector`]: opens sessions; [`MinicomConnector`] for real
//!   devices, `ScriptedFirmware` (feature `test-util`) for tests
//! - [`MinircGuard`]: scoped minicom configuration
//! - [`ConsoleCapture`]: background mirror of console output
//! - [`MenuNavigator`]: the boot menu state machine, driven by a [`MenuProfile`]
//!
//! # Example
//!
//! ```no_run
//! use dpu_console::{ConsoleDevice, MenuNavigator, MenuProfile, MinicomConnector};
//! use dpu_common::ShellRunner;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let connector = MinicomConnector::new(ConsoleDevice::rshim(0), Arc::new(ShellRunner::new()));
//! let navigator = MenuNavigator::new(MenuProfile::bluefield()?)?;
//! let report = navigator.navigate(&connector).await?;
//! println!("interface found after {} presses", report.interface_attempts);
//! # Ok(())
//! # }
//! ```

pub mod budget;
pub mod capture;
pub mod connector;
pub mod device;
pub mod error;
pub mod menu;
pub mod minirc;
pub mod pty;
#[cfg(any(test, feature = "test-util"))]
pub mod scripted;
pub mod session;

pub use budget::WaitBudget;
pub use capture::ConsoleCapture;
pub use connector::{ConsoleConnector, MinicomConnector};
pub use device::ConsoleDevice;
pub use error::{ConsoleError, MenuState, NavigationError, NavigationFailure, Result};
pub use menu::{MenuNavigator, MenuProfile, NavigationReport};
pub use minirc::MinircGuard;
pub use pty::PtyMaster;
#[cfg(any(test, feature = "test-util"))]
pub use scripted::{FirmwareStats, ScriptedFirmware};
pub use session::{console_pattern, ConsoleSession};
