//! Shared plumbing for dpu-tools
//!
//! Everything the higher level crates do to the outside world goes through
//! here: local shell commands, commands tunnelled over `ssh`, and plain HTTP
//! downloads of firmware and boot artifacts.
//!
//! The `test-util` feature adds `RecordingRunner`,
//! a runner with canned answers for tests of the crates built on this one.

pub mod cmd;
pub mod download;
pub mod error;
#[cfg(any(test, feature = "test-util"))]
pub mod recording;
pub mod remote;

pub use cmd::{CmdOutput, CommandRunner, ShellRunner};
#[cfg(any(test, feature = "test-util"))]
pub use recording::RecordingRunner;
pub use error::{CmdError, Result};
pub use remote::{shell_quote, SshRunner};
