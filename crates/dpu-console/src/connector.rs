//! Opening console sessions
//!
//! [`MinicomConnector`] runs `minicom` on a freshly allocated pseudo-terminal
//! and hands the non-blocking master side to a [`ConsoleSession`].

use crate::device::ConsoleDevice;
use crate::error::{ConsoleError, Result};
use crate::pty::PtyMaster;
use crate::session::ConsoleSession;
use async_trait::async_trait;
use dpu_common::CommandRunner;
use nix::pty::{openpty, Winsize};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info};

/// Something that can open a console session on demand
#[async_trait]
pub trait ConsoleConnector: Send + Sync {
    async fn open(&self) -> Result<ConsoleSession>;

    /// Human readable description of the console
    fn describe(&self) -> String;
}

#[derive(Clone)]
pub struct MinicomConnector {
    device: ConsoleDevice,
    runner: Arc<dyn CommandRunner>,
}

impl MinicomConnector {
    pub fn new(device: ConsoleDevice, runner: Arc<dyn CommandRunner>) -> Self {
        Self { device, runner }
    }

    pub fn device(&self) -> &ConsoleDevice {
        &self.device
    }

    fn open_error(&self, reason: impl ToString) -> ConsoleError {
        ConsoleError::Open {
            device: self.device.to_string(),
            reason: reason.to_string(),
        }
    }

    fn spawn(&self) -> Result<ConsoleSession> {
        let winsize = Winsize {
            ws_row: 24,
            ws_col: 80,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let pty = openpty(Some(&winsize), None).map_err(|e| self.open_error(e))?;

        let stdin = pty.slave.try_clone()?;
        let stdout = pty.slave.try_clone()?;
        let stderr = pty.slave;

        let mut command = Command::new("minicom");
        command
            .arg("--baudrate")
            .arg(self.device.baud.to_string())
            .arg("--device")
            .arg(&self.device.path)
            .stdin(Stdio::from(stdin))
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);

        // New session so the pty becomes minicom's terminal, not ours
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setsid()
                    .map(|_| ())
                    .map_err(std::io::Error::from)
            });
        }

        let child = command.spawn().map_err(|e| self.open_error(e))?;
        drop(command);

        let master = PtyMaster::new(pty.master)?;

        Ok(ConsoleSession::new(
            self.device.clone(),
            Box::new(master.clone()),
            Box::new(master),
        )
        .with_child(child))
    }
}

#[async_trait]
impl ConsoleConnector for MinicomConnector {
    async fn open(&self) -> Result<ConsoleSession> {
        // A stale minicom would hold the device
        match self.runner.run("pkill -9 minicom").await {
            Ok(_) => {}
            Err(e) => debug!(error = %e, "pkill minicom failed"),
        }

        if self.runner.is_dry_run() {
            return Err(self.open_error("console cannot be opened in dry-run mode"));
        }

        if !self.device.path.exists() {
            return Err(self.open_error("device does not exist"));
        }

        info!(device = %self.device, "Opening console");
        self.spawn()
    }

    fn describe(&self) -> String {
        format!("minicom {}", self.device)
    }
}
