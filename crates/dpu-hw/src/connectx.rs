//! ConnectX NIC firmware update through Mellanox's `mlxup`

use crate::error::{HwError, Result};
use dpu_common::{shell_quote, CommandRunner};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Where the provisioning image drops the updater
pub const DEFAULT_MLXUP: &str = "/mlxup";

pub struct ConnectX {
    runner: Arc<dyn CommandRunner>,
    mlxup: PathBuf,
}

impl ConnectX {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            mlxup: PathBuf::from(DEFAULT_MLXUP),
        }
    }

    pub fn with_mlxup(mut self, path: impl Into<PathBuf>) -> Self {
        self.mlxup = path.into();
        self
    }

    pub fn mlxup(&self) -> &Path {
        &self.mlxup
    }

    /// Update every ConnectX adapter on the host to the firmware bundled
    /// with `mlxup`, without prompting
    pub async fn update(&self) -> Result<()> {
        if !self.mlxup.is_file() && !self.runner.is_dry_run() {
            return Err(HwError::step(
                "mlxup",
                format!("{} does not exist", self.mlxup.display()),
            ));
        }

        let tool = shell_quote(&self.mlxup.display().to_string());
        self.runner.checked(&format!("chmod +x {}", tool)).await?;

        info!(mlxup = %self.mlxup.display(), "Updating ConnectX firmware");
        let out = self.runner.run(&format!("{} -y", tool)).await?;
        if !out.success() {
            return Err(HwError::step("mlxup", format!("exited with {}", out.code)));
        }
        info!("ConnectX firmware up to date");
        Ok(())
    }
}
