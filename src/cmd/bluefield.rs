use super::Globals;
use clap::Subcommand;
use color_eyre::eyre::Result;
use dpu_hw::{BlueField, ConnectX, DpuMode};
use std::path::PathBuf;
use tracing::info;

#[derive(Subcommand, Debug)]
pub enum ModeCommand {
    /// Prints the current mode (dpu, nic or unknown)
    Get {
        /// BlueField PCI function index
        #[arg(long, default_value_t = 0)]
        id: usize,
        /// Show the mode the card will have after the next reboot
        #[arg(long)]
        next_boot: bool,
    },
    /// Switches the card to DPU or NIC mode, effective after a firmware reset
    Set {
        /// dpu or nic
        mode: DpuMode,
        #[arg(long, default_value_t = 0)]
        id: usize,
    },
}

#[derive(Subcommand, Debug)]
pub enum FirmwareCommand {
    /// Prints the running firmware version and PSID
    Version {
        #[arg(long, default_value_t = 0)]
        id: usize,
    },
    /// Burns a local firmware image and resets the firmware
    Flash {
        /// Firmware image (.bin)
        image: PathBuf,
        /// Skip flashing when the card already runs this version
        #[arg(long)]
        version: Option<String>,
        #[arg(long, default_value_t = 0)]
        id: usize,
    },
    /// Resets the NIC firmware so pending configuration applies
    Reset {
        #[arg(long, default_value_t = 0)]
        id: usize,
    },
    /// Pushes a BFB bundle to the Arm cores through rshim
    LoadBfb {
        /// Local path or http(s) URL of the .bfb
        source: String,
        #[arg(long, default_value_t = 0)]
        id: usize,
    },
    /// Updates every ConnectX adapter with the firmware bundled in mlxup
    CxUpdate {
        /// Path to the mlxup binary
        #[arg(long, default_value = dpu_hw::connectx::DEFAULT_MLXUP)]
        mlxup: PathBuf,
    },
}

pub async fn run_mode(command: ModeCommand, globals: &Globals) -> Result<()> {
    match command {
        ModeCommand::Get { id, next_boot } => {
            let bf = BlueField::select(globals.runner(), id).await?;
            let report = bf.mode(next_boot).await?;
            println!("{}", report);
        }
        ModeCommand::Set { mode, id } => {
            let bf = BlueField::select(globals.runner(), id).await?;
            bf.set_mode(mode).await?;
            info!(pci = bf.pci(), %mode, "Mode set, reset the firmware or power cycle to apply");
        }
    }
    Ok(())
}

pub async fn run_firmware(command: FirmwareCommand, globals: &Globals) -> Result<()> {
    match command {
        FirmwareCommand::Version { id } => {
            let bf = BlueField::select(globals.runner(), id).await?;
            println!("FW Version: {}", bf.firmware_version().await?);
            println!("PSID: {}", bf.psid().await?);
        }
        FirmwareCommand::Flash { image, version, id } => {
            let bf = BlueField::select(globals.runner(), id).await?;
            if bf.flash(&image, version.as_deref()).await? {
                info!(pci = bf.pci(), image = %image.display(), "Firmware flashed");
            } else {
                info!(pci = bf.pci(), "Firmware already up to date");
            }
        }
        FirmwareCommand::Reset { id } => {
            let bf = BlueField::select(globals.runner(), id).await?;
            bf.firmware_reset().await?;
        }
        FirmwareCommand::LoadBfb { source, id } => {
            let bf = BlueField::select(globals.runner(), id).await?;
            bf.load_bfb(&source).await?;
            info!(rshim = %bf.rshim_dir().display(), "BFB loaded");
        }
        FirmwareCommand::CxUpdate { mlxup } => {
            ConnectX::new(globals.runner()).with_mlxup(mlxup).update().await?;
        }
    }
    Ok(())
}
