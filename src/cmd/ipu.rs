use super::Globals;
use clap::Subcommand;
use color_eyre::eyre::Result;
use dpu_console::{ConsoleDevice, MinicomConnector};
use dpu_hw::{IpuFirmware, IpuReflashConfig, ReflashStep};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Subcommand, Debug)]
pub enum IpuCommand {
    /// Prints the IMC firmware release
    Version {
        /// IMC address, `host` or `user@host`
        #[arg(long)]
        imc: String,
    },
    /// Reflashes the IMC firmware
    Reflash {
        #[arg(long)]
        imc: String,
        /// Release to flash
        #[arg(long)]
        version: Option<String>,
        /// Host serving release tarballs and fixboard images
        #[arg(long)]
        repo_url: Option<String>,
        /// Steps to run, comma separated; defaults to every step but
        /// ipu_runtime_access
        #[arg(long, value_delimiter = ',')]
        steps: Vec<ReflashStep>,
        /// Where release tarballs are downloaded and unpacked
        #[arg(long, default_value = "/tmp")]
        download_dir: PathBuf,
    },
}

fn firmware(config: IpuReflashConfig, globals: &Globals) -> IpuFirmware {
    let runner = globals.runner();
    let console = Arc::new(MinicomConnector::new(ConsoleDevice::ipu_imc(), runner.clone()));
    IpuFirmware::new(config, runner, console)
}

pub async fn run_ipu(command: IpuCommand, globals: &Globals) -> Result<()> {
    match command {
        IpuCommand::Version { imc } => {
            let ipu = firmware(IpuReflashConfig::new(imc), globals);
            println!("{}", ipu.current_version().await?);
        }
        IpuCommand::Reflash {
            imc,
            version,
            repo_url,
            steps,
            download_dir,
        } => {
            let mut config = IpuReflashConfig::new(imc)
                .with_steps(steps)
                .with_download_dir(download_dir);
            if let Some(version) = version {
                config = config.with_version(version);
            }
            if let Some(repo_url) = repo_url {
                config = config.with_repo_url(repo_url);
            }

            let report = firmware(config, globals).reflash().await?;
            let steps: Vec<&str> = report.steps_run.iter().map(|s| s.as_str()).collect();
            info!(
                previous = report.previous_version.as_deref().unwrap_or("unknown"),
                steps = %steps.join(","),
                "Reflash finished"
            );
        }
    }
    Ok(())
}
