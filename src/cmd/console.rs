use super::Globals;
use clap::{Args, ValueEnum};
use color_eyre::eyre::{bail, Result, WrapErr};
use dpu_console::{ConsoleDevice, MinircGuard};
use dpu_hw::{detect_dpu_kind, DpuKind};
use tokio::process::Command;
use tracing::info;

#[derive(Args, Debug)]
pub struct ConsoleArgs {
    /// BlueField PCI function index
    #[arg(long, default_value_t = 0)]
    pub id: usize,

    /// IPU console to attach to
    #[arg(long, value_enum, default_value_t = IpuConsole::Imc)]
    pub target: IpuConsole,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum IpuConsole {
    /// Management complex
    Imc,
    /// Compute complex
    Acc,
}

/// Console device for a DPU of `kind`
pub fn console_device(kind: DpuKind, args: &ConsoleArgs) -> ConsoleDevice {
    match kind {
        DpuKind::BlueField => ConsoleDevice::rshim(args.id),
        DpuKind::Ipu => match args.target {
            IpuConsole::Imc => ConsoleDevice::ipu_imc(),
            IpuConsole::Acc => ConsoleDevice::ipu_acc(),
        },
    }
}

pub async fn run_console(args: ConsoleArgs, globals: &Globals) -> Result<()> {
    let runner = globals.runner();
    let kind = detect_dpu_kind(runner.as_ref()).await?;
    let device = console_device(kind, &args);

    if globals.dry_run {
        info!("[DRY RUN] minicom --baudrate {} --device {}", device.baud, device.path.display());
        return Ok(());
    }

    let _minirc = MinircGuard::install_default()?;
    info!(console = %device, "Opening console, press Ctrl-A X to leave");
    let status = Command::new("minicom")
        .arg("--baudrate")
        .arg(device.baud.to_string())
        .arg("--device")
        .arg(&device.path)
        .status()
        .await
        .wrap_err("failed to start minicom")?;
    if !status.success() {
        bail!("minicom exited with {}", status);
    }
    Ok(())
}
