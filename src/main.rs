// Command line front end for the dpu-tools crates
use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;
use std::io::stderr;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, registry, EnvFilter};

mod cmd;

use cmd::{
    bluefield::{FirmwareCommand, ModeCommand},
    console::ConsoleArgs,
    ipu::IpuCommand,
    pxeboot::PxebootArgs,
    Globals,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Firmware and provisioning tool for BlueField and IPU DPUs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output - shows debug logs
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    /// Log the commands that would change the system instead of running them
    #[arg(long, global = true, default_value_t = false)]
    dry_run: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Lists the DPUs on this host
    List,
    /// Opens an interactive serial console on a DPU
    Console(ConsoleArgs),
    /// Reads or changes the BlueField operating mode
    #[command(subcommand)]
    Mode(ModeCommand),
    /// BlueField firmware operations
    #[command(subcommand)]
    Firmware(FirmwareCommand),
    /// Intel IPU firmware operations
    #[command(subcommand)]
    Ipu(IpuCommand),
    /// Installs an OS on a BlueField over PXE
    Pxeboot(PxebootArgs),
}

fn log_filter(verbose: bool) -> EnvFilter {
    let level = if verbose { "debug" } else { "info" };
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,dpu={level}", level = level)))
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    registry()
        .with(log_filter(cli.verbose))
        .with(fmt::layer().with_writer(stderr))
        .init();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    let globals = Globals {
        dry_run: cli.dry_run,
    };

    let result = match cli.command {
        Commands::List => cmd::list::run_list(&globals).await,
        Commands::Console(args) => cmd::console::run_console(args, &globals).await,
        Commands::Mode(command) => cmd::bluefield::run_mode(command, &globals).await,
        Commands::Firmware(command) => cmd::bluefield::run_firmware(command, &globals).await,
        Commands::Ipu(command) => cmd::ipu::run_ipu(command, &globals).await,
        Commands::Pxeboot(args) => cmd::pxeboot::run_pxeboot(args, &globals, shutdown_rx).await,
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("Error: {:?}", e);
        std::process::exit(cmd::exit_code(&e));
    }
    Ok(())
}
