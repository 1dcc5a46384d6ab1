use super::Globals;
use color_eyre::eyre::Result;
use dpu_hw::{scan_for_dpus, DetectedDpu};

/// Table of DPU netdevs, one row per netdev
pub fn format_dpus<'a>(dpus: impl IntoIterator<Item = &'a DetectedDpu>) -> String {
    let mut out = format!("{:<16} {:<14} {}\n", "NETDEV", "PCI", "KIND");
    for dpu in dpus {
        out.push_str(&format!("{:<16} {:<14} {}\n", dpu.netdev, dpu.pci, dpu.kind));
    }
    out
}

pub async fn run_list(globals: &Globals) -> Result<()> {
    let runner = globals.runner();
    let dpus = scan_for_dpus(runner.as_ref()).await?;
    if dpus.is_empty() {
        println!("No DPUs found");
        return Ok(());
    }
    print!("{}", format_dpus(dpus.values()));
    Ok(())
}
