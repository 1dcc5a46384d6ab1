//! Finding DPUs on the PCI bus
//!
//! `lshw -c network -businfo` maps PCI addresses to netdevs and gives the
//! marketing name of each NIC; `lspci` tells Intel IPUs apart from
//! BlueFields.

use crate::error::{HwError, Result};
use dpu_common::CommandRunner;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::debug;

const LSHW_NETWORK: &str = "lshw -c network -businfo";

/// One row of `lshw -businfo` output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterface {
    /// e.g. `pci@0000:03:00.0`
    pub bus_info: String,
    /// netdev name, absent for functions without a driver
    pub device: Option<String>,
    pub description: String,
}

impl NetworkInterface {
    /// PCI address without the `pci@` prefix
    pub fn pci_address(&self) -> Option<&str> {
        self.bus_info.strip_prefix("pci@")
    }
}

/// Parse `lshw -c network -businfo` (two header lines, then one row per
/// function)
pub fn parse_lshw_businfo(out: &str) -> Vec<NetworkInterface> {
    out.lines()
        .skip(2)
        .filter_map(|line| {
            let line = line.trim();
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let class_at = tokens.iter().take(3).position(|t| *t == "network")?;
            if class_at == 0 {
                return None;
            }
            let device = (class_at == 2).then(|| tokens[1].to_string());
            let description = line
                .split_once("network")
                .map(|(_, rest)| rest.trim().to_string())
                .unwrap_or_default();
            Some(NetworkInterface {
                bus_info: tokens[0].to_string(),
                device,
                description,
            })
        })
        .collect()
}

/// PCI addresses of all BlueField functions, in `lshw` order
pub async fn find_bluefields(runner: &dyn CommandRunner) -> Result<Vec<String>> {
    let out = runner.capture(LSHW_NETWORK).await?.out;
    let found: Vec<String> = parse_lshw_businfo(&out)
        .iter()
        .filter(|i| i.description.contains("BlueField"))
        .filter_map(|i| i.pci_address().map(str::to_string))
        .collect();
    debug!(count = found.len(), "BlueField functions found");
    Ok(found)
}

/// PCI address of BlueField function `id`
pub async fn select_bluefield(runner: &dyn CommandRunner, id: usize) -> Result<String> {
    let found = find_bluefields(runner).await?;
    if found.is_empty() {
        return Err(HwError::DeviceNotFound("no BlueField found".to_string()));
    }
    found
        .get(id)
        .cloned()
        .ok_or(HwError::InvalidId { id, count: found.len() })
}

/// BlueField generation (2, 3, ...) of the function at `pci`
pub fn bluefield_generation(lshw_out: &str, pci: &str) -> Option<u32> {
    let prefix = format!("pci@{}", pci);
    lshw_out
        .lines()
        .find(|line| line.starts_with(&prefix))
        .and_then(|line| line.split("BlueField-").nth(1))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|n| n.parse().ok())
}

/// Address of function 0 on the same bus: `03:00.1` -> `03:00.0`
pub fn bus_address(address: &str) -> Option<String> {
    let re = Regex::new(r"^([0-9a-fA-F]+):([0-9a-fA-F]+)\.([0-9a-fA-F]+)").ok()?;
    re.captures(address).map(|c| format!("{}:00.0", &c[1]))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DpuKind {
    Ipu,
    BlueField,
}

impl fmt::Display for DpuKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DpuKind::Ipu => f.write_str("Intel IPU"),
            DpuKind::BlueField => f.write_str("NVIDIA BlueField"),
        }
    }
}

/// A DPU netdev found by [`scan_for_dpus`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedDpu {
    pub netdev: String,
    pub pci: String,
    pub kind: DpuKind,
}

/// Kind of DPU described by one `lspci` line
fn lspci_kind(line: &str) -> Option<DpuKind> {
    if line.contains("Intel Corporation Device 145") {
        Some(DpuKind::Ipu)
    } else if line.contains("BlueField") {
        Some(DpuKind::BlueField)
    } else {
        None
    }
}

/// Match `lspci` and `lshw` output into a netdev → DPU map
pub fn match_dpus(lspci_out: &str, lshw_out: &str) -> BTreeMap<String, DetectedDpu> {
    let mut devs = BTreeMap::new();
    for line in lspci_out.lines() {
        let Some(kind) = lspci_kind(line) else {
            continue;
        };
        let Some(addr) = line.split_whitespace().next().and_then(bus_address) else {
            continue;
        };
        for row in lshw_out.lines().filter(|row| row.contains(&addr)) {
            if let Some(netdev) = row.split_whitespace().nth(1) {
                devs.insert(
                    netdev.to_string(),
                    DetectedDpu {
                        netdev: netdev.to_string(),
                        pci: addr.clone(),
                        kind,
                    },
                );
            }
        }
    }
    devs
}

/// All DPU netdevs on this host
pub async fn scan_for_dpus(runner: &dyn CommandRunner) -> Result<BTreeMap<String, DetectedDpu>> {
    let lspci = runner.capture("lspci").await?.out;
    let lshw = runner.capture(LSHW_NETWORK).await?.out;
    Ok(match_dpus(&lspci, &lshw))
}

/// The single kind of DPU installed on this host
pub async fn detect_dpu_kind(runner: &dyn CommandRunner) -> Result<DpuKind> {
    let devs = scan_for_dpus(runner).await?;
    let kinds: BTreeSet<DpuKind> = devs.values().map(|d| d.kind).collect();
    let mut iter = kinds.iter();
    match (iter.next(), iter.next()) {
        (None, _) => Err(HwError::DeviceNotFound("no DPU devices found".to_string())),
        (Some(kind), None) => Ok(*kind),
        (Some(_), Some(_)) => Err(HwError::MultipleKinds(
            kinds.iter().map(|k| k.to_string()).collect::<Vec<_>>().join(", "),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpu_common::{CmdOutput, RecordingRunner};

    const LSHW: &str = "\
Bus info          Device      Class      Description
=====================================================
pci@0000:03:00.0  ens1f0np0   network    MT42822 BlueField-2 integrated ConnectX-6 Dx network controller
pci@0000:03:00.1  ens1f1np1   network    MT42822 BlueField-2 integrated ConnectX-6 Dx network controller
pci@0000:5e:00.0  eno1        network    Ethernet Controller E810-C for QSFP
pci@0000:5e:00.1              network    Ethernet Controller E810-C for QSFP
";

    const LSPCI: &str = "\
00:00.0 Host bridge: Intel Corporation Sky Lake-E DMI3 Registers (rev 07)
03:00.0 Ethernet controller: Mellanox Technologies MT42822 BlueField-2 integrated ConnectX-6 Dx network controller (rev 01)
03:00.1 Ethernet controller: Mellanox Technologies MT42822 BlueField-2 integrated ConnectX-6 Dx network controller (rev 01)
03:00.2 DMA controller: Mellanox Technologies MT42822 BlueField-2 SoC Management Interface (rev 01)
";

    #[test]
    fn test_parse_lshw() {
        let rows = parse_lshw_businfo(LSHW);
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].pci_address(), Some("0000:03:00.0"));
        assert_eq!(rows[0].device.as_deref(), Some("ens1f0np0"));
        assert!(rows[0].description.starts_with("MT42822 BlueField-2"));
        assert_eq!(rows[3].device, None);
    }

    #[test]
    fn test_generation() {
        assert_eq!(bluefield_generation(LSHW, "0000:03:00.1"), Some(2));
        assert_eq!(bluefield_generation(LSHW, "0000:5e:00.0"), None);
        assert_eq!(bluefield_generation(LSHW, "0000:99:00.0"), None);
    }

    #[test]
    fn test_bus_address() {
        assert_eq!(bus_address("03:00.1"), Some("03:00.0".to_string()));
        assert_eq!(bus_address("af:00.3"), Some("af:00.0".to_string()));
        assert_eq!(bus_address("garbage"), None);
    }

    #[tokio::test]
    async fn test_select_bluefield() {
        let runner = RecordingRunner::new().respond("lshw", CmdOutput::ok(LSHW));
        assert_eq!(select_bluefield(&runner, 1).await.unwrap(), "0000:03:00.1");

        let err = select_bluefield(&runner, 2).await.unwrap_err();
        assert!(matches!(err, HwError::InvalidId { id: 2, count: 2 }));

        let empty = RecordingRunner::new().respond("lshw", CmdOutput::ok("h\n=\n"));
        assert!(matches!(
            select_bluefield(&empty, 0).await.unwrap_err(),
            HwError::DeviceNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_detect_kind() {
        let runner = RecordingRunner::new()
            .respond("lspci", CmdOutput::ok(LSPCI))
            .respond("lshw", CmdOutput::ok(LSHW));
        let devs = scan_for_dpus(&runner).await.unwrap();
        assert_eq!(devs.len(), 1);
        assert_eq!(devs["ens1f0np0"].kind, DpuKind::BlueField);
        assert_eq!(detect_dpu_kind(&runner).await.unwrap(), DpuKind::BlueField);

        let mixed_lspci = format!("{LSPCI}5e:00.0 Ethernet controller: Intel Corporation Device 1452 (rev 11)\n");
        let mixed = RecordingRunner::new()
            .respond("lspci", CmdOutput::ok(mixed_lspci))
            .respond("lshw", CmdOutput::ok(LSHW));
        assert!(matches!(
            detect_dpu_kind(&mixed).await.unwrap_err(),
            HwError::MultipleKinds(_)
        ));

        let none = RecordingRunner::new();
        assert!(detect_dpu_kind(&none).await.unwrap_err().is_not_found());
    }
}
