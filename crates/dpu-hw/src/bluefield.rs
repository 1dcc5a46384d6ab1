//! NVIDIA BlueField firmware and mode control
//!
//! Wraps the Mellanox firmware tools (`mstflint`, `mstconfig`,
//! `mstfwreset`) and the rshim character devices. The tools are treated as
//! opaque: we only parse the bits of their text output we need.

use crate::discovery::{bluefield_generation, select_bluefield};
use crate::error::{HwError, Result};
use async_trait::async_trait;
use dpu_common::download::download_to;
use dpu_common::CommandRunner;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, info};

/// `mstconfig` parameters that make up the DPU/NIC mode
const MODE_PARAMS: [&str; 5] = [
    "INTERNAL_CPU_MODEL",
    "INTERNAL_CPU_PAGE_SUPPLIER",
    "INTERNAL_CPU_ESWITCH_MANAGER",
    "INTERNAL_CPU_IB_VPORT0",
    "INTERNAL_CPU_OFFLOAD_ENGINE",
];

/// Directory of rshim instance serving BlueField function `index`
pub fn rshim_dir(index: usize) -> PathBuf {
    PathBuf::from(format!("/dev/rshim{}", index / 2))
}

/// Key/value pairs from `mstflint -d PCI q`
pub fn parse_mstflint_query(out: &str) -> BTreeMap<String, String> {
    out.lines()
        .filter_map(|line| {
            let mut parts = line.trim().split(':');
            let (key, value) = (parts.next()?, parts.next()?);
            if parts.next().is_some() {
                return None;
            }
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Operating mode of a BlueField
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DpuMode {
    /// Arm cores own the embedded switch
    Dpu,
    /// Behaves like a plain ConnectX NIC
    Nic,
}

impl DpuMode {
    /// Numeric `mstconfig` value of each mode parameter
    fn values(self) -> [(&'static str, &'static str); 5] {
        let v = match self {
            DpuMode::Dpu => "0",
            DpuMode::Nic => "1",
        };
        [
            (MODE_PARAMS[0], "1"),
            (MODE_PARAMS[1], v),
            (MODE_PARAMS[2], v),
            (MODE_PARAMS[3], v),
            (MODE_PARAMS[4], v),
        ]
    }

    fn matches(self, settings: &BTreeMap<String, String>) -> bool {
        settings.len() == MODE_PARAMS.len()
            && self
                .values()
                .iter()
                .all(|(k, v)| settings.get(*k).map(String::as_str) == Some(*v))
    }
}

impl fmt::Display for DpuMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DpuMode::Dpu => f.write_str("dpu"),
            DpuMode::Nic => f.write_str("nic"),
        }
    }
}

impl FromStr for DpuMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "dpu" => Ok(DpuMode::Dpu),
            "nic" => Ok(DpuMode::Nic),
            other => Err(format!("unknown mode '{}', expected 'dpu' or 'nic'", other)),
        }
    }
}

/// Mode as read back from the card
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeReport {
    /// `None` when the settings match neither mode
    pub mode: Option<DpuMode>,
    pub settings: BTreeMap<String, String>,
}

impl fmt::Display for ModeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode {
            Some(mode) => write!(f, "{}", mode),
            None => f.write_str("unknown"),
        }
    }
}

/// Parse `mstconfig -e -d PCI q ...`, taking the current or next-boot
/// column. Values are the numbers in parentheses, e.g. `ECPF(1)` -> `1`.
pub fn parse_mode_query(out: &str, next_boot: bool) -> BTreeMap<String, String> {
    let mut settings = BTreeMap::new();
    let mut in_table = false;

    for line in out.lines().filter(|l| !l.trim().is_empty()) {
        if line.starts_with("Configurations:") {
            in_table = true;
            continue;
        }
        if !in_table {
            continue;
        }
        if line.contains("different from default/current") {
            break;
        }

        let cols: Vec<&str> = line.trim_start_matches('*').split_whitespace().collect();
        let [key, _default, current, next] = cols[..] else {
            continue;
        };
        let column = if next_boot { next } else { current };
        if let Some(value) = column
            .split_once('(')
            .and_then(|(_, rest)| rest.split_once(')'))
            .map(|(v, _)| v)
        {
            settings.insert(key.to_string(), value.to_string());
        }
    }
    settings
}

pub fn classify_mode(settings: BTreeMap<String, String>) -> ModeReport {
    let mode = [DpuMode::Dpu, DpuMode::Nic]
        .into_iter()
        .find(|m| m.matches(&settings));
    ModeReport { mode, settings }
}

/// One BlueField PCI function
pub struct BlueField {
    runner: Arc<dyn CommandRunner>,
    index: usize,
    pci: String,
}

impl BlueField {
    /// Look up BlueField function `index` on this host
    pub async fn select(runner: Arc<dyn CommandRunner>, index: usize) -> Result<Self> {
        let pci = select_bluefield(runner.as_ref(), index).await?;
        debug!(index, pci = %pci, "Selected BlueField");
        Ok(Self { runner, index, pci })
    }

    pub fn pci(&self) -> &str {
        &self.pci
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn rshim_dir(&self) -> PathBuf {
        rshim_dir(self.index)
    }

    /// BlueField generation from `lshw`
    pub async fn generation(&self) -> Result<Option<u32>> {
        let out = self.runner.capture("lshw -c network -businfo").await?.out;
        Ok(bluefield_generation(&out, &self.pci))
    }

    pub async fn query(&self) -> Result<BTreeMap<String, String>> {
        let cmd = format!("mstflint -d {} q", self.pci);
        let out = self.runner.checked(&cmd).await?.out;
        Ok(parse_mstflint_query(&out))
    }

    fn field(info: &BTreeMap<String, String>, key: &str) -> Result<String> {
        info.get(key).cloned().ok_or_else(|| HwError::Parse {
            tool: "mstflint".to_string(),
            reason: format!("no '{}' field", key),
        })
    }

    pub async fn firmware_version(&self) -> Result<String> {
        Self::field(&self.query().await?, "FW Version")
    }

    pub async fn psid(&self) -> Result<String> {
        Self::field(&self.query().await?, "PSID")
    }

    /// Current mode, or the mode that takes effect on next boot
    pub async fn mode(&self, next_boot: bool) -> Result<ModeReport> {
        let cmd = format!("mstconfig -e -d {} q {}", self.pci, MODE_PARAMS.join(" "));
        let out = self.runner.capture(&cmd).await?.out;
        let report = classify_mode(parse_mode_query(&out, next_boot));
        debug!(settings = ?report.settings, "Mode settings");
        Ok(report)
    }

    /// Program `mode`; takes effect after a firmware reset or power cycle
    pub async fn set_mode(&self, mode: DpuMode) -> Result<()> {
        let assignments: Vec<String> = mode
            .values()
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        let cmd = format!("mstconfig -y -d {} s {}", self.pci, assignments.join(" "));
        info!(pci = %self.pci, %mode, "Setting BlueField mode");
        self.runner.checked(&cmd).await?;
        Ok(())
    }

    pub async fn firmware_reset(&self) -> Result<()> {
        info!(pci = %self.pci, "Resetting BlueField firmware");
        self.runner
            .checked(&format!("mstconfig -y -d {} r", self.pci))
            .await?;
        Ok(())
    }

    /// Burn a local firmware image and activate it.
    ///
    /// With `expected_version`, nothing is flashed if the card already runs
    /// that version.
    pub async fn flash(&self, image: &Path, expected_version: Option<&str>) -> Result<bool> {
        if !image.exists() && !self.runner.is_dry_run() {
            return Err(HwError::step(
                "flash",
                format!("image {} does not exist", image.display()),
            ));
        }

        if let Some(version) = expected_version {
            if !self.runner.is_dry_run() && self.firmware_version().await? == version {
                info!(version, "Firmware already at requested version");
                return Ok(false);
            }
        }

        info!(pci = %self.pci, image = %image.display(), "Burning firmware");
        self.runner
            .checked(&format!(
                "mstflint -y -d {} -i {} burn",
                self.pci,
                dpu_common::shell_quote(&image.display().to_string())
            ))
            .await?;
        self.runner
            .checked(&format!("mstfwreset -y -d {} r", self.pci))
            .await?;
        Ok(true)
    }

    /// Write a BFB bundle (local path or http(s) URL) into the rshim boot
    /// device, which installs it on the Arm cores
    pub async fn load_bfb(&self, source: &str) -> Result<()> {
        let boot = self.rshim_dir().join("boot");
        if self.runner.is_dry_run() {
            info!("[DRY RUN] Load {} into {}", source, boot.display());
            return Ok(());
        }

        info!(source, boot = %boot.display(), "Loading BFB image, this will take a while");
        let start = Instant::now();
        write_bfb(source, &boot).await?;
        info!(elapsed_secs = start.elapsed().as_secs(), "BFB image loaded");
        Ok(())
    }
}

async fn write_bfb(source: &str, boot: &Path) -> Result<()> {
    if source.starts_with("http://") || source.starts_with("https://") {
        download_to(source, boot).await?;
        return Ok(());
    }

    let mut input = tokio::fs::File::open(source).await?;
    let mut output = tokio::fs::OpenOptions::new().write(true).open(boot).await?;
    tokio::io::copy(&mut input, &mut output).await?;
    output.flush().await?;
    Ok(())
}

/// A way to hard-reset a DPU
#[async_trait]
pub trait DeviceReset: Send + Sync {
    async fn reset(&self) -> Result<()>;

    fn describe(&self) -> String;
}

/// Reset a BlueField's Arm complex through its rshim `misc` file
#[derive(Debug, Clone)]
pub struct RshimReset {
    misc: PathBuf,
}

impl RshimReset {
    pub fn new(index: usize) -> Self {
        Self {
            misc: rshim_dir(index).join("misc"),
        }
    }

    /// Use a different `misc` file
    pub fn with_misc_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.misc = path.into();
        self
    }
}

#[async_trait]
impl DeviceReset for RshimReset {
    async fn reset(&self) -> Result<()> {
        info!(misc = %self.misc.display(), "Rebooting BlueField");
        let mut misc = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&self.misc)
            .await
            .map_err(|e| HwError::step("reset", format!("{}: {}", self.misc.display(), e)))?;
        misc.write_all(b"SW_RESET 1").await?;
        misc.flush().await?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("rshim reset via {}", self.misc.display())
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
";

    const FLINT: &str = "\
Image type:            FS4
FW Version:            24.35.2000
FW Release Date:       19.10.2022
Product Version:       24.35.2000
Description:           UID                GuidsNumber
Base GUID:             b8cef60300a1b2c4        4
PSID:                  MT_0000000765
Device ID:             0000:03:00.0
Security Attributes:   N/A
";

    const MODE_QUERY: &str = "
Device #1:
----------

Device type:    BlueField2
Name:           MBF2H332A-AEEO_Ax_Bx
Device:         0000:03:00.0

Configurations:                                      Default             Current             Next Boot
*        INTERNAL_CPU_MODEL                          SEPERATED_HOST(0)   EMBEDDED_CPU(1)     EMBEDDED_CPU(1)
         INTERNAL_CPU_PAGE_SUPPLIER                  ECPF(0)             ECPF(0)             EXT_HOST_PF(1)
         INTERNAL_CPU_ESWITCH_MANAGER                ECPF(0)             ECPF(0)             EXT_HOST_PF(1)
         INTERNAL_CPU_IB_VPORT0                      ECPF(0)             ECPF(0)             EXT_HOST_PF(1)
         INTERNAL_CPU_OFFLOAD_ENGINE                 ENABLED(0)          ENABLED(0)          DISABLED(1)
The '*' shows parameters with next value different from default/current value.
";

    fn runner() -> RecordingRunner {
        RecordingRunner::new()
            .respond("lshw", CmdOutput::ok(LSHW))
            .respond("mstflint -d", CmdOutput::ok(FLINT))
            .respond("mstconfig -e", CmdOutput::ok(MODE_QUERY))
    }

    #[test]
    fn test_parse_mstflint() {
        let info = parse_mstflint_query(FLINT);
        assert_eq!(info["FW Version"], "24.35.2000");
        assert_eq!(info["PSID"], "MT_0000000765");
        assert_eq!(info["Base GUID"], "b8cef60300a1b2c4        4");
        // more than one ':' on the line
        assert!(!info.contains_key("Device ID"));
    }

    #[test]
    fn test_parse_mode_columns() {
        let current = classify_mode(parse_mode_query(MODE_QUERY, false));
        assert_eq!(current.mode, Some(DpuMode::Dpu));
        assert_eq!(current.to_string(), "dpu");

        let next = classify_mode(parse_mode_query(MODE_QUERY, true));
        assert_eq!(next.mode, Some(DpuMode::Nic));

        let unknown = classify_mode(parse_mode_query("Configurations:\n x A(1) B(1) C(1)\n", false));
        assert_eq!(unknown.mode, None);
        assert_eq!(unknown.to_string(), "unknown");
    }

    #[tokio::test]
    async fn test_firmware_queries() {
        let runner = Arc::new(runner());
        let bf = BlueField::select(runner.clone(), 1).await.unwrap();
        assert_eq!(bf.pci(), "0000:03:00.1");
        assert_eq!(bf.rshim_dir(), PathBuf::from("/dev/rshim0"));
        assert_eq!(bf.firmware_version().await.unwrap(), "24.35.2000");
        assert_eq!(bf.psid().await.unwrap(), "MT_0000000765");
        assert_eq!(bf.generation().await.unwrap(), Some(2));
        assert_eq!(bf.mode(true).await.unwrap().mode, Some(DpuMode::Nic));
    }

    #[tokio::test]
    async fn test_set_mode_and_reset_commands() {
        let runner = Arc::new(runner());
        let bf = BlueField::select(runner.clone(), 0).await.unwrap();

        bf.set_mode(DpuMode::Nic).await.unwrap();
        bf.firmware_reset().await.unwrap();

        assert_eq!(
            runner.matching("mstconfig -y"),
            vec![
                "mstconfig -y -d 0000:03:00.0 s INTERNAL_CPU_MODEL=1 INTERNAL_CPU_PAGE_SUPPLIER=1 \
                 INTERNAL_CPU_ESWITCH_MANAGER=1 INTERNAL_CPU_IB_VPORT0=1 INTERNAL_CPU_OFFLOAD_ENGINE=1"
                    .to_string(),
                "mstconfig -y -d 0000:03:00.0 r".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_flash_skips_current_version() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("fw.bin");
        std::fs::write(&image, b"fw").unwrap();

        let runner = Arc::new(runner());
        let bf = BlueField::select(runner.clone(), 0).await.unwrap();

        assert!(!bf.flash(&image, Some("24.35.2000")).await.unwrap());
        assert!(runner.matching("burn").is_empty());

        assert!(bf.flash(&image, Some("24.36.1000")).await.unwrap());
        assert_eq!(runner.matching("burn").len(), 1);
        assert_eq!(
            runner.matching("mstfwreset"),
            vec!["mstfwreset -y -d 0000:03:00.0 r".to_string()]
        );

        let missing = bf.flash(&dir.path().join("nope.bin"), None).await.unwrap_err();
        assert!(matches!(missing, HwError::Step { .. }));
    }

    #[tokio::test]
    async fn test_rshim_reset_writes_misc() {
        let dir = tempfile::tempdir().unwrap();
        let misc = dir.path().join("misc");
        std::fs::write(&misc, b"").unwrap();

        let reset = RshimReset::new(3).with_misc_path(&misc);
        reset.reset().await.unwrap();
        assert_eq!(std::fs::read_to_string(&misc).unwrap(), "SW_RESET 1");

        let absent = RshimReset::new(0).with_misc_path(dir.path().join("nope/misc"));
        assert!(absent.reset().await.is_err());
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("dpu".parse::<DpuMode>().unwrap(), DpuMode::Dpu);
        assert!("switch".parse::<DpuMode>().is_err());
    }
}
