//! Intel IPU firmware reflash
//!
//! The IPU management complex (IMC) is reached over `ssh`, or over its
//! serial console when the network side is not up yet. A reflash downloads
//! the SSD and recovery (SPI) images for one release and streams them onto
//! the IMC's NVMe and SPI flash, optionally repairing a blank board config
//! afterwards.

use crate::error::{HwError, Result};
use dpu_common::download::{download_file, extract_tar_gz, find_file, list_http_directory};
use dpu_common::{CommandRunner, SshRunner};
use dpu_console::{console_pattern, ConsoleConnector, ConsoleError, MinircGuard};
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Known IPU releases, oldest first
pub const VERSIONS: [&str; 3] = ["1.2.0.7550", "1.6.2.9418", "1.8.0.10052"];

/// Release that needs runtime access enabled before anything else works
const RUNTIME_ACCESS_VERSION: &str = "1.2.0.7550";

pub const DEFAULT_REPO: &str = "wsfd-advnetlab-amp04.anl.eng.bos2.dc.redhat.com";

const MINICOM_READY: &str = "Press CTRL-A Z for help on special keys";
const CONSOLE_WAIT: Duration = Duration::from_secs(120);

const CONNECTIVITY_RETRIES: u32 = 3;

/// Board config offset in the SPI flash
const BOARD_CONFIG_OFFSET: &str = "0x30000";

/// Pull an `a.b.c.d` release number out of free text
pub fn parse_version(text: &str) -> Option<String> {
    let re = Regex::new(r"\d+\.\d+\.\d+\.\d+").ok()?;
    re.find(text).map(|m| m.as_str().to_string())
}

/// One step of a reflash, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReflashStep {
    RuntimeAccess,
    CleanUpImc,
    FlashSsdImage,
    FlashSpiImage,
    ApplyFixboard,
}

impl ReflashStep {
    pub const ALL: [ReflashStep; 5] = [
        ReflashStep::RuntimeAccess,
        ReflashStep::CleanUpImc,
        ReflashStep::FlashSsdImage,
        ReflashStep::FlashSpiImage,
        ReflashStep::ApplyFixboard,
    ];

    /// Steps run when none are requested explicitly
    pub fn defaults() -> Vec<ReflashStep> {
        vec![
            ReflashStep::CleanUpImc,
            ReflashStep::FlashSsdImage,
            ReflashStep::FlashSpiImage,
            ReflashStep::ApplyFixboard,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReflashStep::RuntimeAccess => "ipu_runtime_access",
            ReflashStep::CleanUpImc => "clean_up_imc",
            ReflashStep::FlashSsdImage => "flash_ssd_image",
            ReflashStep::FlashSpiImage => "flash_spi_image",
            ReflashStep::ApplyFixboard => "apply_fixboard",
        }
    }
}

impl fmt::Display for ReflashStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReflashStep {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|step| step.as_str() == s)
            .ok_or_else(|| {
                let names: Vec<&str> = Self::ALL.iter().map(|s| s.as_str()).collect();
                format!("unknown step '{}', expected one of: {}", s, names.join(", "))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpuReflashConfig {
    /// IMC host name or address, optionally `user@host`
    pub imc_address: String,
    pub version: String,
    /// Host serving the release tarballs and fixboard images
    pub repo_url: String,
    pub steps: Vec<ReflashStep>,
    pub download_dir: PathBuf,
}

impl IpuReflashConfig {
    pub fn new(imc_address: impl Into<String>) -> Self {
        Self {
            imc_address: imc_address.into(),
            version: VERSIONS[VERSIONS.len() - 1].to_string(),
            repo_url: DEFAULT_REPO.to_string(),
            steps: ReflashStep::defaults(),
            download_dir: PathBuf::from("/tmp"),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_repo_url(mut self, repo_url: impl Into<String>) -> Self {
        self.repo_url = repo_url.into();
        self
    }

    /// Run only these steps. An empty list keeps the defaults.
    pub fn with_steps(mut self, steps: Vec<ReflashStep>) -> Self {
        if !steps.is_empty() {
            self.steps = steps;
        }
        self
    }

    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = dir.into();
        self
    }

    /// Host part of the IMC address
    pub fn imc_host(&self) -> &str {
        self.imc_address
            .rsplit_once('@')
            .map(|(_, host)| host)
            .unwrap_or(&self.imc_address)
    }

    fn release_url(&self) -> String {
        format!("http://{}/intel-ipu-mev-{}", self.repo_url, self.version)
    }

    pub fn ssd_tarball_url(&self) -> String {
        format!(
            "{}/intel-ipu-eval-ssd-image-{}.tar.gz",
            self.release_url(),
            self.version
        )
    }

    pub fn recovery_tarball_url(&self) -> String {
        format!(
            "{}/intel-ipu-recovery-firmware-and-tools-{}.tar.gz",
            self.release_url(),
            self.version
        )
    }
}

/// Whether a board config (JSON from `iset-cli get-board-config`) is blank
/// and needs the fixboard image
pub fn board_config_needs_fix(json: &str) -> Result<bool> {
    let config: BTreeMap<String, serde_json::Value> = serde_json::from_str(json)?;
    debug!(?config, "Board config");

    for (key, value) in &config {
        let Some(value) = value.as_str() else {
            continue;
        };
        if key.contains("MAC Address") && matches!(value, "00:00:00:00:00:00" | "FF:FF:FF:FF:FF:FF") {
            return Ok(true);
        }
        if key.contains("PBA")
            && value.len() == 24
            && (value.chars().all(|c| c == '0') || value.chars().all(|c| c == 'F'))
        {
            debug!(key, value, "PBA check failed");
            return Ok(true);
        }
        if key.contains("Serial Number") && value.is_empty() {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Lab server number from a host name like `wsfd-advnetlab42-imc`
pub fn server_number(host: &str) -> Option<String> {
    let re = Regex::new(r"^[a-zA-Z0-9]+-[a-zA-Z]+(\d+)").ok()?;
    re.captures(host).map(|c| c[1].to_string())
}

/// What a reflash did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReflashReport {
    /// Version found before flashing; `None` in dry-run
    pub previous_version: Option<String>,
    pub steps_run: Vec<ReflashStep>,
}

/// Firmware operations on one IPU
pub struct IpuFirmware {
    config: IpuReflashConfig,
    runner: Arc<dyn CommandRunner>,
    console: Arc<dyn ConsoleConnector>,
    minirc: Option<PathBuf>,
    retry_delay: Duration,
}

impl IpuFirmware {
    /// `console` must open the IMC serial console
    pub fn new(
        config: IpuReflashConfig,
        runner: Arc<dyn CommandRunner>,
        console: Arc<dyn ConsoleConnector>,
    ) -> Self {
        Self {
            config,
            runner,
            console,
            minirc: None,
            retry_delay: Duration::from_secs(2),
        }
    }

    /// Install the minicom config at `path` instead of `~/.minirc.dfl`
    pub fn with_minirc_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.minirc = Some(path.into());
        self
    }

    pub fn config(&self) -> &IpuReflashConfig {
        &self.config
    }

    fn imc(&self) -> SshRunner {
        SshRunner::new(self.config.imc_address.clone(), self.runner.clone())
    }

    fn imc_root(&self) -> SshRunner {
        SshRunner::new(format!("root@{}", self.config.imc_host()), self.runner.clone())
    }

    fn minirc_guard(&self) -> Result<MinircGuard> {
        Ok(match &self.minirc {
            Some(path) => MinircGuard::install(path)?,
            None => MinircGuard::install_default()?,
        })
    }

    /// Type `command` on the IMC console and wait for `response`. Returns
    /// the matched text.
    async fn console_exchange(&self, command: &str, response: &str) -> Result<String> {
        let _guard = self.minirc_guard()?;
        let ready = console_pattern(MINICOM_READY)?;
        let answer = console_pattern(response)?;

        debug!(console = %self.console.describe(), command, "Running command on IMC console");
        let mut session = self.console.open().await?;
        let result = async {
            session.wait_for(&ready, CONSOLE_WAIT).await?;
            session.send(format!("{}\n", command).as_bytes()).await?;
            session.wait_for(&answer, CONSOLE_WAIT).await?;
            debug!(output = %session.before(), "IMC console output");
            Ok::<_, ConsoleError>(session.last_match())
        }
        .await;

        let closed = session.close().await;
        let matched = result?;
        closed?;
        Ok(matched)
    }

    /// Installed IPU release, over ssh with the serial console as fallback
    pub async fn current_version(&self) -> Result<String> {
        let out = self.imc().capture("cat /etc/issue.net").await?;
        if out.success() {
            if let Some(version) = parse_version(&out.out) {
                return Ok(version);
            }
        }

        debug!("Version not available over ssh, asking the IMC console");
        let line = self
            .console_exchange("cat /etc/issue.net", r"IPU IMC[^\r\n]*")
            .await?;
        parse_version(&line).ok_or_else(|| HwError::Parse {
            tool: "issue.net".to_string(),
            reason: format!("no version in '{}'", line.trim()),
        })
    }

    /// Ping the IMC a few times
    pub async fn check_connectivity(&self) -> Result<bool> {
        let host = self.config.imc_host();
        for attempt in 1..=CONNECTIVITY_RETRIES {
            if self
                .runner
                .run(&format!("ping -c 1 -W 1 {}", host))
                .await?
                .success()
            {
                debug!(host, "IMC is reachable");
                return Ok(true);
            }
            debug!(host, attempt, "IMC did not answer ping");
            if attempt < CONNECTIVITY_RETRIES {
                tokio::time::sleep(self.retry_delay).await;
            }
        }
        Ok(false)
    }

    /// Enable network and sshd on the IMC through its console
    pub async fn runtime_access(&self) -> Result<()> {
        if self.runner.is_dry_run() {
            info!("[DRY RUN] Send '/etc/ipu/ipu_runtime_access' on the IMC console");
            return Ok(());
        }
        if self.check_connectivity().await? {
            return Ok(());
        }

        info!("IMC unreachable, enabling runtime access over the console");
        self.console_exchange("/etc/ipu/ipu_runtime_access", "Enabling network and sshd")
            .await
            .map_err(|e| HwError::step(ReflashStep::RuntimeAccess, e))?;
        Ok(())
    }

    /// Unmount and wipe the IMC's NVMe. Failures are logged only.
    pub async fn clean_up_imc(&self) -> Result<()> {
        info!("Cleaning up IMC via SSH");
        let imc = self.imc();
        for command in [
            "umount -l /dev/loop0",
            "umount -l /dev/nvme0n1p*",
            "killall -9 tgtd",
            "dd if=/dev/zero of=/dev/nvme0n1 bs=64k status=progress",
        ] {
            let out = imc.run(command).await?;
            if !out.success() {
                debug!(command, code = out.code, "IMC cleanup command failed");
            }
        }
        Ok(())
    }

    /// Download and unpack the release, returning the SSD and SPI images
    pub async fn get_images(&self) -> Result<(PathBuf, PathBuf)> {
        let dir = &self.config.download_dir;
        info!(version = %self.config.version, "Retrieving images");

        let ssd_tar = download_file(&self.config.ssd_tarball_url(), dir).await?;
        let recovery_tar = download_file(&self.config.recovery_tarball_url(), dir).await?;
        let ssd_root = extract_root(&extract_tar_gz(&ssd_tar, dir).await?, dir);
        let recovery_root = extract_root(&extract_tar_gz(&recovery_tar, dir).await?, dir);

        let ssd = find_file(&ssd_root, "ssd-image-mev.bin", "")?;
        let spi = find_file(&recovery_root, "intel-ipu-recovery-firmware", "1001")?;
        debug!(ssd = %ssd.display(), spi = %spi.display(), "Images ready");
        Ok((ssd, spi))
    }

    pub async fn flash_ssd_image(&self, image: &Path) -> Result<()> {
        let step = ReflashStep::FlashSsdImage;
        let imc = self.imc();
        let out = imc
            .pipe_file(image, "dd bs=16M of=/dev/nvme0n1 status=progress")
            .await?;
        if !out.success() {
            return Err(HwError::step(step, format!("dd exited with {}", out.code)));
        }

        info!("Tidy up file system");
        imc.run("sync ; sync ; sync").await?;
        imc.run("echo -e \"w\" | fdisk /dev/nvme0n1").await?;
        imc.run("parted -sf /dev/nvme0n1 print").await?;
        Ok(())
    }

    pub async fn flash_spi_image(&self, image: &Path) -> Result<()> {
        let step = ReflashStep::FlashSpiImage;
        let imc = self.imc();
        let erase = imc.run("flash_erase /dev/mtd0 0 0").await?;
        if !erase.success() {
            return Err(HwError::step(step, format!("flash_erase exited with {}", erase.code)));
        }
        let out = imc
            .pipe_file(image, "dd bs=16M of=/dev/mtd0 status=progress")
            .await?;
        if !out.success() {
            return Err(HwError::step(step, format!("dd exited with {}", out.code)));
        }
        Ok(())
    }

    pub async fn fixboard_is_needed(&self) -> Result<bool> {
        let out = self.imc_root().capture("iset-cli get-board-config").await?;
        if !out.success() {
            return Err(HwError::step(
                ReflashStep::ApplyFixboard,
                format!("iset-cli failed: {}", out.err.trim()),
            ));
        }
        board_config_needs_fix(&out.out)
    }

    /// Copy the prebuilt board config for this server to the IMC and
    /// return its remote path
    async fn stage_board_config(&self, download_dir: &Path) -> Result<String> {
        let step = ReflashStep::ApplyFixboard;
        let host = self.config.imc_host();
        let number = server_number(host)
            .ok_or_else(|| HwError::step(step, format!("no server number in host name {}", host)))?;

        let base = format!("http://{}/fixboard", self.config.repo_url);
        let servers = list_http_directory(&base).await?;
        if !servers.iter().any(|s| s.contains(&number)) {
            return Err(HwError::step(
                step,
                format!("no prebuilt fixboard images for server {} ({})", number, host),
            ));
        }

        let base = format!("{}/{}", base, number);
        let mut board_config = None;
        for file in list_http_directory(&base).await? {
            let local = download_file(&format!("{}/{}", base, file), download_dir).await?;
            if file.ends_with(".bin.board_config") {
                board_config = Some((file, local));
            }
        }
        let (name, local) =
            board_config.ok_or_else(|| HwError::step(step, "no .bin.board_config file found"))?;

        let remote = format!("/tmp/{}", name);
        let out = self.imc_root().copy_to(&local, &remote).await?;
        if !out.success() {
            return Err(HwError::step(step, format!("scp failed: {}", out.err.trim())));
        }
        Ok(remote)
    }

    /// Rewrite the board config sector and reboot the IMC
    pub async fn apply_fixboard(&self) -> Result<()> {
        let step = ReflashStep::ApplyFixboard;
        let scratch = tempfile::tempdir()?;
        let remote = self.stage_board_config(scratch.path()).await?;
        let imc = self.imc_root();

        imc.checked(&format!("flash_erase /dev/mtd0 {} 1", BOARD_CONFIG_OFFSET))
            .await
            .map_err(|e| HwError::step(step, e))?;
        imc.checked(&format!(
            "nandwrite --start={} --input-size=0x1000 -p /dev/mtd0 {}",
            BOARD_CONFIG_OFFSET, remote
        ))
        .await
        .map_err(|e| HwError::step(step, e))?;

        info!("Rebooting IMC now");
        imc.run("reboot").await?;
        Ok(())
    }

    /// Run the configured reflash steps
    pub async fn reflash(&self) -> Result<ReflashReport> {
        let dry_run = self.runner.is_dry_run();
        let mut steps = self.config.steps.clone();
        let mut report = ReflashReport::default();

        info!(imc = %self.config.imc_address, version = %self.config.version, "Reflashing IPU firmware");
        if dry_run {
            info!("DRY RUN, this is just a preview of the actions that will be taken");
            debug!(config = ?self.config, "Reflash configuration");
        } else {
            let version = self.current_version().await?;
            info!(current = %version, "Detected IPU version");
            if version == RUNTIME_ACCESS_VERSION && !steps.contains(&ReflashStep::RuntimeAccess) {
                steps.insert(0, ReflashStep::RuntimeAccess);
            }
            report.previous_version = Some(version);
        }
        steps.sort();
        steps.dedup();

        let needs_images = steps
            .iter()
            .any(|s| matches!(s, ReflashStep::FlashSsdImage | ReflashStep::FlashSpiImage));
        let (ssd, spi) = match (needs_images, dry_run) {
            (false, _) => (PathBuf::new(), PathBuf::new()),
            (true, true) => (
                self.config.download_dir.join("ssd-image-mev.bin"),
                self.config.download_dir.join("intel-ipu-recovery-firmware-1001.bin"),
            ),
            (true, false) => self.get_images().await?,
        };

        for step in ReflashStep::ALL {
            if !steps.contains(&step) {
                info!(%step, "Skipping");
                continue;
            }
            info!(%step, "Running reflash step");
            match step {
                ReflashStep::RuntimeAccess => self.runtime_access().await?,
                ReflashStep::CleanUpImc => self.clean_up_imc().await?,
                ReflashStep::FlashSsdImage => self.flash_ssd_image(&ssd).await?,
                ReflashStep::FlashSpiImage => self.flash_spi_image(&spi).await?,
                ReflashStep::ApplyFixboard if dry_run => {
                    info!("[DRY RUN] Check board config and apply fixboard if needed");
                }
                ReflashStep::ApplyFixboard => {
                    if self.fixboard_is_needed().await? {
                        info!("Applying fixboard");
                        self.apply_fixboard().await?;
                    } else {
                        info!("Fixboard not needed");
                    }
                }
            }
            report.steps_run.push(step);
        }

        if !steps.contains(&ReflashStep::ApplyFixboard) {
            warn!(imc = %self.config.imc_address, "Please cold reboot the IMC");
        }
        info!("IPU reflash done");
        Ok(report)
    }
}

/// Top-level directory of an extracted archive
fn extract_root(entries: &[PathBuf], fallback: &Path) -> PathBuf {
    entries
        .first()
        .and_then(|p| p.strip_prefix(fallback).ok())
        .and_then(|rel| rel.components().next())
        .map(|c| fallback.join(c))
        .unwrap_or_else(|| fallback.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dpu_common::{CmdOutput, RecordingRunner, ShellRunner};
    use dpu_console::{ConsoleDevice, ConsoleSession};
    use std::sync::Mutex;
    use tokio::io::{duplex, split, AsyncBufReadExt, AsyncWriteExt, BufReader};

    /// IMC shell behind minicom
    #[derive(Clone, Default)]
    struct ImcConsole {
        commands: Arc<Mutex<Vec<String>>>,
    }

    impl ImcConsole {
        fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ConsoleConnector for ImcConsole {
        async fn open(&self) -> dpu_console::Result<ConsoleSession> {
            let (ours, theirs) = duplex(16 * 1024);
            let commands = self.commands.clone();
            tokio::spawn(async move {
                let (read, mut write) = split(theirs);
                let _ = write
                    .write_all(b"\r\nWelcome to minicom 2.8\r\nPress CTRL-A Z for help on special keys\r\n\r\n# ")
                    .await;
                let mut lines = BufReader::new(read).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.starts_with('\x01') {
                        return;
                    }
                    commands.lock().unwrap().push(line.clone());
                    let reply: &[u8] = match line.as_str() {
                        "cat /etc/issue.net" => b"IPU IMC MEV-HW-B1-ci-ts.release.1.2.0.7550\r\n# ",
                        "/etc/ipu/ipu_runtime_access" => b"Enabling network and sshd\r\n# ",
                        _ => b"# ",
                    };
                    let _ = write.write_all(reply).await;
                }
            });
            let (reader, writer) = split(ours);
            Ok(ConsoleSession::new(ConsoleDevice::ipu_imc(), Box::new(reader), Box::new(writer)))
        }

        fn describe(&self) -> String {
            "imc console".to_string()
        }
    }

    fn firmware(runner: Arc<dyn CommandRunner>, console: &ImcConsole, minirc: &Path) -> IpuFirmware {
        IpuFirmware::new(IpuReflashConfig::new("imc-host"), runner, Arc::new(console.clone()))
            .with_minirc_path(minirc)
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(
            parse_version("IPU IMC MEV-HW-B1-ci-ts.release.1.8.0.10052 \\n \\l"),
            Some("1.8.0.10052".to_string())
        );
        assert_eq!(parse_version("Red Hat Enterprise Linux"), None);
    }

    #[test]
    fn test_step_names() {
        for step in ReflashStep::ALL {
            assert_eq!(step.to_string().parse::<ReflashStep>().unwrap(), step);
        }
        assert!("flash_everything".parse::<ReflashStep>().is_err());
        assert!(!ReflashStep::defaults().contains(&ReflashStep::RuntimeAccess));
    }

    #[test]
    fn test_config_urls() {
        let config = IpuReflashConfig::new("root@wsfd-advnetlab42-imc").with_version("1.6.2.9418");
        assert_eq!(config.imc_host(), "wsfd-advnetlab42-imc");
        assert_eq!(
            config.ssd_tarball_url(),
            format!("http://{DEFAULT_REPO}/intel-ipu-mev-1.6.2.9418/intel-ipu-eval-ssd-image-1.6.2.9418.tar.gz")
        );
        assert!(config
            .recovery_tarball_url()
            .ends_with("/intel-ipu-recovery-firmware-and-tools-1.6.2.9418.tar.gz"));
        assert_eq!(IpuReflashConfig::new("h").version, "1.8.0.10052");
        assert_eq!(IpuReflashConfig::new("h").with_steps(vec![]).steps, ReflashStep::defaults());
    }

    #[test]
    fn test_board_config_check() {
        let good = r#"{"MAC Address 0": "00:1A:CA:FF:FF:01", "PBA": "K12345-001", "Serial Number": "ABC123"}"#;
        assert!(!board_config_needs_fix(good).unwrap());

        let blank_mac = r#"{"MAC Address 0": "FF:FF:FF:FF:FF:FF", "Serial Number": "ABC123"}"#;
        assert!(board_config_needs_fix(blank_mac).unwrap());

        let blank_pba = r#"{"Board PBA": "000000000000000000000000"}"#;
        assert!(board_config_needs_fix(blank_pba).unwrap());

        let no_serial = r#"{"Serial Number": "", "Board ID": 7}"#;
        assert!(board_config_needs_fix(no_serial).unwrap());

        assert!(matches!(board_config_needs_fix("not json"), Err(HwError::Json(_))));
    }

    #[test]
    fn test_server_number() {
        assert_eq!(server_number("wsfd-advnetlab42-imc"), Some("42".to_string()));
        assert_eq!(server_number("imc"), None);
    }

    #[tokio::test]
    async fn test_version_over_ssh() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new().respond(
            "issue.net",
            CmdOutput::ok("IPU IMC MEV-HW-B1-ci-ts.release.1.8.0.10052\n"),
        ));
        let console = ImcConsole::default();
        let fw = firmware(runner.clone(), &console, &dir.path().join(".minirc.dfl"));

        assert_eq!(fw.current_version().await.unwrap(), "1.8.0.10052");
        assert!(console.commands().is_empty());
        assert!(runner.history()[0].starts_with("ssh "));
    }

    #[tokio::test(start_paused = true)]
    async fn test_version_falls_back_to_console() {
        let dir = tempfile::tempdir().unwrap();
        let minirc = dir.path().join(".minirc.dfl");
        std::fs::write(&minirc, b"pu baudrate 9600\n").unwrap();

        let runner = Arc::new(RecordingRunner::new().respond("issue.net", CmdOutput::failed(255, "no route")));
        let console = ImcConsole::default();
        let fw = firmware(runner, &console, &minirc);

        assert_eq!(fw.current_version().await.unwrap(), "1.2.0.7550");
        assert_eq!(console.commands(), vec!["cat /etc/issue.net"]);
        assert_eq!(std::fs::read(&minirc).unwrap(), b"pu baudrate 9600\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_runtime_access_uses_console_when_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new().respond("ping", CmdOutput::failed(1, "")));
        let console = ImcConsole::default();
        let fw = firmware(runner.clone(), &console, &dir.path().join(".minirc.dfl"));

        fw.runtime_access().await.unwrap();
        assert_eq!(runner.matching("ping -c 1 -W 1 imc-host").len(), 3);
        assert_eq!(console.commands(), vec!["/etc/ipu/ipu_runtime_access"]);
        assert!(!dir.path().join(".minirc.dfl").exists());
    }

    #[tokio::test]
    async fn test_runtime_access_skipped_when_reachable() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let console = ImcConsole::default();
        let fw = firmware(runner.clone(), &console, &dir.path().join(".minirc.dfl"));

        fw.runtime_access().await.unwrap();
        assert_eq!(runner.matching("ping").len(), 1);
        assert!(console.commands().is_empty());
    }

    #[tokio::test]
    async fn test_flash_spi_stops_on_erase_failure() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new().respond("flash_erase", CmdOutput::failed(1, "busy")));
        let fw = firmware(runner.clone(), &ImcConsole::default(), &dir.path().join("m"));

        let err = fw.flash_spi_image(Path::new("/tmp/spi.bin")).await.unwrap_err();
        assert!(err.to_string().contains("flash_spi_image"));
        assert!(runner.matching("of=/dev/mtd0").is_empty());
    }

    #[tokio::test]
    async fn test_reflash_dry_run_preview() {
        let dir = tempfile::tempdir().unwrap();
        let runner: Arc<dyn CommandRunner> = Arc::new(ShellRunner::new().with_dry_run(true));
        let console = ImcConsole::default();
        let fw = firmware(runner, &console, &dir.path().join(".minirc.dfl"));

        let report = fw.reflash().await.unwrap();
        assert_eq!(report.previous_version, None);
        assert_eq!(report.steps_run, ReflashStep::defaults());
        assert!(console.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reflash_old_release_enables_runtime_access() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(
            RecordingRunner::new()
                .respond("issue.net", CmdOutput::ok("IPU IMC MEV-HW-B1-ci-ts.release.1.2.0.7550\n"))
                .respond("ping", CmdOutput::failed(1, "")),
        );
        let console = ImcConsole::default();
        let config = IpuReflashConfig::new("imc-host").with_steps(vec![ReflashStep::CleanUpImc]);
        let fw = IpuFirmware::new(config, runner.clone(), Arc::new(console.clone()))
            .with_minirc_path(dir.path().join(".minirc.dfl"));

        let report = fw.reflash().await.unwrap();
        assert_eq!(report.previous_version.as_deref(), Some("1.2.0.7550"));
        assert_eq!(
            report.steps_run,
            vec![ReflashStep::RuntimeAccess, ReflashStep::CleanUpImc]
        );
        assert_eq!(console.commands(), vec!["/etc/ipu/ipu_runtime_access"]);
        assert_eq!(runner.matching("killall -9 tgtd").len(), 1);
    }

    #[test]
    fn test_extract_root() {
        let base = Path::new("/tmp");
        let entries = vec![PathBuf::from("/tmp/intel-ipu-eval-ssd-image-1.8.0/ssd-image-mev.bin")];
        assert_eq!(extract_root(&entries, base), PathBuf::from("/tmp/intel-ipu-eval-ssd-image-1.8.0"));
        assert_eq!(extract_root(&[], base), PathBuf::from("/tmp"));
    }
}
