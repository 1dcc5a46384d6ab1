//! Host-side preparation for a network boot
//!
//! Puts the install media where the DPU firmware and installer will look
//! for it: EFI shim and GRUB in the TFTP root, kernel and initrd next to
//! them, the ISO tree, rootfs and kickstart under the HTTP root, plus the
//! dhcpd and GRUB configuration.

use crate::config::PxeConfig;
use crate::error::{PxeError, Result};
use async_trait::async_trait;
use dpu_common::download::download_to;
use dpu_common::CommandRunner;
use dpu_services::{GrubConfig, OsFlavor};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// EFI boot files served over TFTP
pub const EFI_BOOT_FILES: [&str; 3] = ["BOOTAA64.EFI", "grubaa64.efi", "mmaa64.efi"];

const KICKSTART_PLACEHOLDER: &str = "NETWORK_INSTALL_URL";

/// Whether a source refers to an NFS export (`host:/path`)
pub fn is_remote_source(source: &str) -> bool {
    source.contains(":/")
}

/// Split `host:/dir/file` into the export `host:/dir` and `file`
pub fn split_nfs_source(source: &str) -> Option<(String, String)> {
    let (host, path) = source.split_once(':')?;
    let path = Path::new(path);
    let dir = path.parent()?.to_str()?;
    let file = path.file_name()?.to_str()?;
    Some((format!("{}:{}", host, dir), file.to_string()))
}

/// Replace the install URL placeholder in a kickstart template
pub fn render_kickstart(template: &str, server: &str) -> String {
    template.replace(KICKSTART_PLACEHOLDER, &format!("http://{}/mnt", server))
}

/// Media ready for one boot attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedMedia {
    pub flavor: OsFlavor,
    /// Local path of the SSH key, if one was given
    pub key: Option<PathBuf>,
}

/// Host preparation used by the boot controller
#[async_trait]
pub trait MediaStager: Send + Sync {
    /// Lay out boot media and configuration
    async fn stage(&self) -> Result<StagedMedia>;

    /// Re-add the host address on the DPU-facing interface
    async fn assert_address(&self) -> Result<()>;
}

/// Stages a RHEL or CoreOS ISO on the local host
pub struct IsoStager {
    config: Arc<PxeConfig>,
    runner: Arc<dyn CommandRunner>,
}

impl IsoStager {
    pub fn new(config: Arc<PxeConfig>, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    fn dry_run(&self) -> bool {
        self.runner.is_dry_run()
    }

    /// Local path for `source`, NFS-mounting its directory when remote
    pub async fn resolve_source(&self, source: &str, mount_point: &Path) -> Result<PathBuf> {
        if !is_remote_source(source) {
            return Ok(PathBuf::from(source));
        }
        let (export, file) = split_nfs_source(source)
            .ok_or_else(|| PxeError::Validation(format!("malformed NFS path {}", source)))?;

        info!(%export, mount = %mount_point.display(), "Mounting NFS export");
        self.mkdir(mount_point).await?;
        self.runner
            .run(&format!("umount {}", mount_point.display()))
            .await?;
        self.runner
            .checked(&format!("mount {} {}", export, mount_point.display()))
            .await?;
        Ok(mount_point.join(file))
    }

    async fn mkdir(&self, dir: &Path) -> Result<()> {
        if !self.dry_run() {
            tokio::fs::create_dir_all(dir).await?;
        }
        Ok(())
    }

    async fn copy(&self, src: &Path, dst: &Path) -> Result<()> {
        if self.dry_run() {
            info!("[DRY RUN] Copy {} to {}", src.display(), dst.display());
            return Ok(());
        }
        tokio::fs::copy(src, dst).await.map_err(|e| {
            PxeError::Staging(format!("copy {} to {}: {}", src.display(), dst.display(), e))
        })?;
        Ok(())
    }

    async fn write(&self, path: &Path, contents: &str) -> Result<()> {
        info!(path = %path.display(), "Writing configuration");
        if self.dry_run() {
            debug!("[DRY RUN] {}", contents);
            return Ok(());
        }
        tokio::fs::write(path, contents).await?;
        Ok(())
    }

    async fn configure_interface(&self) -> Result<()> {
        let iface = &self.config.interface;
        self.runner.run(&format!("ip a f {}", iface)).await?;
        self.assert_address().await
    }

    async fn mount_iso(&self, iso: &Path) -> Result<OsFlavor> {
        let mount = &self.config.paths.iso_mount;
        self.mkdir(mount).await?;
        self.runner.run(&format!("umount {}", mount.display())).await?;
        self.runner
            .checked(&format!(
                "mount -t iso9660 -o loop {} {}",
                iso.display(),
                mount.display()
            ))
            .await?;
        tokio::time::sleep(self.config.mount_settle).await;

        let flavor = if mount.join("coreos").exists() {
            OsFlavor::CoreOs
        } else {
            OsFlavor::Rhel
        };
        info!(%flavor, "Detected install media");
        Ok(flavor)
    }

    async fn fetch_efiboot(&self) -> Result<()> {
        let dst = &self.config.paths.efiboot_cache;
        if dst.exists() {
            info!("Reusing cached efiboot.img");
            return Ok(());
        }
        let source = &self.config.efiboot_img;
        if source.is_empty() {
            return Err(PxeError::Staging(
                "EFI boot files missing and no efiboot.img source given".to_string(),
            ));
        }
        if source.starts_with("http://") || source.starts_with("https://") {
            info!(url = %source, "Downloading efiboot.img");
            if !self.dry_run() {
                download_to(source, dst).await?;
            }
            Ok(())
        } else {
            self.copy(Path::new(source), dst).await
        }
    }

    /// Make sure the shim, GRUB and MOK manager are in the TFTP root
    async fn ensure_efi_files(&self) -> Result<()> {
        let tftp = &self.config.paths.tftp_root;
        if EFI_BOOT_FILES.iter().all(|f| tftp.join(f).exists()) {
            return Ok(());
        }

        self.fetch_efiboot().await?;
        let mount = &self.config.paths.efiboot_mount;
        self.mkdir(mount).await?;
        self.runner.run(&format!("umount {}", mount.display())).await?;
        self.runner
            .checked(&format!(
                "mount {} {}",
                self.config.paths.efiboot_cache.display(),
                mount.display()
            ))
            .await?;

        self.mkdir(tftp).await?;
        for file in EFI_BOOT_FILES {
            self.copy(&mount.join("EFI/BOOT").join(file), &tftp.join(file))
                .await?;
        }
        Ok(())
    }

    async fn stage_tftp(&self, flavor: OsFlavor) -> Result<()> {
        let iso = &self.config.paths.iso_mount;
        let pxe_dir = self.config.paths.tftp_root.join("pxelinux");
        self.mkdir(&pxe_dir).await?;

        let mut files = vec!["images/pxeboot/vmlinuz", "images/pxeboot/initrd.img"];
        if flavor == OsFlavor::CoreOs {
            files.push("images/ignition.img");
        }
        for file in files {
            let src = iso.join(file);
            let name = src.file_name().map(PathBuf::from).unwrap_or_default();
            self.copy(&src, &pxe_dir.join(name)).await?;
        }

        let grub = GrubConfig::new(flavor, self.config.server_ip).render()?;
        self.write(&self.config.paths.tftp_root.join("grub.cfg"), &grub)
            .await?;
        let dhcpd = self.config.dhcpd_config().render()?;
        self.write(&self.config.paths.dhcpd_conf, &dhcpd).await
    }

    async fn stage_www(&self, flavor: OsFlavor) -> Result<()> {
        let www = &self.config.paths.www_root;
        let iso = &self.config.paths.iso_mount;
        let pxe_dir = self.config.paths.tftp_root.join("pxelinux");
        self.mkdir(www).await?;

        let rootfs = iso.join("images/pxeboot/rootfs.img");
        if !www.join("rootfs.img").exists() && rootfs.exists() {
            self.copy(&rootfs, &www.join("rootfs.img")).await?;
        }
        for file in ["vmlinuz", "initrd.img"] {
            if !www.join(file).exists() {
                self.copy(&pxe_dir.join(file), &www.join(file)).await?;
            }
        }
        if !www.join("mnt").exists() && iso.join("images").exists() && !self.dry_run() {
            tokio::fs::symlink(iso, www.join("mnt")).await?;
        }

        let template = &self.config.paths.kickstart_template;
        match tokio::fs::read_to_string(template).await {
            Ok(text) => {
                let kickstart = render_kickstart(&text, &self.config.server_ip.to_string());
                self.write(&www.join("kickstart.ks"), &kickstart).await?;
            }
            Err(e) if flavor == OsFlavor::Rhel && !self.dry_run() => {
                return Err(PxeError::Staging(format!(
                    "kickstart template {}: {}",
                    template.display(),
                    e
                )));
            }
            Err(_) => warn!(template = %template.display(), "No kickstart template, skipping"),
        }
        Ok(())
    }
}

#[async_trait]
impl MediaStager for IsoStager {
    async fn stage(&self) -> Result<StagedMedia> {
        let paths = &self.config.paths;
        let iso = self.resolve_source(&self.config.iso, &paths.nfs_iso_mount).await?;
        let key = match &self.config.key {
            Some(key) => Some(self.resolve_source(key, &paths.nfs_key_mount).await?),
            None => None,
        };

        self.configure_interface().await?;
        let flavor = self.mount_iso(&iso).await?;
        self.ensure_efi_files().await?;
        self.stage_tftp(flavor).await?;
        self.stage_www(flavor).await?;

        Ok(StagedMedia { flavor, key })
    }

    async fn assert_address(&self) -> Result<()> {
        // fails harmlessly when the address is already present
        self.runner
            .run(&format!(
                "ip a a {} dev {}",
                self.config.host_cidr(),
                self.config.interface
            ))
            .await?;
        Ok(())
    }
}
