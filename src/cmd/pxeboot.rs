use super::Globals;
use clap::Args;
use color_eyre::eyre::Result;
use dpu_console::MenuProfile;
use dpu_pxe::{BootOutcome, PxeBoot, PxeConfig, PxeError};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

#[derive(Args, Debug)]
pub struct PxebootArgs {
    /// Install ISO, local path or `host:/path/to.iso` on NFS
    pub iso: String,

    /// BlueField PCI function index
    #[arg(long, default_value_t = 0)]
    pub id: usize,

    /// SSH private key to log in with once the OS is up, local or NFS
    #[arg(long)]
    pub key: Option<String>,

    /// efiboot.img to take the EFI loaders from, local path or http URL
    #[arg(long, default_value = "")]
    pub efiboot_img: String,

    /// Host interface facing the DPU
    #[arg(long, default_value = "tmfifo_net0")]
    pub interface: String,

    /// Bring up the boot services and wait; the console is left alone
    #[arg(long)]
    pub manual: bool,

    /// DNS server handed out by DHCP, may be repeated
    #[arg(long)]
    pub dns: Vec<Ipv4Addr>,

    /// Domain search list handed out by DHCP
    #[arg(long)]
    pub domain_search: Option<String>,

    /// Set the DPU clock to this host's after login
    #[arg(long)]
    pub sync_clock: bool,

    /// Seconds to keep services up for the installer when no key is given
    #[arg(long, default_value_t = 1000)]
    pub hold_secs: u64,

    /// Boot attempts before giving up
    #[arg(long, default_value_t = 6)]
    pub max_attempts: u32,

    /// Firmware menu profile
    #[arg(long, default_value = "bluefield")]
    pub profile: String,

    /// Directory with `<profile>.yml` overrides
    #[arg(long)]
    pub profile_dir: Option<PathBuf>,
}

impl PxebootArgs {
    pub fn to_config(&self) -> Result<PxeConfig, PxeError> {
        if self.max_attempts == 0 {
            return Err(PxeError::Validation("--max-attempts must be at least 1".to_string()));
        }
        let mut config = PxeConfig::new(self.id, self.iso.clone())
            .with_efiboot_img(self.efiboot_img.clone())
            .with_manual(self.manual)
            .with_dns(self.dns.clone(), self.domain_search.clone())
            .with_sync_clock(self.sync_clock)
            .with_hold_without_key(Duration::from_secs(self.hold_secs))
            .with_max_attempts(self.max_attempts);
        if let Some(key) = &self.key {
            config = config.with_key(key.clone());
        }
        config.interface = self.interface.clone();
        config.menu_profile = self.profile.clone();
        Ok(config)
    }

    async fn profile(&self) -> Result<MenuProfile> {
        let profile = match &self.profile_dir {
            Some(dir) => MenuProfile::load(&self.profile, dir).await?,
            None => MenuProfile::builtin(&self.profile)?,
        };
        Ok(profile)
    }
}

pub async fn run_pxeboot(
    args: PxebootArgs,
    globals: &Globals,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let config = args.to_config()?;
    let profile = args.profile().await?;
    let boot = PxeBoot::new(config, globals.runner(), profile, shutdown)?;

    match boot.run().await {
        Ok(BootOutcome::Booted(address)) => {
            info!(%address, "PXE boot finished");
            println!("{}", address);
            Ok(())
        }
        Ok(BootOutcome::ManualStopped) => {
            info!("Manual PXE session stopped");
            Ok(())
        }
        Err(e) => {
            if let PxeError::RetriesExhausted { attempts, last } = &e {
                eprintln!("PXE boot gave up after {} attempts. Last failure: {}", attempts, last);
            }
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(iso: &str) -> PxebootArgs {
        PxebootArgs {
            iso: iso.to_string(),
            id: 2,
            key: None,
            efiboot_img: String::new(),
            interface: "tmfifo_net1".to_string(),
            manual: true,
            dns: Vec::new(),
            domain_search: None,
            sync_clock: false,
            hold_secs: 60,
            max_attempts: 3,
            profile: "bluefield".to_string(),
            profile_dir: None,
        }
    }

    #[test]
    fn test_args_to_config() {
        let config = args("/isos/rhel.iso").to_config().unwrap();
        assert_eq!(config.device_id, 2);
        assert_eq!(config.interface, "tmfifo_net1");
        assert_eq!(config.hold_without_key, Duration::from_secs(60));
        assert_eq!(config.max_attempts, 3);
        assert!(config.manual);
        assert_eq!(config.key, None);
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut a = args("/isos/rhel.iso");
        a.max_attempts = 0;
        let err = a.to_config().unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_builtin_profile() {
        let profile = args("/isos/rhel.iso").profile().await.unwrap();
        assert_eq!(profile, MenuProfile::bluefield().unwrap());
    }
}
