//! PXE boot parameters

use dpu_services::DhcpdConfig;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Where things live on the provisioning host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PxePaths {
    pub tftp_root: PathBuf,
    pub www_root: PathBuf,
    /// Loop mount of the install ISO
    pub iso_mount: PathBuf,
    pub efiboot_mount: PathBuf,
    /// Local copy of `efiboot.img`
    pub efiboot_cache: PathBuf,
    pub dhcpd_conf: PathBuf,
    /// Kickstart template with a `NETWORK_INSTALL_URL` placeholder
    pub kickstart_template: PathBuf,
    pub nfs_iso_mount: PathBuf,
    pub nfs_key_mount: PathBuf,
    pub lock_file: PathBuf,
    pub dhcpd_bin: PathBuf,
    pub tftpd_bin: PathBuf,
}

impl Default for PxePaths {
    fn default() -> Self {
        Self {
            tftp_root: PathBuf::from("/var/lib/tftpboot"),
            www_root: PathBuf::from("/www"),
            iso_mount: PathBuf::from("/var/ftp/mnt"),
            efiboot_mount: PathBuf::from("/var/ftp/efibootimg"),
            efiboot_cache: PathBuf::from("/var/ftp/efiboot.img"),
            dhcpd_conf: PathBuf::from("/etc/dhcp/dhcpd.conf"),
            kickstart_template: PathBuf::from("/kickstart.ks"),
            nfs_iso_mount: PathBuf::from("/mnt/nfs_iso"),
            nfs_key_mount: PathBuf::from("/mnt/nfs_key"),
            lock_file: PathBuf::from("/run/dpu-tools-pxeboot.lock"),
            dhcpd_bin: PathBuf::from("/usr/sbin/dhcpd"),
            tftpd_bin: PathBuf::from("/usr/sbin/in.tftpd"),
        }
    }
}

/// Everything one PXE boot run needs
#[derive(Debug, Clone, PartialEq)]
pub struct PxeConfig {
    /// BlueField PCI function index
    pub device_id: usize,
    /// Install ISO, local path or `host:/path` on NFS
    pub iso: String,
    /// SSH private key for the post-boot login, local or `host:/path`
    pub key: Option<String>,
    /// `efiboot.img` source, local path or http URL
    pub efiboot_img: String,
    /// Host-side interface facing the DPU
    pub interface: String,
    pub server_ip: Ipv4Addr,
    pub prefix_len: u8,
    pub pool_start: Ipv4Addr,
    pub pool_end: Ipv4Addr,
    pub dns_servers: Vec<Ipv4Addr>,
    pub domain_search: Option<String>,
    pub http_bind: SocketAddr,
    pub max_attempts: u32,
    pub ping_timeout: Duration,
    pub ping_interval: Duration,
    /// Pause after the reset before the host address is re-asserted
    pub reset_settle: Duration,
    /// Pause after loop-mounting the ISO
    pub mount_settle: Duration,
    /// How long services stay up for an installer when there is no key
    pub hold_without_key: Duration,
    /// Bring services up and wait instead of driving the console
    pub manual: bool,
    pub login_user: String,
    pub login_attempts: u32,
    pub login_interval: Duration,
    /// Set the device clock to ours after login
    pub sync_clock: bool,
    pub menu_profile: String,
    pub paths: PxePaths,
}

impl Default for PxeConfig {
    fn default() -> Self {
        Self {
            device_id: 0,
            iso: String::new(),
            key: None,
            efiboot_img: String::new(),
            interface: "tmfifo_net0".to_string(),
            server_ip: Ipv4Addr::new(172, 31, 100, 1),
            prefix_len: 24,
            pool_start: Ipv4Addr::new(172, 31, 100, 10),
            pool_end: Ipv4Addr::new(172, 31, 100, 20),
            dns_servers: Vec::new(),
            domain_search: None,
            http_bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 80)),
            max_attempts: 6,
            ping_timeout: Duration::from_secs(180),
            ping_interval: Duration::from_secs(5),
            reset_settle: Duration::from_secs(5),
            mount_settle: Duration::from_secs(10),
            hold_without_key: Duration::from_secs(1000),
            manual: false,
            login_user: "core".to_string(),
            login_attempts: 60,
            login_interval: Duration::from_secs(10),
            sync_clock: false,
            menu_profile: "bluefield".to_string(),
            paths: PxePaths::default(),
        }
    }
}

impl PxeConfig {
    pub fn new(device_id: usize, iso: impl Into<String>) -> Self {
        Self {
            device_id,
            iso: iso.into(),
            ..Self::default()
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_efiboot_img(mut self, source: impl Into<String>) -> Self {
        self.efiboot_img = source.into();
        self
    }

    pub fn with_manual(mut self, manual: bool) -> Self {
        self.manual = manual;
        self
    }

    pub fn with_dns(mut self, servers: Vec<Ipv4Addr>, domain_search: Option<String>) -> Self {
        self.dns_servers = servers;
        self.domain_search = domain_search;
        self
    }

    pub fn with_sync_clock(mut self, sync: bool) -> Self {
        self.sync_clock = sync;
        self
    }

    pub fn with_hold_without_key(mut self, hold: Duration) -> Self {
        self.hold_without_key = hold;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_paths(mut self, paths: PxePaths) -> Self {
        self.paths = paths;
        self
    }

    /// Addresses the DPU may get from the DHCP pool, in sweep order
    pub fn pool_candidates(&self) -> Vec<Ipv4Addr> {
        (u32::from(self.pool_start)..=u32::from(self.pool_end))
            .map(Ipv4Addr::from)
            .collect()
    }

    /// `172.31.100.1/24`
    pub fn host_cidr(&self) -> String {
        format!("{}/{}", self.server_ip, self.prefix_len)
    }

    pub fn netmask(&self) -> Ipv4Addr {
        let bits = u32::MAX
            .checked_shl(32 - u32::from(self.prefix_len.min(32)))
            .unwrap_or(0);
        Ipv4Addr::from(bits)
    }

    pub fn dhcpd_config(&self) -> DhcpdConfig {
        let mask = u32::from(self.netmask());
        let subnet = u32::from(self.server_ip) & mask;
        let mut dhcpd = DhcpdConfig::default()
            .with_server_ip(self.server_ip)
            .with_range(self.pool_start, self.pool_end)
            .with_dns_servers(self.dns_servers.clone());
        dhcpd.subnet = Ipv4Addr::from(subnet);
        dhcpd.netmask = Ipv4Addr::from(mask);
        dhcpd.broadcast = Ipv4Addr::from(subnet | !mask);
        if let Some(domain) = &self.domain_search {
            dhcpd = dhcpd.with_domain_search(domain.clone());
        }
        dhcpd
    }
}
